//! Connection-token checks for the agent bridge.
//!
//! Tokens are issued elsewhere; only their SHA-256 hash is stored. A presented
//! token is hashed with the same function and compared in constant time.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::models::{AgentLink, ExecutionMode};

/// Header carrying the agent id.
pub const AGENT_ID_HEADER: &str = "x-agent-id";

/// Header carrying the connection token (`Bearer <token>` or the bare token).
pub const TOKEN_HEADER: &str = "x-connection-token";

/// Lowercase hex SHA-256 of a connection token.
pub fn hash_connection_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compare two byte strings without short-circuiting on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Presented credentials, as read from the upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub agent_id: String,
    pub token: String,
}

/// Pull the agent id and token out of the request headers.
///
/// Returns `None` if either header is missing, empty or not valid text.
pub fn credentials(headers: &HeaderMap) -> Option<Credentials> {
    let agent_id = headers.get(AGENT_ID_HEADER)?.to_str().ok()?.trim();
    let raw = headers.get(TOKEN_HEADER)?.to_str().ok()?.trim();
    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .unwrap_or(raw)
        .trim();

    if agent_id.is_empty() || token.is_empty() {
        return None;
    }
    Some(Credentials {
        agent_id: agent_id.to_string(),
        token: token.to_string(),
    })
}

/// Whether `link` admits a bridge for `credentials`.
pub fn link_admits(link: &AgentLink, credentials: &Credentials) -> bool {
    let presented = hash_connection_token(&credentials.token);
    let hash_ok = constant_time_eq(presented.as_bytes(), link.token_hash.as_bytes());
    // Evaluate every condition so the outcome does not leak through timing.
    let id_ok = link.agent_id == credentials.agent_id;
    let mode_ok = link.execution_mode == ExecutionMode::Local;
    hash_ok & id_ok & mode_ok & link.active
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(agent: Option<&str>, token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(agent) = agent {
            headers.insert(AGENT_ID_HEADER, HeaderValue::from_str(agent).unwrap());
        }
        if let Some(token) = token {
            headers.insert(TOKEN_HEADER, HeaderValue::from_str(token).unwrap());
        }
        headers
    }

    fn link(token: &str) -> AgentLink {
        AgentLink {
            agent_id: "agent-1".to_string(),
            token_hash: hash_connection_token(token),
            execution_mode: ExecutionMode::Local,
            active: true,
        }
    }

    fn creds(token: &str) -> Credentials {
        Credentials {
            agent_id: "agent-1".to_string(),
            token: token.to_string(),
        }
    }

    #[test]
    fn test_hash_is_lowercase_hex_sha256() {
        assert_eq!(
            hash_connection_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"sane"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_credentials_accept_bearer_and_bare() {
        let bearer = credentials(&headers(Some("agent-1"), Some("Bearer tok"))).unwrap();
        assert_eq!(bearer.token, "tok");
        let bare = credentials(&headers(Some("agent-1"), Some("tok"))).unwrap();
        assert_eq!(bare, bearer);
    }

    #[test]
    fn test_credentials_require_both_headers() {
        assert!(credentials(&headers(None, Some("tok"))).is_none());
        assert!(credentials(&headers(Some("agent-1"), None)).is_none());
        assert!(credentials(&headers(Some(""), Some("tok"))).is_none());
        assert!(credentials(&headers(Some("agent-1"), Some("Bearer "))).is_none());
    }

    #[test]
    fn test_link_admits_only_matching_local_active() {
        assert!(link_admits(&link("secret"), &creds("secret")));
        assert!(!link_admits(&link("secret"), &creds("garbage")));

        let mut server_mode = link("secret");
        server_mode.execution_mode = ExecutionMode::Server;
        assert!(!link_admits(&server_mode, &creds("secret")));

        let mut inactive = link("secret");
        inactive.active = false;
        assert!(!link_admits(&inactive, &creds("secret")));

        let mut other = creds("secret");
        other.agent_id = "agent-2".to_string();
        assert!(!link_admits(&link("secret"), &other));
    }
}
