//! Spectator push protocol.
//!
//! A spectator opens one long-lived chunked HTTP response per match. The body
//! is NDJSON: one JSON object per line, discriminated by a `type` field.
//!
//! # Message Order (per connection)
//!
//! 1. `connected` - exactly once, first
//! 2. `heartbeat` - any number, anywhere
//! 3. `initial` - exactly once, every ply known at that moment
//! 4. `move` - any number, after `initial`, strictly increasing `moveNumber`
//! 5. `timeout` or `completed` - exactly one, last
//!
//! # Examples
//!
//! ```json
//! {"type":"connected","matchId":"m-42"}
//! {"type":"initial","plies":[{"moveNumber":1,"boardState":"...","moveTimeMs":812}]}
//! {"type":"move","ply":{"moveNumber":2,"boardState":"...","moveTimeMs":null}}
//! {"type":"heartbeat"}
//! {"type":"completed","winner":"white","termination":"checkmate"}
//! ```

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::models::PlyState;

/// Content type of the spectator stream body.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// One line of the spectator stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Sent once when the stream opens.
    Connected {
        #[serde(rename = "matchId")]
        match_id: String,
    },

    /// Keeps idle proxies from reaping the connection.
    Heartbeat,

    /// Full replay of every ply known when the viewer attached.
    Initial { plies: Vec<PlyState> },

    /// One newly produced ply.
    Move { ply: PlyState },

    /// The server gave up waiting for the match to resolve.
    Timeout,

    /// Normal end of game.
    Completed {
        winner: Option<String>,
        termination: Option<String>,
    },
}

impl StreamMessage {
    /// Whether this message ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamMessage::Timeout | StreamMessage::Completed { .. })
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Connected { .. } => "connected",
            StreamMessage::Heartbeat => "heartbeat",
            StreamMessage::Initial { .. } => "initial",
            StreamMessage::Move { .. } => "move",
            StreamMessage::Timeout => "timeout",
            StreamMessage::Completed { .. } => "completed",
        }
    }
}

/// Encode a message as one NDJSON line, newline included.
pub fn encode_line(message: &StreamMessage) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Longest line the decoder will buffer before giving up on it
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental NDJSON decoder.
///
/// Chunk boundaries may fall anywhere, including inside a JSON object or a
/// multi-byte UTF-8 sequence. Incomplete trailing bytes are kept until the
/// next `push`. A line that does not parse, or grows past
/// [`MAX_LINE_BYTES`], is logged and skipped.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    pending: Vec<u8>,
    /// Prefix of `pending` already searched for a newline
    scanned: usize,
    /// Dropping the rest of an oversized line
    discarding: bool,
    skipped: usize,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every message it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamMessage> {
        self.pending.extend_from_slice(chunk);

        let mut messages = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.pending[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            if self.discarding {
                self.discarding = false;
            } else {
                match decode_line(&self.pending[start..end]) {
                    Some(Ok(message)) => messages.push(message),
                    Some(Err(e)) => {
                        self.skipped += 1;
                        tracing::warn!(error = %e, "skipping malformed stream line");
                    }
                    None => {}
                }
            }
            start = end + 1;
            from = start;
        }
        self.pending.drain(..start);
        self.scanned = self.pending.len();

        if self.pending.len() > MAX_LINE_BYTES {
            if !self.discarding {
                self.skipped += 1;
                tracing::warn!(limit = MAX_LINE_BYTES, "skipping oversized stream line");
            }
            self.discarding = true;
            self.pending.clear();
            self.scanned = 0;
        }

        messages
    }

    /// Decode whatever is left after the final chunk.
    pub fn finish(&mut self) -> Option<StreamMessage> {
        let rest = std::mem::take(&mut self.pending);
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        match decode_line(&rest)? {
            Ok(message) => Some(message),
            Err(e) => {
                self.skipped += 1;
                tracing::warn!(error = %e, "skipping malformed trailing stream line");
                None
            }
        }
    }

    /// Number of lines dropped because they failed to parse.
    pub fn skipped_lines(&self) -> usize {
        self.skipped
    }

    /// Bytes buffered while waiting for a newline.
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }
}

/// Parse one line. Blank lines yield `None`.
fn decode_line(line: &[u8]) -> Option<serde_json::Result<StreamMessage>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(serde_json::from_slice(line))
}

/// A message that breaks the per-connection ordering contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("duplicate connected message")]
    DuplicateConnected,

    #[error("duplicate initial message")]
    DuplicateInitial,

    #[error("move {move_number} arrived before initial")]
    MoveBeforeInitial { move_number: u32 },

    #[error("move {got} does not follow move {last}")]
    NonIncreasingMove { last: u32, got: u32 },

    #[error("{kind} arrived after the terminal message")]
    AfterTerminal { kind: &'static str },
}

/// Tracks one connection's messages and rejects out-of-contract ones.
#[derive(Debug, Default)]
pub struct OrderingGuard {
    connected: bool,
    initial: bool,
    terminal: bool,
    last_move: u32,
}

impl OrderingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `message` and record it if it is acceptable.
    pub fn check(&mut self, message: &StreamMessage) -> std::result::Result<(), ProtocolViolation> {
        if self.terminal {
            return Err(ProtocolViolation::AfterTerminal {
                kind: message.kind(),
            });
        }

        match message {
            StreamMessage::Connected { .. } => {
                if self.connected {
                    return Err(ProtocolViolation::DuplicateConnected);
                }
                self.connected = true;
            }
            StreamMessage::Heartbeat => {}
            StreamMessage::Initial { plies } => {
                if self.initial {
                    return Err(ProtocolViolation::DuplicateInitial);
                }
                self.initial = true;
                self.last_move = plies.iter().map(|p| p.move_number).max().unwrap_or(0);
            }
            StreamMessage::Move { ply } => {
                if !self.initial {
                    return Err(ProtocolViolation::MoveBeforeInitial {
                        move_number: ply.move_number,
                    });
                }
                if ply.move_number <= self.last_move {
                    return Err(ProtocolViolation::NonIncreasingMove {
                        last: self.last_move,
                        got: ply.move_number,
                    });
                }
                self.last_move = ply.move_number;
            }
            StreamMessage::Timeout | StreamMessage::Completed { .. } => {
                self.terminal = true;
            }
        }

        Ok(())
    }

    /// Whether a terminal message has been seen.
    pub fn is_finished(&self) -> bool {
        self.terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ply(n: u32) -> PlyState {
        let mut ply = PlyState::new(n, serde_json::json!(format!("board-{}", n)));
        ply.move_time_ms = Some(250);
        ply.move_notation = Some(format!("m{}", n));
        ply
    }

    fn sample_stream() -> Vec<StreamMessage> {
        vec![
            StreamMessage::Connected {
                match_id: "m-ü-1".to_string(),
            },
            StreamMessage::Heartbeat,
            StreamMessage::Initial {
                plies: vec![ply(1), ply(2)],
            },
            StreamMessage::Move { ply: ply(3) },
            StreamMessage::Heartbeat,
            StreamMessage::Move { ply: ply(4) },
            StreamMessage::Completed {
                winner: Some("white".to_string()),
                termination: Some("checkmate".to_string()),
            },
        ]
    }

    fn encode_all(messages: &[StreamMessage]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| encode_line(m).unwrap().into_bytes())
            .collect()
    }

    #[test]
    fn test_wire_shapes() {
        assert_eq!(
            encode_line(&StreamMessage::Connected {
                match_id: "m-1".to_string()
            })
            .unwrap(),
            "{\"type\":\"connected\",\"matchId\":\"m-1\"}\n"
        );
        assert_eq!(
            encode_line(&StreamMessage::Heartbeat).unwrap(),
            "{\"type\":\"heartbeat\"}\n"
        );
        assert_eq!(
            encode_line(&StreamMessage::Timeout).unwrap(),
            "{\"type\":\"timeout\"}\n"
        );

        let completed = serde_json::to_value(StreamMessage::Completed {
            winner: None,
            termination: Some("stalemate".to_string()),
        })
        .unwrap();
        assert_eq!(completed["type"], "completed");
        assert!(completed["winner"].is_null());
        assert_eq!(completed["termination"], "stalemate");
    }

    #[test]
    fn test_decoder_every_split_point() {
        let messages = sample_stream();
        let bytes = encode_all(&messages);

        for split in 0..=bytes.len() {
            let mut decoder = NdjsonDecoder::new();
            let mut decoded = decoder.push(&bytes[..split]);
            decoded.extend(decoder.push(&bytes[split..]));
            assert_eq!(decoded, messages, "split at {}", split);
            assert_eq!(decoder.pending_bytes(), 0);
        }
    }

    #[test]
    fn test_decoder_byte_at_a_time() {
        let messages = sample_stream();
        let bytes = encode_all(&messages);

        let mut decoder = NdjsonDecoder::new();
        let decoded: Vec<_> = bytes.iter().flat_map(|b| decoder.push(&[*b])).collect();
        assert_eq!(decoded, messages);
        assert_eq!(decoder.skipped_lines(), 0);
    }

    #[test]
    fn test_decoder_uneven_chunks() {
        let messages = sample_stream();
        let bytes = encode_all(&messages);

        // Chunk sizes cycle through a few primes so boundaries drift across lines.
        let sizes = [7usize, 3, 13, 1, 29, 5];
        let mut decoder = NdjsonDecoder::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        let mut i = 0;
        while offset < bytes.len() {
            let end = (offset + sizes[i % sizes.len()]).min(bytes.len());
            decoded.extend(decoder.push(&bytes[offset..end]));
            offset = end;
            i += 1;
        }
        assert_eq!(decoded, messages);
    }

    #[test]
    fn test_decoder_skips_malformed_line_and_continues() {
        let mut decoder = NdjsonDecoder::new();
        let input = b"{\"type\":\"heartbeat\"}\n{not json\n\n{\"type\":\"timeout\"}\n";
        let decoded = decoder.push(input);
        assert_eq!(decoded, vec![StreamMessage::Heartbeat, StreamMessage::Timeout]);
        assert_eq!(decoder.skipped_lines(), 1);
    }

    #[test]
    fn test_decoder_skips_unknown_type() {
        let mut decoder = NdjsonDecoder::new();
        let decoded = decoder.push(b"{\"type\":\"gossip\"}\n{\"type\":\"heartbeat\"}\n");
        assert_eq!(decoded, vec![StreamMessage::Heartbeat]);
        assert_eq!(decoder.skipped_lines(), 1);
    }

    #[test]
    fn test_decoder_handles_crlf() {
        let mut decoder = NdjsonDecoder::new();
        let decoded = decoder.push(b"{\"type\":\"heartbeat\"}\r\n");
        assert_eq!(decoded, vec![StreamMessage::Heartbeat]);
    }

    #[test]
    fn test_decoder_finish_flushes_unterminated_line() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.push(b"{\"type\":\"time").is_empty());
        assert!(decoder.push(b"out\"}").is_empty());
        assert_eq!(decoder.finish(), Some(StreamMessage::Timeout));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_drops_oversized_line_and_recovers() {
        let mut decoder = NdjsonDecoder::new();
        let filler = vec![b'x'; 64 * 1024];
        let mut decoded = decoder.push(b"{\"type\":\"heartbeat\"}\n{\"type\":\"move\",");
        for _ in 0..(MAX_LINE_BYTES / filler.len() + 2) {
            decoded.extend(decoder.push(&filler));
            assert!(decoder.pending_bytes() <= MAX_LINE_BYTES);
        }
        decoded.extend(decoder.push(b"tail\n{\"type\":\"timeout\"}\n"));

        assert_eq!(decoded, vec![StreamMessage::Heartbeat, StreamMessage::Timeout]);
        assert_eq!(decoder.skipped_lines(), 1);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_guard_accepts_contract_sequence() {
        let mut guard = OrderingGuard::new();
        for message in sample_stream() {
            guard.check(&message).unwrap();
        }
        assert!(guard.is_finished());
    }

    #[test]
    fn test_guard_rejects_move_before_initial() {
        let mut guard = OrderingGuard::new();
        assert_eq!(
            guard.check(&StreamMessage::Move { ply: ply(1) }),
            Err(ProtocolViolation::MoveBeforeInitial { move_number: 1 })
        );
    }

    #[test]
    fn test_guard_rejects_duplicates_and_regressions() {
        let mut guard = OrderingGuard::new();
        let connected = StreamMessage::Connected {
            match_id: "m".to_string(),
        };
        guard.check(&connected).unwrap();
        assert_eq!(guard.check(&connected), Err(ProtocolViolation::DuplicateConnected));

        let initial = StreamMessage::Initial {
            plies: vec![ply(1), ply(2)],
        };
        guard.check(&initial).unwrap();
        assert_eq!(guard.check(&initial), Err(ProtocolViolation::DuplicateInitial));

        assert_eq!(
            guard.check(&StreamMessage::Move { ply: ply(2) }),
            Err(ProtocolViolation::NonIncreasingMove { last: 2, got: 2 })
        );
        // A gap is allowed; the skipped ply may have timed out upstream.
        guard.check(&StreamMessage::Move { ply: ply(4) }).unwrap();
    }

    #[test]
    fn test_guard_rejects_after_terminal() {
        let mut guard = OrderingGuard::new();
        guard.check(&StreamMessage::Timeout).unwrap();
        assert_eq!(
            guard.check(&StreamMessage::Heartbeat),
            Err(ProtocolViolation::AfterTerminal { kind: "heartbeat" })
        );
    }
}
