//! Line-oriented terminal output for `arena-relay watch`.

use std::io::Write;

use super::controller::{PlaybackController, PlaybackState};
use super::driver::PlaybackObserver;
use crate::models::PlyState;

/// Prints state changes and new plies, one line each.
pub struct ConsoleObserver<W: Write + Send> {
    out: W,
    last_state: Option<PlaybackState>,
    printed_plies: usize,
    current: Option<String>,
}

impl ConsoleObserver<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleObserver<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last_state: None,
            printed_plies: 0,
            current: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_state(&mut self, controller: &PlaybackController) -> std::io::Result<()> {
        let line = match controller.state() {
            PlaybackState::Idle => "idle: nothing to watch".to_string(),
            PlaybackState::Connecting { match_id } => {
                let players = controller
                    .matches()
                    .iter()
                    .find(|m| &m.id == match_id)
                    .map(|m| {
                        let name = |p: &Option<crate::models::AgentProfile>| {
                            p.as_ref().map_or("?".to_string(), |a| a.name.clone())
                        };
                        format!(" ({} vs {})", name(&m.white), name(&m.black))
                    })
                    .unwrap_or_default();
                format!("connecting to {}{}", match_id, players)
            }
            PlaybackState::Streaming { match_id } => format!("watching {}", match_id),
            PlaybackState::Reconnecting { match_id, reason } => {
                format!("lost {} ({}), reconnecting", match_id, reason)
            }
            PlaybackState::Completed {
                match_id,
                winner,
                termination,
            } => format!(
                "{} finished: {} by {}",
                match_id,
                winner.as_deref().unwrap_or("draw"),
                termination.as_deref().unwrap_or("unknown")
            ),
            PlaybackState::TimedOut {
                match_id,
                consecutive,
            } => format!("{} timed out ({} in a row)", match_id, consecutive),
            PlaybackState::Error { reason } => format!("error: {}", reason),
        };
        writeln!(self.out, "[{}] {}", controller.state().label(), line)
    }

    fn write_ply(&mut self, ply: &PlyState) -> std::io::Result<()> {
        let notation = ply.move_notation.as_deref().unwrap_or("...");
        match ply.move_time_ms {
            Some(ms) => writeln!(self.out, "  {:>3}. {} ({} ms)", ply.move_number, notation, ms),
            None => writeln!(self.out, "  {:>3}. {} (timeout)", ply.move_number, notation),
        }
    }

    fn write(&mut self, controller: &PlaybackController) -> std::io::Result<()> {
        let current = controller.current_match_id().map(str::to_string);
        if current != self.current {
            self.current = current;
            self.printed_plies = 0;
        }
        // A fresh stream replays from scratch.
        if controller.plies().len() < self.printed_plies {
            self.printed_plies = 0;
        }

        if self.last_state.as_ref() != Some(controller.state()) {
            self.write_state(controller)?;
            self.last_state = Some(controller.state().clone());
        }

        for ply in &controller.plies()[self.printed_plies..] {
            self.write_ply(ply)?;
        }
        self.printed_plies = controller.plies().len();
        self.out.flush()
    }
}

impl<W: Write + Send> PlaybackObserver for ConsoleObserver<W> {
    fn render(&mut self, controller: &PlaybackController) {
        if let Err(e) = self.write(controller) {
            tracing::debug!(error = %e, "could not write playback output");
        }
    }
}
