//! Line-oriented terminal front end: command parsing and text rendering.

use std::fmt::Write as _;
use thiserror::Error;

use crate::common::messages::{ErrorCode, MoveResult, ServerMessage, SessionNote};
use crate::game::GameState;

pub const PROMPT: &str = "cmd (move r c val / state / exit): ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Move { r: i64, c: i64, val: i64 },
    State,
    Exit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("invalid ints")]
    InvalidNumber,
    #[error("unknown command")]
    Unknown,
}

/// Parse one input line. Blank lines parse to `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [] => Ok(None),
        ["exit"] => Ok(Some(Command::Exit)),
        ["state"] => Ok(Some(Command::State)),
        ["move", r, c, val] => {
            let parse = |s: &str| s.parse::<i64>().map_err(|_| CommandError::InvalidNumber);
            Ok(Some(Command::Move {
                r: parse(r)?,
                c: parse(c)?,
                val: parse(val)?,
            }))
        }
        _ => Err(CommandError::Unknown),
    }
}

/// Board with blanks shown as `_`, framed by version and round.
pub fn render_state(state: &GameState) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== GAME STATE v{} Round:{} ===", state.version, state.round);
    for row in &state.board {
        let cells: Vec<String> = row
            .iter()
            .map(|&v| if v == 0 { "_".to_string() } else { v.to_string() })
            .collect();
        let _ = writeln!(out, "{}", cells.join(" "));
    }
    let scores: Vec<String> = state
        .scores
        .iter()
        .map(|(name, score)| format!("{}={}", name, score))
        .collect();
    let _ = writeln!(out, "Scores: {}", scores.join(", "));
    out.push_str("=============================");
    out
}

/// Text shown for a message pushed by the server.
pub fn describe(message: &ServerMessage) -> String {
    match message {
        ServerMessage::State { state, note } => match note {
            Some(note) => {
                let note = match note {
                    SessionNote::Primary => "primary",
                    SessionNote::Spectator => "spectator",
                };
                format!("Initial: {}\n{}", note, render_state(state))
            }
            None => render_state(state),
        },
        ServerMessage::MoveAck {
            result,
            reason,
            state,
        } => {
            let result = match result {
                MoveResult::Ok => "ok",
                MoveResult::Fail => "fail",
            };
            let reason = reason.map(|r| r.as_str()).unwrap_or("");
            format!("Move ack: {} {}\n{}", result, reason, render_state(state))
        }
        ServerMessage::Error { error } => {
            let error = match error {
                ErrorCode::NotPrimary => "not_primary",
                ErrorCode::Unknown => "unknown",
            };
            format!("ERROR: {}", error)
        }
        ServerMessage::Redirect { host, port, reason } => {
            format!("Redirected to {}:{} ({})", host, port, reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::MoveRejection;

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse_command("move 0 2 3"),
            Ok(Some(Command::Move { r: 0, c: 2, val: 3 }))
        );
        assert_eq!(parse_command("  state "), Ok(Some(Command::State)));
        assert_eq!(parse_command("exit"), Ok(Some(Command::Exit)));
        assert_eq!(parse_command(""), Ok(None));
        assert_eq!(parse_command("move -1 0 9"), Ok(Some(Command::Move { r: -1, c: 0, val: 9 })));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(parse_command("move a 0 1"), Err(CommandError::InvalidNumber));
        assert_eq!(parse_command("move 0 1"), Err(CommandError::Unknown));
        assert_eq!(parse_command("jump"), Err(CommandError::Unknown));
    }

    #[test]
    fn blanks_render_as_underscores() {
        let mut state = GameState::with_blanks(3, &[(0, 0), (1, 2)]);
        state.register_player("amy");
        let text = render_state(&state);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "=== GAME STATE v0 Round:1 ===");
        assert_eq!(lines[1], "_ 2 3");
        assert_eq!(lines[2], "2 3 _");
        assert_eq!(lines[3], "3 1 2");
        assert_eq!(lines[4], "Scores: amy=0");
    }

    #[test]
    fn describes_replies() {
        let state = GameState::with_blanks(3, &[]);
        let ack = ServerMessage::MoveAck {
            result: MoveResult::Fail,
            reason: Some(MoveRejection::CellNotEmpty),
            state: state.clone(),
        };
        assert!(describe(&ack).starts_with("Move ack: fail cell_not_empty\n"));

        let err = ServerMessage::Error {
            error: ErrorCode::NotPrimary,
        };
        assert_eq!(describe(&err), "ERROR: not_primary");

        let initial = ServerMessage::State {
            state,
            note: Some(SessionNote::Spectator),
        };
        assert!(describe(&initial).starts_with("Initial: spectator\n"));
    }
}
