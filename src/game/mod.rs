//! # Puzzle Game
//!
//! The shared game session served by the cluster: an `n x n` Latin square with
//! some cells blanked out. Players fill blanks and earn or lose points.

pub mod state;

pub use state::{canonical_value, GameState, MoveOutcome, MoveRejection};
