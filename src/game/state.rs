//! # Game State and Move Rules
//!
//! The board is derived from the cyclic Latin square of size `n`: row `r` is
//! `1..=n` rotated left by `r`, so the solved value at `(r, c)` is
//! `((r + c) mod n) + 1`. At startup some cells are blanked (set to `0`).
//!
//! ## Scoring
//!
//! | Move | Board | Score | Version |
//! |---|---|---|---|
//! | out of bounds | unchanged | unchanged | unchanged |
//! | cell not blank | unchanged | unchanged | unchanged |
//! | correct value | cell filled | `+5` | `+1` |
//! | wrong value | unchanged | `-1` | `+1` |
//!
//! Moves are always checked against the solved square, never against the
//! partially blanked board that clients see.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Points awarded for filling a blank with the right value.
pub const CORRECT_MOVE_POINTS: i64 = 5;

/// Points deducted for a wrong value on a blank cell.
pub const INCORRECT_MOVE_PENALTY: i64 = 1;

/// Solved value of cell `(r, c)` in the cyclic Latin square of size `n`.
///
/// Callers must pass an in-bounds cell (`r < n`, `c < n`).
pub fn canonical_value(n: usize, r: usize, c: usize) -> u32 {
    ((r + c) % n + 1) as u32
}

/// Versioned snapshot of the puzzle session.
///
/// This is the unit of replication: backups receive it whole and replace their
/// own copy with it, and clients receive it after every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    /// Board side length
    pub n: usize,
    /// `n x n` grid, `0` marks a blank cell
    pub board: Vec<Vec<u32>>,
    /// Player display name -> score
    pub scores: BTreeMap<String, i64>,
    pub round: u32,
    /// Bumped on every move that reaches value validation
    pub version: u64,
}

/// Why a move was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveRejection {
    OutOfBounds,
    CellNotEmpty,
    Incorrect,
}

impl MoveRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveRejection::OutOfBounds => "out_of_bounds",
            MoveRejection::CellNotEmpty => "cell_not_empty",
            MoveRejection::Incorrect => "incorrect",
        }
    }
}

impl fmt::Display for MoveRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`GameState::apply_move`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Accepted,
    Rejected(MoveRejection),
}

impl MoveOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, MoveOutcome::Accepted)
    }

    /// Whether the move changed the state (and therefore its version).
    pub fn changed_state(&self) -> bool {
        matches!(
            self,
            MoveOutcome::Accepted | MoveOutcome::Rejected(MoveRejection::Incorrect)
        )
    }

    pub fn rejection(&self) -> Option<MoveRejection> {
        match self {
            MoveOutcome::Accepted => None,
            MoveOutcome::Rejected(reason) => Some(*reason),
        }
    }
}

impl GameState {
    /// Create a session of size `n` with `blanks` randomly chosen blank cells.
    ///
    /// # Example
    /// ```ignore
    /// let game = GameState::new(3, 3);
    /// assert_eq!(game.version, 0);
    /// ```
    pub fn new(n: usize, blanks: usize) -> Self {
        Self::with_rng(n, blanks, &mut rand::thread_rng())
    }

    /// Same as [`GameState::new`] but with a caller-provided random source.
    pub fn with_rng<R: Rng + ?Sized>(n: usize, blanks: usize, rng: &mut R) -> Self {
        let mut cells: Vec<(usize, usize)> = (0..n)
            .flat_map(|r| (0..n).map(move |c| (r, c)))
            .collect();
        cells.shuffle(rng);
        cells.truncate(blanks);
        Self::with_blanks(n, &cells)
    }

    /// Create a session of size `n` with exactly the given cells blanked.
    /// Cells outside the board are ignored.
    pub fn with_blanks(n: usize, blanks: &[(usize, usize)]) -> Self {
        let mut board: Vec<Vec<u32>> = (0..n)
            .map(|r| (0..n).map(|c| canonical_value(n, r, c)).collect())
            .collect();
        for &(r, c) in blanks {
            if r < n && c < n {
                board[r][c] = 0;
            }
        }

        Self {
            n,
            board,
            scores: BTreeMap::new(),
            round: 1,
            version: 0,
        }
    }

    /// Make sure `player` has a score entry, starting at zero.
    pub fn register_player(&mut self, player: &str) {
        self.scores.entry(player.to_string()).or_insert(0);
    }

    pub fn score(&self, player: &str) -> Option<i64> {
        self.scores.get(player).copied()
    }

    pub fn blank_count(&self) -> usize {
        self.board
            .iter()
            .map(|row| row.iter().filter(|&&v| v == 0).count())
            .sum()
    }

    /// Attempt to write `val` into `(r, c)` on behalf of `player`.
    ///
    /// Coordinates arrive straight from the wire, so they may be negative.
    pub fn apply_move(&mut self, player: &str, r: i64, c: i64, val: i64) -> MoveOutcome {
        let (row, col) = match (usize::try_from(r), usize::try_from(c)) {
            (Ok(row), Ok(col)) if row < self.n && col < self.n => (row, col),
            _ => return MoveOutcome::Rejected(MoveRejection::OutOfBounds),
        };

        if self.board[row][col] != 0 {
            return MoveOutcome::Rejected(MoveRejection::CellNotEmpty);
        }

        let expected = canonical_value(self.n, row, col);
        let score = self.scores.entry(player.to_string()).or_insert(0);
        self.version += 1;

        if i64::from(expected) == val {
            self.board[row][col] = expected;
            *score += CORRECT_MOVE_POINTS;
            MoveOutcome::Accepted
        } else {
            *score -= INCORRECT_MOVE_PENALTY;
            MoveOutcome::Rejected(MoveRejection::Incorrect)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn canonical_rows_are_cyclic_shifts() {
        let rows: Vec<Vec<u32>> = (0..3)
            .map(|r| (0..3).map(|c| canonical_value(3, r, c)).collect())
            .collect();
        assert_eq!(rows, vec![vec![1, 2, 3], vec![2, 3, 1], vec![3, 1, 2]]);
    }

    #[test]
    fn correct_then_repeated_move_on_same_cell() {
        let mut game = GameState::with_blanks(3, &[(0, 0)]);
        game.register_player("alice");

        let outcome = game.apply_move("alice", 0, 0, 1);
        assert_eq!(outcome, MoveOutcome::Accepted);
        assert_eq!(game.board[0][0], 1);
        assert_eq!(game.score("alice"), Some(5));
        assert_eq!(game.version, 1);

        let outcome = game.apply_move("alice", 0, 0, 2);
        assert_eq!(outcome, MoveOutcome::Rejected(MoveRejection::CellNotEmpty));
        assert_eq!(game.board[0][0], 1);
        assert_eq!(game.score("alice"), Some(5));
        assert_eq!(game.version, 1);
    }

    #[test]
    fn wrong_value_costs_a_point_and_bumps_version() {
        let mut game = GameState::with_blanks(3, &[(1, 2)]);

        let outcome = game.apply_move("bob", 1, 2, 3);
        assert_eq!(outcome, MoveOutcome::Rejected(MoveRejection::Incorrect));
        assert!(outcome.changed_state());
        assert_eq!(game.board[1][2], 0);
        assert_eq!(game.score("bob"), Some(-1));
        assert_eq!(game.version, 1);
    }

    #[test]
    fn out_of_bounds_changes_nothing() {
        let mut game = GameState::with_blanks(3, &[(0, 0)]);
        let before = game.clone();

        for (r, c) in [(-1, 0), (0, -1), (3, 0), (0, 3), (i64::MAX, 1)] {
            let outcome = game.apply_move("carol", r, c, 1);
            assert_eq!(outcome, MoveOutcome::Rejected(MoveRejection::OutOfBounds));
            assert!(!outcome.changed_state());
        }
        assert_eq!(game, before);
    }

    #[test]
    fn every_blank_accepts_only_its_canonical_value() {
        let n = 4;
        for r in 0..n {
            for c in 0..n {
                for val in 0..=(n as i64 + 1) {
                    let mut game = GameState::with_blanks(n, &[(r, c)]);
                    let outcome = game.apply_move("p", r as i64, c as i64, val);
                    let expected = i64::from(canonical_value(n, r, c));

                    assert_eq!(outcome.is_accepted(), val == expected);
                    assert_eq!(game.version, 1);
                    let filled = game.board[r][c] != 0;
                    assert_eq!(filled, outcome.is_accepted());
                }
            }
        }
    }

    #[test]
    fn random_blanks_are_capped_by_board_size() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(GameState::with_rng(3, 3, &mut rng).blank_count(), 3);
        assert_eq!(GameState::with_rng(3, 50, &mut rng).blank_count(), 9);
        assert_eq!(GameState::with_rng(3, 0, &mut rng).blank_count(), 0);
    }

    #[test]
    fn snapshot_uses_wire_field_names() {
        let game = GameState::with_blanks(2, &[(0, 1)]);
        let json = serde_json::to_value(&game).unwrap();
        assert_eq!(json["n"], 2);
        assert_eq!(json["board"][0][1], 0);
        assert_eq!(json["round"], 1);
        assert_eq!(json["version"], 0);
    }
}
