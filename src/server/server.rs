//! # Server Core - Game State Store
//!
//! The core server component is responsible for ONE thing: holding the puzzle
//! session and applying moves to it. Every mutation and every snapshot read
//! happens inside a single critical section, so a snapshot is always
//! consistent with the version counter at the moment it was taken.
//!
//! All distributed system concerns (discovery, elections, replication, client
//! redirects) are handled by the [`ServerMiddleware`](super::middleware::ServerMiddleware).

use log::{debug, info};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::game::{GameState, MoveOutcome};

pub struct ServerCore {
    /// Server ID for logging purposes
    server_id: u32,
    state: Mutex<GameState>,
}

impl ServerCore {
    /// Create a new server core around an initial game.
    ///
    /// # Example
    /// ```ignore
    /// let core = ServerCore::new(1, GameState::new(3, 3));
    /// ```
    pub fn new(server_id: u32, initial: GameState) -> Self {
        Self {
            server_id,
            state: Mutex::new(initial),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GameState> {
        // GameState has no invariants a panicking writer could half-break
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> GameState {
        self.lock().clone()
    }

    /// Ensure `player` has a score entry.
    pub fn register_player(&self, player: &str) {
        self.lock().register_player(player);
    }

    /// Apply a move and return its outcome with the snapshot taken right after.
    pub fn apply_move(&self, player: &str, r: i64, c: i64, val: i64) -> (MoveOutcome, GameState) {
        let mut state = self.lock();
        let outcome = state.apply_move(player, r, c, val);
        let snapshot = state.clone();
        drop(state);

        match outcome.rejection() {
            None => info!(
                "✅ Server {}: '{}' filled ({}, {}) with {} (v{})",
                self.server_id, player, r, c, val, snapshot.version
            ),
            Some(reason) => info!(
                "❎ Server {}: '{}' move ({}, {}) = {} rejected: {} (v{})",
                self.server_id, player, r, c, val, reason, snapshot.version
            ),
        }
        (outcome, snapshot)
    }

    /// Replace the whole state with a replicated snapshot. No merge and no
    /// version check: the last snapshot applied wins.
    pub fn replace_state(&self, incoming: GameState) {
        let mut state = self.lock();
        debug!(
            "Server {} replacing state v{} with replicated v{}",
            self.server_id, state.version, incoming.version
        );
        *state = incoming;
    }
}
