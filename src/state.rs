//! Shared server state

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use russh::keys::PublicKey;

use crate::config::ServerConfig;

/// State handed to every connection handler
pub struct SharedState {
    pub config: Arc<ServerConfig>,
    /// Key accepted for public-key auth
    pub authorized_key: PublicKey,
    pub recorder: Arc<Recorder>,
}

/// Liveness of the listener
///
/// Set by `SshTestServer::start` once the listener is bound, cleared only by
/// the accept loop when it exits.
#[derive(Debug, Default)]
pub struct ServerState {
    connected: AtomicBool,
}

impl ServerState {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

/// Observations tests can assert on
#[derive(Debug, Default)]
pub struct Recorder {
    sessions: AtomicUsize,
    matches: DashMap<String, usize>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn session_opened(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn matched(&self, command_match: &str) {
        *self.matches.entry(command_match.to_string()).or_insert(0) += 1;
    }

    /// Session channels that got a shell process
    pub fn sessions_opened(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Times a trigger fired across all sessions
    pub fn match_count(&self, command_match: &str) -> usize {
        self.matches.get(command_match).map(|c| *c).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_state_default_disconnected() {
        let state = ServerState::default();
        assert!(!state.is_connected());
        state.set_connected(true);
        assert!(state.is_connected());
    }

    #[test]
    fn test_recorder_counts() {
        let rec = Recorder::new();
        assert_eq!(rec.match_count("ls -lha"), 0);
        rec.matched("ls -lha");
        rec.matched("ls -lha");
        rec.matched("whoami");
        assert_eq!(rec.match_count("ls -lha"), 2);
        assert_eq!(rec.match_count("whoami"), 1);

        rec.session_opened();
        assert_eq!(rec.sessions_opened(), 1);
    }
}
