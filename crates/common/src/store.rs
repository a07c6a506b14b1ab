//! Build session persistence

use crate::session::BuildState;
use crate::Result;

/// Storage for per-session build state
pub trait SessionStore: Send + Sync {
    /// Persist `state`. Without a session id a new one is minted.
    /// Returns the id the state was stored under.
    fn save(&self, session_id: Option<&str>, state: &BuildState) -> Result<String>;

    /// Load the state for a session, storing the default on first use
    fn restore(&self, session_id: &str) -> Result<BuildState>;

    /// Overwrite the session with the default state
    fn reset(&self, session_id: &str) -> Result<BuildState>;
}
