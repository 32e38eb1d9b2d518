//! Listener ports for the relay's two surfaces.
//!
//! The relay itself binds `PORT` (default 8080); the bare variable name is
//! what the original deployment platform injects. Health probes and metrics
//! live on a second listener controlled by `CORSRELAY_ADMIN_PORT` (default
//! 8081) so orchestrators can scrape without going through relay policy.

/// Port the relay listener binds when `PORT` is unset.
pub const DEFAULT_RELAY_PORT: u16 = 8080;

/// Port the admin listener (`/health`, `/ready`, `/metrics`) binds when
/// `CORSRELAY_ADMIN_PORT` is unset.
pub const DEFAULT_ADMIN_PORT: u16 = 8081;

/// Relay port from `PORT`, falling back to [`DEFAULT_RELAY_PORT`].
///
/// ```rust
/// assert!(corsrelay::ports::relay_port() > 0);
/// ```
pub fn relay_port() -> u16 {
    env_port("PORT", DEFAULT_RELAY_PORT)
}

/// Admin port from `CORSRELAY_ADMIN_PORT`, falling back to
/// [`DEFAULT_ADMIN_PORT`].
pub fn admin_port() -> u16 {
    env_port("CORSRELAY_ADMIN_PORT", DEFAULT_ADMIN_PORT)
}

fn env_port(var: &str, default: u16) -> u16 {
    match std::env::var(var) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}
