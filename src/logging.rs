//! # Structured Logging
//!
//! Thin wrapper over `tracing` that tags every record with a control-plane
//! category. Categories let operators filter the combined stream of a busy
//! node (handshakes, beacons, quorum rounds, healing actions) without regex
//! gymnastics, and keep log call sites terse.
//!
//! Initialization is idempotent; the binary calls [`init_logging`] once, tests
//! rely on `test-log` or skip initialization entirely.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Control-plane subsystem a log record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogCategory {
    /// Transport send/receive path
    Transport,
    /// Handshakes, sessions, key rotation
    SecureChannel,
    /// Beacon emission and application
    Beacon,
    /// Claim gossip and quorum validation
    Quorum,
    /// Topology mutations and routing
    Topology,
    /// MAPE-K loop phases
    Healing,
    /// Node lifecycle, configuration, hooks
    System,
}

impl LogCategory {
    fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Transport => "transport",
            LogCategory::SecureChannel => "secure_channel",
            LogCategory::Beacon => "beacon",
            LogCategory::Quorum => "quorum",
            LogCategory::Topology => "topology",
            LogCategory::Healing => "healing",
            LogCategory::System => "system",
        }
    }
}

/// Install the global tracing subscriber.
///
/// `json` selects machine-readable output for production deployments. The
/// filter honors `RUST_LOG`, defaulting to `info` for the crate.
pub fn init_logging(json: bool) {
    INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("quantum_mesh_core=info,mesh_node=info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        if json {
            builder.json().init();
        } else {
            builder.init();
        }
    });
}

/// Log an informational event under a category.
pub fn log_info(category: LogCategory, message: &str) {
    tracing::info!(category = category.as_str(), "{message}");
}

/// Log a warning under a category.
pub fn log_warn(category: LogCategory, message: &str) {
    tracing::warn!(category = category.as_str(), "{message}");
}

/// Log an error under a category.
pub fn log_error(category: LogCategory, message: &str) {
    tracing::error!(category = category.as_str(), "{message}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_render_as_snake_case() {
        assert_eq!(LogCategory::SecureChannel.as_str(), "secure_channel");
        assert_eq!(LogCategory::Healing.as_str(), "healing");
    }

    #[test]
    fn init_is_idempotent() {
        init_logging(false);
        init_logging(true);
    }
}
