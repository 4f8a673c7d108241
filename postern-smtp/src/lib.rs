pub mod command;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod listener;
pub mod response;
pub mod server;
pub mod session;
pub mod state;
pub mod tls;

use serde::Deserialize;

// Re-export commonly used types
pub use command::Command;
pub use listener::Listener;
pub use server::Server;
pub use session::{Session, SessionConfig};
pub use state::State;

/// SMTP server-side timeout configuration
///
/// These timeouts prevent resource exhaustion from slow or malicious
/// clients and follow RFC 5321 Section 4.5.3.2 recommendations. Three are
/// distinct on the wire: greeting-to-first-command, between commands, and
/// 354-to-terminator; the fourth bounds the whole session.
#[derive(Clone, Debug, Deserialize)]
pub struct SmtpTimeouts {
    /// Timeout from the greeting to the first command
    ///
    /// Default: 300 seconds (5 minutes)
    #[serde(default = "default_idle_timeout")]
    pub idle_s: u64,

    /// Timeout between commands (EHLO, MAIL FROM, RCPT TO, etc.)
    ///
    /// RFC 5321 recommends: 5 minutes
    /// Default: 300 seconds (5 minutes)
    #[serde(default = "default_command_timeout")]
    pub command_s: u64,

    /// Total time allowed from the 354 go-ahead to the end-of-data
    /// terminator, and per BDAT chunk payload
    ///
    /// Default: 600 seconds (10 minutes)
    #[serde(default = "default_data_timeout")]
    pub data_s: u64,

    /// Maximum total session duration; 0 disables the cap
    ///
    /// Default: 1800 seconds (30 minutes)
    #[serde(default = "default_session_timeout")]
    pub session_s: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            idle_s: default_idle_timeout(),
            command_s: default_command_timeout(),
            data_s: default_data_timeout(),
            session_s: default_session_timeout(),
        }
    }
}

const fn default_idle_timeout() -> u64 {
    300
}

const fn default_command_timeout() -> u64 {
    300 // 5 minutes per RFC 5321
}

const fn default_data_timeout() -> u64 {
    600
}

const fn default_session_timeout() -> u64 {
    1800 // 30 minutes
}
