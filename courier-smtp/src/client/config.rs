//! Connection settings for the submission client.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// How the connection is protected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Security {
    /// TLS from the first byte (port 465).
    #[default]
    Implicit,
    /// Plain connect, then upgrade with `STARTTLS` (port 587).
    StartTls,
    /// No TLS at all. Only for local relays and tests.
    Plain,
}

impl Security {
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Implicit => 465,
            Self::StartTls => 587,
            Self::Plain => 25,
        }
    }
}

/// Deadlines for each stage of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpTimeouts {
    /// TCP connect plus, for implicit TLS, the handshake.
    ///
    /// Default: 10 seconds
    #[serde(default = "defaults::connect")]
    pub connect_secs: u64,

    /// Waiting for the `220` banner.
    ///
    /// Default: 10 seconds
    #[serde(default = "defaults::greeting")]
    pub greeting_secs: u64,

    /// Any single command and its reply, including the message body.
    ///
    /// Default: 15 seconds
    #[serde(default = "defaults::command")]
    pub command_secs: u64,
}

impl SmtpTimeouts {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn greeting(&self) -> Duration {
        Duration::from_secs(self.greeting_secs)
    }

    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::connect(),
            greeting_secs: defaults::greeting(),
            command_secs: defaults::command(),
        }
    }
}

mod defaults {
    pub const fn connect() -> u64 {
        10
    }

    pub const fn greeting() -> u64 {
        10
    }

    pub const fn command() -> u64 {
        15
    }
}

/// Login for `AUTH`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_never_debug_printed() {
        let creds = Credentials::new("bot@example.com", "hunter2");
        let printed = format!("{creds:?}");
        assert!(printed.contains("bot@example.com"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn default_timeouts() {
        let timeouts = SmtpTimeouts::default();
        assert_eq!(timeouts.connect(), Duration::from_secs(10));
        assert_eq!(timeouts.greeting(), Duration::from_secs(10));
        assert_eq!(timeouts.command(), Duration::from_secs(15));
        assert_eq!(Security::default().default_port(), 465);
    }
}
