//! Runtime configuration shared by the dispatcher, workers and the client.
//!
//! Everything here is resolved once at process start (mostly through clap's
//! `env` support in [`crate::cli`]) and then passed down explicitly.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable overriding the idle timeout, in whole seconds.
pub const IDLE_TIMEOUT_ENV: &str = "COMPRUNNER_IDLE_TIMEOUT";

/// Environment variable overriding the workers' idle timeout, in whole seconds.
pub const WORKER_IDLE_TIMEOUT_ENV: &str = "COMPRUNNER_WORKER_IDLE_TIMEOUT";

/// Environment variable overriding the abstract socket name.
pub const SOCKET_ENV: &str = "COMPRUNNER_SOCKET";

/// Environment variable naming the log file of an auto-started dispatcher.
pub const SERVER_LOG_ENV: &str = "COMPRUNNER_SERVER_LOG";

/// Abstract-namespace name the dispatcher listens on by default.
pub const DEFAULT_SOCKET_NAME: &str = "comprunner";

/// Idle interval used when nothing overrides it.
pub const DEFAULT_IDLE_SECS: i64 = 60;

/// How long a process may sit with nothing to do before exiting.
///
/// A disabled timeout means "run forever", which is what a supervisor that
/// expects a long-lived container wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTimeout(Option<Duration>);

impl IdleTimeout {
    /// Never exit due to idleness.
    pub const DISABLED: Self = Self(None);

    /// Exit after `duration` of idleness.
    pub fn after(duration: Duration) -> Self {
        Self(Some(duration))
    }

    /// Interpret a number of seconds; zero or negative disables the timeout.
    pub fn from_secs(secs: i64) -> Self {
        if secs <= 0 {
            Self::DISABLED
        } else {
            Self::after(Duration::from_secs(secs as u64))
        }
    }

    /// The timeout, or `None` when disabled.
    pub fn duration(&self) -> Option<Duration> {
        self.0
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }
}

impl Default for IdleTimeout {
    fn default() -> Self {
        Self::from_secs(DEFAULT_IDLE_SECS)
    }
}

impl FromStr for IdleTimeout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs: i64 = s
            .trim()
            .parse()
            .map_err(|_| format!("'{}' is not a whole number of seconds", s))?;
        Ok(Self::from_secs(secs))
    }
}

/// Formats as seconds so the value survives a round trip through a command line.
impl fmt::Display for IdleTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(duration) => write!(f, "{}", duration.as_secs()),
            None => write!(f, "-1"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_secs() {
        assert_eq!(
            IdleTimeout::from_secs(30).duration(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(IdleTimeout::from_secs(0), IdleTimeout::DISABLED);
        assert_eq!(IdleTimeout::from_secs(-1), IdleTimeout::DISABLED);
    }

    #[test]
    fn test_default() {
        let timeout = IdleTimeout::default();
        assert!(timeout.is_enabled());
        assert_eq!(
            timeout.duration(),
            Some(Duration::from_secs(DEFAULT_IDLE_SECS as u64))
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "5".parse::<IdleTimeout>().unwrap(),
            IdleTimeout::from_secs(5)
        );
        assert_eq!(" 7 ".parse::<IdleTimeout>().unwrap(), IdleTimeout::from_secs(7));
        assert_eq!("-3".parse::<IdleTimeout>().unwrap(), IdleTimeout::DISABLED);
        assert!("soon".parse::<IdleTimeout>().is_err());
        assert!("1.5".parse::<IdleTimeout>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for timeout in [IdleTimeout::from_secs(12), IdleTimeout::DISABLED] {
            let parsed: IdleTimeout = timeout.to_string().parse().unwrap();
            assert_eq!(parsed, timeout);
        }
    }
}
