//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::SyncError;

/// Which letters count as the end of a completed word for the
/// immediate-flush rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WordBoundaryPolicy {
    /// ASCII letters plus the Latin-1 accented range (`À`–`ÿ`).
    LatinOnly,
    /// Any Unicode alphabetic character.
    AnyScript,
}

impl WordBoundaryPolicy {
    pub fn is_letter(self, c: char) -> bool {
        match self {
            Self::LatinOnly => {
                c.is_ascii_alphabetic() || (('\u{C0}'..='\u{FF}').contains(&c) && c != '×' && c != '÷')
            }
            Self::AnyScript => c.is_alphabetic(),
        }
    }
}

/// Sync engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// WebSocket endpoint of the room server
    pub server_url: String,
    /// HTTP base used for the readiness probe and document fetches
    pub http_base: String,
    /// Path of the idempotent readiness endpoint
    pub probe_path: String,
    /// Upper bound for the readiness probe and channel upgrade
    pub probe_timeout_ms: u64,
    /// Debounce window for text flushes
    pub debounce_ms: u64,
    /// Net character delta that forces an immediate flush
    pub flush_char_threshold: usize,
    pub word_boundary: WordBoundaryPolicy,
    /// Coalescing delay for caret broadcasts
    pub cursor_coalesce_ms: u64,
    /// Pixel movement (per axis) below which an unchanged offset is not rebroadcast
    pub cursor_min_pixel_delta: f32,
    /// Acknowledgment deadline; `None` waits forever
    pub ack_timeout_ms: Option<u64>,
    /// Delay before re-fetching the server copy after a failed reconciliation
    pub reconcile_retry_ms: u64,
    /// Delay before re-acquiring the channel after it failed or dropped
    pub reconnect_ms: u64,
    /// Buffer size of the session event channel
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090/sync".to_string(),
            http_base: "http://127.0.0.1:9090".to_string(),
            probe_path: "/sync/ready".to_string(),
            probe_timeout_ms: 3_000,
            debounce_ms: 500,
            flush_char_threshold: 10,
            word_boundary: WordBoundaryPolicy::AnyScript,
            cursor_coalesce_ms: 50,
            cursor_min_pixel_delta: 2.0,
            ack_timeout_ms: Some(10_000),
            reconcile_retry_ms: 2_000,
            reconnect_ms: 3_000,
            event_buffer: 256,
        }
    }
}

impl SyncConfig {
    /// Config for tests: default cadence, short probe and ack deadlines.
    pub fn for_testing() -> Self {
        Self {
            probe_timeout_ms: 200,
            ack_timeout_ms: Some(1_000),
            event_buffer: 1024,
            ..Self::default()
        }
    }

    /// Load a JSON config file; missing fields fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.as_ref().display())))?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.flush_char_threshold == 0 {
            return Err(SyncError::Config("flush_char_threshold must be positive".into()));
        }
        if self.event_buffer == 0 {
            return Err(SyncError::Config("event_buffer must be positive".into()));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn cursor_coalesce(&self) -> Duration {
        Duration::from_millis(self.cursor_coalesce_ms)
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_ms.map(Duration::from_millis)
    }

    pub fn reconcile_retry(&self) -> Duration {
        Duration::from_millis(self.reconcile_retry_ms)
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }

    /// Full readiness probe URL.
    pub fn probe_url(&self) -> String {
        format!("{}{}", self.http_base.trim_end_matches('/'), self.probe_path)
    }
}

/// The user editing through this session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub user_email: String,
    pub username: String,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, user_email: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_email: user_email.into(),
            username: username.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_cadence() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce(), Duration::from_millis(500));
        assert_eq!(config.flush_char_threshold, 10);
        assert_eq!(config.cursor_coalesce(), Duration::from_millis(50));
        assert_eq!(config.cursor_min_pixel_delta, 2.0);
        assert!(config.probe_timeout() <= Duration::from_secs(5));
    }

    #[test]
    fn test_latin_policy() {
        let p = WordBoundaryPolicy::LatinOnly;
        assert!(p.is_letter('a'));
        assert!(p.is_letter('é'));
        assert!(!p.is_letter('×'));
        assert!(!p.is_letter('ж'));
        assert!(!p.is_letter('3'));
    }

    #[test]
    fn test_any_script_policy() {
        let p = WordBoundaryPolicy::AnyScript;
        assert!(p.is_letter('ж'));
        assert!(p.is_letter('語'));
        assert!(!p.is_letter('!'));
    }

    #[test]
    fn test_from_json_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"debounce_ms": 250, "word_boundary": "latin-only"}}"#).unwrap();

        let config = SyncConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.word_boundary, WordBoundaryPolicy::LatinOnly);
        assert_eq!(config.flush_char_threshold, 10);
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let config = SyncConfig {
            flush_char_threshold: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_probe_url() {
        let config = SyncConfig {
            http_base: "http://host:1/".into(),
            probe_path: "/ready".into(),
            ..SyncConfig::default()
        };
        assert_eq!(config.probe_url(), "http://host:1/ready");
    }
}
