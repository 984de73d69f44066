//! Engine tuning knobs.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Runtime and log reader configuration.
///
/// Every key is optional in serialized form; missing keys take the
/// [`Default`] value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of each resource runtime's command queue.
    pub command_queue_bound: usize,
    /// Capacity of each resource runtime's event broadcast buffer.
    pub event_buffer: usize,
    /// Entries fetched per log page.
    pub log_page_size: usize,
    /// Display name used when the log join finds no match.
    pub log_fallback_label: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_queue_bound: 256,
            event_buffer: 1024,
            log_page_size: 50,
            log_fallback_label: "System".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON config document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_queue_bound == 0 {
            return Err(ConfigError::Invalid {
                field: "command_queue_bound",
                reason: "must be at least 1",
            });
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "event_buffer",
                reason: "must be at least 1",
            });
        }
        if self.log_page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "log_page_size",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}
