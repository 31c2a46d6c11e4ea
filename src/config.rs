//! Configuration for databases and monitors.
//!
//! Configuration is plain data with sensible defaults; per-request options
//! (`record[queueSize=4]`) override it where they apply.

use serde::Deserialize;

use crate::error::{DatabaseError, DbResult};

/// Smallest queue a monitor will ever run with.
pub const MIN_QUEUE_SIZE: usize = 2;

/// Monitor queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Ready buffers a monitor holds when the request does not say.
    pub queue_size: usize,
    /// Lower bound applied to requested queue sizes (never below 2).
    pub min_queue_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queue_size: MIN_QUEUE_SIZE,
            min_queue_size: MIN_QUEUE_SIZE,
        }
    }
}

impl MonitorConfig {
    /// Queue size to use for a request that asked for `requested`.
    #[must_use]
    pub fn effective_queue_size(&self, requested: Option<usize>) -> usize {
        let floor = self.min_queue_size.max(MIN_QUEUE_SIZE);
        requested.unwrap_or(self.queue_size).max(floor)
    }
}

/// Database-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Defaults for monitors created against this database.
    pub monitor: MonitorConfig,
    /// Trace level given to records added with level 0.
    pub default_trace_level: u8,
}

impl DatabaseConfig {
    /// Parse a JSON configuration document; missing keys take defaults.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if the document is not valid JSON for this shape.
    pub fn from_json(text: &str) -> DbResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| DatabaseError::invalid_request(format!("database config: {e}")))
    }
}
