use serde::{Deserialize, Serialize};

/// Log output settings. `RUST_LOG` takes precedence over `level` when set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `ecg_bridge_lib=debug`
    pub level: String,
    /// Prefix every line with a local timestamp
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            timestamps: true,
        }
    }
}
