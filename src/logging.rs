//! Log output setup
//! Routes the `log` macros through `env_logger`, optionally prefixing each
//! line with a local timestamp.

use std::io::Write;

use chrono::Local;
use env_logger::{Builder, Env};

use crate::config::LoggingConfig;

fn builder(config: &LoggingConfig) -> Builder {
    let mut builder = Builder::from_env(Env::default().default_filter_or(config.level.as_str()));
    if config.timestamps {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });
    }
    builder
}

/// Installs the global logger. Calling it again after a logger is set is harmless.
pub fn init(config: &LoggingConfig) {
    if builder(config).try_init().is_ok() {
        log::info!("Logging initialized at level {}", config.level);
    }
}
