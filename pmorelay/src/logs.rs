//! Logging bootstrap.
//!
//! A `Registry` with a reloadable level filter, plus an optional console
//! layer. Both settings come from the `host.logger` section of pmoconfig.

use std::str::FromStr;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, reload, util::SubscriberInitExt, Registry,
};

/// Level used when the configured one is missing or invalid.
const DEFAULT_LEVEL: LevelFilter = LevelFilter::INFO;

/// Runtime control over the installed subscriber.
#[derive(Clone)]
pub struct LogHandle {
    reload: reload::Handle<LevelFilter, Registry>,
    installed: bool,
}

impl LogHandle {
    /// Change the maximum level (`"error"`, `"warn"`, `"info"`, `"debug"`,
    /// `"trace"`, `"off"`).
    pub fn set_level(&self, level: &str) -> anyhow::Result<()> {
        let filter = parse_level(level)
            .ok_or_else(|| anyhow::anyhow!("Invalid log level: {}", level))?;
        self.reload.reload(filter)?;
        tracing::info!("Log level changed to {}", filter);
        Ok(())
    }

    pub fn level(&self) -> Option<LevelFilter> {
        self.reload.clone_current()
    }

    /// `false` when another global subscriber was already installed.
    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    LevelFilter::from_str(level.trim()).ok()
}

/// Install the global subscriber. Calling it twice is harmless: the second
/// handle controls a filter that is not installed.
pub fn init_logging(config: &pmoconfig::Config) -> LogHandle {
    let level = config
        .get_log_min_level()
        .ok()
        .and_then(|level| parse_level(&level))
        .unwrap_or(DEFAULT_LEVEL);
    let enable_console = config.get_log_enable_console().unwrap_or(true);

    let (filter, reload) = reload::Layer::new(level);
    let subscriber = Registry::default().with(filter);

    let installed = if enable_console {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true),
            )
            .try_init()
            .is_ok()
    } else {
        subscriber.try_init().is_ok()
    };

    LogHandle { reload, installed }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(LevelFilter::WARN));
        assert_eq!(parse_level("off"), Some(LevelFilter::OFF));
        assert_eq!(parse_level("loud"), None);
    }
}
