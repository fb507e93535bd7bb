//! Logging setup.
//!
//! The library only emits `tracing` events; nothing is printed unless
//! the embedding process installs a subscriber. [`setup`] installs a
//! compact stdout logger for this crate's events, which is enough for
//! most deployments and for tests.

use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::config::LOG_LEVEL_ENV;
use crate::errors::RecoveryLogError;
use crate::errors::Result;

/// Parse a level name. No level means errors only.
pub fn get_log_level(level: Option<&str>) -> Result<LevelFilter> {
    let Some(level) = level else {
        return Ok(LevelFilter::ERROR);
    };
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        "off" => Ok(LevelFilter::OFF),
        level => Err(RecoveryLogError::InvalidConfig(format!(
            "wrong log level: {level}"
        ))),
    }
}

/// Log this crate's events to stdout at `log_level` and above.
pub fn setup(log_level: Option<&str>) -> Result<()> {
    let log_level = get_log_level(log_level)?;

    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
        .with_filter(Targets::new().with_target("recovery_log", log_level));

    set_global_subscriber(Registry::default().with(logs));
    Ok(())
}

/// [`setup`] with the level taken from `RECOVERY_LOG_LOG_LEVEL`.
pub fn setup_from_env() -> Result<()> {
    let level = std::env::var(LOG_LEVEL_ENV).ok();
    setup(level.as_deref())
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, which happens
    // whenever more than one test sets up logging.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(RecoveryLogError::InvalidConfig(..))
    ));
}

#[test]
fn setup_twice_does_not_panic() {
    setup(Some("trace")).unwrap();
    setup(Some("info")).unwrap();
}
