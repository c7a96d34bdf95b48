//! Configuration for the stream drivers.
//!
//! [`StreamConfig`] holds plain settings that can come from code or, with
//! the `config-file` feature, from a TOML document. [`Hooks`] holds the
//! callbacks invoked for signals that arrive after a stream has already
//! terminated.
//!
//! # Example
//!
//! ```ignore
//! use rivulet::config::StreamConfig;
//!
//! let config = StreamConfig::from_toml_str("capture_panics = false")?;
//! assert!(!config.capture_panics);
//! ```

use crate::error::Error;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration document could not be parsed.
    #[error("invalid config: {0}")]
    Parse(String),
}

/// Callback invoked with an error nobody can receive anymore.
pub type ErrorDroppedHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Callback invoked when a value arrives after termination.
pub type NextDroppedHook = Arc<dyn Fn() + Send + Sync>;

/// Callbacks for signals dropped after termination.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Called for every error dropped after termination.
    pub on_error_dropped: Option<ErrorDroppedHook>,
    /// Called for every value dropped after termination.
    pub on_next_dropped: Option<NextDroppedHook>,
}

impl Hooks {
    /// Creates an empty hook set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the dropped-error hook.
    #[must_use]
    pub fn on_error_dropped(mut self, hook: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error_dropped = Some(Arc::new(hook));
        self
    }

    /// Sets the dropped-value hook.
    #[must_use]
    pub fn on_next_dropped(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_next_dropped = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_error_dropped", &self.on_error_dropped.is_some())
            .field("on_next_dropped", &self.on_next_dropped.is_some())
            .finish()
    }
}

/// Settings shared by the concat and retry drivers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    /// Convert panics raised by cursors and factories into
    /// [`ErrorKind::Panicked`](crate::error::ErrorKind::Panicked) errors
    /// instead of unwinding through the driver.
    pub capture_panics: bool,
    /// Log signals dropped after termination at `warn` level.
    pub log_dropped_signals: bool,
    /// Dropped-signal callbacks. Not loadable from files.
    #[serde(skip)]
    pub hooks: Hooks,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            capture_panics: true,
            log_dropped_signals: true,
            hooks: Hooks::default(),
        }
    }
}

impl StreamConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether collaborator panics are captured.
    #[must_use]
    pub fn capture_panics(mut self, capture: bool) -> Self {
        self.capture_panics = capture;
        self
    }

    /// Sets whether dropped signals are logged.
    #[must_use]
    pub fn log_dropped_signals(mut self, log: bool) -> Self {
        self.log_dropped_signals = log;
        self
    }

    /// Replaces the dropped-signal hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Parses a configuration from a TOML document.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Loads a configuration from a TOML file.
    #[cfg(feature = "config-file")]
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub(crate) fn report_error_dropped(&self, err: &Error) {
        if self.log_dropped_signals {
            crate::tracing_compat::warn!(error = %err, "error dropped after termination");
        }
        if let Some(hook) = &self.hooks.on_error_dropped {
            hook(err);
        }
    }

    pub(crate) fn report_next_dropped(&self) {
        if self.log_dropped_signals {
            crate::tracing_compat::trace!("value dropped after termination");
        }
        if let Some(hook) = &self.hooks.on_next_dropped {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn defaults() {
        let config = StreamConfig::default();
        assert!(config.capture_panics);
        assert!(config.log_dropped_signals);
        assert!(config.hooks.on_error_dropped.is_none());
    }

    #[test]
    fn hooks_are_invoked() {
        let errors = Arc::new(AtomicUsize::new(0));
        let nexts = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        let n = Arc::clone(&nexts);
        let config = StreamConfig::new().log_dropped_signals(false).hooks(
            Hooks::new()
                .on_error_dropped(move |_| {
                    e.fetch_add(1, Ordering::SeqCst);
                })
                .on_next_dropped(move || {
                    n.fetch_add(1, Ordering::SeqCst);
                }),
        );
        config.report_error_dropped(&Error::user("late"));
        config.report_next_dropped();
        config.report_next_dropped();
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(nexts.load(Ordering::SeqCst), 2);
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn parses_toml() {
        let config = StreamConfig::from_toml_str("capture_panics = false\n").unwrap();
        assert!(!config.capture_panics);
        assert!(config.log_dropped_signals);

        let err = StreamConfig::from_toml_str("bogus = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
