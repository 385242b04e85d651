//! Host-facing lifecycle of the Loki writer and the writer registry.
//!
//! A host looks a writer module up by identifier, feeds it configuration,
//! then drives `provision` → `validate` → `open_writer`. The writer it gets
//! back is closed once, at shutdown.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tracing::{debug, Dispatch};

use crate::config::{ClientConfig, RawConfig};
use crate::directive::{self, MODULE_NAME};
use crate::error::{ConfigError, OpenError};
use crate::shipper::{LokiShipper, Shipper};
use crate::writer::LogWriter;

/// Registry identifier of the Loki writer.
pub const MODULE_ID: &str = "logging.writers.loki";

/// A log sink that can be written to and closed once.
pub trait WriteCloser: io::Write + Send {
    fn close(&mut self) -> io::Result<()>;
}

impl<S: Shipper> WriteCloser for LogWriter<S> {
    fn close(&mut self) -> io::Result<()> {
        LogWriter::close(self)
    }
}

/// Lifecycle a host drives to get a writer out of a module.
pub trait WriterModule: fmt::Display + Send {
    /// Load configuration from its JSON form.
    fn unmarshal_json(&mut self, json: &str) -> Result<(), ConfigError>;

    /// Load configuration from a directive block.
    fn unmarshal_directive(&mut self, block: &str) -> Result<(), ConfigError>;

    /// Attach the diagnostic sink. Without one the global subscriber is used.
    fn provision(&mut self, dispatch: Option<Dispatch>);

    /// Check the configuration and freeze it.
    fn validate(&mut self) -> Result<(), ConfigError>;

    /// Start delivering and return the writer for the producer.
    fn open_writer(&mut self) -> Result<Box<dyn WriteCloser>, OpenError>;

    /// Writers with equal keys push to the same place and may be shared.
    fn writer_key(&self) -> String;
}

/// The Loki writer module.
#[derive(Debug, Default)]
pub struct LokiLog {
    raw: RawConfig,
    config: Option<Arc<ClientConfig>>,
    dispatch: Option<Dispatch>,
}

impl LokiLog {
    pub fn new(raw: RawConfig) -> Self {
        Self {
            raw,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(RawConfig::from_json(json)?))
    }

    pub fn from_directive(block: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(directive::parse_block(block)?))
    }

    pub fn raw(&self) -> &RawConfig {
        &self.raw
    }

    /// The validated configuration, once `validate` has succeeded.
    pub fn config(&self) -> Option<&ClientConfig> {
        self.config.as_deref()
    }

    /// Open the concrete writer, keeping access to the shipper.
    pub fn open(&self) -> Result<LogWriter<LokiShipper>, OpenError> {
        let config = self.config.clone().ok_or(OpenError::NotValidated)?;
        let labels = config.labels.clone();
        let shipper = LokiShipper::new(config, self.dispatch.clone())?;
        Ok(LogWriter::new(shipper, labels))
    }
}

impl fmt::Display for LokiLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MODULE_NAME)
    }
}

impl WriterModule for LokiLog {
    fn unmarshal_json(&mut self, json: &str) -> Result<(), ConfigError> {
        self.raw = RawConfig::from_json(json)?;
        self.config = None;
        Ok(())
    }

    fn unmarshal_directive(&mut self, block: &str) -> Result<(), ConfigError> {
        self.raw = directive::parse_block(block)?;
        self.config = None;
        Ok(())
    }

    fn provision(&mut self, dispatch: Option<Dispatch>) {
        self.dispatch = dispatch;
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        // A failed validation leaves nothing usable behind.
        self.config = None;
        let config = self.raw.validate()?;
        debug!(url = %config.url, labels = %config.labels, "Loki writer configuration validated");
        self.config = Some(Arc::new(config));
        Ok(())
    }

    fn open_writer(&mut self) -> Result<Box<dyn WriteCloser>, OpenError> {
        Ok(Box::new(self.open()?))
    }

    fn writer_key(&self) -> String {
        self.raw.writer_key()
    }
}

/// Builds a fresh, unconfigured module.
pub type Constructor = fn() -> Box<dyn WriterModule>;

fn new_loki_log() -> Box<dyn WriterModule> {
    Box::new(LokiLog::default())
}

static REGISTRY: Lazy<RwLock<HashMap<String, Constructor>>> = Lazy::new(|| {
    let mut modules: HashMap<String, Constructor> = HashMap::new();
    modules.insert(MODULE_ID.to_string(), new_loki_log);
    RwLock::new(modules)
});

/// Register a writer module under `id`.
///
/// Returns `false`, leaving the existing entry in place, if `id` is taken.
pub fn register(id: &str, constructor: Constructor) -> bool {
    let Ok(mut modules) = REGISTRY.write() else {
        return false;
    };
    if modules.contains_key(id) {
        return false;
    }
    modules.insert(id.to_string(), constructor);
    true
}

/// Instantiate the module registered under `id`.
pub fn lookup(id: &str) -> Option<Box<dyn WriterModule>> {
    let modules = REGISTRY.read().ok()?;
    modules.get(id).map(|constructor| constructor())
}

/// Identifiers of every registered module, sorted.
pub fn registered() -> Vec<String> {
    let mut ids: Vec<String> = REGISTRY
        .read()
        .map(|modules| modules.keys().cloned().collect())
        .unwrap_or_default();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: &str = r#"
loki http://localhost:3100/loki/api/v1/push {
    labels {
        app svc
    }
    batchwait 2s
}
"#;

    #[test]
    fn test_loki_is_registered() {
        assert!(registered().contains(&MODULE_ID.to_string()));
        let module = lookup(MODULE_ID).unwrap();
        assert_eq!(module.to_string(), "loki");
    }

    #[test]
    fn test_register_rejects_duplicates() {
        fn other() -> Box<dyn WriterModule> {
            Box::new(LokiLog::default())
        }

        assert!(!register(MODULE_ID, other));
        assert!(register("logging.writers.loki_test_copy", other));
        assert!(lookup("logging.writers.loki_test_copy").is_some());
        assert!(lookup("logging.writers.missing").is_none());
    }

    #[test]
    fn test_lifecycle_from_directive() {
        let mut module = lookup(MODULE_ID).unwrap();
        module.unmarshal_directive(BLOCK).unwrap();
        module.provision(None);
        module.validate().unwrap();

        assert_eq!(module.writer_key(), "loki_log_http://localhost:3100/loki/api/v1/push");

        let mut writer = module.open_writer().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_open_requires_validate() {
        let mut module = LokiLog::from_directive(BLOCK).unwrap();
        assert!(matches!(module.open_writer(), Err(OpenError::NotValidated)));
    }

    #[test]
    fn test_failed_validate_clears_config() {
        let mut module = LokiLog::from_directive(BLOCK).unwrap();
        module.validate().unwrap();
        assert!(module.config().is_some());

        module
            .unmarshal_json(r#"{"url":"http://localhost:3100/loki/api/v1/push"}"#)
            .unwrap();
        let err = module.validate().unwrap_err();
        assert_eq!(err.to_string(), "labels is nil, at least one label is required");
        assert!(module.config().is_none());
    }

    #[test]
    fn test_validated_config_has_defaults() {
        let mut module = LokiLog::from_json(
            r#"{"url":"http://example.com/loki/api/v1/push","labels":{"app":"svc"}}"#,
        )
        .unwrap();
        module.validate().unwrap();

        let config = module.config().unwrap();
        assert_eq!(config.batch_size, 1_048_576);
        assert_eq!(config.labels.get("app"), Some("svc"));
    }
}
