//! Loki Writer Library
//!
//! This library ships log lines to Grafana Loki:
//!
//! - **duration**: Duration shorthand (`1h30m`, `500ms`) parsing
//! - **config**: Raw configuration, validation and defaults
//! - **directive**: Directive block configuration syntax
//! - **backoff**: Deterministic retry schedule
//! - **entry** / **batch**: Labeled entries and per-stream push batches
//! - **client**: HTTP push client with auth, TLS, proxy and retry logic
//! - **shipper**: Background batching worker behind a bounded channel
//! - **writer**: `io::Write` adapter that turns writes into entries
//! - **module**: Host lifecycle (provision, validate, open) and registry
//!
//! # Example
//!
//! ```no_run
//! use std::io::Write;
//! use loki_writer::module::{LokiLog, WriterModule};
//!
//! let mut module = LokiLog::from_directive(r#"
//! loki http://localhost:3100/loki/api/v1/push {
//!     labels {
//!         app svc
//!     }
//! }
//! "#).expect("invalid config");
//!
//! module.provision(None);
//! module.validate().expect("invalid config");
//!
//! let mut writer = module.open_writer().expect("failed to open writer");
//! writer.write_all(b"hello\n").ok();
//! writer.close().ok();
//! ```

// Module declarations
pub mod backoff;
pub mod batch;
pub mod client;
pub mod config;
pub mod directive;
pub mod duration;
pub mod entry;
pub mod error;
pub mod module;
pub mod secret;
pub mod shipper;
pub mod writer;

// Re-export commonly used types at crate root for convenience
pub use backoff::{Backoff, BackoffPolicy};
pub use batch::Batch;
pub use client::{BatchDropped, DropReason, PushClient};
pub use config::{ClientConfig, RawConfig};
pub use duration::{parse_duration, StrTimeDuration};
pub use entry::{Entry, LabelSet};
pub use error::{ConfigError, DurationError, OpenError, PushError};
pub use module::{LokiLog, WriteCloser, WriterModule};
pub use secret::Secret;
pub use shipper::{LokiShipper, Shipper, ShipperStats};
pub use writer::LogWriter;
