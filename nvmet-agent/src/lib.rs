//! NVMe-oF Target Agent Library
//!
//! This library reconciles a userspace NVMe-oF target daemon against a
//! declarative target configuration.
//!
//! The library is split into several modules:
//! - `context`: the validated configuration snapshot and the HA rules over it
//! - `reconcile`: per-resource reconcilers and their nesting
//! - `keys`: DH-CHAP key files on disk
//! - `target`: lifecycle entry points (full reconcile, namespace hooks, readiness)
//! - `metrics`: Prometheus metrics collection

pub mod context;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod reconcile;
pub mod target;

pub use context::{BdevEngine, Environment, Namespace, RenderContext, TargetConfig};
pub use error::{NvmetError, Result};
pub use keys::KeyStore;
pub use target::NvmetTarget;
