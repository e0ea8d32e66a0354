//! Vehicle Signal Manager policy library
//!
//! A rule-driven signal-processing engine for automotive environments. It
//! ingests named signal updates, evaluates a user-authored YAML rule set,
//! and emits derived signals subject to Boolean/arithmetic conditions,
//! hierarchical temporal monitors, delays and ordered activation sequences.
//!
//! # Architecture
//!
//! The library is the deterministic core plus its loaders:
//! - Parses rule files, expressions and signal-number mappings
//! - Tracks signal state with change detection
//! - Walks the condition tree on every input, edge-triggering emissions
//! - Supervises monitored conditions with start/stop windows
//! - Schedules delayed emissions on a logical-millisecond timer queue
//!
//! The library does NOT:
//! - Touch wall-clock time (callers supply logical milliseconds)
//! - Perform transport I/O (the binary owns stdin/stdout)
//! - Scale replay time (the replay adapter maps wall-clock to logical)
//!
//! # Example Usage
//!
//! ```no_run
//! use vsm_policy::{PolicyEngine, Value};
//! use std::path::Path;
//!
//! let mut engine = PolicyEngine::from_files(
//!     Path::new("rules.yaml"),
//!     Path::new("signals.vsi"),
//! ).unwrap();
//!
//! for event in engine.start(0) {
//!     println!("{:?}", event);
//! }
//! for event in engine.inject("transmission.gear", Value::Text("reverse".into()), 10) {
//!     println!("{:?}", event);
//! }
//! ```

// Public modules
pub mod capture;
pub mod engine;
pub mod expr;
pub mod monitor;
pub mod rules;
pub mod sched;
pub mod signum;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use capture::{CaptureWriter, ReplayEvent};
pub use engine::{Emission, EngineEvent, PolicyEngine};
pub use monitor::{MonitorPhase, ViolationReason, ViolationReport};
pub use signum::SignalMap;
pub use store::SignalStore;
pub use types::{Millis, PolicyError, Result, Truth, Value};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
