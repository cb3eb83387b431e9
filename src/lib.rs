//! # vssdag: CAN-to-VSS signal transformation engine
//!
//! Ingests vehicle-bus signals decoded from a CAN bus via a DBC database,
//! continuously transforms and combines them through a user-authored
//! mapping pipeline, and emits typed, quality-tagged signals named per the
//! Vehicle Signal Specification hierarchy.
//!
//! ## Architecture
//!
//! - **Decoder** ([`can::DbcDatabase`]): bit-exact frame decoding with
//!   pre-computed invalid/not-available sentinel patterns
//! - **Ingress** ([`can::CanSignalSource`]): SocketCAN reader thread
//!   feeding a lock-free MPSC queue
//! - **Graph** ([`dag::SignalDag`]): dependency-ordered signal nodes with
//!   a stable topological processing order
//! - **Scripting** ([`scripting::ScriptBridge`]): rhai transforms compiled
//!   per node, plus a reactive operator library (`lowpass`, `moving_avg`,
//!   `derivative`, `delayed`, ...)
//! - **Evaluator** ([`processor::SignalProcessor`]): the two-phase
//!   processing loop that applies updates, walks the DAG in order, gates
//!   outputs, and revisits nodes pending deferred re-evaluation
//! - **Output** ([`output`]): text-line and JSON rendering of emissions
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use vssdag::{
//!     can::{CanSignalSource, DbcDatabase},
//!     mapping::load_mapping_file,
//!     processor::SignalProcessor,
//! };
//!
//! # fn main() -> vssdag::Result<()> {
//! let database = Arc::new(DbcDatabase::from_file(Path::new("vehicle.dbc"))?);
//! let mappings = load_mapping_file(Path::new("mappings.yaml"), Some(&database))?;
//! let mut processor = SignalProcessor::new(mappings.clone())?;
//! let source = CanSignalSource::start("can0", database, &mappings)?;
//!
//! loop {
//!     let updates = source.poll();
//!     for emitted in processor.process_signal_updates(updates) {
//!         println!("{}", vssdag::output::format_text(&emitted));
//!     }
//! }
//! # }
//! ```

pub mod can;
pub mod dag;
pub mod error;
pub mod mapping;
pub mod output;
pub mod processor;
pub mod scripting;
pub mod types;

// Re-export commonly used types
pub use can::{CanSignalSource, DbcDatabase, SignalUpdate};
pub use dag::SignalDag;
pub use error::{Result, VssDagError};
pub use mapping::{load_mapping_file, SignalMapping, Transform, UpdateTrigger};
pub use processor::{EmittedSignal, SignalProcessor};
pub use types::{QualifiedValue, SignalQuality, Value, ValueType};
