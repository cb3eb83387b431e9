//! Embedded scripting runtime for signal transforms
//!
//! Transforms are authored in the mapping document as rhai expressions (or
//! declarative value maps) and compiled once at startup. The
//! [`ScriptBridge`] owns the engine and every compiled transform, publishes
//! the evaluator's state into script space, and hosts the reactive
//! operator library (`lowpass`, `moving_avg`, `derivative`, `delayed`, …)
//! whose per-signal state lives on the host side.
//!
//! ## Example transforms
//!
//! Scaling a raw wheel speed to km/h:
//! ```rhai
//! x * 3.6
//! ```
//!
//! Combining two dependencies:
//! ```rhai
//! deps["Battery.Voltage"] * deps["Battery.Current"]
//! ```
//!
//! Guarding against invalid inputs with a hold strategy:
//! ```rhai
//! lowpass(x, 0.2, STRATEGY_HOLD)
//! ```
//!
//! Time-based gating (drives the evaluator's deferred re-evaluation):
//! ```rhai
//! delayed(x, 500.0)
//! ```

mod convert;
mod engine;

pub use convert::{dynamic_to_key, dynamic_to_natural_value, dynamic_to_value, value_to_dynamic};
pub use engine::{
    NodeInvocation, ScriptBridge, TransformOutput, DEFAULT_HOLD_TIMEOUT_SECS, STRATEGY_HOLD,
    STRATEGY_HOLD_TIMEOUT, STRATEGY_PROPAGATE,
};
