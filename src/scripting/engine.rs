//! Rhai script bridge
//!
//! Owns the single-threaded script engine that hosts every per-node
//! transform. The bridge publishes the evaluator's view of the world into
//! script space before each node invocation (`x`, `deps`, `deps_status`,
//! `signal_values`, `signal_status`, `_current_signal`, `_current_time`)
//! and registers the reactive operator library as host functions whose
//! state is keyed by the signal currently executing.
//!
//! ## Script-visible surface
//!
//! - `provide(v)` - publish the transform result under the current signal
//! - `get_state()` - private, persistent state table for the current signal
//! - `mark_pending()` / `clear_pending()` - request or cancel deferred
//!   re-evaluation (read by the evaluator's phase 2)
//! - `STATUS_*`, `TYPE_*`, `STRATEGY_*` constants
//! - reactive operators: `lowpass`, `moving_avg`, `derivative`, `median`,
//!   `rate_limit`, `clamp`, `deadband`, `clean_float`, `rising_edge`,
//!   `falling_edge`, `sustained_condition`, `delayed`
//!
//! Operators receive the empty marker (unit) when their input signal is
//! not valid; where a strategy argument applies, `STRATEGY_PROPAGATE`
//! returns empty, `STRATEGY_HOLD` returns the last valid output, and
//! `STRATEGY_HOLD_TIMEOUT` holds for a bounded window before going empty.

use crate::error::{Result, VssDagError};
use crate::mapping::Transform;
use crate::scripting::convert::dynamic_to_key;
use crate::types::{SignalQuality, ValueType};
use rhai::{Dynamic, Engine, Map, Scope, AST};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Invalid-input handling strategy: return empty immediately.
pub const STRATEGY_PROPAGATE: i64 = 0;
/// Invalid-input handling strategy: return the last valid output.
pub const STRATEGY_HOLD: i64 = 1;
/// Invalid-input handling strategy: hold the last valid output for a
/// bounded window, then return empty.
pub const STRATEGY_HOLD_TIMEOUT: i64 = 2;

/// Hold window for `STRATEGY_HOLD_TIMEOUT`, in seconds.
pub const DEFAULT_HOLD_TIMEOUT_SECS: f64 = 5.0;

/// Per-signal state for the built-in operators. Each operator reads and
/// writes only its own fields, so one signal may chain several operators.
struct OperatorState {
    lowpass: Option<f64>,
    last_valid: Option<f64>,
    invalid_since: Option<f64>,
    avg_window: VecDeque<f64>,
    avg_sum: f64,
    deriv_last: Option<(f64, f64)>,
    deriv_value: f64,
    median_window: VecDeque<f64>,
    rate_last: Option<(f64, f64)>,
    rising_last: bool,
    falling_last: bool,
    sustained_since: Option<f64>,
    delay_key: Option<String>,
    delay_value: Dynamic,
    delay_start: f64,
    delay_pending: bool,
    delay_output: Option<Dynamic>,
}

impl Default for OperatorState {
    fn default() -> Self {
        Self {
            lowpass: None,
            last_valid: None,
            invalid_since: None,
            avg_window: VecDeque::new(),
            avg_sum: 0.0,
            deriv_last: None,
            deriv_value: 0.0,
            median_window: VecDeque::new(),
            rate_last: None,
            rising_last: false,
            falling_last: false,
            sustained_since: None,
            delay_key: None,
            delay_value: Dynamic::UNIT,
            delay_start: 0.0,
            delay_pending: false,
            delay_output: None,
        }
    }
}

/// State shared between the host and the registered script functions.
#[derive(Default)]
struct ScriptGlobals {
    current_signal: String,
    current_time: f64,
    /// Mirror of provided values, written through `provide()`
    signal_values: Map,
    /// Input-signal quality codes, script-visible
    signal_status: Map,
    /// Per-signal shared state tables handed out by `get_state()`
    signal_states: HashMap<String, Dynamic>,
    /// Signals that asked for deferred re-evaluation
    pending: BTreeSet<String>,
    operators: HashMap<String, OperatorState>,
}

type SharedGlobals = Arc<RwLock<ScriptGlobals>>;

/// Numeric view of a script value; empty and non-numeric values have none.
fn dyn_num(d: &Dynamic) -> Option<f64> {
    if let Ok(f) = d.as_float() {
        return Some(f);
    }
    if let Ok(i) = d.as_int() {
        return Some(i as f64);
    }
    if let Ok(b) = d.as_bool() {
        return Some(if b { 1.0 } else { 0.0 });
    }
    None
}

/// Script-space truthiness: unit is false, booleans are themselves,
/// numbers compare against zero, everything else is true.
fn truthy(d: &Dynamic) -> bool {
    if d.is_unit() {
        return false;
    }
    if let Ok(b) = d.as_bool() {
        return b;
    }
    if let Ok(i) = d.as_int() {
        return i != 0;
    }
    if let Ok(f) = d.as_float() {
        return f != 0.0;
    }
    true
}

fn clean_noise(v: f64) -> f64 {
    if v.is_finite() && v.abs() < 1e-6 {
        0.0
    } else {
        v
    }
}

/// A transform compiled at startup, invoked once per node execution.
enum CompiledTransform {
    /// Identity on the input
    Direct,
    /// User script, compiled once
    Code(AST),
    /// Finite value map with pre-parsed targets
    ValueMap(Vec<(String, Dynamic)>),
}

/// The result of one transform invocation, before output coercion.
pub struct TransformOutput {
    pub result: Dynamic,
    pub status: SignalQuality,
}

/// Everything the evaluator passes in for one node invocation.
pub struct NodeInvocation<'a> {
    pub name: &'a str,
    pub is_input: bool,
    /// The input value (input signals only; unit for derived)
    pub input: Dynamic,
    /// Incoming quality of the input signal
    pub input_status: SignalQuality,
    /// Dependency name -> typed value (unit when the dependency is not
    /// valid)
    pub deps: Map,
    /// Dependency name -> quality code
    pub deps_status: Map,
    /// Monotonic seconds with microsecond precision
    pub now: f64,
}

/// The bridge between the evaluator and the embedded script engine.
///
/// Strictly single-threaded: only the evaluator may call into it.
pub struct ScriptBridge {
    engine: Engine,
    globals: SharedGlobals,
    base_scope: Scope<'static>,
    transforms: HashMap<String, CompiledTransform>,
}

impl ScriptBridge {
    pub fn new() -> Self {
        let globals: SharedGlobals = Arc::new(RwLock::new(ScriptGlobals::default()));
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine, globals.clone());

        Self {
            engine,
            globals,
            base_scope: Self::build_base_scope(),
            transforms: HashMap::new(),
        }
    }

    /// Constants published to every transform.
    fn build_base_scope() -> Scope<'static> {
        let mut scope = Scope::new();
        scope.push_constant("STATUS_UNKNOWN", SignalQuality::Unknown.code());
        scope.push_constant("STATUS_VALID", SignalQuality::Valid.code());
        scope.push_constant("STATUS_INVALID", SignalQuality::Invalid.code());
        scope.push_constant("STATUS_NOT_AVAILABLE", SignalQuality::NotAvailable.code());
        scope.push_constant("STATUS_STALE", SignalQuality::Stale.code());
        scope.push_constant("STATUS_OUT_OF_RANGE", SignalQuality::OutOfRange.code());

        scope.push_constant("STRATEGY_PROPAGATE", STRATEGY_PROPAGATE);
        scope.push_constant("STRATEGY_HOLD", STRATEGY_HOLD);
        scope.push_constant("STRATEGY_HOLD_TIMEOUT", STRATEGY_HOLD_TIMEOUT);
        scope.push_constant("DEFAULT_HOLD_TIMEOUT", DEFAULT_HOLD_TIMEOUT_SECS);

        scope.push_constant("TYPE_UNSPECIFIED", ValueType::Unspecified.code());
        scope.push_constant("TYPE_BOOL", ValueType::Bool.code());
        scope.push_constant("TYPE_INT8", ValueType::Int8.code());
        scope.push_constant("TYPE_INT16", ValueType::Int16.code());
        scope.push_constant("TYPE_INT32", ValueType::Int32.code());
        scope.push_constant("TYPE_INT64", ValueType::Int64.code());
        scope.push_constant("TYPE_UINT8", ValueType::UInt8.code());
        scope.push_constant("TYPE_UINT16", ValueType::UInt16.code());
        scope.push_constant("TYPE_UINT32", ValueType::UInt32.code());
        scope.push_constant("TYPE_UINT64", ValueType::UInt64.code());
        scope.push_constant("TYPE_FLOAT", ValueType::Float.code());
        scope.push_constant("TYPE_DOUBLE", ValueType::Double.code());
        scope.push_constant("TYPE_STRING", ValueType::String.code());
        scope.push_constant("TYPE_STRUCT", ValueType::Struct.code());
        scope.push_constant("TYPE_BOOL_ARRAY", ValueType::BoolArray.code());
        scope.push_constant("TYPE_INT32_ARRAY", ValueType::Int32Array.code());
        scope.push_constant("TYPE_INT64_ARRAY", ValueType::Int64Array.code());
        scope.push_constant("TYPE_UINT32_ARRAY", ValueType::UInt32Array.code());
        scope.push_constant("TYPE_UINT64_ARRAY", ValueType::UInt64Array.code());
        scope.push_constant("TYPE_FLOAT_ARRAY", ValueType::FloatArray.code());
        scope.push_constant("TYPE_DOUBLE_ARRAY", ValueType::DoubleArray.code());
        scope.push_constant("TYPE_STRING_ARRAY", ValueType::StringArray.code());
        scope.push_constant("TYPE_STRUCT_ARRAY", ValueType::StructArray.code());
        scope
    }

    /// Register the side-channel functions and the reactive operator
    /// library.
    fn configure_engine(engine: &mut Engine, globals: SharedGlobals) {
        // Safety limits
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(10_000);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(1_000);
        engine.set_max_map_size(1_000);

        {
            let g = globals.clone();
            engine.register_fn("provide", move |value: Dynamic| -> Dynamic {
                if let Ok(mut g) = g.write() {
                    let name = g.current_signal.clone();
                    if value.is_unit() {
                        g.signal_values.remove(name.as_str());
                    } else {
                        g.signal_values.insert(name.as_str().into(), value.clone());
                    }
                }
                value
            });
        }

        {
            let g = globals.clone();
            engine.register_fn("get_state", move || -> Dynamic {
                if let Ok(mut g) = g.write() {
                    let name = g.current_signal.clone();
                    g.signal_states
                        .entry(name)
                        .or_insert_with(|| Dynamic::from_map(Map::new()).into_shared())
                        .clone()
                } else {
                    Dynamic::UNIT
                }
            });
        }

        {
            let g = globals.clone();
            engine.register_fn("mark_pending", move || {
                if let Ok(mut g) = g.write() {
                    let name = g.current_signal.clone();
                    g.pending.insert(name);
                }
            });
        }

        {
            let g = globals.clone();
            engine.register_fn("clear_pending", move || {
                if let Ok(mut g) = g.write() {
                    let name = g.current_signal.clone();
                    g.pending.remove(&name);
                }
            });
        }

        Self::register_operators(engine, globals);
    }

    fn register_operators(engine: &mut Engine, globals: SharedGlobals) {
        // Run an operator body against the current signal's state bucket.
        fn with_state<R>(
            globals: &SharedGlobals,
            default: R,
            body: impl FnOnce(&mut OperatorState, f64) -> R,
        ) -> R {
            match globals.write() {
                Ok(mut g) => {
                    let now = g.current_time;
                    let name = g.current_signal.clone();
                    let state = g.operators.entry(name).or_default();
                    body(state, now)
                }
                Err(_) => default,
            }
        }

        fn hold_on_empty(state: &mut OperatorState, now: f64, strategy: i64) -> Dynamic {
            match strategy {
                STRATEGY_HOLD => state
                    .last_valid
                    .map(Dynamic::from_float)
                    .unwrap_or(Dynamic::UNIT),
                STRATEGY_HOLD_TIMEOUT => {
                    let since = *state.invalid_since.get_or_insert(now);
                    if now - since < DEFAULT_HOLD_TIMEOUT_SECS {
                        state
                            .last_valid
                            .map(Dynamic::from_float)
                            .unwrap_or(Dynamic::UNIT)
                    } else {
                        Dynamic::UNIT
                    }
                }
                _ => Dynamic::UNIT,
            }
        }

        fn lowpass(state: &mut OperatorState, now: f64, x: &Dynamic, alpha: f64, strategy: i64) -> Dynamic {
            let Some(v) = dyn_num(x) else {
                return hold_on_empty(state, now, strategy);
            };
            state.invalid_since = None;
            let y = match state.lowpass {
                None => v,
                Some(prev) => clean_noise(alpha * v + (1.0 - alpha) * prev),
            };
            state.lowpass = Some(y);
            state.last_valid = Some(y);
            Dynamic::from_float(y)
        }

        {
            let g = globals.clone();
            engine.register_fn("lowpass", move |x: Dynamic, alpha: Dynamic| -> Dynamic {
                let alpha = dyn_num(&alpha).unwrap_or(0.0);
                with_state(&g, Dynamic::UNIT, |state, now| {
                    lowpass(state, now, &x, alpha, STRATEGY_PROPAGATE)
                })
            });
        }
        {
            let g = globals.clone();
            engine.register_fn(
                "lowpass",
                move |x: Dynamic, alpha: Dynamic, strategy: i64| -> Dynamic {
                    let alpha = dyn_num(&alpha).unwrap_or(0.0);
                    with_state(&g, Dynamic::UNIT, |state, now| {
                        lowpass(state, now, &x, alpha, strategy)
                    })
                },
            );
        }

        {
            let g = globals.clone();
            engine.register_fn("moving_avg", move |x: Dynamic, window: i64| -> Dynamic {
                with_state(&g, Dynamic::UNIT, |state, _| {
                    let Some(v) = dyn_num(&x) else {
                        // Empty input is skipped, but the current mean is
                        // still reported while any history exists
                        if state.avg_window.is_empty() {
                            return Dynamic::UNIT;
                        }
                        return Dynamic::from_float(
                            state.avg_sum / state.avg_window.len() as f64,
                        );
                    };
                    state.avg_window.push_back(v);
                    state.avg_sum += v;
                    while state.avg_window.len() > window.max(1) as usize {
                        if let Some(old) = state.avg_window.pop_front() {
                            state.avg_sum -= old;
                        }
                    }
                    Dynamic::from_float(state.avg_sum / state.avg_window.len() as f64)
                })
            });
        }

        {
            let g = globals.clone();
            engine.register_fn("derivative", move |x: Dynamic| -> Dynamic {
                with_state(&g, Dynamic::UNIT, |state, now| {
                    let Some(v) = dyn_num(&x) else {
                        return Dynamic::UNIT;
                    };
                    let Some((last_v, last_t)) = state.deriv_last else {
                        state.deriv_last = Some((v, now));
                        state.deriv_value = 0.0;
                        return Dynamic::from_float(0.0);
                    };
                    let dt = now - last_t;
                    // dt below 10 ms reuses the previous derivative
                    if dt > 0.01 {
                        state.deriv_value = clean_noise((v - last_v) / dt);
                        state.deriv_last = Some((v, now));
                    }
                    Dynamic::from_float(state.deriv_value)
                })
            });
        }

        {
            let g = globals.clone();
            engine.register_fn("median", move |x: Dynamic, window: i64| -> Dynamic {
                with_state(&g, Dynamic::UNIT, |state, _| {
                    let Some(v) = dyn_num(&x) else {
                        return Dynamic::UNIT;
                    };
                    state.median_window.push_back(v);
                    while state.median_window.len() > window.max(1) as usize {
                        state.median_window.pop_front();
                    }
                    let mut sorted: Vec<f64> = state.median_window.iter().copied().collect();
                    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    Dynamic::from_float(sorted[sorted.len() / 2])
                })
            });
        }

        {
            let g = globals.clone();
            engine.register_fn("rate_limit", move |x: Dynamic, rate: Dynamic| -> Dynamic {
                let rate = dyn_num(&rate).unwrap_or(0.0);
                with_state(&g, Dynamic::UNIT, |state, now| {
                    let Some(v) = dyn_num(&x) else {
                        return Dynamic::UNIT;
                    };
                    let Some((last_v, last_t)) = state.rate_last else {
                        state.rate_last = Some((v, now));
                        return Dynamic::from_float(v);
                    };
                    let dt = now - last_t;
                    let mut out = v;
                    if dt > 0.0 {
                        let max_change = rate * dt;
                        let change = v - last_v;
                        if change.abs() > max_change {
                            out = last_v + max_change.copysign(change);
                        }
                    }
                    state.rate_last = Some((out, now));
                    Dynamic::from_float(out)
                })
            });
        }

        engine.register_fn(
            "clamp",
            |x: Dynamic, lo: Dynamic, hi: Dynamic| -> Dynamic {
                match (dyn_num(&x), dyn_num(&lo), dyn_num(&hi)) {
                    (Some(v), Some(lo), Some(hi)) => Dynamic::from_float(v.clamp(lo, hi)),
                    _ => Dynamic::UNIT,
                }
            },
        );

        engine.register_fn("deadband", |x: Dynamic, threshold: Dynamic| -> Dynamic {
            match (dyn_num(&x), dyn_num(&threshold)) {
                (Some(v), Some(t)) => {
                    Dynamic::from_float(if v.abs() < t { 0.0 } else { v })
                }
                _ => Dynamic::UNIT,
            }
        });

        engine.register_fn("clean_float", |x: Dynamic| -> Dynamic {
            match dyn_num(&x) {
                Some(v) => Dynamic::from_float(clean_noise(v)),
                None => x,
            }
        });

        {
            let g = globals.clone();
            engine.register_fn("rising_edge", move |x: Dynamic| -> bool {
                with_state(&g, false, |state, _| {
                    let current = truthy(&x);
                    let edge = current && !state.rising_last;
                    state.rising_last = current;
                    edge
                })
            });
        }

        {
            let g = globals.clone();
            engine.register_fn("falling_edge", move |x: Dynamic| -> bool {
                with_state(&g, false, |state, _| {
                    let current = truthy(&x);
                    let edge = !current && state.falling_last;
                    state.falling_last = current;
                    edge
                })
            });
        }

        {
            let g = globals.clone();
            engine.register_fn(
                "sustained_condition",
                move |condition: Dynamic, duration_ms: Dynamic| -> bool {
                    let duration_ms = dyn_num(&duration_ms).unwrap_or(0.0);
                    with_state(&g, false, |state, now| {
                        if truthy(&condition) {
                            let since = *state.sustained_since.get_or_insert(now);
                            (now - since) * 1000.0 >= duration_ms
                        } else {
                            state.sustained_since = None;
                            false
                        }
                    })
                },
            );
        }

        {
            let g = globals.clone();
            engine.register_fn("delayed", move |x: Dynamic, delay_ms: Dynamic| -> Dynamic {
                let delay_ms = dyn_num(&delay_ms).unwrap_or(0.0);
                let Ok(mut guard) = g.write() else {
                    return Dynamic::UNIT;
                };
                let ScriptGlobals {
                    current_signal,
                    current_time,
                    pending,
                    operators,
                    ..
                } = &mut *guard;
                let now = *current_time;
                let state = operators.entry(current_signal.clone()).or_default();

                let key = dynamic_to_key(&x).unwrap_or_else(|| "\u{0}nil".to_string());
                if state.delay_key.as_deref() != Some(key.as_str()) {
                    // Input changed: restart the delay window
                    state.delay_key = Some(key);
                    state.delay_value = x.clone();
                    state.delay_start = now;
                    state.delay_pending = true;
                    pending.insert(current_signal.clone());
                }

                if state.delay_pending {
                    if (now - state.delay_start) * 1000.0 >= delay_ms {
                        state.delay_output = Some(state.delay_value.clone());
                        state.delay_pending = false;
                        pending.remove(current_signal.as_str());
                    } else {
                        pending.insert(current_signal.clone());
                    }
                }

                state.delay_output.clone().unwrap_or(Dynamic::UNIT)
            });
        }
    }

    /// Compile one node's transform. A compile failure aborts
    /// initialization.
    pub fn compile_transform(&mut self, name: &str, transform: &Transform) -> Result<()> {
        let compiled = match transform {
            Transform::Direct => CompiledTransform::Direct,
            Transform::Code(source) => {
                let ast = self.engine.compile(source).map_err(|e| {
                    VssDagError::Script(format!(
                        "failed to compile transform for '{}': {}",
                        name, e
                    ))
                })?;
                CompiledTransform::Code(ast)
            }
            Transform::ValueMapping(pairs) => {
                let table = pairs
                    .iter()
                    .map(|(from, to)| (from.clone(), Self::parse_mapping_target(to)))
                    .collect();
                CompiledTransform::ValueMap(table)
            }
        };
        debug!(signal = name, "compiled transform");
        self.transforms.insert(name.to_string(), compiled);
        Ok(())
    }

    /// Targets that look like booleans or numbers become booleans or
    /// numbers; everything else stays a string.
    fn parse_mapping_target(to: &str) -> Dynamic {
        match to {
            "true" => return Dynamic::from_bool(true),
            "false" => return Dynamic::from_bool(false),
            _ => {}
        }
        if let Ok(i) = to.parse::<i64>() {
            return Dynamic::from_int(i);
        }
        if let Ok(f) = to.parse::<f64>() {
            return Dynamic::from_float(f);
        }
        Dynamic::from(to.to_string())
    }

    /// Execute one node's transform and derive the outgoing status.
    pub fn run_transform(&self, invocation: NodeInvocation<'_>) -> Result<TransformOutput> {
        let compiled = self.transforms.get(invocation.name).ok_or_else(|| {
            VssDagError::Script(format!("no transform compiled for '{}'", invocation.name))
        })?;

        // Input signals with non-valid status see the empty marker
        let x = if invocation.is_input && !invocation.input_status.is_valid() {
            Dynamic::UNIT
        } else {
            invocation.input.clone()
        };

        let (values_mirror, status_mirror) = {
            let Ok(mut g) = self.globals.write() else {
                return Err(VssDagError::Script("script globals poisoned".to_string()));
            };
            g.current_signal = invocation.name.to_string();
            g.current_time = invocation.now;
            if invocation.is_input {
                g.signal_status.insert(
                    invocation.name.into(),
                    Dynamic::from_int(invocation.input_status.code()),
                );
            }
            (g.signal_values.clone(), g.signal_status.clone())
        };

        let result = match compiled {
            CompiledTransform::Direct => {
                if invocation.is_input {
                    x.clone()
                } else {
                    // Identity has no meaning without an input
                    Dynamic::UNIT
                }
            }
            CompiledTransform::Code(ast) => {
                let mut scope = self.base_scope.clone();
                scope.push_constant("_current_signal", invocation.name.to_string());
                scope.push_constant("_current_time", invocation.now);
                scope.push_dynamic("x", x.clone());
                scope.push("deps", invocation.deps.clone());
                scope.push("deps_status", invocation.deps_status.clone());
                scope.push("signal_values", values_mirror);
                scope.push("signal_status", status_mirror);

                self.engine
                    .eval_ast_with_scope::<Dynamic>(&mut scope, ast)
                    .map_err(|e| {
                        VssDagError::Script(format!(
                            "transform for '{}' failed: {}",
                            invocation.name, e
                        ))
                    })?
            }
            CompiledTransform::ValueMap(table) => Self::lookup_mapping(table, &x),
        };

        // Implicit provide of the produced value
        if !result.is_unit() {
            if let Ok(mut g) = self.globals.write() {
                g.signal_values
                    .insert(invocation.name.into(), result.clone());
            }
        }

        let status = if invocation.is_input && !invocation.input_status.is_valid() {
            invocation.input_status
        } else if result.is_unit() {
            SignalQuality::Invalid
        } else {
            SignalQuality::Valid
        };

        Ok(TransformOutput { result, status })
    }

    /// Consult the table by stringified value, then by numeric equality of
    /// the keys.
    fn lookup_mapping(table: &[(String, Dynamic)], x: &Dynamic) -> Dynamic {
        let Some(key) = dynamic_to_key(x) else {
            return Dynamic::UNIT;
        };
        if let Some((_, target)) = table.iter().find(|(from, _)| *from == key) {
            return target.clone();
        }
        if let Some(numeric) = dyn_num(x) {
            for (from, target) in table {
                if from.parse::<f64>() == Ok(numeric) {
                    return target.clone();
                }
            }
        }
        Dynamic::UNIT
    }

    /// Snapshot of the signals currently marked for deferred
    /// re-evaluation, in deterministic order.
    pub fn pending_signals(&self) -> Vec<String> {
        match self.globals.read() {
            Ok(g) => g.pending.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// The mirror value last provided for a signal, if any.
    pub fn provided_value(&self, name: &str) -> Option<Dynamic> {
        match self.globals.read() {
            Ok(g) => g.signal_values.get(name).cloned(),
            Err(_) => None,
        }
    }
}

impl Default for ScriptBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptBridge")
            .field("transforms", &self.transforms.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge_with(name: &str, transform: Transform) -> ScriptBridge {
        let mut bridge = ScriptBridge::new();
        bridge.compile_transform(name, &transform).unwrap();
        bridge
    }

    fn invoke(
        bridge: &ScriptBridge,
        name: &str,
        input: Dynamic,
        status: SignalQuality,
        now: f64,
    ) -> TransformOutput {
        bridge
            .run_transform(NodeInvocation {
                name,
                is_input: true,
                input,
                input_status: status,
                deps: Map::new(),
                deps_status: Map::new(),
                now,
            })
            .unwrap()
    }

    #[test]
    fn test_code_transform_scales_input() {
        let bridge = bridge_with("Speed", Transform::Code("x * 3.6".to_string()));
        let out = invoke(
            &bridge,
            "Speed",
            Dynamic::from_float(25.0),
            SignalQuality::Valid,
            0.0,
        );
        assert_eq!(out.result.as_float().unwrap(), 90.0);
        assert_eq!(out.status, SignalQuality::Valid);
    }

    #[test]
    fn test_multi_line_transform_returns_last_expression() {
        let source = "let doubled = x * 2;\ndoubled + 1";
        let bridge = bridge_with("S", Transform::Code(source.to_string()));
        let out = invoke(
            &bridge,
            "S",
            Dynamic::from_int(10),
            SignalQuality::Valid,
            0.0,
        );
        assert_eq!(out.result.as_int().unwrap(), 21);
    }

    #[test]
    fn test_compile_failure_is_fatal() {
        let mut bridge = ScriptBridge::new();
        let err = bridge
            .compile_transform("Bad", &Transform::Code("x *".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("Bad"));
    }

    #[test]
    fn test_invalid_input_sees_empty_and_keeps_status() {
        let bridge = bridge_with("S", Transform::Code("x".to_string()));
        let out = invoke(
            &bridge,
            "S",
            Dynamic::from_float(4.0),
            SignalQuality::Invalid,
            0.0,
        );
        assert!(out.result.is_unit());
        assert_eq!(out.status, SignalQuality::Invalid);

        let out = invoke(
            &bridge,
            "S",
            Dynamic::from_float(4.0),
            SignalQuality::NotAvailable,
            0.0,
        );
        assert_eq!(out.status, SignalQuality::NotAvailable);
    }

    #[test]
    fn test_empty_result_forces_invalid() {
        let bridge = bridge_with("S", Transform::Code("()".to_string()));
        let out = invoke(
            &bridge,
            "S",
            Dynamic::from_float(1.0),
            SignalQuality::Valid,
            0.0,
        );
        assert!(out.result.is_unit());
        assert_eq!(out.status, SignalQuality::Invalid);
    }

    #[test]
    fn test_direct_transform_is_identity() {
        let bridge = bridge_with("S", Transform::Direct);
        let out = invoke(
            &bridge,
            "S",
            Dynamic::from_int(7),
            SignalQuality::Valid,
            0.0,
        );
        assert_eq!(out.result.as_int().unwrap(), 7);
    }

    #[test]
    fn test_value_mapping_exact_and_numeric_keys() {
        let bridge = bridge_with(
            "Gear",
            Transform::ValueMapping(vec![
                ("0".to_string(), "PARK".to_string()),
                ("3".to_string(), "DRIVE".to_string()),
            ]),
        );
        let out = invoke(
            &bridge,
            "Gear",
            Dynamic::from_int(3),
            SignalQuality::Valid,
            0.0,
        );
        assert_eq!(out.result.to_string(), "DRIVE");

        // a float input still matches the numeric form of the key
        let out = invoke(
            &bridge,
            "Gear",
            Dynamic::from_float(3.0),
            SignalQuality::Valid,
            0.0,
        );
        assert_eq!(out.result.to_string(), "DRIVE");

        // no match yields empty, which becomes INVALID
        let out = invoke(
            &bridge,
            "Gear",
            Dynamic::from_int(9),
            SignalQuality::Valid,
            0.0,
        );
        assert!(out.result.is_unit());
        assert_eq!(out.status, SignalQuality::Invalid);
    }

    #[test]
    fn test_value_mapping_bool_and_number_targets() {
        let bridge = bridge_with(
            "S",
            Transform::ValueMapping(vec![
                ("1".to_string(), "true".to_string()),
                ("2".to_string(), "42".to_string()),
                ("3".to_string(), "2.5".to_string()),
            ]),
        );
        assert!(invoke(&bridge, "S", Dynamic::from_int(1), SignalQuality::Valid, 0.0)
            .result
            .as_bool()
            .unwrap());
        assert_eq!(
            invoke(&bridge, "S", Dynamic::from_int(2), SignalQuality::Valid, 0.0)
                .result
                .as_int()
                .unwrap(),
            42
        );
        assert_eq!(
            invoke(&bridge, "S", Dynamic::from_int(3), SignalQuality::Valid, 0.0)
                .result
                .as_float()
                .unwrap(),
            2.5
        );
    }

    #[test]
    fn test_provide_updates_mirror() {
        let bridge = bridge_with("S", Transform::Code("provide(x * 2)".to_string()));
        invoke(
            &bridge,
            "S",
            Dynamic::from_int(21),
            SignalQuality::Valid,
            0.0,
        );
        let provided = bridge.provided_value("S").unwrap();
        assert_eq!(provided.as_int().unwrap(), 42);
    }

    #[test]
    fn test_get_state_persists_across_invocations() {
        let source = r#"
let state = get_state();
if state.count == () { state.count = 0; }
state.count += 1;
state.count
"#;
        let bridge = bridge_with("S", Transform::Code(source.to_string()));
        for expected in 1..=3 {
            let out = invoke(
                &bridge,
                "S",
                Dynamic::from_int(0),
                SignalQuality::Valid,
                0.0,
            );
            assert_eq!(out.result.as_int().unwrap(), expected);
        }
    }

    #[test]
    fn test_lowpass_initializes_and_filters() {
        let bridge = bridge_with("S", Transform::Code("lowpass(x, 0.5)".to_string()));
        let first = invoke(
            &bridge,
            "S",
            Dynamic::from_float(10.0),
            SignalQuality::Valid,
            0.0,
        );
        assert_eq!(first.result.as_float().unwrap(), 10.0);

        let second = invoke(
            &bridge,
            "S",
            Dynamic::from_float(20.0),
            SignalQuality::Valid,
            0.1,
        );
        assert_eq!(second.result.as_float().unwrap(), 15.0);
    }

    #[test]
    fn test_lowpass_hold_strategy_on_invalid() {
        let bridge = bridge_with(
            "S",
            Transform::Code("lowpass(x, 0.5, STRATEGY_HOLD)".to_string()),
        );
        invoke(
            &bridge,
            "S",
            Dynamic::from_float(10.0),
            SignalQuality::Valid,
            0.0,
        );
        let held = invoke(
            &bridge,
            "S",
            Dynamic::from_float(99.0),
            SignalQuality::Invalid,
            0.1,
        );
        assert_eq!(held.result.as_float().unwrap(), 10.0);
        assert_eq!(held.status, SignalQuality::Invalid);
    }

    #[test]
    fn test_lowpass_propagate_strategy_on_invalid() {
        let bridge = bridge_with("S", Transform::Code("lowpass(x, 0.5)".to_string()));
        invoke(
            &bridge,
            "S",
            Dynamic::from_float(10.0),
            SignalQuality::Valid,
            0.0,
        );
        let out = invoke(
            &bridge,
            "S",
            Dynamic::from_float(0.0),
            SignalQuality::Invalid,
            0.1,
        );
        assert!(out.result.is_unit());
    }

    #[test]
    fn test_lowpass_hold_timeout_expires() {
        let bridge = bridge_with(
            "S",
            Transform::Code("lowpass(x, 0.5, STRATEGY_HOLD_TIMEOUT)".to_string()),
        );
        invoke(
            &bridge,
            "S",
            Dynamic::from_float(10.0),
            SignalQuality::Valid,
            0.0,
        );
        let held = invoke(
            &bridge,
            "S",
            Dynamic::UNIT,
            SignalQuality::Invalid,
            1.0,
        );
        assert_eq!(held.result.as_float().unwrap(), 10.0);

        let expired = invoke(
            &bridge,
            "S",
            Dynamic::UNIT,
            SignalQuality::Invalid,
            1.0 + DEFAULT_HOLD_TIMEOUT_SECS + 1.0,
        );
        assert!(expired.result.is_unit());
    }

    #[test]
    fn test_moving_avg_skips_empty_but_reports_mean() {
        let bridge = bridge_with("S", Transform::Code("moving_avg(x, 3)".to_string()));
        invoke(&bridge, "S", Dynamic::from_float(1.0), SignalQuality::Valid, 0.0);
        invoke(&bridge, "S", Dynamic::from_float(2.0), SignalQuality::Valid, 0.1);
        let out = invoke(&bridge, "S", Dynamic::UNIT, SignalQuality::Invalid, 0.2);
        assert_eq!(out.result.as_float().unwrap(), 1.5);
    }

    #[test]
    fn test_moving_avg_window_slides() {
        let bridge = bridge_with("S", Transform::Code("moving_avg(x, 2)".to_string()));
        invoke(&bridge, "S", Dynamic::from_float(1.0), SignalQuality::Valid, 0.0);
        invoke(&bridge, "S", Dynamic::from_float(2.0), SignalQuality::Valid, 0.1);
        let out = invoke(&bridge, "S", Dynamic::from_float(6.0), SignalQuality::Valid, 0.2);
        assert_eq!(out.result.as_float().unwrap(), 4.0);
    }

    #[test]
    fn test_derivative_first_sample_and_slope() {
        let bridge = bridge_with("S", Transform::Code("derivative(x)".to_string()));
        let first = invoke(&bridge, "S", Dynamic::from_float(10.0), SignalQuality::Valid, 1.0);
        assert_eq!(first.result.as_float().unwrap(), 0.0);

        let second = invoke(&bridge, "S", Dynamic::from_float(20.0), SignalQuality::Valid, 1.1);
        assert!((second.result.as_float().unwrap() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_derivative_reuses_value_for_tiny_dt() {
        let bridge = bridge_with("S", Transform::Code("derivative(x)".to_string()));
        invoke(&bridge, "S", Dynamic::from_float(10.0), SignalQuality::Valid, 1.0);
        invoke(&bridge, "S", Dynamic::from_float(20.0), SignalQuality::Valid, 1.1);
        // 5 ms later: previous derivative is reused
        let out = invoke(&bridge, "S", Dynamic::from_float(100.0), SignalQuality::Valid, 1.105);
        assert!((out.result.as_float().unwrap() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_median_of_window() {
        let bridge = bridge_with("S", Transform::Code("median(x, 5)".to_string()));
        for v in [5.0, 1.0, 9.0] {
            invoke(&bridge, "S", Dynamic::from_float(v), SignalQuality::Valid, 0.0);
        }
        let out = invoke(&bridge, "S", Dynamic::from_float(3.0), SignalQuality::Valid, 0.0);
        // window [5, 1, 9, 3] sorted [1, 3, 5, 9] -> index 2
        assert_eq!(out.result.as_float().unwrap(), 5.0);
    }

    #[test]
    fn test_rate_limit_clamps_change() {
        let bridge = bridge_with("S", Transform::Code("rate_limit(x, 50.0)".to_string()));
        invoke(&bridge, "S", Dynamic::from_float(10.0), SignalQuality::Valid, 0.0);
        let out = invoke(&bridge, "S", Dynamic::from_float(20.0), SignalQuality::Valid, 0.1);
        assert!((out.result.as_float().unwrap() - 15.0).abs() < 1e-6);
    }

    #[test]
    fn test_pure_utilities() {
        let bridge = bridge_with("S", Transform::Code("clamp(x, 0.0, 100.0)".to_string()));
        let out = invoke(&bridge, "S", Dynamic::from_float(150.0), SignalQuality::Valid, 0.0);
        assert_eq!(out.result.as_float().unwrap(), 100.0);

        let bridge = bridge_with("S", Transform::Code("deadband(x, 0.5)".to_string()));
        let out = invoke(&bridge, "S", Dynamic::from_float(0.2), SignalQuality::Valid, 0.0);
        assert_eq!(out.result.as_float().unwrap(), 0.0);

        let bridge = bridge_with("S", Transform::Code("clean_float(x)".to_string()));
        let out = invoke(&bridge, "S", Dynamic::from_float(1e-9), SignalQuality::Valid, 0.0);
        assert_eq!(out.result.as_float().unwrap(), 0.0);
    }

    #[test]
    fn test_edge_detectors_fire_once() {
        let bridge = bridge_with("S", Transform::Code("rising_edge(x)".to_string()));
        let rising = |v: bool, t: f64| {
            invoke(&bridge, "S", Dynamic::from_bool(v), SignalQuality::Valid, t)
                .result
                .as_bool()
                .unwrap()
        };
        assert!(!rising(false, 0.0));
        assert!(rising(true, 0.1));
        assert!(!rising(true, 0.2));
        assert!(!rising(false, 0.3));
        assert!(rising(true, 0.4));
    }

    #[test]
    fn test_sustained_condition_needs_duration() {
        let bridge = bridge_with(
            "S",
            Transform::Code("sustained_condition(x, 100.0)".to_string()),
        );
        let check = |v: bool, t: f64| {
            invoke(&bridge, "S", Dynamic::from_bool(v), SignalQuality::Valid, t)
                .result
                .as_bool()
                .unwrap()
        };
        assert!(!check(true, 0.0));
        assert!(!check(true, 0.05));
        assert!(check(true, 0.15));
        // condition drop resets the window
        assert!(!check(false, 0.2));
        assert!(!check(true, 0.25));
    }

    #[test]
    fn test_delayed_marks_pending_then_delivers() {
        let bridge = bridge_with("S", Transform::Code("delayed(x, 500.0)".to_string()));

        let out = invoke(&bridge, "S", Dynamic::from_int(1), SignalQuality::Valid, 0.0);
        assert!(out.result.is_unit());
        assert_eq!(bridge.pending_signals(), vec!["S".to_string()]);

        // still waiting at 300 ms
        let out = invoke(&bridge, "S", Dynamic::from_int(1), SignalQuality::Valid, 0.3);
        assert!(out.result.is_unit());
        assert_eq!(bridge.pending_signals(), vec!["S".to_string()]);

        // delivered at 600 ms, pending cleared
        let out = invoke(&bridge, "S", Dynamic::from_int(1), SignalQuality::Valid, 0.6);
        assert_eq!(out.result.as_int().unwrap(), 1);
        assert!(bridge.pending_signals().is_empty());

        // value change restarts the window
        let out = invoke(&bridge, "S", Dynamic::from_int(2), SignalQuality::Valid, 0.7);
        assert_eq!(out.result.as_int().unwrap(), 1);
        assert_eq!(bridge.pending_signals(), vec!["S".to_string()]);
    }

    #[test]
    fn test_deps_are_read_through_deps_table() {
        let mut bridge = ScriptBridge::new();
        bridge
            .compile_transform(
                "Power",
                &Transform::Code(
                    "deps[\"Battery.Voltage\"] * deps[\"Battery.Current\"]".to_string(),
                ),
            )
            .unwrap();

        let mut deps = Map::new();
        deps.insert("Battery.Voltage".into(), Dynamic::from_float(400.0));
        deps.insert("Battery.Current".into(), Dynamic::from_float(150.0));
        let mut deps_status = Map::new();
        deps_status.insert("Battery.Voltage".into(), Dynamic::from_int(1));
        deps_status.insert("Battery.Current".into(), Dynamic::from_int(1));

        let out = bridge
            .run_transform(NodeInvocation {
                name: "Power",
                is_input: false,
                input: Dynamic::UNIT,
                input_status: SignalQuality::Valid,
                deps,
                deps_status,
                now: 0.0,
            })
            .unwrap();
        assert_eq!(out.result.as_float().unwrap(), 60000.0);
    }

    #[test]
    fn test_state_is_isolated_between_signals() {
        let mut bridge = ScriptBridge::new();
        bridge
            .compile_transform("A", &Transform::Code("lowpass(x, 0.5)".to_string()))
            .unwrap();
        bridge
            .compile_transform("B", &Transform::Code("lowpass(x, 0.5)".to_string()))
            .unwrap();

        let run = |name: &str, v: f64, t: f64| {
            bridge
                .run_transform(NodeInvocation {
                    name,
                    is_input: true,
                    input: Dynamic::from_float(v),
                    input_status: SignalQuality::Valid,
                    deps: Map::new(),
                    deps_status: Map::new(),
                    now: t,
                })
                .unwrap()
                .result
                .as_float()
                .unwrap()
        };

        assert_eq!(run("A", 10.0, 0.0), 10.0);
        // B's filter initializes independently of A's state
        assert_eq!(run("B", 100.0, 0.1), 100.0);
        assert_eq!(run("A", 20.0, 0.2), 15.0);
    }
}
