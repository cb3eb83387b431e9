//! Two-phase signal evaluator
//!
//! [`SignalProcessor::process_signal_updates`] is the sole mutator of the
//! authoritative signal store and of the DAG's runtime state. One call (a
//! "tick") runs four steps:
//!
//! 1. **Intake** - store each incoming update's qualified value and mark
//!    the node and its dependents dirty.
//! 2. **Schedule pass** - walk the topological order and mark nodes for
//!    processing: dirty nodes, plus periodic nodes whose interval elapsed
//!    and whose dependencies are all present.
//! 3. **Execute pass** - walk the order again, materialise `deps` /
//!    `deps_status` from the store, invoke the compiled transform,
//!    reconcile the provided value back into the store, and gate the
//!    output on the node's interval.
//! 4. **Phase 2** - re-run every node that marked itself pending during
//!    phase 1 (time-based operators like `delayed`); emit only on the
//!    first valid output or when the canonical text changed.
//!
//! Two clocks are kept: a monotonic one for scheduling and operator
//! arithmetic, a wall clock only for emission timestamps. They are never
//! mixed in comparisons.

use crate::can::SignalUpdate;
use crate::dag::{NodeIndex, SignalDag};
use crate::error::Result;
use crate::mapping::{SignalMapping, UpdateTrigger};
use crate::scripting::{dynamic_to_value, value_to_dynamic, NodeInvocation, ScriptBridge};
use crate::types::{QualifiedValue, SignalQuality, Value};
use rhai::{Dynamic, Map};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, trace};

/// One signal emission leaving the evaluator.
#[derive(Debug, Clone)]
pub struct EmittedSignal {
    pub path: String,
    pub value: Value,
    pub quality: SignalQuality,
    pub timestamp: SystemTime,
}

/// Paired monotonic/wall clock anchors.
///
/// Monotonic seconds are anchored at the wall epoch so operator arithmetic
/// sees epoch-like magnitudes while staying immune to wall-clock jumps.
struct Clock {
    start: Instant,
    start_wall: SystemTime,
    epoch_offset: f64,
}

impl Clock {
    fn new() -> Self {
        let start_wall = SystemTime::now();
        let epoch_offset = start_wall
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            start: Instant::now(),
            start_wall,
            epoch_offset,
        }
    }

    /// Monotonic seconds with microsecond precision.
    fn monotonic_secs(&self) -> f64 {
        self.epoch_offset + self.start.elapsed().as_secs_f64()
    }

    /// Wall-clock time corresponding to a monotonic instant.
    fn wall_of(&self, t: Instant) -> SystemTime {
        self.start_wall + t.saturating_duration_since(self.start)
    }
}

/// The dependency-ordered, quality-aware signal evaluator.
pub struct SignalProcessor {
    dag: SignalDag,
    bridge: ScriptBridge,
    /// Authoritative store of current values, inputs and derived alike.
    /// The script-side `signal_values` is a mirror; this is the source of
    /// truth.
    signal_values: HashMap<String, QualifiedValue>,
    clock: Clock,
}

impl SignalProcessor {
    /// Build the DAG and compile every transform. Any failure here aborts
    /// initialization.
    pub fn new(mappings: Vec<(String, SignalMapping)>) -> Result<Self> {
        let dag = SignalDag::build(mappings)?;
        let mut bridge = ScriptBridge::new();
        for &idx in dag.processing_order() {
            let node = dag.node(idx);
            bridge.compile_transform(&node.name, &node.mapping.transform)?;
        }
        Ok(Self {
            dag,
            bridge,
            signal_values: HashMap::new(),
            clock: Clock::new(),
        })
    }

    /// External names of all input signals.
    pub fn required_input_signals(&self) -> Vec<String> {
        self.dag
            .input_signals()
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Run one tick. See the module docs for the phase structure.
    pub fn process_signal_updates(&mut self, updates: Vec<SignalUpdate>) -> Vec<EmittedSignal> {
        let mut emitted = Vec::new();

        // Intake
        for update in updates {
            match self.dag.index_of(&update.name) {
                Some(idx) if self.dag.node(idx).is_input => {
                    if update.quality.is_valid() {
                        trace!(
                            signal = %update.name,
                            value = %update.value.to_text(),
                            "input update"
                        );
                    } else {
                        trace!(
                            signal = %update.name,
                            status = %update.quality,
                            "input update"
                        );
                    }
                    let wall = self.clock.wall_of(update.timestamp);
                    self.signal_values.insert(
                        update.name.clone(),
                        QualifiedValue::new(update.value, update.quality, wall),
                    );
                    self.dag.node_mut(idx).last_update = Some(update.timestamp);
                    self.dag.mark_dirty(&update.name);
                }
                Some(_) => {
                    debug!(signal = %update.name, "update for derived signal ignored");
                }
                None => {
                    debug!(signal = %update.name, "ignoring unknown signal");
                }
            }
        }

        let now = Instant::now();
        let order: Vec<NodeIndex> = self.dag.processing_order().to_vec();

        // Schedule pass: decide which nodes run this tick
        let mut marked = vec![false; self.dag.len()];
        for &idx in &order {
            let node = self.dag.node(idx);
            let mut needs_processing = node.has_new_data;
            let mut is_periodic_run = false;

            if matches!(
                node.mapping.update_trigger,
                UpdateTrigger::Periodic | UpdateTrigger::Both
            ) && node.mapping.interval_ms > 0
            {
                let deps_present = node
                    .mapping
                    .depends_on
                    .iter()
                    .all(|dep| self.signal_values.contains_key(dep));
                if deps_present {
                    let interval = Duration::from_millis(node.mapping.interval_ms);
                    match node.last_process {
                        None => {
                            needs_processing = true;
                            is_periodic_run = true;
                        }
                        Some(last) if now.saturating_duration_since(last) >= interval => {
                            needs_processing = true;
                            is_periodic_run = true;
                        }
                        Some(_) => {}
                    }
                }
            }

            if needs_processing {
                marked[idx] = true;
                if is_periodic_run {
                    self.dag.node_mut(idx).needs_periodic_update = true;
                }
                let dependents = self.dag.node(idx).dependents.clone();
                for dependent in dependents {
                    self.dag.node_mut(dependent).has_new_data = true;
                }
            }
        }

        // Execute pass
        for &idx in &order {
            if !marked[idx] && !self.dag.node(idx).has_new_data {
                continue;
            }

            let record = self.process_node(idx);

            {
                let node = self.dag.node_mut(idx);
                if node.needs_periodic_update {
                    node.last_process = Some(now);
                    node.needs_periodic_update = false;
                }
            }

            if let Some(record) = record {
                let node = self.dag.node(idx);
                let interval = node.mapping.interval_ms;
                let should_output = match node.last_output {
                    None => true,
                    Some(last) if interval > 0 => {
                        now.saturating_duration_since(last) >= Duration::from_millis(interval)
                    }
                    Some(_) => true,
                };

                if should_output {
                    let text = record.value.to_text();
                    let node = self.dag.node_mut(idx);
                    node.last_output = Some(now);
                    node.last_output_value = text;
                    emitted.push(record);
                } else {
                    trace!(signal = %node.name, "output throttled");
                }
            }

            self.dag.node_mut(idx).has_new_data = false;
        }

        // Phase 2: deferred re-evaluation of self-marked nodes
        for name in self.bridge.pending_signals() {
            let Some(idx) = self.dag.index_of(&name) else {
                continue;
            };
            if self.dag.node(idx).is_input {
                continue;
            }
            trace!(signal = %name, "phase 2 re-evaluation");

            let Some(record) = self.process_node(idx) else {
                continue;
            };
            if !record.quality.is_valid() {
                continue;
            }

            let text = record.value.to_text();
            let node = self.dag.node(idx);
            let changed = node.last_output.is_none() || node.last_output_value != text;
            if changed {
                debug!(signal = %name, value = %text, "phase 2 output");
                let node = self.dag.node_mut(idx);
                node.last_output = Some(now);
                node.last_output_value = text;
                emitted.push(record);
            }
        }

        emitted
    }

    /// Invoke one node's transform against the current store and
    /// reconcile the result. Returns the emission record, or `None` when
    /// the script failed at runtime.
    fn process_node(&mut self, idx: NodeIndex) -> Option<EmittedSignal> {
        let node = self.dag.node(idx);
        let name = node.name.clone();
        let is_input = node.is_input;
        let datatype = node.mapping.datatype;
        let struct_type = node.mapping.struct_type.clone();
        let struct_fields = node.mapping.struct_fields.clone();
        let depends_on = node.mapping.depends_on.clone();

        let (input, input_status) = if is_input {
            match self.signal_values.get(&name) {
                Some(qv) => (value_to_dynamic(&qv.value), qv.quality),
                None => (Dynamic::UNIT, SignalQuality::Valid),
            }
        } else {
            (Dynamic::UNIT, SignalQuality::Valid)
        };

        // Dependencies materialise from the store: typed value when valid,
        // the empty marker otherwise
        let mut deps = Map::new();
        let mut deps_status = Map::new();
        for dep in &depends_on {
            match self.signal_values.get(dep) {
                Some(qv) if qv.quality.is_valid() => {
                    deps.insert(dep.as_str().into(), value_to_dynamic(&qv.value));
                }
                _ => {
                    deps.insert(dep.as_str().into(), Dynamic::UNIT);
                }
            }
            if let Some(qv) = self.signal_values.get(dep) {
                deps_status.insert(dep.as_str().into(), Dynamic::from_int(qv.quality.code()));
            }
        }

        let output = match self.bridge.run_transform(NodeInvocation {
            name: &name,
            is_input,
            input,
            input_status,
            deps,
            deps_status,
            now: self.clock.monotonic_secs(),
        }) {
            Ok(output) => output,
            Err(e) => {
                // The node yields nothing this tick; dependents keep the
                // previous stored value
                error!("{}", e);
                return None;
            }
        };

        let value = dynamic_to_value(&output.result, datatype, &struct_type, &struct_fields);
        let wall_now = SystemTime::now();

        if !output.result.is_unit() {
            // Read back what the transform provided (a script may provide
            // a different value than it returns) and make it authoritative
            let provided = self
                .bridge
                .provided_value(&name)
                .unwrap_or_else(|| output.result.clone());
            let stored = dynamic_to_value(&provided, datatype, &struct_type, &struct_fields);
            self.signal_values.insert(
                name.clone(),
                QualifiedValue::new(stored, SignalQuality::Valid, wall_now),
            );
        }

        Some(EmittedSignal {
            path: name,
            value,
            quality: output.status,
            timestamp: wall_now,
        })
    }
}
