//! CAN bus ingress
//!
//! Owns the raw SocketCAN socket and the reader thread. Frames whose ids
//! are not subscribed are dropped on the reader thread; subscribed frames
//! are decoded and each resulting update is translated from its
//! database-level signal name to the external signal name before being
//! enqueued on the lock-free MPSC channel that the evaluator drains.
//!
//! The reader blocks on the socket with a read timeout so the stop flag is
//! observed promptly; `stop()` is idempotent and safe to call more than
//! once.

use crate::can::DbcDatabase;
use crate::error::{Result, VssDagError};
use crate::mapping::SignalMapping;
use crate::types::{SignalQuality, Value};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket};
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// One decoded update travelling from the ingress thread to the
/// evaluator.
#[derive(Debug, Clone)]
pub struct SignalUpdate {
    /// External signal name (already translated from the database name)
    pub name: String,
    pub value: Value,
    pub quality: SignalQuality,
    /// Monotonic receive time
    pub timestamp: Instant,
}

/// Upper bound on updates returned by one `poll()` call. Bounds per-tick
/// latency, not throughput.
pub const POLL_BATCH_SIZE: usize = 100;

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const CAN_ID_MASK: u32 = 0x1FFF_FFFF;

/// Subscription tables derived from the input mappings.
struct Subscription {
    /// Database signal name -> external signal name
    translation: HashMap<String, String>,
    /// Message ids carrying at least one subscribed signal
    ids: HashSet<u32>,
    /// External names of all exported signals
    exported: Vec<String>,
}

fn build_subscription(
    database: &DbcDatabase,
    mappings: &[(String, SignalMapping)],
) -> Subscription {
    let mut translation = HashMap::new();
    let mut ids = HashSet::new();
    let mut exported = Vec::new();

    for (name, mapping) in mappings {
        if mapping.source.kind != "dbc" {
            continue;
        }
        translation.insert(mapping.source.name.clone(), name.clone());
        exported.push(name.clone());
        match database.message_id_of(&mapping.source.name) {
            Some(id) => {
                debug!(
                    signal = %mapping.source.name,
                    id = format_args!("0x{:X}", id),
                    "subscribed to message"
                );
                ids.insert(id);
            }
            None => warn!(
                signal = %mapping.source.name,
                "DBC signal not found in database"
            ),
        }
    }

    Subscription {
        translation,
        ids,
        exported,
    }
}

/// Bus ingress component: socket, reader thread, and update queue.
pub struct CanSignalSource {
    receiver: Receiver<SignalUpdate>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    exported: Vec<String>,
}

impl CanSignalSource {
    /// Open the interface, derive the subscription set from the input
    /// mappings, and start the reader thread.
    pub fn start(
        interface: &str,
        database: Arc<DbcDatabase>,
        mappings: &[(String, SignalMapping)],
    ) -> Result<Self> {
        let subscription = build_subscription(&database, mappings);
        if subscription.ids.is_empty() {
            warn!("no CAN message ids to monitor");
        } else {
            info!(
                ids = subscription.ids.len(),
                signals = subscription.translation.len(),
                "monitoring CAN messages on {}",
                interface
            );
        }

        let socket = CanSocket::open(interface)
            .map_err(|e| VssDagError::Bus(format!("failed to open {}: {}", interface, e)))?;

        let (sender, receiver) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let exported = subscription.exported.clone();

        let reader = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                read_loop(socket, database, subscription, sender, stop);
            })
        };

        Ok(Self {
            receiver,
            stop,
            reader: Some(reader),
            exported,
        })
    }

    /// Dequeue up to [`POLL_BATCH_SIZE`] updates in enqueue order.
    pub fn poll(&self) -> Vec<SignalUpdate> {
        let mut updates = Vec::new();
        while updates.len() < POLL_BATCH_SIZE {
            match self.receiver.try_recv() {
                Ok(update) => updates.push(update),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if !updates.is_empty() {
            trace!(count = updates.len(), "polled signal updates");
        }
        updates
    }

    /// External names of the signals this source exports.
    pub fn exported_signals(&self) -> &[String] {
        &self.exported
    }

    /// Signal the reader to exit and join it. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("CAN reader thread panicked");
            }
            info!("CAN reader stopped");
        }
    }
}

impl Drop for CanSignalSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(
    socket: CanSocket,
    database: Arc<DbcDatabase>,
    subscription: Subscription,
    sender: Sender<SignalUpdate>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        // the timeout bounds how long a stop request can go unnoticed
        let frame = match socket.read_frame_timeout(READ_TIMEOUT) {
            Ok(CanFrame::Data(frame)) => frame,
            // remote and error frames carry no signal payload
            Ok(_) => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                warn!("error reading from CAN socket: {}", e);
                continue;
            }
        };

        let id = frame.raw_id() & CAN_ID_MASK;
        if !subscription.ids.contains(&id) {
            continue;
        }

        let timestamp = Instant::now();
        for decoded in database.decode(id, frame.data()) {
            let Some(external) = subscription.translation.get(&decoded.name) else {
                continue;
            };
            trace!(
                signal = %external,
                dbc = %decoded.name,
                quality = %decoded.quality,
                "enqueued update"
            );
            let update = SignalUpdate {
                name: external.clone(),
                value: decoded.value,
                quality: decoded.quality,
                timestamp,
            };
            if sender.send(update).is_err() {
                // evaluator went away; nothing left to do
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::SignalSource;

    const TEST_DBC: &str = r#"
VERSION ""

NS_ :

BS_:

BU_: ECU1

BO_ 291 StatusData: 8 ECU1
 SG_ ErrorCode : 0|8@1+ (1,0) [0|253] "" ECU1

BO_ 512 MotionData: 8 ECU1
 SG_ VehSpd : 0|16@1+ (0.01,0) [0|655.35] "km/h" ECU1
"#;

    fn mapping_for(dbc_name: &str) -> SignalMapping {
        SignalMapping {
            source: SignalSource::new("dbc", dbc_name),
            ..Default::default()
        }
    }

    #[test]
    fn test_subscription_translates_and_collects_ids() {
        let db = DbcDatabase::from_dbc_content(TEST_DBC).unwrap();
        let mappings = vec![
            ("Vehicle.Speed".to_string(), mapping_for("VehSpd")),
            ("Vehicle.Error".to_string(), mapping_for("ErrorCode")),
            (
                "Vehicle.Derived".to_string(),
                SignalMapping {
                    depends_on: vec!["Vehicle.Speed".to_string()],
                    ..Default::default()
                },
            ),
        ];

        let subscription = build_subscription(&db, &mappings);
        assert_eq!(subscription.ids, HashSet::from([291, 512]));
        assert_eq!(
            subscription.translation.get("VehSpd"),
            Some(&"Vehicle.Speed".to_string())
        );
        assert_eq!(
            subscription.exported,
            vec!["Vehicle.Speed".to_string(), "Vehicle.Error".to_string()]
        );
    }

    #[test]
    fn test_unknown_dbc_signal_is_skipped() {
        let db = DbcDatabase::from_dbc_content(TEST_DBC).unwrap();
        let mappings = vec![("X".to_string(), mapping_for("NoSuchSignal"))];
        let subscription = build_subscription(&db, &mappings);
        assert!(subscription.ids.is_empty());
        // the name still translates; the signal just never arrives
        assert_eq!(subscription.translation.len(), 1);
    }
}
