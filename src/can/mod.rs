//! CAN bus support: DBC database decoding and SocketCAN ingress.

mod dbc;
mod source;

pub use dbc::{ByteOrder, DbcDatabase, DecodedSignal, MessageSpec, SignalSpec};
pub use source::{CanSignalSource, SignalUpdate, POLL_BATCH_SIZE};
