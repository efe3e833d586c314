//! MetaTrader file bridge.
//!
//! Communicates with an MQL5 EA that can only read and write files. Each
//! request is written as a JSON command file and answered through a JSON
//! response file in the same directory, correlated by command id.

pub mod channel;
pub mod client;
pub mod correlator;
pub(crate) mod poller;
pub mod protocol;

pub use channel::FileChannel;
pub use client::{Bridge, QueuedReply};
pub use correlator::{Correlator, Reply, Resolution, Settlement};
pub use protocol::{decode_response, encode_command, Response};
