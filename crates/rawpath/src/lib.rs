//! rawpath: raw-Ethernet RPC datapath over a kernel-bypass NIC queue pair.
//!
//! `RawTransport` turns batches of message-buffer packets into send
//! descriptors, detects arrivals on a multi-packet or conventional receive
//! queue, and hands consumed receive buffers back to the NIC in batches.
//! The NIC itself sits behind the `NicDriver` trait; `LoopbackNic` is a
//! software implementation that delivers every send back to its own
//! receive queue.

pub mod error;
pub mod loopback;
pub mod msgbuf;
pub mod nic;
pub mod ring;
mod rx;
pub mod transport;
pub mod tx;

pub use error::{NicFault, TransportError};
pub use loopback::{LoopbackNic, LoopbackStats};
pub use msgbuf::MsgBuffer;
pub use nic::NicDriver;
pub use ring::RxRing;
pub use transport::RawTransport;
pub use tx::TxBurstItem;
