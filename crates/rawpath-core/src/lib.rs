//! rawpath-core: wire format and configuration shared by the rawpath
//! datapath, the loopback daemon and the integration tests.

pub mod config;
pub mod wire;

pub use config::{DatapathGeometry, RawpathConfig, RecvMode};
pub use wire::{Endpoint, FrameHeader, PktHdr, PktType, RoutingInfo};
