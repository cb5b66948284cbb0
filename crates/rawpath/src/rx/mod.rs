//! Receive path: arrival detection and receive-buffer replenishment.
//!
//! Two implementations, one per receive mode. The transport picks one at
//! construction and keeps it for its lifetime.

mod cq;
mod multi_packet;

pub(crate) use cq::CqRecv;
pub(crate) use multi_packet::MpRecv;

use rawpath_core::config::{DatapathGeometry, RecvMode};

use crate::error::{NicFault, TransportError};
use crate::nic::{Lkey, NicDriver};
use crate::ring::RxRing;

/// Arrival detection plus replenishment for one receive mode.
pub(crate) trait RecvEngine {
    /// Number of newly arrived packets, which occupy ring slots
    /// `rx_head()..` (circularly) as they were before the call. Never waits.
    fn rx_burst<N: NicDriver>(&mut self, nic: &mut N, ring: &RxRing) -> Result<usize, NicFault>;

    /// Hand `num_recvs` consumed slots back. Posts only once enough have
    /// accumulated.
    fn post_recvs<N: NicDriver>(&mut self, nic: &mut N, num_recvs: usize) -> Result<(), NicFault>;

    /// Ring index of the next slot `rx_burst` will report.
    fn rx_head(&self) -> usize;

    /// Consumed slots not yet returned to the NIC.
    fn recvs_outstanding(&self) -> usize;
}

pub(crate) enum RecvPath {
    MultiPacket(MpRecv),
    CompletionQueue(CqRecv),
}

impl RecvPath {
    /// Create the receive queue for `geometry.mode` and post every slot of
    /// `ring` to it.
    pub(crate) fn new<N: NicDriver>(
        nic: &mut N,
        geometry: &DatapathGeometry,
        ring: &RxRing,
        lkey: Lkey,
    ) -> Result<Self, TransportError> {
        Ok(match geometry.mode {
            RecvMode::MultiPacket => RecvPath::MultiPacket(MpRecv::new(nic, geometry, ring, lkey)?),
            RecvMode::CompletionQueue => {
                RecvPath::CompletionQueue(CqRecv::new(nic, geometry, ring, lkey)?)
            }
        })
    }

    /// Multi-packet only: arrivals counted but not yet reported.
    pub(crate) fn backlog(&self) -> usize {
        match self {
            RecvPath::MultiPacket(mp) => mp.backlog(),
            RecvPath::CompletionQueue(_) => 0,
        }
    }
}

impl RecvEngine for RecvPath {
    #[inline]
    fn rx_burst<N: NicDriver>(&mut self, nic: &mut N, ring: &RxRing) -> Result<usize, NicFault> {
        match self {
            RecvPath::MultiPacket(mp) => mp.rx_burst(nic, ring),
            RecvPath::CompletionQueue(cq) => cq.rx_burst(nic, ring),
        }
    }

    #[inline]
    fn post_recvs<N: NicDriver>(&mut self, nic: &mut N, num_recvs: usize) -> Result<(), NicFault> {
        match self {
            RecvPath::MultiPacket(mp) => mp.post_recvs(nic, num_recvs),
            RecvPath::CompletionQueue(cq) => cq.post_recvs(nic, num_recvs),
        }
    }

    fn rx_head(&self) -> usize {
        match self {
            RecvPath::MultiPacket(mp) => mp.rx_head(),
            RecvPath::CompletionQueue(cq) => cq.rx_head(),
        }
    }

    fn recvs_outstanding(&self) -> usize {
        match self {
            RecvPath::MultiPacket(mp) => mp.recvs_outstanding(),
            RecvPath::CompletionQueue(cq) => cq.recvs_outstanding(),
        }
    }
}
