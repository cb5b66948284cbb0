//! `RawTransport`: one NIC queue pair driven by one polling thread.
//!
//! Owns the receive ring, the send descriptor arena and the receive path.
//! Everything is allocated and posted in `new`; the four datapath calls
//! below never allocate and never wait.

use rawpath_core::config::{DatapathGeometry, RawpathConfig};
use tracing::info;

use crate::error::{NicFault, TransportError};
use crate::msgbuf::MsgBuffer;
use crate::nic::{Lkey, NicDriver};
use crate::ring::RxRing;
use crate::rx::{RecvEngine, RecvPath};
use crate::tx::{TxBurstItem, TxEngine};

pub struct RawTransport<N: NicDriver> {
    // Dropped before the ring it may still point into.
    nic: N,
    geometry: DatapathGeometry,
    ring: RxRing,
    ring_lkey: Lkey,
    tx: TxEngine,
    rx: RecvPath,
}

impl<N: NicDriver> RawTransport<N> {
    /// Map and register the receive ring, create the receive queue for
    /// `geometry.mode`, and post every receive buffer.
    pub fn new(mut nic: N, geometry: DatapathGeometry) -> Result<Self, TransportError> {
        let ring = RxRing::new(geometry.mtu, geometry.ring_entries)?;
        let (base, len) = ring.region();
        // Safety: the ring is never deregistered and outlives `nic`, which is
        // declared first in `RawTransport` and so dropped first.
        let ring_lkey = unsafe { nic.register_memory(base, len) }
            .map_err(|s| TransportError::Registration(len, s))?;

        let rx = RecvPath::new(&mut nic, &geometry, &ring, ring_lkey)?;
        let tx = TxEngine::new(&geometry);

        info!(
            mode = ?geometry.mode,
            mtu = geometry.mtu,
            ring_entries = geometry.ring_entries,
            postlist = geometry.postlist,
            max_inline = geometry.max_inline,
            testing = geometry.testing,
            "raw transport up"
        );

        Ok(Self {
            nic,
            geometry,
            ring,
            ring_lkey,
            tx,
            rx,
        })
    }

    pub fn from_config(nic: N, config: &RawpathConfig) -> Result<Self, TransportError> {
        Self::new(nic, config.geometry()?)
    }

    /// Allocate a message buffer sized for this transport's packets and
    /// register it with the NIC.
    pub fn alloc_msg_buffer(&mut self, max_data_size: usize) -> Result<MsgBuffer, TransportError> {
        let mut buf = MsgBuffer::alloc(max_data_size, self.geometry.max_data_per_pkt)?;
        let (base, len) = buf.region();
        // Safety: a registered `MsgBuffer` never frees its memory on drop; it
        // is only released by `free_msg_buffer` after deregistration.
        let lkey = unsafe { self.nic.register_memory(base, len) }
            .map_err(|s| TransportError::Registration(len, s))?;
        buf.set_lkey(lkey);
        Ok(buf)
    }

    /// Deregister a buffer from `alloc_msg_buffer` and free it.
    ///
    /// On error the buffer stays registered and is leaked.
    pub fn free_msg_buffer(&mut self, mut buf: MsgBuffer) -> Result<(), TransportError> {
        let lkey = buf.lkey();
        if lkey != 0 {
            self.nic
                .deregister_memory(lkey)
                .map_err(|s| TransportError::Deregistration(lkey, s))?;
            buf.set_lkey(0);
        }
        Ok(())
    }

    /// Build and post one send descriptor per item, with a single doorbell.
    ///
    /// # Panics
    /// If `items` is longer than the configured postlist.
    #[inline]
    pub fn tx_burst(&mut self, items: &[TxBurstItem<'_>]) -> Result<(), NicFault> {
        self.tx.tx_burst(&mut self.nic, items)
    }

    /// Sends are posted by `tx_burst` itself; there is nothing to flush.
    #[inline]
    pub fn tx_flush(&mut self) -> Result<(), NicFault> {
        Ok(())
    }

    /// Count of newly received packets. They sit in ring slots starting at
    /// the `rx_head()` observed before this call.
    #[inline]
    pub fn rx_burst(&mut self) -> Result<usize, NicFault> {
        self.rx.rx_burst(&mut self.nic, &self.ring)
    }

    /// Return `num_recvs` consumed ring slots to the NIC.
    #[inline]
    pub fn post_recvs(&mut self, num_recvs: usize) -> Result<(), NicFault> {
        self.rx.post_recvs(&mut self.nic, num_recvs)
    }

    pub fn rx_ring(&self) -> &RxRing {
        &self.ring
    }

    /// Ring index of the next packet `rx_burst` will report.
    pub fn rx_head(&self) -> usize {
        self.rx.rx_head()
    }

    /// Arrivals seen by the last snapshot but not reported yet. Always 0 in
    /// completion-queue mode.
    pub fn rx_backlog(&self) -> usize {
        self.rx.backlog()
    }

    pub fn recvs_outstanding(&self) -> usize {
        self.rx.recvs_outstanding()
    }

    pub fn ring_lkey(&self) -> Lkey {
        self.ring_lkey
    }

    pub fn geometry(&self) -> &DatapathGeometry {
        &self.geometry
    }

    pub fn postlist(&self) -> usize {
        self.tx.postlist()
    }

    pub fn nic(&self) -> &N {
        &self.nic
    }

    pub fn nic_mut(&mut self) -> &mut N {
        &mut self.nic
    }
}
