//! Conventional receive queue: one descriptor per ring slot, arrivals
//! reported by the receive completion queue.

use rawpath_core::config::DatapathGeometry;
use tracing::{debug, info};

use super::RecvEngine;
use crate::error::{FaultSite, NicFault, TransportError};
use crate::nic::{Lkey, NicDriver, RecvPost, RecvWr, Sge};
use crate::ring::RxRing;

pub(crate) struct CqRecv {
    /// Descriptor `i` always points at ring slot `i`.
    recv_wr: Box<[RecvWr]>,
    /// Next descriptor to post.
    recv_head: usize,
    /// Next slot to report.
    rx_head: usize,
    recvs_outstanding: usize,
    recv_slack: usize,
    postlist: usize,
    bulk: bool,
}

impl CqRecv {
    pub(crate) fn new<N: NicDriver>(
        nic: &mut N,
        geometry: &DatapathGeometry,
        ring: &RxRing,
        lkey: Lkey,
    ) -> Result<Self, TransportError> {
        let entries = geometry.ring_entries;
        debug_assert_eq!(ring.num_slots(), entries);

        let recv_wr: Box<[RecvWr]> = (0..entries)
            .map(|i| {
                RecvWr::new(
                    i as u64,
                    Sge {
                        addr: ring.slot_addr(i),
                        length: ring.slot_size() as u32,
                        lkey,
                    },
                )
            })
            .collect();

        nic.create_rq(entries).map_err(TransportError::QueueSetup)?;
        nic.post_recv(RecvPost::Chain {
            ring: &recv_wr,
            head: 0,
            len: entries,
        })
        .map_err(TransportError::InitialPost)?;

        let bulk = geometry.fast_recv && nic.supports_bulk_recv();
        info!(entries, slack = geometry.recv_slack, bulk, "receive queue ready");

        Ok(Self {
            recv_wr,
            recv_head: 0,
            rx_head: 0,
            recvs_outstanding: 0,
            recv_slack: geometry.recv_slack,
            postlist: geometry.postlist,
            bulk,
        })
    }

    #[cfg(test)]
    fn recv_head(&self) -> usize {
        self.recv_head
    }
}

impl RecvEngine for CqRecv {
    fn rx_burst<N: NicDriver>(&mut self, nic: &mut N, _ring: &RxRing) -> Result<usize, NicFault> {
        let n = nic
            .poll_recv_cq(self.postlist)
            .map_err(|s| NicFault::new(FaultSite::PollRecvCq, s))?;
        self.rx_head = (self.rx_head + n) % self.recv_wr.len();
        Ok(n)
    }

    fn post_recvs<N: NicDriver>(&mut self, nic: &mut N, num_recvs: usize) -> Result<(), NicFault> {
        let entries = self.recv_wr.len();
        debug_assert!(num_recvs <= entries);
        self.recvs_outstanding += num_recvs;
        if self.recvs_outstanding < self.recv_slack {
            return Ok(());
        }

        let count = self.recvs_outstanding;
        if self.bulk {
            let wr = RecvWr::bulk(count);
            nic.post_recv(RecvPost::Bulk(&wr))
                .map_err(|s| NicFault::new(FaultSite::PostRecv, s))?;
        } else {
            nic.post_recv(RecvPost::Chain {
                ring: &self.recv_wr,
                head: self.recv_head,
                len: count,
            })
            .map_err(|s| NicFault::new(FaultSite::PostRecv, s))?;
        }
        debug!(count, head = self.recv_head, bulk = self.bulk, "reposted receive descriptors");

        // The driver re-arms a bulk post in ring order too, so the head
        // tracks both strategies.
        self.recv_head = (self.recv_head + count) % entries;
        self.recvs_outstanding = 0;
        Ok(())
    }

    fn rx_head(&self) -> usize {
        self.rx_head
    }

    fn recvs_outstanding(&self) -> usize {
        self.recvs_outstanding
    }
}
