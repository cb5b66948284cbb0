//! Multi-packet receive queue, read through completion snapshots.
//!
//! The NIC fills the strides of each posted WQE in order and, per packet,
//! overwrites the next entry of a small completion array with the
//! (wqe_id, wqe_counter) it used. Those two counters form one cyclic index
//! over `65536 * strides` positions. Reading the entry at `cqe_idx` and
//! comparing it with the previous reading tells us how far the NIC has moved.
//!
//! Nothing is ever polled or acknowledged; the array is only read.

use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, Ordering};

use rawpath_core::config::DatapathGeometry;
use tracing::{debug, info, trace};

use super::RecvEngine;
use crate::error::{FaultSite, NicFault, TransportError};
use crate::nic::{Cqe64, Lkey, MpRqGeometry, NicDriver, Sge};
use crate::ring::RxRing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CqeSnapshot {
    pub wqe_id: u16,
    pub wqe_counter: u16,
}

impl CqeSnapshot {
    fn cycle_idx(self, strides: usize) -> usize {
        self.wqe_id as usize * strides + self.wqe_counter as usize
    }
}

/// Forward distance from `prev` to `cur` on a cycle of length `cycle`.
fn cycle_delta(prev: CqeSnapshot, cur: CqeSnapshot, strides: usize, cycle: usize) -> usize {
    let prev = prev.cycle_idx(strides);
    let cur = cur.cycle_idx(strides);
    debug_assert!(prev < cycle && cur < cycle);
    (cur + cycle - prev) % cycle
}

/// Read one completion entry the NIC may be rewriting concurrently. Retries
/// until `wqe_id` reads the same on both sides of the counter.
fn snapshot(cqe: NonNull<Cqe64>) -> CqeSnapshot {
    let cqe = cqe.as_ptr();
    loop {
        // Safety: `cqe` points into the completion array the driver handed
        // out, which outlives the receive path. Both fields have alignment 1.
        let (id0, counter, id1) = unsafe {
            let id0 = ptr::read_volatile(ptr::addr_of!((*cqe).wqe_id));
            let counter = ptr::read_volatile(ptr::addr_of!((*cqe).wqe_counter));
            fence(Ordering::Acquire);
            let id1 = ptr::read_volatile(ptr::addr_of!((*cqe).wqe_id));
            (id0, counter, id1)
        };
        if id0 == id1 {
            return CqeSnapshot {
                wqe_id: u16::from_be_bytes(id0),
                wqe_counter: u16::from_be_bytes(counter),
            };
        }
    }
}

pub(crate) struct MpRecv {
    cqe_arr: NonNull<Cqe64>,
    cq_depth: usize,
    cqe_idx: usize,
    prev_snapshot: CqeSnapshot,
    strides: usize,
    cycle: usize,
    ring_entries: usize,
    postlist: usize,
    rx_head: usize,
    backlog: usize,
    /// One segment per WQE, each covering `strides` consecutive ring slots.
    mp_sge: Box<[Sge]>,
    mp_sge_idx: usize,
    recvs_outstanding: usize,
}

// Safety: the completion array belongs to this receive path's queue, which
// moves with it.
unsafe impl Send for MpRecv {}

impl MpRecv {
    pub(crate) fn new<N: NicDriver>(
        nic: &mut N,
        geometry: &DatapathGeometry,
        ring: &RxRing,
        lkey: Lkey,
    ) -> Result<Self, TransportError> {
        let strides = geometry.strides_per_wqe;
        let cq_depth = geometry.recv_cq_depth;
        debug_assert!(cq_depth <= strides);
        debug_assert_eq!(ring.num_slots(), geometry.mp_rq_depth * strides);

        let cqe_arr = nic
            .create_mp_rq(MpRqGeometry {
                log_num_strides: strides.trailing_zeros(),
                log_stride_bytes: ring.slot_size().trailing_zeros(),
                cq_depth,
            })
            .map_err(TransportError::QueueSetup)?;

        // Park every entry at the end of the cycle, as if the last
        // `cq_depth` strides of WQE 0xffff had just completed. The first
        // real completion (WQE 0, stride 0) is then exactly one step ahead
        // of the last entry.
        for i in 0..cq_depth {
            let parked = Cqe64::new(u16::MAX, (strides - (cq_depth - i)) as u16, 0);
            // Safety: i < cq_depth, the length of the driver's array.
            unsafe { ptr::write_volatile(cqe_arr.as_ptr().add(i), parked) };
        }
        fence(Ordering::Release);
        // Safety: cq_depth >= 1.
        let prev_snapshot = snapshot(unsafe { NonNull::new_unchecked(cqe_arr.as_ptr().add(cq_depth - 1)) });
        let cycle = geometry.cqe_snapshot_cycle;
        debug_assert_eq!(prev_snapshot.cycle_idx(strides), cycle - 1);

        let wqe_bytes = strides * ring.slot_size();
        let mp_sge: Box<[Sge]> = (0..geometry.mp_rq_depth)
            .map(|i| Sge {
                addr: ring.slot_addr(i * strides),
                length: wqe_bytes as u32,
                lkey,
            })
            .collect();
        for sge in mp_sge.iter() {
            nic.post_mp_recv(sge).map_err(TransportError::InitialPost)?;
        }

        info!(
            wqes = mp_sge.len(),
            strides,
            stride_bytes = ring.slot_size(),
            cq_depth,
            "multi-packet receive queue ready"
        );

        Ok(Self {
            cqe_arr,
            cq_depth,
            cqe_idx: 0,
            prev_snapshot,
            strides,
            cycle,
            ring_entries: geometry.ring_entries,
            postlist: geometry.postlist,
            rx_head: 0,
            backlog: 0,
            mp_sge,
            mp_sge_idx: 0,
            recvs_outstanding: 0,
        })
    }

    pub(crate) fn backlog(&self) -> usize {
        self.backlog
    }

    fn cqe_at(&self, idx: usize) -> NonNull<Cqe64> {
        debug_assert!(idx < self.cq_depth);
        // Safety: idx < cq_depth.
        unsafe { NonNull::new_unchecked(self.cqe_arr.as_ptr().add(idx)) }
    }
}

impl RecvEngine for MpRecv {
    fn rx_burst<N: NicDriver>(&mut self, _nic: &mut N, ring: &RxRing) -> Result<usize, NicFault> {
        let cur = snapshot(self.cqe_at(self.cqe_idx));
        let delta = cycle_delta(self.prev_snapshot, cur, self.strides, self.cycle);
        if delta == 0 || delta >= self.ring_entries {
            return Ok(0);
        }

        self.backlog += delta;
        let drained = self.backlog.min(self.postlist);
        for _ in 0..drained {
            ring.prefetch(self.rx_head);
            self.rx_head = (self.rx_head + 1) % self.ring_entries;
        }
        self.backlog -= drained;

        self.cqe_idx = (self.cqe_idx + 1) % self.cq_depth;
        self.prev_snapshot = cur;
        trace!(delta, drained, backlog = self.backlog, "rx snapshot");
        Ok(drained)
    }

    fn post_recvs<N: NicDriver>(&mut self, nic: &mut N, num_recvs: usize) -> Result<(), NicFault> {
        debug_assert!(num_recvs <= self.ring_entries);
        self.recvs_outstanding += num_recvs;
        if self.recvs_outstanding < self.strides {
            return Ok(());
        }

        nic.post_mp_recv(&self.mp_sge[self.mp_sge_idx])
            .map_err(|s| NicFault::new(FaultSite::PostMpRecv, s))?;
        debug!(wqe = self.mp_sge_idx, outstanding = self.recvs_outstanding, "reposted multi-packet WQE");
        self.mp_sge_idx = (self.mp_sge_idx + 1) % self.mp_sge.len();
        self.recvs_outstanding -= self.strides;
        Ok(())
    }

    fn rx_head(&self) -> usize {
        self.rx_head
    }

    fn recvs_outstanding(&self) -> usize {
        self.recvs_outstanding
    }
}
