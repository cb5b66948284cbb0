//! Software NIC that wires a queue pair's send side to its own receive side.
//!
//! Behaves like the hardware at the descriptor level: memory keys and
//! bounds are checked on every segment, multi-segment sends are gathered
//! into one frame, and frames land in posted receive buffers in posting
//! order. Completions are written the way the NIC writes them, so the
//! snapshot reader sees exactly what it would see on a real multi-packet
//! queue.
//!
//! A frame whose IPv4 destination is 0.0.0.0 is discarded, as the switch
//! would. That is how drop injection shows up end to end.
//!
//! Segment addresses are dereferenced only if they fall inside a region
//! that is still registered under the segment's key. Registration is
//! `unsafe` and carries the promise that the region outlives it, which is
//! what makes those reads and writes sound.

use std::collections::VecDeque;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, Ordering};

use memmap2::MmapMut;
use rawpath_core::wire::parse_frame_header;
use tracing::trace;

use crate::nic::{Cqe64, Lkey, MpRqGeometry, NicDriver, NicStatus, RecvPost, SendWr, Sge};

const EFAULT: i32 = 14;
const ENOMEM: i32 = 12;
const EINVAL: i32 = 22;

fn status(code: i32) -> NicStatus {
    NicStatus::new(code).unwrap_or_else(|| unreachable!("error codes are non-zero"))
}

/// Driver operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackOp {
    RegisterMemory,
    DeregisterMemory,
    PostSend,
    PollSendCq,
    CreateRq,
    PostRecv,
    PollRecvCq,
    CreateMpRq,
    PostMpRecv,
}

/// Counters kept by the loopback NIC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub post_send_calls: u64,
    pub tx_pkts: u64,
    pub tx_bytes: u64,
    pub tx_inline: u64,
    /// Frames discarded for a zero destination address.
    pub switch_drops: u64,
    pub rx_delivered: u64,
    /// Frames that found no posted receive buffer.
    pub rx_no_buffer: u64,
    /// Frames larger than the receive buffer.
    pub rx_oversize: u64,
    pub recv_posts: u64,
    pub bulk_recv_posts: u64,
    pub mp_recv_posts: u64,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    addr: u64,
    len: u64,
    lkey: Lkey,
}

struct CqQueue {
    depth: usize,
    /// Posted buffers, in the order they will be filled.
    armed: VecDeque<Sge>,
    /// Filled buffers not yet handed back, oldest first. A bulk post
    /// re-arms from here.
    filled: VecDeque<Sge>,
    completions: usize,
}

struct MpQueue {
    cqes: MmapMut,
    cq_depth: usize,
    cq_pi: usize,
    strides: usize,
    stride_bytes: usize,
    wqes: VecDeque<Sge>,
    /// Counter of the front WQE, wrapping at 2^16.
    wqe_id: u16,
    /// Next stride of the front WQE.
    stride: usize,
}

enum RxQueue {
    None,
    Cq(CqQueue),
    Mp(MpQueue),
}

pub struct LoopbackNic {
    regions: Vec<Region>,
    next_lkey: Lkey,
    bulk_recv: bool,
    rx: RxQueue,
    send_completions: usize,
    frame: Vec<u8>,
    last_send_batch: usize,
    faults: Vec<(LoopbackOp, i32)>,
    stats: LoopbackStats,
}

// Safety: the only pointers held are into the NIC's own completion mapping.
unsafe impl Send for LoopbackNic {}

impl Default for LoopbackNic {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNic {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            next_lkey: 1,
            bulk_recv: false,
            rx: RxQueue::None,
            send_completions: 0,
            frame: Vec::with_capacity(u16::MAX as usize),
            last_send_batch: 0,
            faults: Vec::new(),
            stats: LoopbackStats::default(),
        }
    }

    /// Accept bulk receive posts.
    pub fn with_bulk_recv(mut self) -> Self {
        self.bulk_recv = true;
        self
    }

    pub fn stats(&self) -> LoopbackStats {
        self.stats
    }

    /// Regions currently registered.
    pub fn registrations(&self) -> usize {
        self.regions.len()
    }

    /// Descriptors carried by the most recent `post_send`.
    pub fn last_send_batch(&self) -> usize {
        self.last_send_batch
    }

    /// Make the next call of `op` fail with `code`.
    pub fn fail_next(&mut self, op: LoopbackOp, code: i32) {
        assert!(code != 0, "0 is success");
        self.faults.push((op, code));
    }

    fn injected(&mut self, op: LoopbackOp) -> Result<(), NicStatus> {
        match self.faults.iter().position(|(o, _)| *o == op) {
            Some(i) => Err(status(self.faults.remove(i).1)),
            None => Ok(()),
        }
    }

    fn check_sge(&self, sge: &Sge) -> Result<(), NicStatus> {
        let end = sge.addr.checked_add(u64::from(sge.length)).ok_or(status(EFAULT))?;
        let ok = self
            .regions
            .iter()
            .any(|r| r.lkey == sge.lkey && sge.addr >= r.addr && end <= r.addr + r.len);
        if ok {
            Ok(())
        } else {
            Err(status(EFAULT))
        }
    }

    /// Put one gathered frame on the wire and, unless it is dropped, into
    /// the receive queue.
    fn deliver(rx: &mut RxQueue, stats: &mut LoopbackStats, frame: &[u8]) {
        let Ok(hdr) = parse_frame_header(frame) else {
            stats.rx_oversize += 1;
            return;
        };
        if hdr.ipv4.dst_ip().is_unspecified() {
            stats.switch_drops += 1;
            trace!(len = frame.len(), "loopback switch dropped frame");
            return;
        }

        match rx {
            RxQueue::None => stats.rx_no_buffer += 1,
            RxQueue::Cq(q) => {
                let Some(sge) = q.armed.pop_front() else {
                    stats.rx_no_buffer += 1;
                    return;
                };
                if frame.len() > sge.length as usize {
                    stats.rx_oversize += 1;
                    q.armed.push_front(sge);
                    return;
                }
                // Safety: the segment was validated against a registered
                // region when it was posted.
                unsafe { ptr::copy_nonoverlapping(frame.as_ptr(), sge.addr as *mut u8, frame.len()) };
                q.filled.push_back(sge);
                q.completions += 1;
                stats.rx_delivered += 1;
            }
            RxQueue::Mp(q) => {
                if frame.len() > q.stride_bytes {
                    stats.rx_oversize += 1;
                    return;
                }
                let Some(wqe) = q.wqes.front().copied() else {
                    stats.rx_no_buffer += 1;
                    return;
                };
                let dst = wqe.addr + (q.stride * q.stride_bytes) as u64;
                // Safety: the WQE segment spans `strides * stride_bytes`
                // validated bytes.
                unsafe { ptr::copy_nonoverlapping(frame.as_ptr(), dst as *mut u8, frame.len()) };
                fence(Ordering::Release);

                let cqe = Cqe64::new(q.wqe_id, q.stride as u16, frame.len() as u32);
                let slot = q.cq_pi % q.cq_depth;
                // Safety: the mapping holds cq_depth entries.
                unsafe {
                    let base = q.cqes.as_mut_ptr() as *mut Cqe64;
                    ptr::write_volatile(base.add(slot), cqe);
                }
                q.cq_pi += 1;
                stats.rx_delivered += 1;

                q.stride += 1;
                if q.stride == q.strides {
                    q.wqes.pop_front();
                    q.wqe_id = q.wqe_id.wrapping_add(1);
                    q.stride = 0;
                }
            }
        }
    }
}

impl NicDriver for LoopbackNic {
    unsafe fn register_memory(&mut self, addr: NonNull<u8>, len: usize) -> Result<Lkey, NicStatus> {
        self.injected(LoopbackOp::RegisterMemory)?;
        let lkey = self.next_lkey;
        self.next_lkey += 1;
        self.regions.push(Region {
            addr: addr.as_ptr() as u64,
            len: len as u64,
            lkey,
        });
        Ok(lkey)
    }

    fn deregister_memory(&mut self, lkey: Lkey) -> Result<(), NicStatus> {
        self.injected(LoopbackOp::DeregisterMemory)?;
        let Some(i) = self.regions.iter().position(|r| r.lkey == lkey) else {
            return Err(status(EINVAL));
        };
        self.regions.swap_remove(i);
        Ok(())
    }

    fn post_send(&mut self, wrs: &[SendWr]) -> Result<(), NicStatus> {
        self.injected(LoopbackOp::PostSend)?;
        for wr in wrs {
            if wr.num_sge == 0 || wr.num_sge > wr.sgl.len() {
                return Err(status(EINVAL));
            }
            for sge in wr.sges() {
                self.check_sge(sge)?;
            }
        }

        for wr in wrs {
            self.frame.clear();
            for sge in wr.sges() {
                // Safety: checked against a registered region above, and a
                // registered region is still allocated.
                let bytes = unsafe { std::slice::from_raw_parts(sge.addr as *const u8, sge.length as usize) };
                self.frame.extend_from_slice(bytes);
            }
            self.stats.tx_pkts += 1;
            self.stats.tx_bytes += self.frame.len() as u64;
            if wr.flags.inline {
                self.stats.tx_inline += 1;
            }
            if wr.flags.signaled {
                self.send_completions += 1;
            }
            Self::deliver(&mut self.rx, &mut self.stats, &self.frame);
        }

        self.stats.post_send_calls += 1;
        self.last_send_batch = wrs.len();
        Ok(())
    }

    fn poll_send_cq(&mut self, max: usize) -> Result<usize, NicStatus> {
        self.injected(LoopbackOp::PollSendCq)?;
        let n = self.send_completions.min(max);
        self.send_completions -= n;
        Ok(n)
    }

    fn create_rq(&mut self, depth: usize) -> Result<(), NicStatus> {
        self.injected(LoopbackOp::CreateRq)?;
        if !matches!(self.rx, RxQueue::None) || depth == 0 {
            return Err(status(EINVAL));
        }
        self.rx = RxQueue::Cq(CqQueue {
            depth,
            armed: VecDeque::with_capacity(depth),
            filled: VecDeque::with_capacity(depth),
            completions: 0,
        });
        Ok(())
    }

    fn post_recv(&mut self, post: RecvPost<'_>) -> Result<(), NicStatus> {
        self.injected(LoopbackOp::PostRecv)?;
        match post {
            RecvPost::Chain { .. } => {
                for wr in post.chain() {
                    self.check_sge(&wr.sge)?;
                }
                let RxQueue::Cq(q) = &mut self.rx else {
                    return Err(status(EINVAL));
                };
                let n = post.count();
                if q.armed.len() + n > q.depth {
                    return Err(status(ENOMEM));
                }
                q.armed.extend(post.chain().map(|wr| wr.sge));
                let reposted = n.min(q.filled.len());
                q.filled.drain(..reposted);
                self.stats.recv_posts += 1;
            }
            RecvPost::Bulk(wr) => {
                if !self.bulk_recv || !wr.is_bulk() {
                    return Err(status(EINVAL));
                }
                let RxQueue::Cq(q) = &mut self.rx else {
                    return Err(status(EINVAL));
                };
                let n = wr.num_sge;
                if n > q.filled.len() {
                    return Err(status(EINVAL));
                }
                q.armed.extend(q.filled.drain(..n));
                self.stats.bulk_recv_posts += 1;
            }
        }
        Ok(())
    }

    fn supports_bulk_recv(&self) -> bool {
        self.bulk_recv
    }

    fn poll_recv_cq(&mut self, max: usize) -> Result<usize, NicStatus> {
        self.injected(LoopbackOp::PollRecvCq)?;
        let RxQueue::Cq(q) = &mut self.rx else {
            return Err(status(EINVAL));
        };
        let n = q.completions.min(max);
        q.completions -= n;
        Ok(n)
    }

    fn create_mp_rq(&mut self, geometry: MpRqGeometry) -> Result<NonNull<Cqe64>, NicStatus> {
        self.injected(LoopbackOp::CreateMpRq)?;
        if !matches!(self.rx, RxQueue::None) || geometry.cq_depth == 0 {
            return Err(status(EINVAL));
        }
        let len = geometry.cq_depth * std::mem::size_of::<Cqe64>();
        let mut cqes = MmapMut::map_anon(len).map_err(|_| status(ENOMEM))?;
        let base = NonNull::new(cqes.as_mut_ptr() as *mut Cqe64).ok_or(status(ENOMEM))?;
        self.rx = RxQueue::Mp(MpQueue {
            cqes,
            cq_depth: geometry.cq_depth,
            cq_pi: 0,
            strides: 1 << geometry.log_num_strides,
            stride_bytes: 1 << geometry.log_stride_bytes,
            wqes: VecDeque::new(),
            wqe_id: 0,
            stride: 0,
        });
        Ok(base)
    }

    fn post_mp_recv(&mut self, sge: &Sge) -> Result<(), NicStatus> {
        self.injected(LoopbackOp::PostMpRecv)?;
        self.check_sge(sge)?;
        let RxQueue::Mp(q) = &mut self.rx else {
            return Err(status(EINVAL));
        };
        if sge.length as usize != q.strides * q.stride_bytes {
            return Err(status(EINVAL));
        }
        q.wqes.push_back(*sge);
        self.stats.mp_recv_posts += 1;
        Ok(())
    }
}
