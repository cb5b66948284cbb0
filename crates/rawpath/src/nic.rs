//! NIC driver interface: the hardware queue operations the datapath is
//! built on, plus the descriptor types that cross that boundary.
//!
//! Descriptor rings are index-addressed arenas. A batch is always handed to
//! the driver as a slice or as (ring, head, len), never as a linked chain, so
//! the datapath has no link state to break around a submission.
//!
//! Every call is synchronous and non-blocking. A failing call returns a
//! `NicStatus`; the datapath treats any failure on the hot path as fatal.

use std::fmt;
use std::num::NonZeroI32;
use std::ptr::NonNull;

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Local memory key of a registered region.
pub type Lkey = u32;

/// Non-zero status code returned by a failed driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NicStatus(NonZeroI32);

impl NicStatus {
    /// Returns None for 0, which is success and never a status.
    pub fn new(code: i32) -> Option<Self> {
        NonZeroI32::new(code).map(Self)
    }

    pub fn code(self) -> i32 {
        self.0.get()
    }
}

impl fmt::Display for NicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.0)
    }
}

// ── Send descriptors ──────────────────────────────────────────────────────────

/// One scatter-gather element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: Lkey,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    /// Generate a send completion for this descriptor.
    pub signaled: bool,
    /// The driver may copy the data into the descriptor at post time.
    pub inline: bool,
}

/// Send work request. Its segments live inside the descriptor; the first
/// `num_sge` are in use.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendWr {
    pub wr_id: u64,
    pub flags: SendFlags,
    pub num_sge: usize,
    pub sgl: [Sge; 2],
}

impl SendWr {
    pub fn sges(&self) -> &[Sge] {
        &self.sgl[..self.num_sge]
    }

    /// Bytes this descriptor puts on the wire.
    pub fn byte_len(&self) -> usize {
        self.sges().iter().map(|s| s.length as usize).sum()
    }
}

// ── Receive descriptors ───────────────────────────────────────────────────────

/// wr_id that marks a bulk receive request. The driver re-arms `num_sge`
/// descriptors of its own receive ring instead of reading segments.
pub const FAST_RECV_MAGIC_WR_ID: u64 = 3185;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub num_sge: usize,
    pub sge: Sge,
}

impl RecvWr {
    pub fn new(wr_id: u64, sge: Sge) -> Self {
        Self {
            wr_id,
            num_sge: 1,
            sge,
        }
    }

    /// Encoded request to re-arm `count` receive descriptors with one doorbell.
    pub fn bulk(count: usize) -> Self {
        Self {
            wr_id: FAST_RECV_MAGIC_WR_ID,
            num_sge: count,
            sge: Sge::default(),
        }
    }

    pub fn is_bulk(&self) -> bool {
        self.wr_id == FAST_RECV_MAGIC_WR_ID
    }
}

/// A receive post: either a span of the circular descriptor ring or a single
/// bulk sentinel.
#[derive(Debug, Clone, Copy)]
pub enum RecvPost<'a> {
    /// `len` descriptors starting at `ring[head]`, wrapping at the ring's end.
    Chain {
        ring: &'a [RecvWr],
        head: usize,
        len: usize,
    },
    Bulk(&'a RecvWr),
}

impl<'a> RecvPost<'a> {
    /// Number of receive buffers this post hands to the NIC.
    pub fn count(&self) -> usize {
        match self {
            RecvPost::Chain { len, .. } => *len,
            RecvPost::Bulk(wr) => wr.num_sge,
        }
    }

    /// Descriptors of a chain post in ring order. Empty for a bulk post.
    pub fn chain(&self) -> impl Iterator<Item = &'a RecvWr> + 'a {
        let (ring, head, len): (&'a [RecvWr], usize, usize) = match *self {
            RecvPost::Chain { ring, head, len } => (ring, head, len),
            RecvPost::Bulk(_) => (&[], 0, 0),
        };
        let len = if ring.is_empty() { 0 } else { len };
        ring.iter().cycle().skip(head).take(len)
    }
}

// ── Multi-packet receive completions ──────────────────────────────────────────

/// 64-byte receive completion entry as the NIC writes it. Only the fields
/// the snapshot reader uses are broken out.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Cqe64 {
    rsvd0: [u8; 2],
    /// Index of the multi-packet WQE that took the packet, big-endian,
    /// counting up and wrapping at 2^16.
    pub wqe_id: [u8; 2],
    rsvd4: [u8; 40],
    byte_cnt: [u8; 4],
    rsvd48: [u8; 12],
    /// Stride within that WQE, big-endian.
    pub wqe_counter: [u8; 2],
    signature: u8,
    op_own: u8,
}

assert_eq_size!(Cqe64, [u8; 64]);

impl Cqe64 {
    pub fn new(wqe_id: u16, wqe_counter: u16, byte_cnt: u32) -> Self {
        let mut cqe = Self::new_zeroed();
        cqe.wqe_id = wqe_id.to_be_bytes();
        cqe.wqe_counter = wqe_counter.to_be_bytes();
        cqe.byte_cnt = byte_cnt.to_be_bytes();
        cqe
    }

    pub fn byte_cnt(&self) -> u32 {
        u32::from_be_bytes(self.byte_cnt)
    }
}

/// Multi-packet receive queue shape, fixed at queue creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpRqGeometry {
    pub log_num_strides: u32,
    pub log_stride_bytes: u32,
    /// Entries in the completion array the NIC cycles through.
    pub cq_depth: usize,
}

// ── Driver ────────────────────────────────────────────────────────────────────

/// Hardware queue operations of one NIC queue pair.
pub trait NicDriver {
    /// Register `len` bytes at `addr` for NIC access.
    ///
    /// # Safety
    /// The region must stay allocated until `deregister_memory` succeeds for
    /// the returned key, or until the driver is dropped. The NIC reads and
    /// writes it asynchronously through any descriptor carrying that key.
    unsafe fn register_memory(&mut self, addr: NonNull<u8>, len: usize) -> Result<Lkey, NicStatus>;

    /// Revoke NIC access to a registered region. Segments carrying `lkey`
    /// are rejected from then on.
    fn deregister_memory(&mut self, lkey: Lkey) -> Result<(), NicStatus>;

    /// Post a batch of send descriptors with a single doorbell.
    fn post_send(&mut self, wrs: &[SendWr]) -> Result<(), NicStatus>;

    /// Reap up to `max` send completions. Never waits.
    fn poll_send_cq(&mut self, max: usize) -> Result<usize, NicStatus>;

    /// Create a conventional receive queue of `depth` descriptors.
    fn create_rq(&mut self, depth: usize) -> Result<(), NicStatus>;

    fn post_recv(&mut self, post: RecvPost<'_>) -> Result<(), NicStatus>;

    /// Whether `post_recv` understands `RecvPost::Bulk`.
    fn supports_bulk_recv(&self) -> bool {
        false
    }

    /// Reap up to `max` receive completions. Never waits.
    fn poll_recv_cq(&mut self, max: usize) -> Result<usize, NicStatus>;

    /// Create a multi-packet receive queue. Returns the completion array of
    /// `geometry.cq_depth` entries that the NIC overwrites cyclically; it
    /// stays valid for the life of the driver.
    fn create_mp_rq(&mut self, geometry: MpRqGeometry) -> Result<NonNull<Cqe64>, NicStatus>;

    /// Post one multi-packet receive WQE covering all of its strides.
    fn post_mp_recv(&mut self, sge: &Sge) -> Result<(), NicStatus>;
}
