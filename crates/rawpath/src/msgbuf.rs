//! Message buffers. One RPC message's payload plus a packet header slot
//! for every packet the message is split into.
//!
//! Layout of one allocation:
//!
//!   [ hdr 0 ][ payload, rounded up to 8 bytes ][ hdr 1 ][ hdr 2 ] ...
//!
//! Header 0 sits directly in front of the payload so the first packet goes
//! out as one contiguous segment. Later packets need two segments: their
//! header from the tail, and their slice of the payload.
//!
//! Headers are zeroed at allocation, which is what keeps the IPv4 and UDP
//! checksum fields zero for the life of the buffer.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use rawpath_core::wire::{PktHdr, MAX_MSG_SIZE, MAX_PKT_NUM, PKTHDR_SIZE, PKT_HDR_MAGIC};
use zerocopy::FromBytes;

use crate::error::TransportError;
use crate::nic::Lkey;

const BUF_ALIGN: usize = 64;

/// Owned message buffer in NIC-registered memory.
///
/// The datapath borrows a `MsgBuffer` for one `tx_burst` call and writes only
/// its header slots. Payload bytes are never touched by the datapath.
pub struct MsgBuffer {
    /// Start of the allocation: header 0.
    base: NonNull<u8>,
    layout: Layout,
    max_data_size: usize,
    max_num_pkts: usize,
    max_data_per_pkt: usize,
    data_size: usize,
    num_pkts: usize,
    lkey: Lkey,
}

// Safety: MsgBuffer owns its allocation exclusively. It is not Sync, so
// header writes through a shared reference stay on one thread.
unsafe impl Send for MsgBuffer {}

fn num_pkts_for(data_size: usize, max_data_per_pkt: usize) -> usize {
    if data_size == 0 {
        1
    } else {
        data_size.div_ceil(max_data_per_pkt)
    }
}

fn round_up8(n: usize) -> usize {
    (n + 7) & !7
}

impl MsgBuffer {
    /// Allocate a zeroed buffer for up to `max_data_size` payload bytes, cut
    /// into packets of `max_data_per_pkt`. Every header gets the magic.
    ///
    /// The buffer is unregistered (`lkey` 0) until a transport registers it.
    pub fn alloc(max_data_size: usize, max_data_per_pkt: usize) -> Result<Self, TransportError> {
        if max_data_per_pkt == 0 {
            return Err(TransportError::EmptyPacket);
        }
        let max_num_pkts = num_pkts_for(max_data_size, max_data_per_pkt);
        if max_data_size > MAX_MSG_SIZE || max_num_pkts > MAX_PKT_NUM + 1 {
            return Err(TransportError::MsgTooLarge {
                size: max_data_size,
                max: MAX_MSG_SIZE.min((MAX_PKT_NUM + 1) * max_data_per_pkt),
            });
        }

        let size = PKTHDR_SIZE + round_up8(max_data_size) + (max_num_pkts - 1) * PKTHDR_SIZE;
        let layout = Layout::from_size_align(size, BUF_ALIGN).map_err(|_| {
            TransportError::MsgTooLarge {
                size: max_data_size,
                max: MAX_MSG_SIZE,
            }
        })?;

        // Safety: size is at least PKTHDR_SIZE, so the layout is non-zero.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let base = match NonNull::new(ptr) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };

        let mut buf = Self {
            base,
            layout,
            max_data_size,
            max_num_pkts,
            max_data_per_pkt,
            data_size: max_data_size,
            num_pkts: max_num_pkts,
            lkey: 0,
        };
        for n in 0..max_num_pkts {
            buf.pkthdr_mut(n).set_magic(PKT_HDR_MAGIC);
        }
        Ok(buf)
    }

    /// Header-only buffer for control packets (credit returns, RFRs).
    pub fn control(max_data_per_pkt: usize) -> Result<Self, TransportError> {
        Self::alloc(0, max_data_per_pkt)
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    pub fn num_pkts(&self) -> usize {
        self.num_pkts
    }

    pub fn max_data_per_pkt(&self) -> usize {
        self.max_data_per_pkt
    }

    pub fn lkey(&self) -> Lkey {
        self.lkey
    }

    /// Record the key the NIC registered this buffer under. 0 means
    /// unregistered.
    pub(crate) fn set_lkey(&mut self, lkey: Lkey) {
        self.lkey = lkey;
    }

    /// The whole allocation, for registration with a NIC.
    pub fn region(&self) -> (NonNull<u8>, usize) {
        (self.base, self.layout.size())
    }

    /// Header 0 carries the magic written at allocation.
    pub fn is_valid(&self) -> bool {
        self.pkthdr(0).is_valid()
    }

    /// Shrink or regrow the message within its allocation. Headers of packets
    /// that fall out of range keep their contents.
    pub fn resize(&mut self, new_data_size: usize) -> Result<(), TransportError> {
        if new_data_size > self.max_data_size {
            return Err(TransportError::MsgTooLarge {
                size: new_data_size,
                max: self.max_data_size,
            });
        }
        self.data_size = new_data_size;
        self.num_pkts = num_pkts_for(new_data_size, self.max_data_per_pkt);
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        // Safety: the payload area lies inside the allocation and is only
        // written through `data_mut`, which needs `&mut self`.
        unsafe { std::slice::from_raw_parts(self.data_ptr(), self.data_size) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        // Safety: as in `data`, with exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr() as *mut u8, self.data_size) }
    }

    /// Wire size of packet `n`: header plus its share of the payload.
    pub fn pkt_size(&self, n: usize) -> usize {
        debug_assert!(n < self.num_pkts);
        let offset = n * self.max_data_per_pkt;
        PKTHDR_SIZE + self.max_data_per_pkt.min(self.data_size.saturating_sub(offset))
    }

    /// Copy of header `n`.
    pub fn pkthdr(&self, n: usize) -> PktHdr {
        // Safety: header slots lie inside the allocation and PktHdr has
        // alignment 1.
        let bytes = unsafe { std::slice::from_raw_parts(self.pkthdr_ptr(n).as_ptr(), PKTHDR_SIZE) };
        PktHdr::read_from(bytes).unwrap_or_else(|| unreachable!("header slot is PKTHDR_SIZE bytes"))
    }

    /// Header `n`, for the RPC layer to fill in metadata.
    pub fn pkthdr_mut(&mut self, n: usize) -> &mut PktHdr {
        // Safety: exclusive access through `&mut self`; slot is in bounds.
        unsafe { &mut *(self.pkthdr_ptr(n).as_ptr() as *mut PktHdr) }
    }

    /// Header `n` for the transmit path, which holds only `&MsgBuffer`.
    ///
    /// # Safety
    /// No other reference to header `n` may be live while the returned one
    /// is. MsgBuffer never hands out header references from `&self`, and is
    /// not Sync, so a single transmit loop satisfies this.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn pkthdr_for_tx(&self, n: usize) -> &mut PktHdr {
        &mut *(self.pkthdr_ptr(n).as_ptr() as *mut PktHdr)
    }

    /// Address of header `n`, as a NIC segment address.
    pub fn pkthdr_addr(&self, n: usize) -> u64 {
        self.pkthdr_ptr(n).as_ptr() as u64
    }

    /// Address of payload byte `offset`, as a NIC segment address.
    pub fn data_addr(&self, offset: usize) -> u64 {
        debug_assert!(offset <= self.max_data_size);
        self.data_ptr() as u64 + offset as u64
    }

    fn data_ptr(&self) -> *const u8 {
        // Safety: PKTHDR_SIZE is inside the allocation.
        unsafe { self.base.as_ptr().add(PKTHDR_SIZE) }
    }

    fn pkthdr_ptr(&self, n: usize) -> NonNull<u8> {
        assert!(n < self.max_num_pkts, "packet {n} out of {}", self.max_num_pkts);
        if n == 0 {
            return self.base;
        }
        let offset = PKTHDR_SIZE + round_up8(self.max_data_size) + (n - 1) * PKTHDR_SIZE;
        // Safety: offset + PKTHDR_SIZE <= layout.size() for n < max_num_pkts.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }
}

impl Drop for MsgBuffer {
    /// A buffer still registered with a NIC is leaked rather than freed: the
    /// NIC may read it through its key at any time. Hand it back with
    /// `RawTransport::free_msg_buffer` to release it.
    fn drop(&mut self) {
        if self.lkey != 0 {
            tracing::warn!(
                lkey = self.lkey,
                bytes = self.layout.size(),
                "message buffer dropped while registered, leaking it"
            );
            return;
        }
        // Safety: allocated in `alloc` with this exact layout, and no NIC
        // holds a registration for it.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for MsgBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgBuffer")
            .field("data_size", &self.data_size)
            .field("num_pkts", &self.num_pkts)
            .field("max_data_size", &self.max_data_size)
            .field("lkey", &self.lkey)
            .finish()
    }
}
