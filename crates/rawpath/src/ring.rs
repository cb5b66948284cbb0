//! Receive ring: one anonymous mapping cut into fixed-size slots.
//!
//! In multi-packet mode the slots are the strides of the WQEs laid end to
//! end, so slot `i` is stride `i % strides` of WQE `i / strides`. In
//! completion-queue mode slot `i` backs receive descriptor `i`. Either way the
//! NIC writes packets here and the datapath only reads them.

use std::ptr::NonNull;

use memmap2::MmapMut;
use rawpath_core::wire::{parse_frame_header, FrameHeader, PktHdr, PKTHDR_SIZE};
use zerocopy::FromBytes;

use crate::error::TransportError;

pub struct RxRing {
    // Keeps the mapping alive; all access goes through `base`.
    _extent: MmapMut,
    base: NonNull<u8>,
    slot_size: usize,
    num_slots: usize,
}

// Safety: the ring owns its mapping. Slots are read only between the NIC
// completing into them and the slot being re-posted.
unsafe impl Send for RxRing {}

impl RxRing {
    pub fn new(slot_size: usize, num_slots: usize) -> Result<Self, TransportError> {
        let len = slot_size * num_slots;
        let mut extent = MmapMut::map_anon(len).map_err(|e| TransportError::RingAlloc(len, e))?;
        let base = NonNull::new(extent.as_mut_ptr())
            .ok_or_else(|| TransportError::RingAlloc(len, std::io::ErrorKind::OutOfMemory.into()))?;
        Ok(Self {
            _extent: extent,
            base,
            slot_size,
            num_slots,
        })
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// The whole mapping, for registration with a NIC.
    pub fn region(&self) -> (NonNull<u8>, usize) {
        (self.base, self.slot_size * self.num_slots)
    }

    pub fn slot_addr(&self, idx: usize) -> u64 {
        self.slot_ptr(idx) as u64
    }

    pub fn slot(&self, idx: usize) -> &[u8] {
        // Safety: slot_ptr bounds-checks idx; the NIC does not write a slot
        // the caller has been handed until it is re-posted.
        unsafe { std::slice::from_raw_parts(self.slot_ptr(idx), self.slot_size) }
    }

    /// Frame header of the packet in slot `idx`.
    pub fn frame_header(&self, idx: usize) -> Option<FrameHeader> {
        parse_frame_header(self.slot(idx)).ok()
    }

    pub fn pkthdr(&self, idx: usize) -> Option<PktHdr> {
        let slot = self.slot(idx);
        if slot.len() < PKTHDR_SIZE {
            return None;
        }
        PktHdr::read_from_prefix(slot)
    }

    /// Pull the first cache line of slot `idx` toward L1.
    #[inline]
    pub(crate) fn prefetch(&self, idx: usize) {
        prefetch_t0(self.slot_ptr(idx));
    }

    fn slot_ptr(&self, idx: usize) -> *const u8 {
        assert!(idx < self.num_slots, "slot {idx} out of {}", self.num_slots);
        // Safety: idx < num_slots keeps the offset inside the mapping.
        unsafe { self.base.as_ptr().add(idx * self.slot_size) }
    }
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn prefetch_t0(ptr: *const u8) {
    use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
    // Safety: prefetch is a hint and never faults.
    unsafe { _mm_prefetch::<_MM_HINT_T0>(ptr as *const i8) }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn prefetch_t0(_ptr: *const u8) {}

impl std::fmt::Debug for RxRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxRing")
            .field("slot_size", &self.slot_size)
            .field("num_slots", &self.num_slots)
            .finish()
    }
}
