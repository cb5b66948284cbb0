//! Transmit engine.
//!
//! Turns a batch of (message buffer, packet index, routing info) items into
//! send descriptors and hands them to the NIC with one doorbell. The only
//! bytes written are the frame header of each packet's header slot.

use std::net::Ipv4Addr;

use rawpath_core::config::DatapathGeometry;
use rawpath_core::wire::{RoutingInfo, ETH_INLINE_HEADER_SIZE, HDR_COPY_SIZE, PKTHDR_SIZE};
use tracing::trace;
use zerocopy::AsBytes;

use crate::error::{FaultSite, NicFault};
use crate::msgbuf::MsgBuffer;
use crate::nic::{NicDriver, SendFlags, SendWr, Sge};

/// One packet to transmit.
#[derive(Debug, Clone, Copy)]
pub struct TxBurstItem<'a> {
    pub msg_buffer: &'a MsgBuffer,
    pub pkt_index: usize,
    pub routing_info: &'a RoutingInfo,
    /// Have the network discard this packet. Only honoured when the
    /// transport was built with `tx.testing`.
    pub drop: bool,
}

impl<'a> TxBurstItem<'a> {
    pub fn new(msg_buffer: &'a MsgBuffer, pkt_index: usize, routing_info: &'a RoutingInfo) -> Self {
        Self {
            msg_buffer,
            pkt_index,
            routing_info,
            drop: false,
        }
    }
}

/// Every Nth descriptor asks for a completion. Reaping one at each such
/// descriptor keeps the send CQ from overflowing.
#[derive(Debug)]
struct SignalPolicy {
    every: usize,
    nb_tx: u64,
}

impl SignalPolicy {
    /// Whether the next descriptor is signaled, and whether a completion
    /// should be reaped before it.
    fn next(&mut self) -> (bool, bool) {
        let signaled = self.nb_tx % self.every as u64 == 0;
        let reap = signaled && self.nb_tx > 0;
        self.nb_tx += 1;
        (signaled, reap)
    }
}

pub(crate) struct TxEngine {
    send_wr: Box<[SendWr]>,
    signal: SignalPolicy,
    max_data_per_pkt: usize,
    max_inline: usize,
    testing: bool,
}

impl TxEngine {
    pub(crate) fn new(geometry: &DatapathGeometry) -> Self {
        let send_wr = (0..geometry.postlist)
            .map(|i| SendWr {
                wr_id: i as u64,
                ..SendWr::default()
            })
            .collect();
        Self {
            send_wr,
            signal: SignalPolicy {
                every: geometry.signal_every,
                nb_tx: 0,
            },
            max_data_per_pkt: geometry.max_data_per_pkt,
            max_inline: geometry.max_inline,
            testing: geometry.testing,
        }
    }

    pub(crate) fn postlist(&self) -> usize {
        self.send_wr.len()
    }

    /// Whether a single-segment send of `length` bytes fits the NIC's inline
    /// budget. The NIC keeps the Ethernet header in the descriptor itself.
    fn fits_inline(max_inline: usize, length: usize) -> bool {
        max_inline > 0 && length <= max_inline + ETH_INLINE_HEADER_SIZE
    }

    pub(crate) fn tx_burst<N: NicDriver>(
        &mut self,
        nic: &mut N,
        items: &[TxBurstItem<'_>],
    ) -> Result<(), NicFault> {
        let n = items.len();
        assert!(n <= self.send_wr.len(), "burst of {n} exceeds postlist {}", self.send_wr.len());
        if n == 0 {
            return Ok(());
        }

        let max_data = self.max_data_per_pkt;
        let max_inline = self.max_inline;
        for (i, item) in items.iter().enumerate() {
            let msg = item.msg_buffer;
            let pkt = item.pkt_index;
            debug_assert!(msg.is_valid());
            debug_assert!(pkt < msg.num_pkts());

            let (signaled, reap) = self.signal.next();
            if reap {
                nic.poll_send_cq(1)
                    .map_err(|s| NicFault::new(FaultSite::PollSendCq, s))?;
            }

            let pkt_size;
            let wr = &mut self.send_wr[i];
            wr.flags = SendFlags {
                signaled,
                inline: false,
            };
            if pkt == 0 {
                pkt_size = PKTHDR_SIZE + msg.data_size().min(max_data);
                wr.sgl[0] = Sge {
                    addr: msg.pkthdr_addr(0),
                    length: pkt_size as u32,
                    lkey: msg.lkey(),
                };
                wr.num_sge = 1;
                wr.flags.inline = Self::fits_inline(max_inline, pkt_size);
            } else {
                let offset = pkt * max_data;
                let data_len = max_data.min(msg.data_size() - offset);
                pkt_size = PKTHDR_SIZE + data_len;
                wr.sgl[0] = Sge {
                    addr: msg.pkthdr_addr(pkt),
                    length: PKTHDR_SIZE as u32,
                    lkey: msg.lkey(),
                };
                wr.sgl[1] = Sge {
                    addr: msg.data_addr(offset),
                    length: data_len as u32,
                    lkey: msg.lkey(),
                };
                wr.num_sge = 2;
            }

            // Safety: this loop is the only writer of the buffer's headers and
            // holds no other reference to this slot.
            let hdr = unsafe { msg.pkthdr_for_tx(pkt) };
            hdr.frame.as_bytes_mut()[..HDR_COPY_SIZE].copy_from_slice(item.routing_info.copy_bytes());
            hdr.frame.set_lengths(pkt_size);
            debug_assert!(hdr.frame.checksums_zero());

            if self.testing && item.drop {
                hdr.frame.ipv4.set_dst_ip(Ipv4Addr::UNSPECIFIED);
            }

            let frame = hdr.frame;
            trace!(
                pkt_size,
                drop = item.drop,
                signaled,
                hdr = %hdr,
                frame = %frame,
                "tx"
            );
        }

        nic.post_send(&self.send_wr[..n])
            .map_err(|s| NicFault::new(FaultSite::PostSend, s))
    }
}
