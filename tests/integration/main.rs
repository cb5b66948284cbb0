//! rawpath integration test harness.
//!
//! Every test drives a full `RawTransport` over the loopback NIC, so sends
//! come back through the same queue pair's receive side:
//!
//!   cargo test --test integration
//!
//! Nothing here needs a real NIC or root.

use anyhow::{bail, Result};
use std::net::Ipv4Addr;

use rawpath::{LoopbackNic, MsgBuffer, RawTransport, TxBurstItem};
use rawpath_core::config::RecvMode;
use rawpath_core::wire::{Endpoint, PktHdr, PktType, RoutingInfo, PKTHDR_SIZE};
use rawpath_core::RawpathConfig;

mod drop_injection;
mod messages;
mod receive;
mod replenish;
mod transmit;

// ── Harness ───────────────────────────────────────────────────────────────────

pub type Transport = RawTransport<LoopbackNic>;

pub fn endpoint() -> Endpoint {
    Endpoint {
        mac: [0x02, 0, 0, 0, 0, 0x01],
        ip: Ipv4Addr::new(10, 10, 0, 1),
        udp_port: 31850,
    }
}

/// Routing info for sending to ourselves.
pub fn self_routing() -> RoutingInfo {
    let ep = endpoint();
    RoutingInfo::new(&ep, &ep)
}

pub fn config(mode: RecvMode) -> RawpathConfig {
    let mut config = RawpathConfig::default();
    config.rx.mode = mode;
    config
}

pub fn transport(config: &RawpathConfig) -> Result<Transport> {
    let nic = if config.rx.fast_recv {
        LoopbackNic::new().with_bulk_recv()
    } else {
        LoopbackNic::new()
    };
    Ok(RawTransport::from_config(nic, config)?)
}

/// Allocate a message and stamp every packet header with its packet number.
pub fn message(transport: &mut Transport, size: usize, fill: u8) -> Result<MsgBuffer> {
    let mut msg = transport.alloc_msg_buffer(size)?;
    for (i, b) in msg.data_mut().iter_mut().enumerate() {
        *b = fill.wrapping_add(i as u8);
    }
    for pkt in 0..msg.num_pkts() {
        let hdr = msg.pkthdr_mut(pkt);
        hdr.set_msg_size(size)?;
        hdr.set_pkt_type_num(PktType::Req, pkt)?;
    }
    Ok(msg)
}

/// Send every packet of `msg`, one burst per postlist's worth.
pub fn send_message(transport: &mut Transport, msg: &MsgBuffer, routing: &RoutingInfo) -> Result<()> {
    let postlist = transport.postlist();
    let items: Vec<_> = (0..msg.num_pkts())
        .map(|pkt| TxBurstItem::new(msg, pkt, routing))
        .collect();
    for burst in items.chunks(postlist) {
        transport.tx_burst(burst)?;
    }
    transport.tx_flush()?;
    Ok(())
}

/// A packet read back out of the receive ring.
pub struct Received {
    pub slot: usize,
    pub hdr: PktHdr,
    pub payload: Vec<u8>,
}

/// Poll until a burst comes back empty, returning every packet seen and
/// handing each burst's slots back to the NIC.
pub fn receive_all(transport: &mut Transport) -> Result<Vec<Received>> {
    let mut out = Vec::new();
    for _ in 0..100_000 {
        let head = transport.rx_head();
        let n = transport.rx_burst()?;
        if n == 0 {
            return Ok(out);
        }
        let ring = transport.rx_ring();
        for k in 0..n {
            let slot = (head + k) % ring.num_slots();
            let Some(hdr) = ring.pkthdr(slot) else {
                bail!("slot {slot} too small for a packet header");
            };
            let len = hdr.frame.ipv4.tot_len() as usize + 14 - PKTHDR_SIZE;
            let payload = ring.slot(slot)[PKTHDR_SIZE..PKTHDR_SIZE + len].to_vec();
            out.push(Received { slot, hdr, payload });
        }
        transport.post_recvs(n)?;
    }
    bail!("receive never ran dry")
}

/// Reassemble received packets of one message, ordered by packet number.
pub fn reassemble(mut packets: Vec<Received>) -> Vec<u8> {
    packets.sort_by_key(|p| p.hdr.pkt_num());
    packets.into_iter().flat_map(|p| p.payload).collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// Both receive modes come up with the default geometry.
#[test]
fn test_transport_builds_in_both_modes() -> Result<()> {
    for mode in [RecvMode::MultiPacket, RecvMode::CompletionQueue] {
        let t = transport(&config(mode))?;
        assert_eq!(t.geometry().mode, mode);
        assert_eq!(t.rx_head(), 0);
        assert_eq!(t.recvs_outstanding(), 0);
        assert_eq!(t.rx_ring().num_slots(), t.geometry().ring_entries);
    }
    Ok(())
}

/// A single control packet goes out and comes back intact.
#[test]
fn test_control_packet_round_trip() -> Result<()> {
    for mode in [RecvMode::MultiPacket, RecvMode::CompletionQueue] {
        let mut t = transport(&config(mode))?;
        let routing = self_routing();
        let msg = message(&mut t, 0, 0)?;
        send_message(&mut t, &msg, &routing)?;

        let got = receive_all(&mut t)?;
        assert_eq!(got.len(), 1, "{mode:?}");
        assert!(got[0].hdr.is_valid());
        assert!(got[0].payload.is_empty());
        assert_eq!(got[0].hdr.frame.udp.dst_port(), endpoint().udp_port);
    }
    Ok(())
}
