//! The polling loop: send one message through the loopback NIC, read back
//! whatever arrived, return the buffers, repeat.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use rawpath::{LoopbackNic, MsgBuffer, NicFault, RawTransport, TxBurstItem};
use rawpath_core::wire::{Endpoint, PktType, RoutingInfo};
use rawpath_core::RawpathConfig;

use crate::stats::DatapathStats;

/// Request type stamped on generated messages.
const LOOPBACK_REQ_TYPE: u8 = 1;

pub fn run(config: &RawpathConfig, stats: &DatapathStats, stop: &AtomicBool) -> Result<()> {
    let mut datapath = Datapath::new(config)?;
    while !stop.load(Ordering::Relaxed) {
        datapath.step(stats).unwrap_or_else(|fault| fault.abort());
    }
    tracing::info!("datapath loop stopped");
    datapath.finish()
}

/// One transport and the message it keeps sending to itself.
pub struct Datapath {
    transport: RawTransport<LoopbackNic>,
    msg: MsgBuffer,
    routing: RoutingInfo,
    /// Flag every Nth packet sent for a switch drop. 0 = never.
    drop_every: u64,
    pkt_seq: u64,
}

impl Datapath {
    pub fn new(config: &RawpathConfig) -> Result<Self> {
        let mut nic = LoopbackNic::new();
        if config.rx.fast_recv {
            nic = nic.with_bulk_recv();
        }
        let mut transport =
            RawTransport::from_config(nic, config).context("failed to set up transport")?;

        let local = Endpoint {
            mac: config.loopback.mac_bytes()?,
            ip: config.loopback.ip,
            udp_port: config.loopback.udp_port,
        };
        let routing = RoutingInfo::new(&local, &local);
        tracing::info!(
            mac = hex::encode(local.mac),
            ip = %local.ip,
            udp_port = local.udp_port,
            frame = %routing.frame(),
            "loopback endpoint"
        );

        let mut msg = transport
            .alloc_msg_buffer(config.loopback.msg_size)
            .context("failed to allocate message buffer")?;
        stamp_message(&mut msg)?;

        let drop_every = if config.tx.testing {
            config.loopback.drop_every as u64
        } else {
            0
        };
        tracing::info!(
            msg_size = msg.data_size(),
            num_pkts = msg.num_pkts(),
            drop_every,
            "datapath loop starting"
        );

        Ok(Self {
            transport,
            msg,
            routing,
            drop_every,
            pkt_seq: 0,
        })
    }

    /// Send the whole message in postlist-sized bursts, then drain and
    /// repost everything that came back.
    pub fn step(&mut self, stats: &DatapathStats) -> Result<(), NicFault> {
        let postlist = self.transport.postlist();
        let num_pkts = self.msg.num_pkts();
        let mut items = Vec::with_capacity(postlist.min(num_pkts));

        for first in (0..num_pkts).step_by(postlist) {
            items.clear();
            for pkt in first..num_pkts.min(first + postlist) {
                self.pkt_seq += 1;
                let mut item = TxBurstItem::new(&self.msg, pkt, &self.routing);
                item.drop = self.drop_every > 0 && self.pkt_seq % self.drop_every == 0;
                items.push(item);
            }
            self.transport.tx_burst(&items)?;
            stats.tx_bursts.fetch_add(1, Ordering::Relaxed);
            stats.tx_pkts.fetch_add(items.len() as u64, Ordering::Relaxed);
        }
        self.transport.tx_flush()?;

        drain_rx(&mut self.transport, stats)?;
        stats.record_nic(&self.transport.nic().stats());
        Ok(())
    }

    /// Release the message buffer and tear the transport down.
    pub fn finish(self) -> Result<()> {
        let Datapath { mut transport, msg, .. } = self;
        transport
            .free_msg_buffer(msg)
            .context("failed to free message buffer")?;
        Ok(())
    }
}

/// Fill in the metadata of every packet header once; the transmit path only
/// rewrites the frame headers.
fn stamp_message(msg: &mut MsgBuffer) -> Result<()> {
    let size = msg.data_size();
    for (i, b) in msg.data_mut().iter_mut().enumerate() {
        *b = i as u8;
    }
    for pkt in 0..msg.num_pkts() {
        let hdr = msg.pkthdr_mut(pkt);
        hdr.set_req_type(LOOPBACK_REQ_TYPE);
        hdr.set_msg_size(size)?;
        hdr.set_pkt_type_num(PktType::Req, pkt)?;
        hdr.set_req_num(1)?;
    }
    Ok(())
}

fn drain_rx(transport: &mut RawTransport<LoopbackNic>, stats: &DatapathStats) -> Result<(), NicFault> {
    loop {
        let head = transport.rx_head();
        let n = transport.rx_burst()?;
        if n == 0 {
            return Ok(());
        }

        let ring = transport.rx_ring();
        let entries = ring.num_slots();
        let mut valid = 0u64;
        for k in 0..n {
            if let Some(hdr) = ring.pkthdr((head + k) % entries) {
                if hdr.is_valid() {
                    valid += 1;
                    tracing::trace!(%hdr, "rx");
                }
            }
        }
        stats.rx_pkts.fetch_add(valid, Ordering::Relaxed);
        stats.rx_invalid.fetch_add(n as u64 - valid, Ordering::Relaxed);

        transport.post_recvs(n)?;
    }
}
