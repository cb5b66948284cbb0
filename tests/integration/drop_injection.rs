use crate::*;

use rawpath_core::wire::{ETH_HDR_SIZE, IPV4_HDR_SIZE};

fn testing_config(testing: bool) -> RawpathConfig {
    let mut cfg = config(RecvMode::CompletionQueue);
    cfg.tx.testing = testing;
    cfg
}

/// A flagged packet leaves with a zero destination and the switch eats it.
/// Everything else in its header is still right.
#[test]
fn test_flagged_packet_is_dropped() -> Result<()> {
    let mut t = transport(&testing_config(true))?;
    let routing = self_routing();
    let c = t.geometry().max_data_per_pkt;
    let msg = message(&mut t, c + 100, 0)?;

    let mut dropped = TxBurstItem::new(&msg, 1, &routing);
    dropped.drop = true;
    t.tx_burst(&[TxBurstItem::new(&msg, 0, &routing), dropped])?;

    let stats = t.nic().stats();
    assert_eq!(stats.tx_pkts, 2);
    assert_eq!(stats.switch_drops, 1);

    let got = receive_all(&mut t)?;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].hdr.pkt_num(), 0);

    let hdr = msg.pkthdr(1);
    let pkt_size = PKTHDR_SIZE + 100;
    assert_eq!(hdr.frame.ipv4.dst_ip(), Ipv4Addr::UNSPECIFIED);
    assert_eq!(hdr.frame.ipv4.src_ip(), endpoint().ip);
    assert_eq!(hdr.frame.ipv4.tot_len() as usize, pkt_size - ETH_HDR_SIZE);
    assert_eq!(hdr.frame.udp.len() as usize, pkt_size - ETH_HDR_SIZE - IPV4_HDR_SIZE);
    assert_eq!(hdr.frame.eth.dst_mac(), endpoint().mac);
    assert_eq!(hdr.frame.udp.dst_port(), endpoint().udp_port);
    assert!(hdr.frame.checksums_zero());
    assert!(hdr.is_valid());
    Ok(())
}

/// Outside test mode the flag is ignored.
#[test]
fn test_flag_ignored_without_testing() -> Result<()> {
    let mut t = transport(&testing_config(false))?;
    let routing = self_routing();
    let msg = message(&mut t, 10, 0)?;
    let mut item = TxBurstItem::new(&msg, 0, &routing);
    item.drop = true;
    t.tx_burst(&[item])?;

    assert_eq!(t.nic().stats().switch_drops, 0);
    assert_eq!(receive_all(&mut t)?.len(), 1);
    assert_eq!(msg.pkthdr(0).frame.ipv4.dst_ip(), endpoint().ip);
    Ok(())
}

/// Resending a previously dropped packet without the flag delivers it.
#[test]
fn test_resend_after_drop() -> Result<()> {
    let mut t = transport(&testing_config(true))?;
    let routing = self_routing();
    let msg = message(&mut t, 10, 0)?;
    let mut item = TxBurstItem::new(&msg, 0, &routing);
    item.drop = true;
    t.tx_burst(&[item])?;
    assert!(receive_all(&mut t)?.is_empty());

    item.drop = false;
    t.tx_burst(&[item])?;
    let got = receive_all(&mut t)?;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, msg.data());
    Ok(())
}
