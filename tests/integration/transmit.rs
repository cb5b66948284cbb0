use crate::*;

use rawpath_core::wire::{ETH_HDR_SIZE, IPV4_HDR_SIZE};

/// A message of 2C+1 bytes is three packets: one single-segment packet and
/// two header+payload packets carrying C and 1 bytes.
#[test]
fn test_three_packet_message() -> Result<()> {
    let mut t = transport(&config(RecvMode::MultiPacket))?;
    let c = t.geometry().max_data_per_pkt;
    let routing = self_routing();
    let msg = message(&mut t, 2 * c + 1, 7)?;
    assert_eq!(msg.num_pkts(), 3);

    send_message(&mut t, &msg, &routing)?;
    let stats = t.nic().stats();
    assert_eq!(stats.post_send_calls, 1);
    assert_eq!(t.nic().last_send_batch(), 3);
    // packet 0 is a full chunk, far past the inline budget
    assert_eq!(stats.tx_inline, 0);
    assert_eq!(stats.tx_bytes as usize, 3 * PKTHDR_SIZE + 2 * c + 1);

    let got = receive_all(&mut t)?;
    assert_eq!(got.len(), 3);
    let sizes: Vec<usize> = got.iter().map(|p| p.payload.len()).collect();
    assert_eq!(sizes, vec![c, c, 1]);

    for p in &got {
        let pkt_size = PKTHDR_SIZE + p.payload.len();
        let frame = p.hdr.frame;
        assert_eq!(frame.ipv4.tot_len() as usize, pkt_size - ETH_HDR_SIZE);
        assert_eq!(frame.udp.len() as usize, pkt_size - ETH_HDR_SIZE - IPV4_HDR_SIZE);
        assert!(frame.checksums_zero());
        assert!(p.hdr.is_valid());
    }

    assert_eq!(reassemble(got), msg.data());
    Ok(())
}

/// Small first packets are marked inline; trailing packets never are.
#[test]
fn test_inline_only_for_small_first_packets() -> Result<()> {
    let mut t = transport(&config(RecvMode::CompletionQueue))?;
    let routing = self_routing();
    let max_inline = t.geometry().max_inline;
    let small = message(&mut t, max_inline + 18 - PKTHDR_SIZE, 0)?;
    let c = t.geometry().max_data_per_pkt;
    // second packet carries a single byte, still not inline
    let two = message(&mut t, c + 1, 0)?;

    send_message(&mut t, &small, &routing)?;
    assert_eq!(t.nic().stats().tx_inline, 1);

    send_message(&mut t, &two, &routing)?;
    assert_eq!(t.nic().stats().tx_inline, 1);

    assert_eq!(receive_all(&mut t)?.len(), 3);
    Ok(())
}

/// Every burst size up to the postlist is exactly one submission carrying
/// exactly that many descriptors.
#[test]
fn test_one_submission_per_burst() -> Result<()> {
    let mut t = transport(&config(RecvMode::CompletionQueue))?;
    let routing = self_routing();
    let msg = message(&mut t, 0, 0)?;
    let postlist = t.postlist();

    for n in 1..=postlist {
        let before = t.nic().stats().post_send_calls;
        let items = vec![TxBurstItem::new(&msg, 0, &routing); n];
        t.tx_burst(&items)?;
        assert_eq!(t.nic().stats().post_send_calls, before + 1);
        assert_eq!(t.nic().last_send_batch(), n);
        assert_eq!(receive_all(&mut t)?.len(), n);
    }
    // the arena did not grow or shrink
    assert_eq!(t.postlist(), postlist);
    Ok(())
}

/// Packets of different messages interleave in one burst.
#[test]
fn test_mixed_burst() -> Result<()> {
    let mut t = transport(&config(RecvMode::MultiPacket))?;
    let routing = self_routing();
    let c = t.geometry().max_data_per_pkt;
    let a = message(&mut t, 3 * c, 1)?;
    let b = message(&mut t, 10, 2)?;

    let items = [
        TxBurstItem::new(&a, 2, &routing),
        TxBurstItem::new(&b, 0, &routing),
        TxBurstItem::new(&a, 0, &routing),
    ];
    t.tx_burst(&items)?;

    let got = receive_all(&mut t)?;
    assert_eq!(got.len(), 3);
    assert_eq!(got[0].payload, &a.data()[2 * c..]);
    assert_eq!(got[1].payload, b.data());
    assert_eq!(got[2].payload, &a.data()[..c]);
    Ok(())
}
