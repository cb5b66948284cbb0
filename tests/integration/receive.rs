use crate::*;

/// Packets come back in send order and occupy consecutive ring slots.
#[test]
fn test_arrivals_fill_consecutive_slots() -> Result<()> {
    for mode in [RecvMode::MultiPacket, RecvMode::CompletionQueue] {
        let mut t = transport(&config(mode))?;
        let routing = self_routing();
        let c = t.geometry().max_data_per_pkt;
        let msg = message(&mut t, 20 * c, 0)?;
        send_message(&mut t, &msg, &routing)?;

        let got = receive_all(&mut t)?;
        assert_eq!(got.len(), 20, "{mode:?}");
        for (i, p) in got.iter().enumerate() {
            assert_eq!(p.slot, i, "{mode:?}");
            assert_eq!(p.hdr.pkt_num(), i, "{mode:?}");
        }
        assert_eq!(t.rx_head(), 20);
    }
    Ok(())
}

/// Many trips around the ring, replenishing as we go, lose nothing.
#[test]
fn test_ring_wraps_with_replenish() -> Result<()> {
    for mode in [RecvMode::MultiPacket, RecvMode::CompletionQueue] {
        let mut t = transport(&config(mode))?;
        let routing = self_routing();
        let msg = message(&mut t, 0, 0)?;
        let items = vec![TxBurstItem::new(&msg, 0, &routing); 32];
        let entries = t.geometry().ring_entries;

        let mut total = 0;
        let rounds = 3 * entries / 32 + 5;
        for _ in 0..rounds {
            t.tx_burst(&items)?;
            total += receive_all(&mut t)?.len();
        }
        assert_eq!(total, rounds * 32, "{mode:?}");
        assert_eq!(t.rx_head(), rounds * 32 % entries, "{mode:?}");

        let stats = t.nic().stats();
        assert_eq!(stats.rx_no_buffer, 0, "{mode:?}");
        assert_eq!(stats.rx_delivered as usize, total);
    }
    Ok(())
}

/// A completion-queue poll never reports more than a postlist at once.
#[test]
fn test_cq_poll_is_bounded_by_postlist() -> Result<()> {
    let mut cfg = config(RecvMode::CompletionQueue);
    cfg.tx.postlist = 16;
    let mut t = transport(&cfg)?;
    let routing = self_routing();
    let msg = message(&mut t, 0, 0)?;
    let items = vec![TxBurstItem::new(&msg, 0, &routing); 16];
    t.tx_burst(&items)?;
    t.tx_burst(&items)?;

    assert_eq!(t.rx_burst()?, 16);
    assert_eq!(t.rx_burst()?, 16);
    assert_eq!(t.rx_burst()?, 0);
    Ok(())
}

/// With a postlist smaller than the arrivals, the snapshot reader carries
/// the rest in its backlog and releases it as later completions appear.
#[test]
fn test_multi_packet_backlog() -> Result<()> {
    let mut cfg = config(RecvMode::MultiPacket);
    cfg.tx.postlist = 4;
    let mut t = transport(&cfg)?;
    let routing = self_routing();
    let msg = message(&mut t, 0, 0)?;
    let burst = vec![TxBurstItem::new(&msg, 0, &routing); 4];

    // 9 arrivals: completion entry 0 (of 8) has been overwritten by the 9th
    t.tx_burst(&burst)?;
    t.tx_burst(&burst)?;
    t.tx_burst(&burst[..1])?;

    assert_eq!(t.rx_burst()?, 4);
    assert_eq!(t.rx_backlog(), 5);

    // entry 1 holds the 2nd arrival: behind us, so stale
    assert_eq!(t.rx_burst()?, 0);
    assert_eq!(t.rx_backlog(), 5);

    // the 10th arrival lands in entry 1 and moves the snapshot by one
    t.tx_burst(&burst[..1])?;
    assert_eq!(t.rx_burst()?, 4);
    assert_eq!(t.rx_backlog(), 2);
    assert_eq!(t.rx_head(), 8);
    Ok(())
}
