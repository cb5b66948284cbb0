use crate::*;

fn cq_config(fast_recv: bool) -> RawpathConfig {
    let mut cfg = config(RecvMode::CompletionQueue);
    cfg.rx.ring_entries = 256;
    cfg.rx.recv_slack = 32;
    cfg.rx.fast_recv = fast_recv;
    cfg
}

/// Fill `n` slots and consume them without handing them back.
fn consume(t: &mut Transport, n: usize) -> Result<()> {
    let routing = self_routing();
    let msg = message(t, 0, 0)?;
    let items = vec![TxBurstItem::new(&msg, 0, &routing); n];
    t.tx_burst(&items)?;
    let mut seen = 0;
    while seen < n {
        let got = t.rx_burst()?;
        if got == 0 {
            bail!("only {seen} of {n} packets arrived");
        }
        seen += got;
    }
    Ok(())
}

#[test]
fn test_no_post_below_slack() -> Result<()> {
    for fast_recv in [false, true] {
        let mut t = transport(&cq_config(fast_recv))?;
        consume(&mut t, 40)?;
        let before = t.nic().stats();

        for _ in 0..31 {
            t.post_recvs(1)?;
        }
        let after = t.nic().stats();
        assert_eq!(after.recv_posts, before.recv_posts);
        assert_eq!(after.bulk_recv_posts, before.bulk_recv_posts);
        assert_eq!(t.recvs_outstanding(), 31);

        t.post_recvs(1)?;
        assert_eq!(t.recvs_outstanding(), 0);
        let after = t.nic().stats();
        if fast_recv {
            assert_eq!(after.bulk_recv_posts, before.bulk_recv_posts + 1);
            assert_eq!(after.recv_posts, before.recv_posts);
        } else {
            assert_eq!(after.recv_posts, before.recv_posts + 1);
            assert_eq!(after.bulk_recv_posts, 0);
        }
    }
    Ok(())
}

/// Bulk posting is used only when both the config and the driver allow it.
#[test]
fn test_bulk_post_falls_back_to_chain() -> Result<()> {
    let cfg = cq_config(true);
    let mut t = RawTransport::from_config(LoopbackNic::new(), &cfg)?;
    consume(&mut t, 32)?;
    t.post_recvs(32)?;
    let stats = t.nic().stats();
    assert_eq!(stats.bulk_recv_posts, 0);
    // one post at construction, one now
    assert_eq!(stats.recv_posts, 2);
    assert_eq!(t.recvs_outstanding(), 0);
    Ok(())
}

/// Without replenishment the NIC runs out of buffers and starts dropping.
#[test]
fn test_exhaustion_without_replenish() -> Result<()> {
    let mut t = transport(&cq_config(false))?;
    for _ in 0..4 {
        consume(&mut t, 64)?;
    }
    assert_eq!(t.nic().stats().rx_no_buffer, 0);

    let routing = self_routing();
    let msg = message(&mut t, 0, 0)?;
    t.tx_burst(&[TxBurstItem::new(&msg, 0, &routing)])?;
    assert_eq!(t.nic().stats().rx_no_buffer, 1);
    assert_eq!(t.rx_burst()?, 0);

    // returning buffers brings the queue back
    t.post_recvs(64)?;
    t.tx_burst(&[TxBurstItem::new(&msg, 0, &routing)])?;
    assert_eq!(t.rx_burst()?, 1);
    Ok(())
}

/// Multi-packet mode reposts a whole WQE per stride group and carries the
/// remainder.
#[test]
fn test_multi_packet_repost_by_stride() -> Result<()> {
    let mut t = transport(&config(RecvMode::MultiPacket))?;
    let strides = t.geometry().strides_per_wqe;
    let base = t.nic().stats().mp_recv_posts;
    assert_eq!(base, t.geometry().mp_rq_depth as u64);

    for _ in 0..(strides / 64) {
        consume(&mut t, 64)?;
    }
    t.post_recvs(strides - 1)?;
    assert_eq!(t.nic().stats().mp_recv_posts, base);
    assert_eq!(t.recvs_outstanding(), strides - 1);

    t.post_recvs(3)?;
    assert_eq!(t.nic().stats().mp_recv_posts, base + 1);
    assert_eq!(t.recvs_outstanding(), 2);
    Ok(())
}
