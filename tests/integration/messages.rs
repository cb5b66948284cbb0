use crate::*;

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

/// Random message sizes, both receive modes: what comes back reassembles to
/// what went out.
#[test]
fn test_random_message_sizes() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for mode in [RecvMode::MultiPacket, RecvMode::CompletionQueue] {
        let mut t = transport(&config(mode))?;
        let routing = self_routing();
        let c = t.geometry().max_data_per_pkt;

        for round in 0..200u32 {
            let size = rng.gen_range(0..=40 * c);
            let msg = message(&mut t, size, round as u8)?;
            send_message(&mut t, &msg, &routing)?;

            let got = receive_all(&mut t)?;
            assert_eq!(got.len(), msg.num_pkts(), "{mode:?} size {size}");
            assert!(got.iter().all(|p| p.hdr.msg_size() == size));
            assert_eq!(reassemble(got), msg.data(), "{mode:?} size {size}");
            t.free_msg_buffer(msg)?;
        }
        assert_eq!(t.nic().stats().rx_no_buffer, 0);
        assert_eq!(t.nic().registrations(), 1);
    }
    Ok(())
}

/// Several messages in flight at once, sent packet by packet in random
/// interleaving.
#[test]
fn test_interleaved_messages() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let mut t = transport(&config(RecvMode::MultiPacket))?;
    let routing = self_routing();
    let c = t.geometry().max_data_per_pkt;

    let mut msgs = Vec::new();
    for i in 0..4u8 {
        let size = rng.gen_range(c..=5 * c);
        let mut msg = message(&mut t, size, i.wrapping_mul(31))?;
        for pkt in 0..msg.num_pkts() {
            msg.pkthdr_mut(pkt).set_dest_session_num(u16::from(i));
        }
        msgs.push(msg);
    }

    let mut pending: Vec<(usize, usize)> = msgs
        .iter()
        .enumerate()
        .flat_map(|(m, msg)| (0..msg.num_pkts()).map(move |p| (m, p)))
        .collect();
    // shuffle
    for i in (1..pending.len()).rev() {
        pending.swap(i, rng.gen_range(0..=i));
    }

    let items: Vec<_> = pending
        .iter()
        .map(|&(m, p)| TxBurstItem::new(&msgs[m], p, &routing))
        .collect();
    for burst in items.chunks(t.postlist()) {
        t.tx_burst(burst)?;
    }

    let got = receive_all(&mut t)?;
    assert_eq!(got.len(), pending.len());
    for (i, msg) in msgs.iter().enumerate() {
        let mine: Vec<Received> = got
            .iter()
            .filter(|p| p.hdr.dest_session_num() == i as u16)
            .map(|p| Received {
                slot: p.slot,
                hdr: p.hdr,
                payload: p.payload.clone(),
            })
            .collect();
        assert_eq!(reassemble(mine), msg.data());
    }
    Ok(())
}
