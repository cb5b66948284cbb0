//! Datapath counters, written by the polling thread and read by the printer.

use std::sync::atomic::{AtomicU64, Ordering};

use rawpath::LoopbackStats;

#[derive(Default)]
pub struct DatapathStats {
    pub tx_bursts: AtomicU64,
    pub tx_pkts: AtomicU64,
    pub rx_pkts: AtomicU64,
    /// Received packets whose header lacked the magic.
    pub rx_invalid: AtomicU64,
    pub switch_drops: AtomicU64,
    pub rx_no_buffer: AtomicU64,
}

impl DatapathStats {
    /// Copy the NIC-side counters in. Called from the polling thread.
    pub fn record_nic(&self, nic: &LoopbackStats) {
        self.switch_drops.store(nic.switch_drops, Ordering::Relaxed);
        self.rx_no_buffer.store(nic.rx_no_buffer, Ordering::Relaxed);
    }

    pub fn print_stats(&self) {
        tracing::info!(
            tx_bursts = self.tx_bursts.load(Ordering::Relaxed),
            tx_pkts = self.tx_pkts.load(Ordering::Relaxed),
            rx_pkts = self.rx_pkts.load(Ordering::Relaxed),
            rx_invalid = self.rx_invalid.load(Ordering::Relaxed),
            switch_drops = self.switch_drops.load(Ordering::Relaxed),
            rx_no_buffer = self.rx_no_buffer.load(Ordering::Relaxed),
            "datapath stats"
        );
    }
}
