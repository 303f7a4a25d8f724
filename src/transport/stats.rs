//! Transport counters
//!
//! One [`TransportStats`] is shared by every connection created from the same
//! dialer or listener and periodically written to the log.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative transport counters
#[derive(Debug, Default)]
pub struct TransportStats {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub out_pkts: AtomicU64,
    pub in_pkts: AtomicU64,
    pub fec_parity_shards: AtomicU64,
    pub fec_recovered: AtomicU64,
    pub fec_errs: AtomicU64,
    pub auth_failures: AtomicU64,
    pub active_opens: AtomicU64,
    pub passive_opens: AtomicU64,
}

/// Add `n` to a counter
#[inline]
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl TransportStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            out_pkts: load(&self.out_pkts),
            in_pkts: load(&self.in_pkts),
            fec_parity_shards: load(&self.fec_parity_shards),
            fec_recovered: load(&self.fec_recovered),
            fec_errs: load(&self.fec_errs),
            auth_failures: load(&self.auth_failures),
            active_opens: load(&self.active_opens),
            passive_opens: load(&self.passive_opens),
        }
    }
}

/// Point-in-time copy of [`TransportStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub out_pkts: u64,
    pub in_pkts: u64,
    pub fec_parity_shards: u64,
    pub fec_recovered: u64,
    pub fec_errs: u64,
    pub auth_failures: u64,
    pub active_opens: u64,
    pub passive_opens: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bytes out/in {}/{} pkts out/in {}/{} \
             fec parity {} recovered {} errs {} auth failures {} opens active/passive {}/{}",
            self.bytes_sent,
            self.bytes_received,
            self.out_pkts,
            self.in_pkts,
            self.fec_parity_shards,
            self.fec_recovered,
            self.fec_errs,
            self.auth_failures,
            self.active_opens,
            self.passive_opens,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = TransportStats::default();
        add(&stats.in_pkts, 3);
        add(&stats.fec_recovered, 1);

        let snap = stats.snapshot();
        assert_eq!(snap.in_pkts, 3);
        assert_eq!(snap.fec_recovered, 1);
        assert_eq!(snap.out_pkts, 0);
        assert!(snap.to_string().contains("recovered 1"));
    }
}
