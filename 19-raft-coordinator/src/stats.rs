//! Per-operation throughput counters.
//!
//! Handlers call [`PerformanceCenter::record`] on every client operation. A
//! background task calls [`PerformanceCenter::tick`] once per interval, which
//! closes the running count into a bounded window used for the average.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatOp {
    Put,
    Get,
    Delete,
    Scan,
    KeepAlive,
    Lock,
    UnLock,
    Watch,
}

impl StatOp {
    pub const ALL: [StatOp; 8] = [
        StatOp::Put,
        StatOp::Get,
        StatOp::Delete,
        StatOp::Scan,
        StatOp::KeepAlive,
        StatOp::Lock,
        StatOp::UnLock,
        StatOp::Watch,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for StatOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatOp::Put => "put",
            StatOp::Get => "get",
            StatOp::Delete => "delete",
            StatOp::Scan => "scan",
            StatOp::KeepAlive => "keepalive",
            StatOp::Lock => "lock",
            StatOp::UnLock => "unlock",
            StatOp::Watch => "watch",
        };
        f.write_str(name)
    }
}

/// Throughput for one operation: the last closed interval and the window average.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpStatistics {
    pub op: StatOp,
    pub current: u64,
    pub average: u64,
}

struct Counters {
    running: [u64; 8],
    last: [u64; 8],
    window: VecDeque<[u64; 8]>,
}

pub struct PerformanceCenter {
    counters: Mutex<Counters>,
    window_size: usize,
}

impl PerformanceCenter {
    pub fn new(window_size: usize) -> Self {
        Self {
            counters: Mutex::new(Counters {
                running: [0; 8],
                last: [0; 8],
                window: VecDeque::with_capacity(window_size),
            }),
            window_size: window_size.max(1),
        }
    }

    pub fn record(&self, op: StatOp) {
        self.counters.lock().running[op.slot()] += 1;
    }

    /// Closes the running interval.
    pub fn tick(&self) {
        let mut counters = self.counters.lock();
        let closed = std::mem::take(&mut counters.running);
        counters.last = closed;
        if counters.window.len() == self.window_size {
            counters.window.pop_front();
        }
        counters.window.push_back(closed);
    }

    pub fn snapshot(&self) -> Vec<OpStatistics> {
        let counters = self.counters.lock();
        let samples = counters.window.len().max(1) as u64;
        StatOp::ALL
            .iter()
            .map(|&op| {
                let total: u64 = counters.window.iter().map(|row| row[op.slot()]).sum();
                OpStatistics {
                    op,
                    current: counters.last[op.slot()],
                    average: total / samples,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(center: &PerformanceCenter, op: StatOp) -> OpStatistics {
        center
            .snapshot()
            .into_iter()
            .find(|s| s.op == op)
            .unwrap()
    }

    #[test]
    fn counts_show_up_after_tick() {
        let center = PerformanceCenter::new(4);
        center.record(StatOp::Put);
        center.record(StatOp::Put);
        assert_eq!(stat(&center, StatOp::Put).current, 0);

        center.tick();
        assert_eq!(stat(&center, StatOp::Put).current, 2);
        assert_eq!(stat(&center, StatOp::Get).current, 0);
    }

    #[test]
    fn average_covers_bounded_window() {
        let center = PerformanceCenter::new(2);
        for count in [10, 2, 4] {
            for _ in 0..count {
                center.record(StatOp::Lock);
            }
            center.tick();
        }
        let lock = stat(&center, StatOp::Lock);
        assert_eq!(lock.current, 4);
        assert_eq!(lock.average, 3);
    }

    #[test]
    fn snapshot_lists_every_operation() {
        let center = PerformanceCenter::new(1);
        let names: Vec<String> = center.snapshot().iter().map(|s| s.op.to_string()).collect();
        assert_eq!(
            names,
            ["put", "get", "delete", "scan", "keepalive", "lock", "unlock", "watch"]
        );
    }
}
