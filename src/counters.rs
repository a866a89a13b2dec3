//! Performance counters: count how many times we do various important
//! operations during an analysis run, logged once at the end.

use std::sync::atomic::{AtomicUsize, Ordering, fence};

use enum_map::{Enum, EnumMap};
use tracing::info;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    FilesWalked,
    ImagesDecoded,
    HashesComputed,
    DecodeFailures,
    HashFailures,
    CacheHashHits,
}

#[derive(Default)]
pub struct Counters(EnumMap<Op, AtomicUsize>);

impl Counters {
    pub fn new() -> Counters {
        Counters::default()
    }

    #[inline]
    pub fn bump(&self, which: Op) {
        self.add(which, 1);
    }

    pub fn add(&self, to: Op, amount: usize) {
        self.0[to].fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self, op: Op) -> usize {
        self.0[op].load(Ordering::Relaxed)
    }

    /// Logs every non-zero counter at `info` level.
    pub fn log_counts(&self) {
        fence(Ordering::SeqCst);

        let counts: Vec<_> = self
            .0
            .iter()
            .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
            .filter(|(_k, v)| *v > 0)
            .collect();

        if counts.is_empty() {
            return;
        }

        info!("Counters:");
        for (op, count) in &counts {
            info!("{count:>8}  {}", op_name(*op));
        }
    }
}

fn op_name(op: Op) -> &'static str {
    match op {
        Op::FilesWalked => "files walked",
        Op::ImagesDecoded => "images decoded",
        Op::HashesComputed => "hashes computed",
        Op::DecodeFailures => "decode failures",
        Op::HashFailures => "hash failures",
        Op::CacheHashHits => "cached hash hits",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let counters = Counters::new();
        assert_eq!(counters.get(Op::FilesWalked), 0);
        counters.bump(Op::FilesWalked);
        counters.add(Op::FilesWalked, 4);
        assert_eq!(counters.get(Op::FilesWalked), 5);
    }
}
