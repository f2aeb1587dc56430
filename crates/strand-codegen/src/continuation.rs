//! Pseudo-block bookkeeping for suspension points.
//!
//! Addresses start at -1 and decrease strictly. Every allocated address gets
//! exactly one dispatch arm: a real resume arm where execution continues, or
//! an empty stub when nothing ever resumes there (synchronous call sites,
//! code skipped by an early return). Arms come out in allocation order.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmKind {
    Real,
    Stub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoArm {
    pub addr: i64,
    pub kind: ArmKind,
}

#[derive(Debug, Clone)]
pub struct PseudoBlocks {
    next: i64,
    pending: BTreeSet<i64>,
    arms: Vec<PseudoArm>,
}

impl Default for PseudoBlocks {
    fn default() -> Self {
        Self::new()
    }
}

impl PseudoBlocks {
    pub fn new() -> Self {
        Self {
            next: -1,
            pending: BTreeSet::new(),
            arms: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> i64 {
        let addr = self.next;
        self.next -= 1;
        self.pending.insert(addr);
        addr
    }

    pub fn allocated(&self) -> usize {
        (-1 - self.next) as usize
    }

    /// Record `addr` as a real arm. Returns the addresses that must be
    /// emitted as stubs first, highest first.
    pub fn resume(&mut self, addr: i64) -> Vec<i64> {
        let stubs = self.drain_above(addr);
        if self.pending.remove(&addr) {
            self.arms.push(PseudoArm {
                addr,
                kind: ArmKind::Real,
            });
        }
        stubs
    }

    /// Stubs for everything still pending, highest first.
    pub fn flush(&mut self) -> Vec<i64> {
        self.drain_above(i64::MIN)
    }

    fn drain_above(&mut self, addr: i64) -> Vec<i64> {
        let stubs: Vec<i64> = self
            .pending
            .range(addr.saturating_add(1)..)
            .rev()
            .copied()
            .collect();
        for stub in &stubs {
            self.pending.remove(stub);
            self.arms.push(PseudoArm {
                addr: *stub,
                kind: ArmKind::Stub,
            });
        }
        stubs
    }

    pub fn arms(&self) -> &[PseudoArm] {
        &self.arms
    }

    pub fn into_arms(self) -> Vec<PseudoArm> {
        self.arms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_decrease_from_minus_one() {
        let mut blocks = PseudoBlocks::new();
        assert_eq!(blocks.allocate(), -1);
        assert_eq!(blocks.allocate(), -2);
        assert_eq!(blocks.allocated(), 2);
    }

    #[test]
    fn skipped_addresses_are_stubbed_before_resume() {
        let mut blocks = PseudoBlocks::new();
        let sync_site = blocks.allocate();
        let other_sync = blocks.allocate();
        let suspend = blocks.allocate();
        assert_eq!(blocks.resume(suspend), vec![sync_site, other_sync]);
        let tail = blocks.allocate();
        assert_eq!(blocks.flush(), vec![tail]);
        let addrs: Vec<i64> = blocks.arms().iter().map(|a| a.addr).collect();
        assert_eq!(addrs, vec![-1, -2, -3, -4]);
        assert_eq!(blocks.arms()[2].kind, ArmKind::Real);
        assert!(blocks.flush().is_empty());
    }
}
