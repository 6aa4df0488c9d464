//! Snapshot building

use std::collections::BTreeMap;
use uuid::Uuid;

use crate::ws::protocol::{FighterSnapshot, ServerMsg};

use super::fighter::Fighter;
use super::phase::GamePhase;

/// Builds snapshots for network transmission
pub struct SnapshotBuilder {
    /// Tick counter since last snapshot
    ticks_since_snapshot: u32,
    /// Snapshot interval in ticks
    snapshot_interval: u32,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            ticks_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (used after phase changes)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    /// Build a snapshot message; fighters are listed in peer id order
    pub fn build(
        &self,
        tick: u64,
        phase: GamePhase,
        fighters: &BTreeMap<Uuid, Fighter>,
    ) -> ServerMsg {
        let fighters: Vec<FighterSnapshot> = fighters.values().map(Fighter::snapshot).collect();

        ServerMsg::Snapshot {
            tick,
            phase,
            fighters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sends_every_interval() {
        let mut builder = SnapshotBuilder::new(3);
        let sent: Vec<bool> = (0..6).map(|_| builder.should_send()).collect();
        assert_eq!(sent, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn force_next_sends_immediately() {
        let mut builder = SnapshotBuilder::new(5);
        builder.should_send();
        builder.force_next();
        assert!(builder.should_send());
        assert!(!builder.should_send());
    }
}
