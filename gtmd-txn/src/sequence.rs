// SPDX-License-Identifier: AGPL-3.0-or-later
// GtmD - Global Transaction Manager for Distributed SQL
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Sequence Cleanup Capability
//!
//! Transactions may create, drop or alter sequences; the sequence manager
//! itself lives outside this crate. The registry only tracks *which*
//! sequences each transaction touched and, when the transaction completes,
//! dispatches the bookkeeping to a [`SequenceManager`] implementation:
//!
//! | slot state on cleanup | created          | dropped            | altered            |
//! |-----------------------|------------------|--------------------|--------------------|
//! | abort in progress     | remove (first)   | restore original   | restore original   |
//! | commit in progress    | (nothing)        | remove permanently | remove original copy |
//!
//! Created sequences must be removed before dropped ones are restored: a
//! sequence created in the aborting transaction may have reused the name
//! of one it dropped.
//!
//! The registry invokes the manager while holding the table lock, so
//! implementations must be quick and must not call back into the registry.

use parking_lot::Mutex;
use std::sync::Arc;

/// Opaque reference to a sequence, shared between the registry and the
/// sequence manager. Cheap to clone; the manager interprets the key.
pub type SeqRef = Arc<str>;

/// Callbacks invoked from commit/abort cleanup.
pub trait SequenceManager: Send + Sync {
    /// Abort path: a sequence created by the transaction is removed.
    fn remove_created(&self, seq: &SeqRef);

    /// Abort path: a sequence dropped by the transaction is reinstated.
    fn restore_dropped(&self, seq: &SeqRef);

    /// Abort path: an altered sequence reverts to its original state.
    fn restore_altered(&self, seq: &SeqRef);

    /// Commit path: a dropped sequence is removed permanently.
    fn remove_dropped(&self, seq: &SeqRef);

    /// Commit path: the original copy of an altered sequence is removed;
    /// the altered copy stays.
    fn remove_altered(&self, seq: &SeqRef);
}

/// Sequence manager that ignores every callback. Used when the node runs
/// without a sequence subsystem attached.
#[derive(Debug, Default)]
pub struct NullSequenceManager;

impl SequenceManager for NullSequenceManager {
    fn remove_created(&self, _seq: &SeqRef) {}
    fn restore_dropped(&self, _seq: &SeqRef) {}
    fn restore_altered(&self, _seq: &SeqRef) {}
    fn remove_dropped(&self, _seq: &SeqRef) {}
    fn remove_altered(&self, _seq: &SeqRef) {}
}

/// A recorded cleanup callback, in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeqEvent {
    RemoveCreated(String),
    RestoreDropped(String),
    RestoreAltered(String),
    RemoveDropped(String),
    RemoveAltered(String),
}

/// Sequence manager that records every callback, for tests and tooling.
#[derive(Debug, Default)]
pub struct RecordingSequenceManager {
    events: Mutex<Vec<SeqEvent>>,
}

impl RecordingSequenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the recorded events in the order they were dispatched.
    pub fn take_events(&self) -> Vec<SeqEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl SequenceManager for RecordingSequenceManager {
    fn remove_created(&self, seq: &SeqRef) {
        self.events.lock().push(SeqEvent::RemoveCreated(seq.to_string()));
    }

    fn restore_dropped(&self, seq: &SeqRef) {
        self.events.lock().push(SeqEvent::RestoreDropped(seq.to_string()));
    }

    fn restore_altered(&self, seq: &SeqRef) {
        self.events.lock().push(SeqEvent::RestoreAltered(seq.to_string()));
    }

    fn remove_dropped(&self, seq: &SeqRef) {
        self.events.lock().push(SeqEvent::RemoveDropped(seq.to_string()));
    }

    fn remove_altered(&self, seq: &SeqRef) {
        self.events.lock().push(SeqEvent::RemoveAltered(seq.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_manager_keeps_order() {
        let mgr = RecordingSequenceManager::new();
        let a: SeqRef = "seq_a".into();
        let b: SeqRef = "seq_b".into();

        mgr.remove_created(&a);
        mgr.restore_dropped(&b);
        mgr.restore_altered(&a);

        assert_eq!(
            mgr.take_events(),
            vec![
                SeqEvent::RemoveCreated("seq_a".to_string()),
                SeqEvent::RestoreDropped("seq_b".to_string()),
                SeqEvent::RestoreAltered("seq_a".to_string()),
            ]
        );
        assert!(mgr.take_events().is_empty());
    }
}
