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

//! Global Xmin Tracking
//!
//! Every coordinator and datanode periodically reports the oldest GXID it
//! still considers running. The tracker keeps the latest report per node
//! and folds them, together with the GXIDs of the open-set, into
//! `recent_global_xmin` - the horizon below which no snapshot anywhere in
//! the cluster can still need transaction status.
//!
//! A node reporting an invalid GXID is dropped from the map (it has no
//! snapshots open). A report older than the already-published horizon is
//! rejected; accepting it would move the horizon backwards.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, warn};

use gtmd_core::{xid, GlobalXid, GtmNodeType};

/// Errcode values returned to the reporting node.
pub const XMIN_OK: i32 = 0;
/// The reported xmin precedes the published global xmin.
pub const XMIN_TOO_OLD: i32 = -2;

#[derive(Debug)]
struct XminState {
    reported: HashMap<(GtmNodeType, String), GlobalXid>,
    recent_global_xmin: GlobalXid,
}

/// Tracker for per-node reported xmins.
#[derive(Debug)]
pub struct XminTracker {
    state: RwLock<XminState>,
}

impl XminTracker {
    pub fn new(initial_xmin: GlobalXid) -> Self {
        Self {
            state: RwLock::new(XminState {
                reported: HashMap::new(),
                recent_global_xmin: initial_xmin,
            }),
        }
    }

    /// Latest published horizon.
    pub fn recent_global_xmin(&self) -> GlobalXid {
        self.state.read().recent_global_xmin
    }

    /// Fold a node's report into the horizon.
    ///
    /// `open_xmins` are the GXIDs of the currently open, non-vacuum
    /// transactions on this node; the horizon never advances past them.
    /// Returns `(recent_global_xmin, errcode)`.
    pub fn report(
        &self,
        node_type: GtmNodeType,
        node_name: &str,
        reported: GlobalXid,
        open_xmins: &[GlobalXid],
    ) -> (GlobalXid, i32) {
        let mut state = self.state.write();

        if !xid::is_valid(reported) {
            // The node has no open snapshots; stop considering it.
            state.reported.remove(&(node_type, node_name.to_string()));
            debug!(node = node_name, "node reported idle, dropped from xmin map");
            let xmin = Self::recompute(&mut state, open_xmins);
            return (xmin, XMIN_OK);
        }

        if xid::precedes(reported, state.recent_global_xmin) {
            warn!(
                node = node_name,
                reported,
                global_xmin = state.recent_global_xmin,
                "rejecting xmin report older than the published horizon"
            );
            return (state.recent_global_xmin, XMIN_TOO_OLD);
        }

        state
            .reported
            .insert((node_type, node_name.to_string()), reported);
        let xmin = Self::recompute(&mut state, open_xmins);
        (xmin, XMIN_OK)
    }

    fn recompute(state: &mut XminState, open_xmins: &[GlobalXid]) -> GlobalXid {
        let mut min = GlobalXid::MAX;
        let mut seen = false;

        for &v in state.reported.values() {
            if !seen || xid::precedes(v, min) {
                min = v;
                seen = true;
            }
        }
        for &v in open_xmins {
            if xid::is_normal(v) && (!seen || xid::precedes(v, min)) {
                min = v;
                seen = true;
            }
        }

        if seen && xid::follows(min, state.recent_global_xmin) {
            state.recent_global_xmin = min;
        }
        state.recent_global_xmin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtmd_core::FIRST_NORMAL_GLOBAL_XID;

    #[test]
    fn test_single_node_advances_horizon() {
        let tracker = XminTracker::new(FIRST_NORMAL_GLOBAL_XID);

        let (xmin, err) = tracker.report(GtmNodeType::Datanode, "dn1", 10, &[]);
        assert_eq!(err, XMIN_OK);
        assert_eq!(xmin, 10);
        assert_eq!(tracker.recent_global_xmin(), 10);
    }

    #[test]
    fn test_horizon_is_min_over_nodes_and_open_set() {
        let tracker = XminTracker::new(FIRST_NORMAL_GLOBAL_XID);

        tracker.report(GtmNodeType::Datanode, "dn1", 20, &[]);
        let (xmin, err) = tracker.report(GtmNodeType::Coordinator, "co1", 30, &[15]);
        assert_eq!(err, XMIN_OK);
        // The open transaction at 15 holds the horizon back.
        assert_eq!(xmin, 15);
    }

    #[test]
    fn test_too_old_report_rejected() {
        let tracker = XminTracker::new(FIRST_NORMAL_GLOBAL_XID);
        tracker.report(GtmNodeType::Datanode, "dn1", 100, &[]);
        assert_eq!(tracker.recent_global_xmin(), 100);

        let (xmin, err) = tracker.report(GtmNodeType::Datanode, "dn2", 50, &[]);
        assert_eq!(err, XMIN_TOO_OLD);
        assert_eq!(xmin, 100);
        // The stale report must not have entered the map.
        assert_eq!(tracker.recent_global_xmin(), 100);
    }

    #[test]
    fn test_idle_node_dropped() {
        let tracker = XminTracker::new(FIRST_NORMAL_GLOBAL_XID);
        tracker.report(GtmNodeType::Datanode, "dn1", 10, &[]);
        tracker.report(GtmNodeType::Datanode, "dn2", 40, &[]);
        assert_eq!(tracker.recent_global_xmin(), 10);

        // dn1 goes idle; dn2's report now defines the horizon.
        let (xmin, err) = tracker.report(GtmNodeType::Datanode, "dn1", 0, &[]);
        assert_eq!(err, XMIN_OK);
        assert_eq!(xmin, 40);
    }

    #[test]
    fn test_horizon_never_regresses() {
        let tracker = XminTracker::new(FIRST_NORMAL_GLOBAL_XID);
        tracker.report(GtmNodeType::Datanode, "dn1", 60, &[]);
        // Even if every node disappears, the horizon stays put.
        tracker.report(GtmNodeType::Datanode, "dn1", 0, &[]);
        assert_eq!(tracker.recent_global_xmin(), 60);
    }
}
