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

//! Transaction Slot
//!
//! One entry of the fixed-capacity transaction array. A slot is reused
//! across millions of short-lived transactions; `in_use` flips only under
//! the registry's table lock, while the mutable body is guarded by the
//! per-slot lock so state transitions do not contend with slot allocation.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use gtmd_core::{GlobalXid, IsolationLevel, TxnHandle, TxnState, INVALID_GLOBAL_XID};

use crate::sequence::SeqRef;

/// Mutable fields of a transaction record, guarded by the slot lock.
#[derive(Debug)]
pub struct SlotBody {
    /// Assigned GXID, or invalid while the transaction is starting.
    pub gxid: GlobalXid,
    pub state: TxnState,
    pub isolation: IsolationLevel,
    pub read_only: bool,
    /// Logical client session; empty means "no session".
    pub session_id: String,
    /// Identifier of the connected client, for disconnect cleanup.
    pub client_id: u32,
    /// Backend id behind a proxy; -1 when the client is not proxied.
    pub proxy_conn_id: i32,
    /// Autovacuum transactions are excluded from snapshot xmin.
    pub is_vacuum: bool,
    /// 2PC identifier, present iff the transaction entered prepare.
    pub gid: Option<String>,
    /// Data nodes involved in the prepared transaction.
    pub node_list: Option<String>,
    /// Sequences created/dropped/altered under this transaction, handed
    /// to the sequence manager during cleanup.
    pub created_seqs: Vec<SeqRef>,
    pub dropped_seqs: Vec<SeqRef>,
    pub altered_seqs: Vec<SeqRef>,
}

impl SlotBody {
    fn empty() -> Self {
        Self {
            gxid: INVALID_GLOBAL_XID,
            state: TxnState::Aborted,
            isolation: IsolationLevel::default(),
            read_only: false,
            session_id: String::new(),
            client_id: 0,
            proxy_conn_id: -1,
            is_vacuum: false,
            gid: None,
            node_list: None,
            created_seqs: Vec::new(),
            dropped_seqs: Vec::new(),
            altered_seqs: Vec::new(),
        }
    }

    /// Initialize the record for a fresh transaction. No GXID yet.
    pub fn init(
        &mut self,
        isolation: IsolationLevel,
        read_only: bool,
        session_id: &str,
        client_id: u32,
        proxy_conn_id: i32,
    ) {
        self.gxid = INVALID_GLOBAL_XID;
        self.state = TxnState::Starting;
        self.isolation = isolation;
        self.read_only = read_only;
        self.session_id.clear();
        self.session_id.push_str(session_id);
        self.client_id = client_id;
        self.proxy_conn_id = proxy_conn_id;
        self.is_vacuum = false;
        self.gid = None;
        self.node_list = None;
        self.created_seqs.clear();
        self.dropped_seqs.clear();
        self.altered_seqs.clear();
    }

    /// Release per-transaction resources once the slot leaves the
    /// open-set. String buffers are zeroed so a reused slot never leaks a
    /// previous GID or node list.
    pub fn clean(&mut self) {
        self.created_seqs.clear();
        self.dropped_seqs.clear();
        self.altered_seqs.clear();
        self.state = TxnState::Aborted;
        self.session_id.clear();
        self.gid = None;
        self.node_list = None;
        self.gxid = INVALID_GLOBAL_XID;
    }
}

/// One entry of the global transaction array.
///
/// `in_use` is atomic so the allocation scan can probe slots without
/// touching the body lock; it still transitions only under the table
/// lock.
#[derive(Debug)]
pub struct TxnSlot {
    handle: TxnHandle,
    in_use: AtomicBool,
    body: RwLock<SlotBody>,
}

impl TxnSlot {
    pub fn new(handle: TxnHandle) -> Self {
        Self {
            handle,
            in_use: AtomicBool::new(false),
            body: RwLock::new(SlotBody::empty()),
        }
    }

    #[inline]
    pub fn handle(&self) -> TxnHandle {
        self.handle
    }

    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Flip the in-use flag. Caller must hold the table lock.
    #[inline]
    pub fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::Release);
    }

    #[inline]
    pub fn body(&self) -> &RwLock<SlotBody> {
        &self.body
    }

    /// Snapshot the assigned GXID.
    #[inline]
    pub fn gxid(&self) -> GlobalXid {
        self.body.read().gxid
    }

    /// Snapshot the current state.
    #[inline]
    pub fn state(&self) -> TxnState {
        self.body.read().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_resets_previous_contents() {
        let slot = TxnSlot::new(7);
        {
            let mut body = slot.body().write();
            body.init(IsolationLevel::Serializable, true, "sess-1", 42, 3);
            body.gid = Some("tx-old".to_string());
            body.node_list = Some("n1,n2".to_string());
            body.created_seqs.push("seq_a".into());
        }
        {
            let mut body = slot.body().write();
            body.init(IsolationLevel::ReadCommitted, false, "", 43, -1);
            assert_eq!(body.state, TxnState::Starting);
            assert_eq!(body.gxid, INVALID_GLOBAL_XID);
            assert!(body.gid.is_none());
            assert!(body.node_list.is_none());
            assert!(body.created_seqs.is_empty());
            assert!(body.session_id.is_empty());
            assert_eq!(body.client_id, 43);
        }
    }

    #[test]
    fn test_clean_zeroes_strings() {
        let slot = TxnSlot::new(0);
        {
            let mut body = slot.body().write();
            body.init(IsolationLevel::ReadCommitted, false, "sess", 1, -1);
            body.gxid = 10;
            body.gid = Some("gid-1".to_string());
            body.state = TxnState::CommitInProgress;
            body.clean();
            assert_eq!(body.state, TxnState::Aborted);
            assert_eq!(body.gxid, INVALID_GLOBAL_XID);
            assert!(body.session_id.is_empty());
            assert!(body.gid.is_none());
        }
    }
}
