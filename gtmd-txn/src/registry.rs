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

//! Global Transaction Registry
//!
//! Owns the fixed-capacity slot array, the open-set of in-flight
//! transactions and the GXID generator, and drives the lifecycle of every
//! global transaction: begin, prepare, commit, abort, single and batched,
//! plus cleanup when a client disconnects.
//!
//! ## Identifiers
//!
//! A transaction is referenced by four identifiers of very different
//! lookup cost:
//!
//! - handle: index into the slot array, O(1)
//! - GXID: the 32-bit global id, resolved through a hash index
//! - GID: the user-visible 2PC identifier, resolved through a hash index
//! - session id: logical client session, resolved through a hash index
//!
//! The hash indexes are maintained under the table lock whenever open-set
//! membership or an identifier binding changes, replacing the linear
//! open-set walks the slot count (16k by default) would otherwise make a
//! hot spot.
//!
//! ## Slot allocation
//!
//! A rotating cursor (`last_slot`) starts each free-slot scan just past
//! the previously allocated index. Finished transactions free their slots
//! long before the cursor wraps, so the scan almost always succeeds on
//! the first probe instead of re-walking the cold low indexes.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use gtmd_core::{
    xid, GlobalXid, GtmError, GtmNodeType, GtmState, IsolationLevel, Result, TxnHandle, TxnState,
    TxnStatus, FIRST_NORMAL_GLOBAL_XID, INVALID_GLOBAL_XID,
};

use crate::control::ControlStore;
use crate::sequence::{SeqRef, SequenceManager};
use crate::slot::{SlotBody, TxnSlot};
use crate::xmin::XminTracker;

/// Default capacity of the slot array.
pub const MAX_GLOBAL_TRANSACTIONS: usize = 16384;

/// GXIDs issued between control-file checkpoints.
pub const CONTROL_INTERVAL: u32 = 10000;

/// Upper bound for a 2PC GID, in bytes.
pub const GID_MAXLEN: usize = 256;

/// Upper bound for a global session id, in bytes.
pub const SESSION_ID_MAXLEN: usize = 64;

/// Upper bound for a prepared transaction's node list, in bytes.
pub const NODESTRING_MAXLEN: usize = 1024;

/// Registry tunables.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity of the slot array.
    pub max_transactions: usize,
    /// GXIDs issued between control-file checkpoints.
    pub control_interval: u32,
    /// Standby nodes apply mirrored mutations but never issue GXIDs.
    pub standby: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_transactions: MAX_GLOBAL_TRANSACTIONS,
            control_interval: CONTROL_INTERVAL,
            standby: false,
        }
    }
}

/// Arguments for starting one transaction.
#[derive(Debug, Clone)]
pub struct BeginRequest {
    pub isolation: IsolationLevel,
    pub read_only: bool,
    /// Empty means "no session"; a nonempty session reuses its open slot.
    pub session_id: String,
    pub client_id: u32,
    pub proxy_conn_id: i32,
}

impl BeginRequest {
    pub fn new(
        isolation: IsolationLevel,
        read_only: bool,
        session_id: impl Into<String>,
        client_id: u32,
        proxy_conn_id: i32,
    ) -> Self {
        Self {
            isolation,
            read_only,
            session_id: session_id.into(),
            client_id,
            proxy_conn_id,
        }
    }
}

/// Open-set membership, allocation cursor and identifier indexes.
/// Guarded by the table lock.
struct TableState {
    /// Handles of in-use slots, in insertion order.
    open: Vec<TxnHandle>,
    /// Index of the most recently allocated slot.
    last_slot: usize,
    by_gxid: HashMap<GlobalXid, TxnHandle>,
    by_gid: HashMap<String, TxnHandle>,
    by_session: HashMap<String, TxnHandle>,
    /// Newest GXID whose slot has left the open-set.
    latest_completed_xid: GlobalXid,
    free_slots: usize,
}

/// GXID counter and wraparound limits. Guarded by the ID-gen lock.
struct XidGenState {
    next_xid: GlobalXid,
    oldest_xid: GlobalXid,
    vac_limit: GlobalXid,
    warn_limit: GlobalXid,
    stop_limit: GlobalXid,
    wrap_limit: GlobalXid,
    state: GtmState,
    /// Last GXID written to the control file.
    control_xid: GlobalXid,
    /// Last GXID known to be backed up for restore.
    backed_up_xid: GlobalXid,
}

/// One open transaction in a serialized registry snapshot.
#[derive(Debug, Serialize)]
pub struct TxnDigest {
    pub handle: TxnHandle,
    pub gxid: GlobalXid,
    pub state: TxnState,
    pub isolation: IsolationLevel,
    pub read_only: bool,
    pub session_id: String,
    pub client_id: u32,
    pub is_vacuum: bool,
    pub gid: Option<String>,
}

/// Serialized registry snapshot returned by the GXID_LIST operation.
#[derive(Debug, Serialize)]
pub struct RegistrySummary {
    pub state: GtmState,
    pub next_xid: GlobalXid,
    pub oldest_xid: GlobalXid,
    pub vac_limit: GlobalXid,
    pub warn_limit: GlobalXid,
    pub stop_limit: GlobalXid,
    pub wrap_limit: GlobalXid,
    pub latest_completed_xid: GlobalXid,
    pub recent_global_xmin: GlobalXid,
    pub open: Vec<TxnDigest>,
}

/// The process-wide transaction registry.
pub struct TxnRegistry {
    slots: Vec<TxnSlot>,
    table: RwLock<TableState>,
    xidgen: RwLock<XidGenState>,
    xmin: XminTracker,
    control: Arc<dyn ControlStore>,
    sequences: Arc<dyn SequenceManager>,
    config: RegistryConfig,
    /// Raised when the standby needs a fresh restore point.
    need_backup: AtomicBool,
}

impl TxnRegistry {
    pub fn new(
        config: RegistryConfig,
        control: Arc<dyn ControlStore>,
        sequences: Arc<dyn SequenceManager>,
    ) -> Self {
        let capacity = config.max_transactions;
        let slots = (0..capacity)
            .map(|i| TxnSlot::new(i as TxnHandle))
            .collect();

        Self {
            slots,
            table: RwLock::new(TableState {
                open: Vec::new(),
                last_slot: capacity - 1,
                by_gxid: HashMap::new(),
                by_gid: HashMap::new(),
                by_session: HashMap::new(),
                latest_completed_xid: FIRST_NORMAL_GLOBAL_XID,
                free_slots: capacity,
            }),
            xidgen: RwLock::new(XidGenState {
                next_xid: FIRST_NORMAL_GLOBAL_XID,
                oldest_xid: FIRST_NORMAL_GLOBAL_XID,
                vac_limit: INVALID_GLOBAL_XID,
                warn_limit: INVALID_GLOBAL_XID,
                stop_limit: INVALID_GLOBAL_XID,
                wrap_limit: INVALID_GLOBAL_XID,
                state: GtmState::Starting,
                control_xid: FIRST_NORMAL_GLOBAL_XID,
                backed_up_xid: INVALID_GLOBAL_XID,
            }),
            xmin: XminTracker::new(FIRST_NORMAL_GLOBAL_XID),
            control,
            sequences,
            config,
            need_backup: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_standby(&self) -> bool {
        self.config.standby
    }

    /// Resolve a handle, requiring the slot to be in use.
    fn slot(&self, handle: TxnHandle) -> Result<&TxnSlot> {
        let slot = usize::try_from(handle)
            .ok()
            .and_then(|i| self.slots.get(i))
            .ok_or(GtmError::InvalidHandle(handle))?;
        if !slot.is_in_use() {
            return Err(GtmError::InvalidHandle(handle));
        }
        Ok(slot)
    }

    // ------------------------------------------------------------------
    // ID generation
    // ------------------------------------------------------------------

    /// Read `next_xid` without allocating it.
    pub fn read_next_xid(&self) -> GlobalXid {
        self.xidgen.read().next_xid
    }

    pub fn state(&self) -> GtmState {
        self.xidgen.read().state
    }

    pub fn latest_completed_xid(&self) -> GlobalXid {
        self.table.read().latest_completed_xid
    }

    pub fn recent_global_xmin(&self) -> GlobalXid {
        self.xmin.recent_global_xmin()
    }

    /// Seed the GXID counter from the control file and start serving.
    /// Only legal while the registry is still starting.
    pub fn set_next_xid(&self, gxid: GlobalXid) -> Result<()> {
        let mut gen = self.xidgen.write();
        if gen.state != GtmState::Starting {
            return Err(GtmError::InvalidState(format!(
                "cannot set next gxid in state {:?}",
                gen.state
            )));
        }
        gen.next_xid = gxid;
        gen.control_xid = gxid;
        gen.state = GtmState::Running;
        Ok(())
    }

    /// Stop issuing GXIDs so the final control checkpoint stays the
    /// newest id ever handed out.
    pub fn set_shutting_down(&self) {
        self.xidgen.write().state = GtmState::ShuttingDown;
    }

    /// Install the wraparound thresholds. An invalid `vac_limit` disables
    /// the whole check (the allocation fast path).
    pub fn set_wraparound_limits(
        &self,
        vac_limit: GlobalXid,
        warn_limit: GlobalXid,
        stop_limit: GlobalXid,
        wrap_limit: GlobalXid,
    ) {
        let mut gen = self.xidgen.write();
        gen.vac_limit = vac_limit;
        gen.warn_limit = warn_limit;
        gen.stop_limit = stop_limit;
        gen.wrap_limit = wrap_limit;
    }

    /// Record the newest GXID covered by a standby restore point.
    pub fn set_backed_up_xid(&self, gxid: GlobalXid) {
        self.xidgen.write().backed_up_xid = gxid;
    }

    /// Does the standby restore point lag the counter?
    pub fn needs_restore_update(&self) -> bool {
        let gen = self.xidgen.read();
        xid::precedes_or_equals(gen.backed_up_xid, gen.next_xid)
    }

    /// Consume the "standby restore point pending" flag.
    pub fn take_need_backup(&self) -> bool {
        self.need_backup.swap(false, Ordering::AcqRel)
    }

    /// Assign a GXID to every handle that does not have one yet.
    ///
    /// Returns the GXIDs for all handles (pre-assigned ones included) and
    /// the subset of handles that received a fresh id. Serialized by the
    /// ID-gen lock; the control-file write happens after both registry
    /// locks are released.
    pub fn allocate_multi(
        &self,
        handles: &[TxnHandle],
    ) -> Result<(Vec<GlobalXid>, Vec<TxnHandle>)> {
        if self.config.standby {
            return Err(GtmError::StandbyMode);
        }

        let mut gxids = vec![INVALID_GLOBAL_XID; handles.len()];
        let mut new_handles = Vec::new();
        let mut save_control = None;

        {
            let mut gen = self.xidgen.write();
            if gen.state == GtmState::ShuttingDown {
                return Err(GtmError::ShuttingDown);
            }
            if gen.state == GtmState::Starting {
                return Err(GtmError::InvalidState(
                    "gxid counter not restored yet".to_string(),
                ));
            }

            let mut table = self.table.write();
            let mut last_assigned = INVALID_GLOBAL_XID;

            for (i, &handle) in handles.iter().enumerate() {
                let slot = self.slot(handle)?;
                let mut body = slot.body().write();

                if xid::is_valid(body.gxid) {
                    debug!(handle, gxid = body.gxid, "gxid already assigned");
                    gxids[i] = body.gxid;
                    continue;
                }

                let next = gen.next_xid;

                // Wraparound defenses, coded to fall through as fast as
                // possible while the vac limit is unset.
                if xid::follows_or_equals(next, gen.vac_limit) && xid::is_valid(gen.vac_limit) {
                    if xid::follows_or_equals(next, gen.stop_limit) {
                        return Err(GtmError::WraparoundStop);
                    } else if xid::follows_or_equals(next, gen.warn_limit) {
                        warn!(
                            remaining = gen.wrap_limit.wrapping_sub(next),
                            "gxid space low; vacuum required within {} transactions",
                            gen.wrap_limit.wrapping_sub(next)
                        );
                    }
                }

                xid::advance(&mut gen.next_xid);

                body.gxid = next;
                if body.state == TxnState::Starting {
                    body.state = TxnState::InProgress;
                }
                table.by_gxid.insert(next, handle);

                gxids[i] = next;
                new_handles.push(handle);
                last_assigned = next;
            }

            if xid::is_valid(last_assigned)
                && (last_assigned.wrapping_sub(gen.control_xid) > self.config.control_interval
                    || last_assigned < gen.control_xid)
            {
                gen.control_xid = last_assigned;
                save_control = Some(gen.next_xid);
            }

            if xid::precedes_or_equals(gen.backed_up_xid, gen.next_xid) {
                self.need_backup.store(true, Ordering::Release);
            }
        }

        if let Some(next) = save_control {
            self.control.save(next)?;
        }

        Ok((gxids, new_handles))
    }

    /// Assign a GXID to a single transaction.
    pub fn allocate(&self, handle: TxnHandle) -> Result<GlobalXid> {
        let (gxids, _) = self.allocate_multi(std::slice::from_ref(&handle))?;
        Ok(gxids[0])
    }

    // ------------------------------------------------------------------
    // Begin
    // ------------------------------------------------------------------

    /// Start (or resume) a batch of transactions.
    ///
    /// A request naming a session already bound to an open slot reuses
    /// that slot; everything else takes a fresh slot via the rotating
    /// cursor. On capacity exhaustion the error leaves earlier entries of
    /// the batch allocated - they are reaped by disconnect cleanup.
    pub fn begin_multi(&self, requests: &[BeginRequest]) -> Result<Vec<TxnHandle>> {
        let capacity = self.slots.len();
        let mut handles = Vec::with_capacity(requests.len());
        let mut table = self.table.write();

        for req in requests {
            if !req.session_id.is_empty() {
                if let Some(&existing) = table.by_session.get(&req.session_id) {
                    debug!(session = %req.session_id, handle = existing, "reusing session slot");
                    handles.push(existing);
                    continue;
                }
            }

            if table.free_slots == 0 {
                return Err(GtmError::Capacity(capacity));
            }

            let mut idx = (table.last_slot + 1) % capacity;
            let mut found = None;
            for _ in 0..capacity {
                if !self.slots[idx].is_in_use() {
                    found = Some(idx);
                    break;
                }
                idx = (idx + 1) % capacity;
            }
            let idx = found.ok_or(GtmError::Capacity(capacity))?;
            let slot = &self.slots[idx];

            slot.body().write().init(
                req.isolation,
                req.read_only,
                &req.session_id,
                req.client_id,
                req.proxy_conn_id,
            );
            slot.set_in_use(true);

            table.free_slots -= 1;
            table.last_slot = idx;
            let handle = idx as TxnHandle;
            table.open.push(handle);
            if !req.session_id.is_empty() {
                table.by_session.insert(req.session_id.clone(), handle);
            }
            handles.push(handle);
        }

        Ok(handles)
    }

    /// Start a single transaction.
    pub fn begin(&self, request: BeginRequest) -> Result<TxnHandle> {
        Ok(self.begin_multi(std::slice::from_ref(&request))?[0])
    }

    /// Start an autovacuum transaction; excluded from snapshot xmin.
    pub fn begin_autovacuum(&self, isolation: IsolationLevel, client_id: u32) -> Result<TxnHandle> {
        let handle = self.begin(BeginRequest::new(isolation, false, "", client_id, -1))?;
        self.set_vacuum(handle)?;
        Ok(handle)
    }

    /// Flag a transaction as autovacuum.
    pub fn set_vacuum(&self, handle: TxnHandle) -> Result<()> {
        let slot = self.slot(handle)?;
        slot.body().write().is_vacuum = true;
        Ok(())
    }

    /// Apply a mirrored begin from the master: create the slots, install
    /// the master's GXIDs and drive `next_xid` past them.
    pub fn bkup_begin_multi(
        &self,
        requests: &[BeginRequest],
        gxids: &[GlobalXid],
    ) -> Result<Vec<TxnHandle>> {
        debug_assert_eq!(requests.len(), gxids.len());
        let handles = self.begin_multi(requests)?;
        let mut save_control = None;

        {
            let mut gen = self.xidgen.write();
            let mut table = self.table.write();
            let mut last = INVALID_GLOBAL_XID;

            for (&handle, &gxid) in handles.iter().zip(gxids) {
                let slot = &self.slots[handle as usize];
                let mut body = slot.body().write();
                if xid::is_valid(body.gxid) {
                    // Session reuse: the slot already carries this GXID.
                    continue;
                }
                body.gxid = gxid;
                if body.state == TxnState::Starting {
                    body.state = TxnState::InProgress;
                }
                table.by_gxid.insert(gxid, handle);

                if xid::precedes_or_equals(gen.next_xid, gxid) {
                    gen.next_xid = gxid.wrapping_add(1);
                    if gen.next_xid < FIRST_NORMAL_GLOBAL_XID {
                        gen.next_xid = FIRST_NORMAL_GLOBAL_XID;
                    }
                }
                last = gen.next_xid;
            }

            if xid::is_valid(last)
                && (last.wrapping_sub(gen.control_xid) > self.config.control_interval
                    || last < gen.control_xid)
            {
                gen.control_xid = last;
                save_control = Some(last);
            }
        }

        if let Some(next) = save_control {
            self.control.save(next)?;
        }

        Ok(handles)
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn gxid_to_handle(&self, gxid: GlobalXid) -> Option<TxnHandle> {
        if !xid::is_valid(gxid) {
            return None;
        }
        self.table.read().by_gxid.get(&gxid).copied()
    }

    pub fn gid_to_handle(&self, gid: &str) -> Option<TxnHandle> {
        self.table.read().by_gid.get(gid).copied()
    }

    pub fn session_to_handle(&self, session_id: &str) -> Option<TxnHandle> {
        if session_id.is_empty() {
            return None;
        }
        self.table.read().by_session.get(session_id).copied()
    }

    /// Is a GXID still in the open-set?
    pub fn is_gxid_in_progress(&self, gxid: GlobalXid) -> bool {
        self.gxid_to_handle(gxid).is_some()
    }

    /// GXID currently assigned to a handle (may be invalid).
    pub fn gxid_of(&self, handle: TxnHandle) -> Result<GlobalXid> {
        Ok(self.slot(handle)?.gxid())
    }

    pub fn state_of(&self, handle: TxnHandle) -> Result<TxnState> {
        Ok(self.slot(handle)?.state())
    }

    pub fn open_count(&self) -> usize {
        self.table.read().open.len()
    }

    pub fn free_slot_count(&self) -> usize {
        self.table.read().free_slots
    }

    /// Highest client id (in modular order) among open transactions.
    pub fn last_client_id(&self) -> u32 {
        let table = self.table.read();
        let mut last = 0u32;
        for &handle in &table.open {
            let client_id = self.slots[handle as usize].body().read().client_id;
            if xid::client_id_follows(client_id, last) {
                last = client_id;
            }
        }
        last
    }

    // ------------------------------------------------------------------
    // Prepare (2PC)
    // ------------------------------------------------------------------

    /// Bind a GID and node list, moving the transaction into
    /// prepare-in-progress. Fails if the GID is already bound to any
    /// open transaction.
    pub fn start_prepared(&self, handle: TxnHandle, gid: &str, node_list: &str) -> Result<()> {
        let slot = self.slot(handle)?;

        let mut table = self.table.write();
        if table.by_gid.contains_key(gid) {
            warn!(gid, "gid already exists");
            return Err(GtmError::DuplicateGid(gid.to_string()));
        }
        table.by_gid.insert(gid.to_string(), handle);

        let mut body = slot.body().write();
        body.state = TxnState::PrepareInProgress;
        body.gid = Some(gid.to_string());
        body.node_list = Some(node_list.to_string());
        Ok(())
    }

    /// Finish the prepare: prepare-in-progress becomes prepared.
    pub fn prepare(&self, handle: TxnHandle) -> Result<()> {
        let slot = self.slot(handle)?;
        let mut body = slot.body().write();
        if body.state != TxnState::PrepareInProgress {
            return Err(GtmError::InvalidState(format!(
                "prepare from {:?}, expected PrepareInProgress",
                body.state
            )));
        }
        body.state = TxnState::Prepared;
        Ok(())
    }

    /// GXID and node list of the prepared transaction bound to `gid`.
    pub fn gid_data(&self, gid: &str) -> Result<(GlobalXid, Option<String>)> {
        let handle = self
            .gid_to_handle(gid)
            .ok_or_else(|| GtmError::UnknownGid(gid.to_string()))?;
        let slot = self.slot(handle)?;
        let body = slot.body().read();
        Ok((body.gxid, body.node_list.clone()))
    }

    // ------------------------------------------------------------------
    // Commit / rollback
    // ------------------------------------------------------------------

    /// Commit a batch of transactions.
    ///
    /// A transaction whose `waited_xids` include a still-open GXID is
    /// left untouched with a delayed status; the client retries. The
    /// open-set membership is consulted per transaction against the live
    /// table, so entries of the same batch never unblock each other
    /// within one call.
    pub fn commit_multi(&self, handles: &[TxnHandle], waited_xids: &[GlobalXid]) -> Vec<TxnStatus> {
        let mut statuses = vec![TxnStatus::Error; handles.len()];
        let mut finished = Vec::with_capacity(handles.len());

        for (i, &handle) in handles.iter().enumerate() {
            let slot = match self.slot(handle) {
                Ok(slot) => slot,
                Err(_) => {
                    warn!(handle, "cannot commit uninitialized handle");
                    continue;
                }
            };

            let waiting = waited_xids.iter().any(|&w| self.is_gxid_in_progress(w));
            if waiting {
                debug!(handle, "commit delayed by in-progress transactions");
                statuses[i] = TxnStatus::Delayed;
                continue;
            }

            slot.body().write().state = TxnState::CommitInProgress;
            statuses[i] = TxnStatus::Ok;
            finished.push(handle);
        }

        self.remove_finished(&finished);
        statuses
    }

    /// Commit a single transaction.
    pub fn commit(&self, handle: TxnHandle, waited_xids: &[GlobalXid]) -> TxnStatus {
        self.commit_multi(std::slice::from_ref(&handle), waited_xids)[0]
    }

    /// Roll back a batch of transactions.
    pub fn rollback_multi(&self, handles: &[TxnHandle]) -> Vec<TxnStatus> {
        let mut statuses = vec![TxnStatus::Error; handles.len()];
        let mut finished = Vec::with_capacity(handles.len());

        for (i, &handle) in handles.iter().enumerate() {
            let slot = match self.slot(handle) {
                Ok(slot) => slot,
                Err(_) => continue,
            };
            slot.body().write().state = TxnState::AbortInProgress;
            statuses[i] = TxnStatus::Ok;
            finished.push(handle);
        }

        self.remove_finished(&finished);
        statuses
    }

    /// Roll back a single transaction.
    pub fn rollback(&self, handle: TxnHandle) -> TxnStatus {
        self.rollback_multi(std::slice::from_ref(&handle))[0]
    }

    /// Remove every non-prepared transaction belonging to a client.
    ///
    /// `proxy_conn_id == -1` matches all backends of the client;
    /// otherwise only the given backend's transactions are removed.
    /// Prepared (and prepare-in-progress) transactions survive: they are
    /// completed later through the GID, typically by another client.
    pub fn remove_all(&self, client_id: u32, proxy_conn_id: i32) -> usize {
        debug!(client_id, proxy_conn_id, "removing client transactions");

        let mut table = self.table.write();
        let mut removed = 0;
        let mut i = 0;

        while i < table.open.len() {
            let handle = table.open[i];
            let slot = &self.slots[handle as usize];
            let matches = {
                let body = slot.body().read();
                slot.is_in_use()
                    && body.state != TxnState::Prepared
                    && body.state != TxnState::PrepareInProgress
                    && xid::client_id_equals(body.client_id, client_id)
                    && (proxy_conn_id == -1 || body.proxy_conn_id == proxy_conn_id)
            };

            if matches {
                table.open.remove(i);
                let mut body = slot.body().write();
                self.clean_locked(&mut table, slot, &mut body);
                removed += 1;
            } else {
                i += 1;
            }
        }

        removed
    }

    /// Remove finished transactions from the open-set and clean their
    /// slots, all under one hold of the table lock.
    fn remove_finished(&self, handles: &[TxnHandle]) {
        if handles.is_empty() {
            return;
        }

        let mut table = self.table.write();
        for &handle in handles {
            let slot = &self.slots[handle as usize];
            if !slot.is_in_use() {
                continue;
            }
            if let Some(pos) = table.open.iter().position(|&h| h == handle) {
                table.open.remove(pos);
            }
            let mut body = slot.body().write();
            self.clean_locked(&mut table, slot, &mut body);
        }
    }

    /// Common cleanup tail. Caller holds the table lock, has removed the
    /// handle from the open vector, and holds the slot's write lock.
    fn clean_locked(&self, table: &mut TableState, slot: &TxnSlot, body: &mut SlotBody) {
        let handle = slot.handle();

        if xid::is_valid(body.gxid) {
            table.by_gxid.remove(&body.gxid);
        }
        if let Some(gid) = &body.gid {
            if table.by_gid.get(gid) == Some(&handle) {
                table.by_gid.remove(gid);
            }
        }
        if !body.session_id.is_empty() && table.by_session.get(&body.session_id) == Some(&handle) {
            table.by_session.remove(&body.session_id);
        }

        if xid::is_normal(body.gxid)
            && xid::follows_or_equals(body.gxid, table.latest_completed_xid)
        {
            table.latest_completed_xid = body.gxid;
        }

        debug!(
            gxid = body.gxid,
            client_id = body.client_id,
            handle,
            "removing transaction"
        );

        // Sequence bookkeeping depends on how the transaction ended.
        // Created sequences are dropped before dropped ones are restored,
        // since a created sequence may have reused a dropped name.
        match body.state {
            TxnState::AbortInProgress => {
                for seq in &body.created_seqs {
                    self.sequences.remove_created(seq);
                }
                for seq in &body.dropped_seqs {
                    self.sequences.restore_dropped(seq);
                }
                for seq in &body.altered_seqs {
                    self.sequences.restore_altered(seq);
                }
            }
            TxnState::CommitInProgress => {
                for seq in &body.dropped_seqs {
                    self.sequences.remove_dropped(seq);
                }
                for seq in &body.altered_seqs {
                    self.sequences.remove_altered(seq);
                }
            }
            _ => {}
        }

        body.clean();
        slot.set_in_use(false);
        table.free_slots += 1;
    }

    // ------------------------------------------------------------------
    // Sequence bookkeeping
    // ------------------------------------------------------------------

    /// Track a sequence created by the transaction owning `gxid`.
    /// Silently ignores unknown GXIDs.
    pub fn remember_created_sequence(&self, gxid: GlobalXid, seq: SeqRef) {
        if let Some(handle) = self.gxid_to_handle(gxid) {
            if let Ok(slot) = self.slot(handle) {
                slot.body().write().created_seqs.push(seq);
            }
        }
    }

    /// Stop tracking a created sequence (it was dropped again in the same
    /// transaction).
    pub fn forget_created_sequence(&self, gxid: GlobalXid, seq: &SeqRef) {
        if let Some(handle) = self.gxid_to_handle(gxid) {
            if let Ok(slot) = self.slot(handle) {
                let mut body = slot.body().write();
                body.created_seqs.retain(|s| s != seq);
            }
        }
    }

    /// Track a sequence dropped by the transaction owning `gxid`.
    pub fn remember_dropped_sequence(&self, gxid: GlobalXid, seq: SeqRef) {
        if let Some(handle) = self.gxid_to_handle(gxid) {
            if let Ok(slot) = self.slot(handle) {
                slot.body().write().dropped_seqs.push(seq);
            }
        }
    }

    /// Track a sequence altered by the transaction owning `gxid`.
    pub fn remember_altered_sequence(&self, gxid: GlobalXid, seq: SeqRef) {
        if let Some(handle) = self.gxid_to_handle(gxid) {
            if let Ok(slot) = self.slot(handle) {
                slot.body().write().altered_seqs.push(seq);
            }
        }
    }

    // ------------------------------------------------------------------
    // Xmin reports
    // ------------------------------------------------------------------

    /// Fold a node's xmin report into the global horizon.
    ///
    /// Returns `(latest_completed_xid, recent_global_xmin, errcode)`.
    pub fn report_xmin(
        &self,
        node_type: GtmNodeType,
        node_name: &str,
        reported: GlobalXid,
    ) -> (GlobalXid, GlobalXid, i32) {
        let (open_xmins, latest_completed) = {
            let table = self.table.read();
            let mut xmins = Vec::with_capacity(table.open.len());
            for &handle in &table.open {
                let body = self.slots[handle as usize].body().read();
                if !body.is_vacuum && xid::is_normal(body.gxid) {
                    xmins.push(body.gxid);
                }
            }
            (xmins, table.latest_completed_xid)
        };

        let (global_xmin, errcode) = self.xmin.report(node_type, node_name, reported, &open_xmins);
        (latest_completed, global_xmin, errcode)
    }

    // ------------------------------------------------------------------
    // Snapshot for GXID_LIST
    // ------------------------------------------------------------------

    /// Serialize the registry state. Standby promotion tooling uses this
    /// to seed a fresh master.
    pub fn summary(&self) -> RegistrySummary {
        let gen = self.xidgen.read();
        let table = self.table.read();

        let open = table
            .open
            .iter()
            .map(|&handle| {
                let body = self.slots[handle as usize].body().read();
                TxnDigest {
                    handle,
                    gxid: body.gxid,
                    state: body.state,
                    isolation: body.isolation,
                    read_only: body.read_only,
                    session_id: body.session_id.clone(),
                    client_id: body.client_id,
                    is_vacuum: body.is_vacuum,
                    gid: body.gid.clone(),
                }
            })
            .collect();

        RegistrySummary {
            state: gen.state,
            next_xid: gen.next_xid,
            oldest_xid: gen.oldest_xid,
            vac_limit: gen.vac_limit,
            warn_limit: gen.warn_limit,
            stop_limit: gen.stop_limit,
            wrap_limit: gen.wrap_limit,
            latest_completed_xid: table.latest_completed_xid,
            recent_global_xmin: self.xmin.recent_global_xmin(),
            open,
        }
    }
}
