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

//! Request Dispatch
//!
//! One handler per opcode, each with the same shape: parse the payload,
//! act on the registry, mirror the mutation to the standby, encode the
//! response. Responses echo the proxy connection id of the request.
//!
//! Error discipline follows the wire contract: malformed payloads and
//! unknown opcodes are fatal for the connection, while validation, state,
//! capacity and wraparound failures travel back to the client as an
//! error response and leave the connection usable.
//!
//! `BKUP_*` opcodes are the standby-side twins. They apply the mirrored
//! mutation, produce no response (except the sync ack) and never forward
//! further.

use tracing::{debug, error, warn};

use gtmd_core::{
    current_timestamp, GlobalXid, GtmError, GtmNodeType, IsolationLevel, Result, TxnStatus,
    INVALID_TXN_HANDLE,
};
use gtmd_txn::registry::{GID_MAXLEN, NODESTRING_MAXLEN, SESSION_ID_MAXLEN};
use gtmd_txn::{BeginRequest, TxnRegistry};

use crate::proto::{
    opcode, put_bool, put_i32, put_i64, put_string, put_u32, Message, PayloadReader,
    NO_PROXY_CONN,
};
use crate::standby::StandbyLink;

/// Per-request view of the connection's shared state.
pub struct RequestContext<'a> {
    pub registry: &'a TxnRegistry,
    pub standby: &'a mut StandbyLink,
    /// Client id the server issued to this connection.
    pub client_id: u32,
    pub synchronous_backup: bool,
}

impl RequestContext<'_> {
    /// Mirror a mutation to the standby before the response is written.
    ///
    /// In asynchronous mode an unreachable standby is logged and the
    /// master keeps serving; the next successful call re-establishes the
    /// channel. Synchronous mode escalates the failure to the client and
    /// additionally waits for the standby's ack (unless the client is a
    /// proxy, which does its own flushing).
    fn mirror(&mut self, msg: Message, from_proxy: bool) -> Result<()> {
        if !self.standby.is_attached() {
            return Ok(());
        }
        match self.standby.mirror(&msg) {
            Ok(()) => {
                if self.synchronous_backup && !from_proxy {
                    self.standby.sync()?;
                }
                Ok(())
            }
            Err(e) => {
                if self.synchronous_backup {
                    Err(e)
                } else {
                    warn!(error = %e, "standby mirror failed; continuing without it");
                    Ok(())
                }
            }
        }
    }
}

fn is_backup_opcode(op: u8) -> bool {
    (opcode::BKUP_TXN_BEGIN..=opcode::BKUP_SYNC).contains(&op)
}

fn is_fatal(err: &GtmError) -> bool {
    matches!(
        err,
        GtmError::Protocol(_)
            | GtmError::Io(_)
            | GtmError::ConnectionClosed
            | GtmError::FrameTooLarge(_, _)
            | GtmError::InvalidOpcode(_)
    )
}

/// Route one request. `Ok(None)` means no response (backup opcodes);
/// `Err` means the connection must be closed.
pub fn dispatch(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let result = match request.opcode {
        opcode::TXN_BEGIN => handle_begin(ctx, request),
        opcode::TXN_BEGIN_GETGXID => handle_begin_getgxid(ctx, request),
        opcode::TXN_BEGIN_GETGXID_AUTOVACUUM => handle_begin_autovacuum(ctx, request),
        opcode::TXN_BEGIN_GETGXID_MULTI => handle_begin_getgxid_multi(ctx, request),
        opcode::TXN_PREPARE => handle_prepare(ctx, request),
        opcode::TXN_START_PREPARED => handle_start_prepared(ctx, request),
        opcode::TXN_COMMIT => handle_commit(ctx, request),
        opcode::TXN_COMMIT_PREPARED => handle_commit_prepared(ctx, request),
        opcode::TXN_COMMIT_MULTI => handle_commit_multi(ctx, request),
        opcode::TXN_ROLLBACK => handle_rollback(ctx, request),
        opcode::TXN_ROLLBACK_MULTI => handle_rollback_multi(ctx, request),
        opcode::TXN_GET_GID_DATA => handle_get_gid_data(ctx, request),
        opcode::TXN_GET_GXID => handle_get_gxid(ctx, request),
        opcode::TXN_GET_NEXT_GXID => handle_get_next_gxid(ctx, request),
        opcode::TXN_GXID_LIST => handle_gxid_list(ctx, request),
        opcode::REPORT_XMIN => handle_report_xmin(ctx, request),

        opcode::BKUP_TXN_BEGIN => handle_bkup_begin(ctx, request),
        opcode::BKUP_TXN_BEGIN_GETGXID => handle_bkup_begin_getgxid(ctx, request),
        opcode::BKUP_TXN_BEGIN_GETGXID_AUTOVACUUM => handle_bkup_begin_autovacuum(ctx, request),
        opcode::BKUP_TXN_BEGIN_GETGXID_MULTI => handle_bkup_begin_getgxid_multi(ctx, request),
        opcode::BKUP_TXN_PREPARE => handle_bkup_prepare(ctx, request),
        opcode::BKUP_TXN_START_PREPARED => handle_bkup_start_prepared(ctx, request),
        opcode::BKUP_TXN_COMMIT => handle_bkup_commit(ctx, request),
        opcode::BKUP_TXN_COMMIT_PREPARED => handle_bkup_commit_prepared(ctx, request),
        opcode::BKUP_TXN_COMMIT_MULTI => handle_bkup_commit_multi(ctx, request),
        opcode::BKUP_TXN_ROLLBACK => handle_bkup_rollback(ctx, request),
        opcode::BKUP_TXN_ROLLBACK_MULTI => handle_bkup_rollback_multi(ctx, request),
        opcode::BKUP_SYNC => Ok(Some(Message::new(
            opcode::SYNC_RESULT,
            request.conn_id,
            Vec::new(),
        ))),

        other => return Err(GtmError::InvalidOpcode(other)),
    };

    match result {
        Ok(resp) => Ok(resp),
        Err(e) if is_fatal(&e) => Err(e),
        Err(e) if is_backup_opcode(request.opcode) => {
            // A diverging standby must not answer the master; drop the
            // replication connection instead and let it reconnect.
            error!(opcode = request.opcode, error = %e, "backup apply failed");
            Err(e)
        }
        Err(e) => Ok(Some(Message::error(request.conn_id, &e.to_string()))),
    }
}

// ============================================================================
// Begin family
// ============================================================================

fn parse_begin_args(r: &mut PayloadReader) -> Result<(IsolationLevel, bool, String)> {
    let isolation = IsolationLevel::try_from(r.get_u32("isolation")?)?;
    let read_only = r.get_bool("read_only")?;
    let session_id = r.get_string(SESSION_ID_MAXLEN, "session_id")?;
    Ok((isolation, read_only, session_id))
}

fn handle_begin(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let (isolation, read_only, session_id) = parse_begin_args(&mut r)?;
    r.expect_end()?;

    let handle = ctx.registry.begin(BeginRequest::new(
        isolation,
        read_only,
        session_id.clone(),
        ctx.client_id,
        NO_PROXY_CONN,
    ))?;
    let timestamp = current_timestamp();

    let mut bkup = Vec::new();
    put_u32(&mut bkup, isolation.as_wire());
    put_bool(&mut bkup, read_only);
    put_string(&mut bkup, &session_id);
    put_u32(&mut bkup, ctx.client_id);
    put_i64(&mut bkup, timestamp);
    ctx.mirror(
        Message::new(opcode::BKUP_TXN_BEGIN, NO_PROXY_CONN, bkup),
        request.conn_id != NO_PROXY_CONN,
    )?;

    let mut out = Vec::new();
    put_i32(&mut out, handle);
    put_i64(&mut out, timestamp);
    Ok(Some(Message::new(
        opcode::TXN_BEGIN_RESULT,
        request.conn_id,
        out,
    )))
}

fn handle_begin_getgxid(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let (isolation, read_only, session_id) = parse_begin_args(&mut r)?;
    r.expect_end()?;

    let timestamp = current_timestamp();
    let handle = ctx.registry.begin(BeginRequest::new(
        isolation,
        read_only,
        session_id.clone(),
        ctx.client_id,
        NO_PROXY_CONN,
    ))?;
    let gxid = ctx.registry.allocate(handle)?;

    debug!(gxid, "issuing transaction id");

    let mut bkup = Vec::new();
    put_u32(&mut bkup, gxid);
    put_u32(&mut bkup, isolation.as_wire());
    put_bool(&mut bkup, read_only);
    put_string(&mut bkup, &session_id);
    put_u32(&mut bkup, ctx.client_id);
    put_i64(&mut bkup, timestamp);
    ctx.mirror(
        Message::new(opcode::BKUP_TXN_BEGIN_GETGXID, NO_PROXY_CONN, bkup),
        request.conn_id != NO_PROXY_CONN,
    )?;

    let mut out = Vec::new();
    put_u32(&mut out, gxid);
    put_i64(&mut out, timestamp);
    Ok(Some(Message::new(
        opcode::TXN_BEGIN_GETGXID_RESULT,
        request.conn_id,
        out,
    )))
}

fn handle_begin_autovacuum(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let isolation = IsolationLevel::try_from(r.get_u32("isolation")?)?;
    let _read_only = r.get_bool("read_only")?;
    r.expect_end()?;

    let handle = ctx.registry.begin_autovacuum(isolation, ctx.client_id)?;
    let gxid = ctx.registry.allocate(handle)?;

    let mut bkup = Vec::new();
    put_u32(&mut bkup, gxid);
    put_u32(&mut bkup, isolation.as_wire());
    put_u32(&mut bkup, ctx.client_id);
    ctx.mirror(
        Message::new(
            opcode::BKUP_TXN_BEGIN_GETGXID_AUTOVACUUM,
            NO_PROXY_CONN,
            bkup,
        ),
        request.conn_id != NO_PROXY_CONN,
    )?;

    let mut out = Vec::new();
    put_u32(&mut out, gxid);
    Ok(Some(Message::new(
        opcode::TXN_BEGIN_GETGXID_AUTOVACUUM_RESULT,
        request.conn_id,
        out,
    )))
}

fn handle_begin_getgxid_multi(
    ctx: &mut RequestContext,
    request: &Message,
) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let count = r.get_u32("txn_count")? as usize;
    if count == 0 {
        return Err(GtmError::Protocol("zero transaction count".to_string()));
    }

    let mut requests = Vec::new();
    for _ in 0..count {
        let isolation = IsolationLevel::try_from(r.get_u32("isolation")?)?;
        let read_only = r.get_bool("read_only")?;
        let session_id = r.get_string(SESSION_ID_MAXLEN, "session_id")?;
        let conn_id = r.get_i32("conn_id")?;
        requests.push(BeginRequest::new(
            isolation,
            read_only,
            session_id,
            ctx.client_id,
            conn_id,
        ));
    }
    r.expect_end()?;

    let timestamp = current_timestamp();
    let handles = ctx.registry.begin_multi(&requests)?;
    let (gxids, _new_handles) = ctx.registry.allocate_multi(&handles)?;

    let mut bkup = Vec::new();
    put_u32(&mut bkup, count as u32);
    for (req, &gxid) in requests.iter().zip(&gxids) {
        put_u32(&mut bkup, gxid);
        put_u32(&mut bkup, req.isolation.as_wire());
        put_bool(&mut bkup, req.read_only);
        put_string(&mut bkup, &req.session_id);
        put_u32(&mut bkup, req.client_id);
        put_i32(&mut bkup, req.proxy_conn_id);
    }
    ctx.mirror(
        Message::new(opcode::BKUP_TXN_BEGIN_GETGXID_MULTI, NO_PROXY_CONN, bkup),
        request.conn_id != NO_PROXY_CONN,
    )?;

    let mut out = Vec::new();
    put_u32(&mut out, count as u32);
    for &gxid in &gxids {
        put_u32(&mut out, gxid);
    }
    put_i64(&mut out, timestamp);
    Ok(Some(Message::new(
        opcode::TXN_BEGIN_GETGXID_MULTI_RESULT,
        request.conn_id,
        out,
    )))
}

// ============================================================================
// Prepare family
// ============================================================================

fn handle_prepare(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxid = r.get_u32("gxid")?;
    r.expect_end()?;

    let handle = ctx
        .registry
        .gxid_to_handle(gxid)
        .ok_or(GtmError::UnknownGxid(gxid))?;
    ctx.registry.prepare(handle)?;

    debug!(gxid, "prepared transaction");

    let mut bkup = Vec::new();
    put_u32(&mut bkup, gxid);
    ctx.mirror(
        Message::new(opcode::BKUP_TXN_PREPARE, NO_PROXY_CONN, bkup),
        request.conn_id != NO_PROXY_CONN,
    )?;

    let mut out = Vec::new();
    put_u32(&mut out, gxid);
    Ok(Some(Message::new(
        opcode::TXN_PREPARE_RESULT,
        request.conn_id,
        out,
    )))
}

fn handle_start_prepared(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxid = r.get_u32("gxid")?;
    let gid = r.get_string(GID_MAXLEN, "gid")?;
    let node_list = r.get_string(NODESTRING_MAXLEN, "node_list")?;
    r.expect_end()?;

    let handle = ctx
        .registry
        .gxid_to_handle(gxid)
        .ok_or(GtmError::UnknownGxid(gxid))?;
    ctx.registry.start_prepared(handle, &gid, &node_list)?;

    let mut bkup = Vec::new();
    put_u32(&mut bkup, gxid);
    put_string(&mut bkup, &gid);
    put_string(&mut bkup, &node_list);
    ctx.mirror(
        Message::new(opcode::BKUP_TXN_START_PREPARED, NO_PROXY_CONN, bkup),
        request.conn_id != NO_PROXY_CONN,
    )?;

    let mut out = Vec::new();
    put_u32(&mut out, gxid);
    Ok(Some(Message::new(
        opcode::TXN_START_PREPARED_RESULT,
        request.conn_id,
        out,
    )))
}

fn handle_get_gid_data(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let isolation = IsolationLevel::try_from(r.get_u32("isolation")?)?;
    let read_only = r.get_bool("read_only")?;
    let gid = r.get_string(GID_MAXLEN, "gid")?;
    r.expect_end()?;

    // The auxiliary transaction carries the COMMIT PREPARED / ROLLBACK
    // PREPARED itself; it gets a fresh slot and GXID.
    let (prepared_gxid, node_list) = ctx.registry.gid_data(&gid)?;
    let aux = ctx.registry.begin(BeginRequest::new(
        isolation,
        read_only,
        "",
        ctx.client_id,
        NO_PROXY_CONN,
    ))?;
    let new_gxid = ctx.registry.allocate(aux)?;

    // The prepared GXID was mirrored when it was begun; the auxiliary
    // GXID must reach the standby too, since a COMMIT/ABORT for it will
    // arrive later.
    let mut bkup = Vec::new();
    put_u32(&mut bkup, new_gxid);
    put_u32(&mut bkup, isolation.as_wire());
    put_bool(&mut bkup, false);
    put_string(&mut bkup, "");
    put_u32(&mut bkup, ctx.client_id);
    put_i64(&mut bkup, 0);
    ctx.mirror(
        Message::new(opcode::BKUP_TXN_BEGIN_GETGXID, NO_PROXY_CONN, bkup),
        request.conn_id != NO_PROXY_CONN,
    )?;

    let mut out = Vec::new();
    put_u32(&mut out, new_gxid);
    put_u32(&mut out, prepared_gxid);
    put_string(&mut out, node_list.as_deref().unwrap_or(""));
    Ok(Some(Message::new(
        opcode::TXN_GET_GID_DATA_RESULT,
        request.conn_id,
        out,
    )))
}

// ============================================================================
// Commit / rollback family
// ============================================================================

fn read_waited_xids(r: &mut PayloadReader) -> Result<Vec<GlobalXid>> {
    let count = r.get_u32("waited_xid_count")? as usize;
    let mut waited = Vec::new();
    for _ in 0..count {
        waited.push(r.get_u32("waited_xid")?);
    }
    Ok(waited)
}

fn handle_commit(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxid = r.get_u32("gxid")?;
    let waited = read_waited_xids(&mut r)?;
    r.expect_end()?;

    let handle = ctx
        .registry
        .gxid_to_handle(gxid)
        .unwrap_or(INVALID_TXN_HANDLE);
    let status = ctx.registry.commit(handle, &waited);

    // A delayed commit mutates nothing; only a successful one is
    // mirrored. The retry that succeeds mirrors then.
    if status == TxnStatus::Ok {
        let mut bkup = Vec::new();
        put_u32(&mut bkup, gxid);
        ctx.mirror(
            Message::new(opcode::BKUP_TXN_COMMIT, NO_PROXY_CONN, bkup),
            request.conn_id != NO_PROXY_CONN,
        )?;
    }

    let mut out = Vec::new();
    put_u32(&mut out, gxid);
    put_i32(&mut out, status.as_wire());
    Ok(Some(Message::new(
        opcode::TXN_COMMIT_RESULT,
        request.conn_id,
        out,
    )))
}

fn handle_commit_prepared(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxid = r.get_u32("gxid")?;
    let prepared_gxid = r.get_u32("prepared_gxid")?;
    let waited = read_waited_xids(&mut r)?;
    r.expect_end()?;

    debug!(gxid, prepared_gxid, "committing prepared transaction pair");

    let handles = [
        ctx.registry
            .gxid_to_handle(gxid)
            .unwrap_or(INVALID_TXN_HANDLE),
        ctx.registry
            .gxid_to_handle(prepared_gxid)
            .unwrap_or(INVALID_TXN_HANDLE),
    ];
    let statuses = ctx.registry.commit_multi(&handles, &waited);

    // The auxiliary GXID's status is authoritative; the pair commits or
    // delays together.
    if statuses[0] == TxnStatus::Ok {
        let mut bkup = Vec::new();
        put_u32(&mut bkup, gxid);
        put_u32(&mut bkup, prepared_gxid);
        ctx.mirror(
            Message::new(opcode::BKUP_TXN_COMMIT_PREPARED, NO_PROXY_CONN, bkup),
            request.conn_id != NO_PROXY_CONN,
        )?;
    }

    let mut out = Vec::new();
    put_u32(&mut out, gxid);
    put_i32(&mut out, statuses[0].as_wire());
    Ok(Some(Message::new(
        opcode::TXN_COMMIT_PREPARED_RESULT,
        request.conn_id,
        out,
    )))
}

fn read_gxid_batch(r: &mut PayloadReader) -> Result<Vec<GlobalXid>> {
    let count = r.get_u32("txn_count")? as usize;
    let mut gxids = Vec::new();
    for _ in 0..count {
        gxids.push(r.get_u32("gxid")?);
    }
    Ok(gxids)
}

fn handle_commit_multi(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxids = read_gxid_batch(&mut r)?;
    r.expect_end()?;

    let handles: Vec<_> = gxids
        .iter()
        .map(|&g| ctx.registry.gxid_to_handle(g).unwrap_or(INVALID_TXN_HANDLE))
        .collect();
    let statuses = ctx.registry.commit_multi(&handles, &[]);

    let mut bkup = Vec::new();
    put_u32(&mut bkup, gxids.len() as u32);
    for &g in &gxids {
        put_u32(&mut bkup, g);
    }
    ctx.mirror(
        Message::new(opcode::BKUP_TXN_COMMIT_MULTI, NO_PROXY_CONN, bkup),
        request.conn_id != NO_PROXY_CONN,
    )?;

    let mut out = Vec::new();
    put_u32(&mut out, statuses.len() as u32);
    for status in &statuses {
        put_i32(&mut out, status.as_wire());
    }
    Ok(Some(Message::new(
        opcode::TXN_COMMIT_MULTI_RESULT,
        request.conn_id,
        out,
    )))
}

fn handle_rollback(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxid = r.get_u32("gxid")?;
    r.expect_end()?;

    debug!(gxid, "cancelling transaction");

    let handle = ctx
        .registry
        .gxid_to_handle(gxid)
        .unwrap_or(INVALID_TXN_HANDLE);
    let status = ctx.registry.rollback(handle);

    let mut bkup = Vec::new();
    put_u32(&mut bkup, gxid);
    ctx.mirror(
        Message::new(opcode::BKUP_TXN_ROLLBACK, NO_PROXY_CONN, bkup),
        request.conn_id != NO_PROXY_CONN,
    )?;

    let mut out = Vec::new();
    put_u32(&mut out, gxid);
    put_i32(&mut out, status.as_wire());
    Ok(Some(Message::new(
        opcode::TXN_ROLLBACK_RESULT,
        request.conn_id,
        out,
    )))
}

fn handle_rollback_multi(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxids = read_gxid_batch(&mut r)?;
    r.expect_end()?;

    let handles: Vec<_> = gxids
        .iter()
        .map(|&g| ctx.registry.gxid_to_handle(g).unwrap_or(INVALID_TXN_HANDLE))
        .collect();
    let statuses = ctx.registry.rollback_multi(&handles);

    let mut bkup = Vec::new();
    put_u32(&mut bkup, gxids.len() as u32);
    for &g in &gxids {
        put_u32(&mut bkup, g);
    }
    ctx.mirror(
        Message::new(opcode::BKUP_TXN_ROLLBACK_MULTI, NO_PROXY_CONN, bkup),
        request.conn_id != NO_PROXY_CONN,
    )?;

    let mut out = Vec::new();
    put_u32(&mut out, statuses.len() as u32);
    for status in &statuses {
        put_i32(&mut out, status.as_wire());
    }
    Ok(Some(Message::new(
        opcode::TXN_ROLLBACK_MULTI_RESULT,
        request.conn_id,
        out,
    )))
}

// ============================================================================
// Queries
// ============================================================================

fn handle_get_gxid(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let handle = r.get_i32("handle")?;
    r.expect_end()?;

    let gxid = ctx.registry.allocate(handle)?;

    let mut out = Vec::new();
    put_i32(&mut out, handle);
    put_u32(&mut out, gxid);
    Ok(Some(Message::new(
        opcode::TXN_GET_GXID_RESULT,
        request.conn_id,
        out,
    )))
}

fn handle_get_next_gxid(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    PayloadReader::new(&request.payload).expect_end()?;

    let next = ctx.registry.read_next_xid();

    let mut out = Vec::new();
    put_u32(&mut out, next);
    Ok(Some(Message::new(
        opcode::TXN_GET_NEXT_GXID_RESULT,
        request.conn_id,
        out,
    )))
}

fn handle_gxid_list(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    PayloadReader::new(&request.payload).expect_end()?;

    if ctx.registry.is_standby() {
        return Err(GtmError::StandbyMode);
    }

    let summary = ctx.registry.summary();
    let body = serde_json::to_vec(&summary)
        .map_err(|e| GtmError::InvalidState(format!("serialize registry: {}", e)))?;

    let mut out = Vec::new();
    put_u32(&mut out, body.len() as u32);
    out.extend_from_slice(&body);
    Ok(Some(Message::new(
        opcode::TXN_GXID_LIST_RESULT,
        request.conn_id,
        out,
    )))
}

fn handle_report_xmin(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxid = r.get_u32("gxid")?;
    let node_type_raw = r.get_u32("node_type")?;
    let node_name = r.get_string(SESSION_ID_MAXLEN, "node_name")?;
    r.expect_end()?;

    let (latest_completed, global_xmin, errcode) = match GtmNodeType::try_from(node_type_raw) {
        Ok(node_type) => ctx.registry.report_xmin(node_type, &node_name, gxid),
        Err(_) => (
            ctx.registry.latest_completed_xid(),
            ctx.registry.recent_global_xmin(),
            -1,
        ),
    };

    let mut out = Vec::new();
    put_u32(&mut out, latest_completed);
    put_u32(&mut out, global_xmin);
    put_i32(&mut out, errcode);
    Ok(Some(Message::new(
        opcode::REPORT_XMIN_RESULT,
        request.conn_id,
        out,
    )))
}

// ============================================================================
// Backup twins (standby side)
// ============================================================================

fn handle_bkup_begin(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let isolation = IsolationLevel::try_from(r.get_u32("isolation")?)?;
    let read_only = r.get_bool("read_only")?;
    let session_id = r.get_string(SESSION_ID_MAXLEN, "session_id")?;
    let client_id = r.get_u32("client_id")?;
    let _timestamp = r.get_i64("timestamp")?;
    r.expect_end()?;

    ctx.registry.begin(BeginRequest::new(
        isolation,
        read_only,
        session_id,
        client_id,
        NO_PROXY_CONN,
    ))?;
    Ok(None)
}

fn handle_bkup_begin_getgxid(
    ctx: &mut RequestContext,
    request: &Message,
) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxid = r.get_u32("gxid")?;
    let isolation = IsolationLevel::try_from(r.get_u32("isolation")?)?;
    let read_only = r.get_bool("read_only")?;
    let session_id = r.get_string(SESSION_ID_MAXLEN, "session_id")?;
    let client_id = r.get_u32("client_id")?;
    let _timestamp = r.get_i64("timestamp")?;
    r.expect_end()?;

    ctx.registry.bkup_begin_multi(
        &[BeginRequest::new(
            isolation,
            read_only,
            session_id,
            client_id,
            NO_PROXY_CONN,
        )],
        &[gxid],
    )?;
    Ok(None)
}

fn handle_bkup_begin_autovacuum(
    ctx: &mut RequestContext,
    request: &Message,
) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxid = r.get_u32("gxid")?;
    let isolation = IsolationLevel::try_from(r.get_u32("isolation")?)?;
    let client_id = r.get_u32("client_id")?;
    r.expect_end()?;

    let handles = ctx.registry.bkup_begin_multi(
        &[BeginRequest::new(
            isolation,
            false,
            "",
            client_id,
            NO_PROXY_CONN,
        )],
        &[gxid],
    )?;
    ctx.registry.set_vacuum(handles[0])?;
    Ok(None)
}

fn handle_bkup_begin_getgxid_multi(
    ctx: &mut RequestContext,
    request: &Message,
) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let count = r.get_u32("txn_count")? as usize;
    if count == 0 {
        return Err(GtmError::Protocol("zero transaction count".to_string()));
    }

    let mut requests = Vec::new();
    let mut gxids = Vec::new();
    for _ in 0..count {
        let gxid = r.get_u32("gxid")?;
        let isolation = IsolationLevel::try_from(r.get_u32("isolation")?)?;
        let read_only = r.get_bool("read_only")?;
        let session_id = r.get_string(SESSION_ID_MAXLEN, "session_id")?;
        let client_id = r.get_u32("client_id")?;
        let conn_id = r.get_i32("conn_id")?;
        requests.push(BeginRequest::new(
            isolation,
            read_only,
            session_id,
            client_id,
            conn_id,
        ));
        gxids.push(gxid);
    }
    r.expect_end()?;

    ctx.registry.bkup_begin_multi(&requests, &gxids)?;
    Ok(None)
}

fn handle_bkup_prepare(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxid = r.get_u32("gxid")?;
    r.expect_end()?;

    let handle = ctx
        .registry
        .gxid_to_handle(gxid)
        .ok_or(GtmError::UnknownGxid(gxid))?;
    ctx.registry.prepare(handle)?;
    Ok(None)
}

fn handle_bkup_start_prepared(
    ctx: &mut RequestContext,
    request: &Message,
) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxid = r.get_u32("gxid")?;
    let gid = r.get_string(GID_MAXLEN, "gid")?;
    let node_list = r.get_string(NODESTRING_MAXLEN, "node_list")?;
    r.expect_end()?;

    let handle = ctx
        .registry
        .gxid_to_handle(gxid)
        .ok_or(GtmError::UnknownGxid(gxid))?;
    ctx.registry.start_prepared(handle, &gid, &node_list)?;
    Ok(None)
}

fn handle_bkup_commit(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxid = r.get_u32("gxid")?;
    r.expect_end()?;

    let handle = ctx
        .registry
        .gxid_to_handle(gxid)
        .unwrap_or(INVALID_TXN_HANDLE);
    ctx.registry.commit(handle, &[]);
    Ok(None)
}

fn handle_bkup_commit_prepared(
    ctx: &mut RequestContext,
    request: &Message,
) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxid = r.get_u32("gxid")?;
    let prepared_gxid = r.get_u32("prepared_gxid")?;
    r.expect_end()?;

    let handles = [
        ctx.registry
            .gxid_to_handle(gxid)
            .unwrap_or(INVALID_TXN_HANDLE),
        ctx.registry
            .gxid_to_handle(prepared_gxid)
            .unwrap_or(INVALID_TXN_HANDLE),
    ];
    ctx.registry.commit_multi(&handles, &[]);
    Ok(None)
}

fn handle_bkup_commit_multi(
    ctx: &mut RequestContext,
    request: &Message,
) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxids = read_gxid_batch(&mut r)?;
    r.expect_end()?;

    let handles: Vec<_> = gxids
        .iter()
        .map(|&g| ctx.registry.gxid_to_handle(g).unwrap_or(INVALID_TXN_HANDLE))
        .collect();
    ctx.registry.commit_multi(&handles, &[]);
    Ok(None)
}

fn handle_bkup_rollback(ctx: &mut RequestContext, request: &Message) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxid = r.get_u32("gxid")?;
    r.expect_end()?;

    let handle = ctx
        .registry
        .gxid_to_handle(gxid)
        .unwrap_or(INVALID_TXN_HANDLE);
    ctx.registry.rollback(handle);
    Ok(None)
}

fn handle_bkup_rollback_multi(
    ctx: &mut RequestContext,
    request: &Message,
) -> Result<Option<Message>> {
    let mut r = PayloadReader::new(&request.payload);
    let gxids = read_gxid_batch(&mut r)?;
    r.expect_end()?;

    let handles: Vec<_> = gxids
        .iter()
        .map(|&g| ctx.registry.gxid_to_handle(g).unwrap_or(INVALID_TXN_HANDLE))
        .collect();
    ctx.registry.rollback_multi(&handles);
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtmd_txn::{MemoryControlStore, NullSequenceManager, RegistryConfig};
    use std::sync::Arc;

    fn registry() -> TxnRegistry {
        let registry = TxnRegistry::new(
            RegistryConfig {
                max_transactions: 64,
                ..Default::default()
            },
            Arc::new(MemoryControlStore::new()),
            Arc::new(NullSequenceManager),
        );
        registry
            .set_next_xid(gtmd_core::FIRST_NORMAL_GLOBAL_XID)
            .unwrap();
        registry
    }

    fn send(registry: &TxnRegistry, opcode: u8, conn_id: i32, payload: Vec<u8>) -> Option<Message> {
        let mut standby = StandbyLink::detached();
        let mut ctx = RequestContext {
            registry,
            standby: &mut standby,
            client_id: 1,
            synchronous_backup: false,
        };
        dispatch(&mut ctx, &Message::new(opcode, conn_id, payload)).unwrap()
    }

    #[test]
    fn test_begin_getgxid_then_commit() {
        let registry = registry();

        let mut payload = Vec::new();
        put_u32(&mut payload, IsolationLevel::ReadCommitted.as_wire());
        put_bool(&mut payload, false);
        put_string(&mut payload, "s1");
        let resp = send(&registry, opcode::TXN_BEGIN_GETGXID, -1, payload).unwrap();
        assert_eq!(resp.opcode, opcode::TXN_BEGIN_GETGXID_RESULT);

        let mut r = PayloadReader::new(&resp.payload);
        let gxid = r.get_u32("gxid").unwrap();
        assert_eq!(gxid, 3);
        assert!(r.get_i64("timestamp").unwrap() > 0);

        let mut payload = Vec::new();
        put_u32(&mut payload, gxid);
        put_u32(&mut payload, 0);
        let resp = send(&registry, opcode::TXN_COMMIT, -1, payload).unwrap();
        assert_eq!(resp.opcode, opcode::TXN_COMMIT_RESULT);
        let mut r = PayloadReader::new(&resp.payload);
        assert_eq!(r.get_u32("gxid").unwrap(), gxid);
        assert_eq!(r.get_i32("status").unwrap(), TxnStatus::Ok.as_wire());
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn test_proxy_conn_id_echoed() {
        let registry = registry();

        let mut payload = Vec::new();
        put_u32(&mut payload, IsolationLevel::ReadCommitted.as_wire());
        put_bool(&mut payload, false);
        put_string(&mut payload, "");
        let resp = send(&registry, opcode::TXN_BEGIN, 42, payload).unwrap();
        assert_eq!(resp.conn_id, 42);
    }

    #[test]
    fn test_unknown_gxid_commit_reports_status_error() {
        let registry = registry();

        let mut payload = Vec::new();
        put_u32(&mut payload, 999);
        put_u32(&mut payload, 0);
        let resp = send(&registry, opcode::TXN_COMMIT, -1, payload).unwrap();
        let mut r = PayloadReader::new(&resp.payload);
        r.get_u32("gxid").unwrap();
        assert_eq!(r.get_i32("status").unwrap(), TxnStatus::Error.as_wire());
    }

    #[test]
    fn test_malformed_payload_is_fatal() {
        let registry = registry();
        let mut standby = StandbyLink::detached();
        let mut ctx = RequestContext {
            registry: &registry,
            standby: &mut standby,
            client_id: 1,
            synchronous_backup: false,
        };
        // COMMIT with a 2-byte payload is a protocol error.
        let result = dispatch(
            &mut ctx,
            &Message::new(opcode::TXN_COMMIT, -1, vec![1, 2]),
        );
        assert!(matches!(result, Err(GtmError::Protocol(_))));
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let registry = registry();
        let mut standby = StandbyLink::detached();
        let mut ctx = RequestContext {
            registry: &registry,
            standby: &mut standby,
            client_id: 1,
            synchronous_backup: false,
        };
        let result = dispatch(&mut ctx, &Message::new(0x03, -1, vec![]));
        assert!(matches!(result, Err(GtmError::InvalidOpcode(0x03))));
    }

    #[test]
    fn test_validation_error_keeps_connection() {
        let registry = registry();

        // Prepare for a GXID that does not exist: error response, not a
        // dropped connection.
        let mut payload = Vec::new();
        put_u32(&mut payload, 777);
        let resp = send(&registry, opcode::TXN_PREPARE, -1, payload).unwrap();
        assert_eq!(resp.opcode, opcode::ERROR);
        let text = String::from_utf8(resp.payload).unwrap();
        assert!(text.contains("777"));
    }

    #[test]
    fn test_gxid_list_refused_on_standby() {
        let registry = TxnRegistry::new(
            RegistryConfig {
                max_transactions: 16,
                standby: true,
                ..Default::default()
            },
            Arc::new(MemoryControlStore::new()),
            Arc::new(NullSequenceManager),
        );
        registry
            .set_next_xid(gtmd_core::FIRST_NORMAL_GLOBAL_XID)
            .unwrap();

        let resp = send(&registry, opcode::TXN_GXID_LIST, -1, vec![]).unwrap();
        assert_eq!(resp.opcode, opcode::ERROR);
    }

    #[test]
    fn test_bkup_ops_produce_no_response() {
        let registry = TxnRegistry::new(
            RegistryConfig {
                max_transactions: 16,
                standby: true,
                ..Default::default()
            },
            Arc::new(MemoryControlStore::new()),
            Arc::new(NullSequenceManager),
        );
        registry
            .set_next_xid(gtmd_core::FIRST_NORMAL_GLOBAL_XID)
            .unwrap();

        let mut payload = Vec::new();
        put_u32(&mut payload, 55);
        put_u32(&mut payload, IsolationLevel::ReadCommitted.as_wire());
        put_bool(&mut payload, false);
        put_string(&mut payload, "s1");
        put_u32(&mut payload, 9);
        put_i64(&mut payload, 0);
        let resp = send(&registry, opcode::BKUP_TXN_BEGIN_GETGXID, -1, payload);
        assert!(resp.is_none());
        assert!(registry.is_gxid_in_progress(55));
        assert_eq!(registry.read_next_xid(), 56);

        // The sync marker is the one backup opcode with an ack.
        let resp = send(&registry, opcode::BKUP_SYNC, -1, vec![]).unwrap();
        assert_eq!(resp.opcode, opcode::SYNC_RESULT);
    }

    #[test]
    fn test_report_xmin_roundtrip() {
        let registry = registry();

        let mut payload = Vec::new();
        put_u32(&mut payload, 10);
        put_u32(&mut payload, GtmNodeType::Datanode.as_wire());
        put_string(&mut payload, "dn1");
        let resp = send(&registry, opcode::REPORT_XMIN, -1, payload).unwrap();
        assert_eq!(resp.opcode, opcode::REPORT_XMIN_RESULT);

        let mut r = PayloadReader::new(&resp.payload);
        let latest = r.get_u32("latest").unwrap();
        let xmin = r.get_u32("xmin").unwrap();
        let errcode = r.get_i32("errcode").unwrap();
        assert_eq!(latest, registry.latest_completed_xid());
        assert_eq!(xmin, 10);
        assert_eq!(errcode, 0);
    }

    #[test]
    fn test_get_gid_data_flow() {
        let registry = registry();

        // begin + gxid
        let mut payload = Vec::new();
        put_u32(&mut payload, IsolationLevel::ReadCommitted.as_wire());
        put_bool(&mut payload, false);
        put_string(&mut payload, "");
        let resp = send(&registry, opcode::TXN_BEGIN_GETGXID, -1, payload).unwrap();
        let gxid = PayloadReader::new(&resp.payload).get_u32("gxid").unwrap();

        // start prepared + prepare
        let mut payload = Vec::new();
        put_u32(&mut payload, gxid);
        put_string(&mut payload, "tx1");
        put_string(&mut payload, "n1,n2");
        let resp = send(&registry, opcode::TXN_START_PREPARED, -1, payload).unwrap();
        assert_eq!(resp.opcode, opcode::TXN_START_PREPARED_RESULT);

        let mut payload = Vec::new();
        put_u32(&mut payload, gxid);
        send(&registry, opcode::TXN_PREPARE, -1, payload).unwrap();

        // get gid data allocates the auxiliary transaction
        let mut payload = Vec::new();
        put_u32(&mut payload, IsolationLevel::ReadCommitted.as_wire());
        put_bool(&mut payload, false);
        put_string(&mut payload, "tx1");
        let resp = send(&registry, opcode::TXN_GET_GID_DATA, -1, payload).unwrap();
        assert_eq!(resp.opcode, opcode::TXN_GET_GID_DATA_RESULT);
        let mut r = PayloadReader::new(&resp.payload);
        let new_gxid = r.get_u32("new_gxid").unwrap();
        let prepared_gxid = r.get_u32("prepared_gxid").unwrap();
        let nodes = r.get_string(NODESTRING_MAXLEN, "nodes").unwrap();
        assert_eq!(new_gxid, 4);
        assert_eq!(prepared_gxid, 3);
        assert_eq!(nodes, "n1,n2");

        // commit prepared pair
        let mut payload = Vec::new();
        put_u32(&mut payload, new_gxid);
        put_u32(&mut payload, prepared_gxid);
        put_u32(&mut payload, 0);
        let resp = send(&registry, opcode::TXN_COMMIT_PREPARED, -1, payload).unwrap();
        let mut r = PayloadReader::new(&resp.payload);
        r.get_u32("gxid").unwrap();
        assert_eq!(r.get_i32("status").unwrap(), TxnStatus::Ok.as_wire());
        assert_eq!(registry.open_count(), 0);
        assert_eq!(registry.latest_completed_xid(), 4);
    }
}
