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

//! Protocol Client
//!
//! Typed access to a running GtmD node, one request/response per call.
//! Proxies set a connection id with [`GtmClient::set_conn_id`]; ordinary
//! clients leave it at `-1`.

use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use gtmd_core::{
    GlobalXid, GtmError, IsolationLevel, Result, Timestamp, TxnHandle, TxnStatus,
};

use crate::proto::{
    opcode, put_bool, put_i32, put_string, put_u32, Message, PayloadReader, NO_PROXY_CONN,
};

/// Client connection to a GtmD node.
pub struct GtmClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    conn_id: i32,
}

impl GtmClient {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
            conn_id: NO_PROXY_CONN,
        })
    }

    pub fn connect_with_timeout<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<Self> {
        let client = Self::connect(addr)?;
        client.reader.get_ref().set_read_timeout(Some(timeout))?;
        Ok(client)
    }

    /// Stamp subsequent requests with a proxy connection id.
    pub fn set_conn_id(&mut self, conn_id: i32) {
        self.conn_id = conn_id;
    }

    /// Send one request and read its response frame.
    pub fn request(&mut self, opcode: u8, payload: Vec<u8>) -> Result<Message> {
        Message::new(opcode, self.conn_id, payload).write_to(&mut self.writer)?;
        Message::read_from(&mut self.reader)
    }

    fn expect(&mut self, op: u8, payload: Vec<u8>) -> Result<Message> {
        let resp = self.request(op, payload)?;
        if resp.opcode == opcode::ERROR {
            return Err(GtmError::Remote(
                String::from_utf8_lossy(&resp.payload).to_string(),
            ));
        }
        if resp.opcode != Message::result_opcode(op) {
            return Err(GtmError::Protocol(format!(
                "unexpected response opcode {:#x} for request {:#x}",
                resp.opcode, op
            )));
        }
        Ok(resp)
    }

    /// Start a transaction; returns the handle and the GTM timestamp.
    pub fn begin(
        &mut self,
        isolation: IsolationLevel,
        read_only: bool,
        session_id: &str,
    ) -> Result<(TxnHandle, Timestamp)> {
        let mut payload = Vec::new();
        put_u32(&mut payload, isolation.as_wire());
        put_bool(&mut payload, read_only);
        put_string(&mut payload, session_id);
        let resp = self.expect(opcode::TXN_BEGIN, payload)?;

        let mut r = PayloadReader::new(&resp.payload);
        let handle = r.get_i32("handle")?;
        let timestamp = r.get_i64("timestamp")?;
        Ok((handle, timestamp))
    }

    /// Start a transaction and allocate its GXID in one round trip.
    pub fn begin_get_gxid(
        &mut self,
        isolation: IsolationLevel,
        read_only: bool,
        session_id: &str,
    ) -> Result<(GlobalXid, Timestamp)> {
        let mut payload = Vec::new();
        put_u32(&mut payload, isolation.as_wire());
        put_bool(&mut payload, read_only);
        put_string(&mut payload, session_id);
        let resp = self.expect(opcode::TXN_BEGIN_GETGXID, payload)?;

        let mut r = PayloadReader::new(&resp.payload);
        let gxid = r.get_u32("gxid")?;
        let timestamp = r.get_i64("timestamp")?;
        Ok((gxid, timestamp))
    }

    /// Start an autovacuum transaction.
    pub fn begin_get_gxid_autovacuum(
        &mut self,
        isolation: IsolationLevel,
        read_only: bool,
    ) -> Result<GlobalXid> {
        let mut payload = Vec::new();
        put_u32(&mut payload, isolation.as_wire());
        put_bool(&mut payload, read_only);
        let resp = self.expect(opcode::TXN_BEGIN_GETGXID_AUTOVACUUM, payload)?;
        PayloadReader::new(&resp.payload).get_u32("gxid")
    }

    /// Batched begin; one entry per backend behind a proxy.
    pub fn begin_get_gxid_multi(
        &mut self,
        entries: &[(IsolationLevel, bool, String, i32)],
    ) -> Result<(Vec<GlobalXid>, Timestamp)> {
        let mut payload = Vec::new();
        put_u32(&mut payload, entries.len() as u32);
        for (isolation, read_only, session_id, conn_id) in entries {
            put_u32(&mut payload, isolation.as_wire());
            put_bool(&mut payload, *read_only);
            put_string(&mut payload, session_id);
            put_i32(&mut payload, *conn_id);
        }
        let resp = self.expect(opcode::TXN_BEGIN_GETGXID_MULTI, payload)?;

        let mut r = PayloadReader::new(&resp.payload);
        let count = r.get_u32("txn_count")? as usize;
        let mut gxids = Vec::with_capacity(count);
        for _ in 0..count {
            gxids.push(r.get_u32("gxid")?);
        }
        let timestamp = r.get_i64("timestamp")?;
        Ok((gxids, timestamp))
    }

    /// Bind a GID and node list to a running transaction.
    pub fn start_prepared(
        &mut self,
        gxid: GlobalXid,
        gid: &str,
        node_list: &str,
    ) -> Result<GlobalXid> {
        let mut payload = Vec::new();
        put_u32(&mut payload, gxid);
        put_string(&mut payload, gid);
        put_string(&mut payload, node_list);
        let resp = self.expect(opcode::TXN_START_PREPARED, payload)?;
        PayloadReader::new(&resp.payload).get_u32("gxid")
    }

    /// Finish the prepare phase.
    pub fn prepare(&mut self, gxid: GlobalXid) -> Result<GlobalXid> {
        let mut payload = Vec::new();
        put_u32(&mut payload, gxid);
        let resp = self.expect(opcode::TXN_PREPARE, payload)?;
        PayloadReader::new(&resp.payload).get_u32("gxid")
    }

    /// Commit, optionally waiting on other transactions to finish first.
    pub fn commit(&mut self, gxid: GlobalXid, waited_xids: &[GlobalXid]) -> Result<TxnStatus> {
        let mut payload = Vec::new();
        put_u32(&mut payload, gxid);
        put_u32(&mut payload, waited_xids.len() as u32);
        for &w in waited_xids {
            put_u32(&mut payload, w);
        }
        let resp = self.expect(opcode::TXN_COMMIT, payload)?;

        let mut r = PayloadReader::new(&resp.payload);
        r.get_u32("gxid")?;
        let status = r.get_i32("status")?;
        TxnStatus::from_wire(status)
            .ok_or_else(|| GtmError::Protocol(format!("invalid status {}", status)))
    }

    /// Commit a prepared pair: the auxiliary GXID and the prepared GXID.
    pub fn commit_prepared(
        &mut self,
        gxid: GlobalXid,
        prepared_gxid: GlobalXid,
        waited_xids: &[GlobalXid],
    ) -> Result<TxnStatus> {
        let mut payload = Vec::new();
        put_u32(&mut payload, gxid);
        put_u32(&mut payload, prepared_gxid);
        put_u32(&mut payload, waited_xids.len() as u32);
        for &w in waited_xids {
            put_u32(&mut payload, w);
        }
        let resp = self.expect(opcode::TXN_COMMIT_PREPARED, payload)?;

        let mut r = PayloadReader::new(&resp.payload);
        r.get_u32("gxid")?;
        let status = r.get_i32("status")?;
        TxnStatus::from_wire(status)
            .ok_or_else(|| GtmError::Protocol(format!("invalid status {}", status)))
    }

    /// Commit a batch of GXIDs; returns one status per entry.
    pub fn commit_multi(&mut self, gxids: &[GlobalXid]) -> Result<Vec<TxnStatus>> {
        let mut payload = Vec::new();
        put_u32(&mut payload, gxids.len() as u32);
        for &g in gxids {
            put_u32(&mut payload, g);
        }
        let resp = self.expect(opcode::TXN_COMMIT_MULTI, payload)?;
        Self::read_statuses(&resp)
    }

    /// Roll back one transaction.
    pub fn rollback(&mut self, gxid: GlobalXid) -> Result<TxnStatus> {
        let mut payload = Vec::new();
        put_u32(&mut payload, gxid);
        let resp = self.expect(opcode::TXN_ROLLBACK, payload)?;

        let mut r = PayloadReader::new(&resp.payload);
        r.get_u32("gxid")?;
        let status = r.get_i32("status")?;
        TxnStatus::from_wire(status)
            .ok_or_else(|| GtmError::Protocol(format!("invalid status {}", status)))
    }

    /// Roll back a batch of GXIDs.
    pub fn rollback_multi(&mut self, gxids: &[GlobalXid]) -> Result<Vec<TxnStatus>> {
        let mut payload = Vec::new();
        put_u32(&mut payload, gxids.len() as u32);
        for &g in gxids {
            put_u32(&mut payload, g);
        }
        let resp = self.expect(opcode::TXN_ROLLBACK_MULTI, payload)?;
        Self::read_statuses(&resp)
    }

    /// Resolve a GID before COMMIT/ROLLBACK PREPARED: a fresh GXID for
    /// the operation, the prepared GXID and the involved node list.
    pub fn get_gid_data(
        &mut self,
        isolation: IsolationLevel,
        read_only: bool,
        gid: &str,
    ) -> Result<(GlobalXid, GlobalXid, String)> {
        let mut payload = Vec::new();
        put_u32(&mut payload, isolation.as_wire());
        put_bool(&mut payload, read_only);
        put_string(&mut payload, gid);
        let resp = self.expect(opcode::TXN_GET_GID_DATA, payload)?;

        let mut r = PayloadReader::new(&resp.payload);
        let new_gxid = r.get_u32("new_gxid")?;
        let prepared_gxid = r.get_u32("prepared_gxid")?;
        let node_list = r.get_string(crate::proto::MAX_FRAME_SIZE, "node_list")?;
        Ok((new_gxid, prepared_gxid, node_list))
    }

    /// Allocate (or fetch) the GXID of an existing handle.
    pub fn get_gxid(&mut self, handle: TxnHandle) -> Result<(TxnHandle, GlobalXid)> {
        let mut payload = Vec::new();
        put_i32(&mut payload, handle);
        let resp = self.expect(opcode::TXN_GET_GXID, payload)?;

        let mut r = PayloadReader::new(&resp.payload);
        let handle = r.get_i32("handle")?;
        let gxid = r.get_u32("gxid")?;
        Ok((handle, gxid))
    }

    /// Peek at the next GXID without allocating it.
    pub fn get_next_gxid(&mut self) -> Result<GlobalXid> {
        let resp = self.expect(opcode::TXN_GET_NEXT_GXID, Vec::new())?;
        PayloadReader::new(&resp.payload).get_u32("next_gxid")
    }

    /// Serialized registry snapshot (JSON).
    pub fn gxid_list(&mut self) -> Result<String> {
        let resp = self.expect(opcode::TXN_GXID_LIST, Vec::new())?;
        let mut r = PayloadReader::new(&resp.payload);
        r.get_string(crate::proto::MAX_FRAME_SIZE, "registry")
    }

    /// Report this node's xmin; returns
    /// `(latest_completed_xid, global_xmin, errcode)`.
    pub fn report_xmin(
        &mut self,
        gxid: GlobalXid,
        node_type: gtmd_core::GtmNodeType,
        node_name: &str,
    ) -> Result<(GlobalXid, GlobalXid, i32)> {
        let mut payload = Vec::new();
        put_u32(&mut payload, gxid);
        put_u32(&mut payload, node_type.as_wire());
        put_string(&mut payload, node_name);
        let resp = self.expect(opcode::REPORT_XMIN, payload)?;

        let mut r = PayloadReader::new(&resp.payload);
        let latest = r.get_u32("latest_completed_xid")?;
        let xmin = r.get_u32("global_xmin")?;
        let errcode = r.get_i32("errcode")?;
        Ok((latest, xmin, errcode))
    }

    fn read_statuses(resp: &Message) -> Result<Vec<TxnStatus>> {
        let mut r = PayloadReader::new(&resp.payload);
        let count = r.get_u32("txn_count")? as usize;
        let mut statuses = Vec::with_capacity(count);
        for _ in 0..count {
            let status = r.get_i32("status")?;
            statuses.push(TxnStatus::from_wire(status).ok_or_else(|| {
                GtmError::Protocol(format!("invalid status {}", status))
            })?);
        }
        Ok(statuses)
    }
}
