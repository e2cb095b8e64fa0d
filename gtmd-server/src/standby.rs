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

//! Standby Replication Link
//!
//! Each handler thread owns one link to the warm standby. After the
//! primary action of a mutating request succeeds, the handler mirrors an
//! equivalent backup frame here before the client response is written,
//! so an acknowledged mutation always has a counterpart on the standby.
//!
//! A failed send tears the connection down and retries on a fresh one, a
//! bounded number of times. Resending is idempotent: the standby either
//! already advanced to the mirrored GXID or will do so now. Backup frames
//! have no responses; the only read on this stream is the ack of a
//! synchronous flush.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::time::Duration;

use gtmd_core::{GtmError, Result};
use tracing::{debug, warn};

use crate::proto::{opcode, Message, NO_PROXY_CONN};

/// Reconnect attempts per mirrored frame before giving up.
pub const STANDBY_RETRY_LIMIT: u32 = 3;

/// Connect timeout for (re)establishing the standby channel.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Replication channel to the standby. `addr == None` means no standby
/// is attached and every mirror call is a no-op.
pub struct StandbyLink {
    addr: Option<String>,
    stream: Option<TcpStream>,
}

impl StandbyLink {
    pub fn new(addr: Option<String>) -> Self {
        Self { addr, stream: None }
    }

    /// No standby configured at all.
    pub fn detached() -> Self {
        Self::new(None)
    }

    pub fn is_attached(&self) -> bool {
        self.addr.is_some()
    }

    fn ensure_connected(&mut self) -> Result<&mut TcpStream> {
        let addr = self
            .addr
            .as_ref()
            .ok_or_else(|| GtmError::StandbyUnreachable("no standby configured".to_string()))?;

        if self.stream.is_none() {
            let sockaddr: std::net::SocketAddr = addr
                .parse()
                .map_err(|e| GtmError::StandbyUnreachable(format!("bad address {}: {}", addr, e)))?;
            let stream = TcpStream::connect_timeout(&sockaddr, CONNECT_TIMEOUT)
                .map_err(|e| GtmError::StandbyUnreachable(format!("connect {}: {}", addr, e)))?;
            stream.set_nodelay(true)?;
            debug!(standby = %addr, "standby connection established");
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("stream just set"))
    }

    /// Send one backup frame, reconnecting and resending on failure.
    pub fn mirror(&mut self, msg: &Message) -> Result<()> {
        if self.addr.is_none() {
            return Ok(());
        }

        let mut last_err = None;
        for attempt in 0..STANDBY_RETRY_LIMIT {
            match self.try_send(msg) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "standby send failed, reconnecting");
                    self.stream = None;
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            GtmError::StandbyUnreachable("standby retries exhausted".to_string())
        }))
    }

    fn try_send(&mut self, msg: &Message) -> Result<()> {
        let stream = self.ensure_connected()?;
        let mut writer = BufWriter::new(stream.try_clone()?);
        msg.write_to(&mut writer)
    }

    /// Synchronous flush: all previously mirrored frames are applied once
    /// the standby acknowledges the sync marker.
    pub fn sync(&mut self) -> Result<()> {
        if self.addr.is_none() {
            return Ok(());
        }

        self.mirror(&Message::new(opcode::BKUP_SYNC, NO_PROXY_CONN, Vec::new()))?;

        let stream = self.ensure_connected()?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let ack = Message::read_from(&mut reader).map_err(|e| {
            GtmError::StandbyUnreachable(format!("waiting for standby ack: {}", e))
        })?;

        if ack.opcode != opcode::SYNC_RESULT {
            return Err(GtmError::StandbyUnreachable(format!(
                "unexpected standby ack opcode {:#x}",
                ack.opcode
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for StandbyLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandbyLink")
            .field("addr", &self.addr)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}
