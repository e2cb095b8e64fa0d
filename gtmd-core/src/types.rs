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

//! Scalar types shared by the transaction registry and the wire protocol.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::GtmError;

/// Transaction handle: index into the global slot array.
///
/// Handles are the cheap identifier; GXID, GID and session id lookups all
/// resolve to a handle first.
pub type TxnHandle = i32;

/// Sentinel for "no transaction".
pub const INVALID_TXN_HANDLE: TxnHandle = -1;

/// Proxy connection id carried by proxy-framed requests. `-1` = no proxy.
pub type ProxyConnId = i32;

/// Wall-clock timestamp in microseconds since the UNIX epoch.
pub type Timestamp = i64;

/// Current wall-clock timestamp handed to clients on begin.
#[inline]
pub fn current_timestamp() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Isolation level requested by the client for a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Read committed - see all committed data
    #[default]
    ReadCommitted,
    /// Repeatable read - consistent point-in-time view
    RepeatableRead,
    /// Serializable - strongest isolation
    Serializable,
}

impl IsolationLevel {
    /// Wire encoding of the isolation level.
    pub fn as_wire(&self) -> u32 {
        match self {
            IsolationLevel::ReadCommitted => 0,
            IsolationLevel::RepeatableRead => 1,
            IsolationLevel::Serializable => 2,
        }
    }
}

impl TryFrom<u32> for IsolationLevel {
    type Error = GtmError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(IsolationLevel::ReadCommitted),
            1 => Ok(IsolationLevel::RepeatableRead),
            2 => Ok(IsolationLevel::Serializable),
            other => Err(GtmError::Protocol(format!(
                "invalid isolation level: {}",
                other
            ))),
        }
    }
}

/// Lifecycle state of a transaction slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    /// Slot allocated, no GXID yet
    Starting,
    /// GXID assigned, transaction running
    InProgress,
    /// START_PREPARED received, GID bound
    PrepareInProgress,
    /// PREPARE completed, immune to client cleanup
    Prepared,
    /// Commit decided, slot queued for removal
    CommitInProgress,
    /// Abort decided, slot queued for removal
    AbortInProgress,
    /// Terminal state of a cleaned slot
    Aborted,
}

/// Per-transaction outcome of a (batched) commit or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Operation applied, slot removed
    Ok,
    /// Invalid handle / unknown GXID
    Error,
    /// Commit blocked by an in-progress waited transaction; retry later
    Delayed,
}

impl TxnStatus {
    /// Wire encoding: `0` ok, `-1` error, `1` delayed.
    pub fn as_wire(&self) -> i32 {
        match self {
            TxnStatus::Ok => 0,
            TxnStatus::Error => -1,
            TxnStatus::Delayed => 1,
        }
    }

    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(TxnStatus::Ok),
            -1 => Some(TxnStatus::Error),
            1 => Some(TxnStatus::Delayed),
            _ => None,
        }
    }
}

/// Process-wide state of the transaction manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GtmState {
    /// Waiting for the control file restore
    Starting,
    /// Issuing GXIDs
    Running,
    /// No further GXIDs; the control checkpoint is final
    ShuttingDown,
}

/// Kind of cluster node reporting an xmin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GtmNodeType {
    Coordinator,
    Datanode,
}

impl GtmNodeType {
    pub fn as_wire(&self) -> u32 {
        match self {
            GtmNodeType::Coordinator => 1,
            GtmNodeType::Datanode => 2,
        }
    }
}

impl TryFrom<u32> for GtmNodeType {
    type Error = GtmError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(GtmNodeType::Coordinator),
            2 => Ok(GtmNodeType::Datanode),
            other => Err(GtmError::Protocol(format!("invalid node type: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_wire_roundtrip() {
        for level in [
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
        ] {
            assert_eq!(IsolationLevel::try_from(level.as_wire()).unwrap(), level);
        }
        assert!(IsolationLevel::try_from(9).is_err());
    }

    #[test]
    fn test_txn_status_wire_values() {
        assert_eq!(TxnStatus::Ok.as_wire(), 0);
        assert_eq!(TxnStatus::Error.as_wire(), -1);
        assert_eq!(TxnStatus::Delayed.as_wire(), 1);
        assert_eq!(TxnStatus::from_wire(1), Some(TxnStatus::Delayed));
        assert_eq!(TxnStatus::from_wire(5), None);
    }

    #[test]
    fn test_timestamp_advances() {
        let a = current_timestamp();
        let b = current_timestamp();
        assert!(b >= a);
        assert!(a > 0);
    }
}
