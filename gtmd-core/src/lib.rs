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

//! GtmD Core Types
//!
//! Shared vocabulary for the GtmD cluster transaction manager:
//!
//! - GXID arithmetic: modular comparison and advancement of the 32-bit
//!   global transaction id space ([`xid`])
//! - Scalar types used across the registry and the wire protocol
//!   ([`types`]): isolation levels, transaction states, statuses, handles
//! - The workspace error enum ([`error`])
//!
//! Everything heavier (the transaction table, the server) lives in
//! `gtmd-txn` and `gtmd-server`.

pub mod error;
pub mod types;
pub mod xid;

pub use error::{GtmError, Result};
pub use types::{
    current_timestamp, GtmNodeType, GtmState, IsolationLevel, ProxyConnId, Timestamp, TxnHandle,
    TxnState, TxnStatus, INVALID_TXN_HANDLE,
};
pub use xid::{
    client_id_equals, client_id_follows, GlobalXid, BOOTSTRAP_GLOBAL_XID,
    FIRST_NORMAL_GLOBAL_XID, FROZEN_GLOBAL_XID, INVALID_GLOBAL_XID,
};
