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

//! GtmD Server
//!
//! The network face of the transaction manager:
//!
//! - [`proto`]: the framed wire protocol (opcode, proxy connection id,
//!   length-prefixed payload) and its payload codecs
//! - [`dispatch`]: one handler per opcode, each parsing arguments, acting
//!   on the registry, mirroring the mutation to the standby and encoding
//!   the response
//! - [`standby`]: the replication link to the warm standby, with bounded
//!   reconnect-retry and optional synchronous flush
//! - [`server`]: the TCP listener, one handler thread per client
//!   connection, client-id issuance and disconnect cleanup
//! - [`client`]: the matching protocol client, used by tests, tooling and
//!   proxies

pub mod client;
pub mod dispatch;
pub mod proto;
pub mod server;
pub mod standby;

pub use client::GtmClient;
pub use server::{GtmServer, ServerConfig};
pub use standby::StandbyLink;
