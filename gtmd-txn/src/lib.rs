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

//! GtmD Transaction Table and GXID Allocator
//!
//! This crate is the in-memory core of the transaction manager:
//!
//! - [`registry::TxnRegistry`] owns the fixed-capacity slot array, the
//!   open-set of in-flight transactions, the rotating allocation cursor
//!   and the GXID generator with its wraparound limits.
//! - [`slot`] holds the per-transaction record and its lifecycle.
//! - [`control`] persists the periodic GXID checkpoint so a restart never
//!   reissues ids.
//! - [`sequence`] is the capability handed into commit/abort cleanup to
//!   finalize or roll back sequence mutations.
//! - [`xmin`] tracks the xmins reported by cluster nodes and maintains the
//!   recent global xmin.
//!
//! ## Locking
//!
//! Three lock classes, always acquired in this order:
//!
//! 1. the ID-gen lock (GXID counter and limits)
//! 2. the table lock (slot allocation, open-set membership, indexes)
//! 3. the per-slot lock (mutable fields of one record)
//!
//! The control-file write runs with no registry lock held.

pub mod control;
pub mod registry;
pub mod slot;
pub mod sequence;
pub mod xmin;

pub use control::{ControlStore, FileControlStore, MemoryControlStore};
pub use registry::{BeginRequest, RegistryConfig, TxnRegistry};
pub use sequence::{NullSequenceManager, RecordingSequenceManager, SeqRef, SequenceManager};
