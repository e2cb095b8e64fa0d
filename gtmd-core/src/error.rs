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

//! Error types for GtmD

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GtmError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("Invalid transaction handle: {0}")]
    InvalidHandle(i32),

    #[error("No transaction for gxid {0}")]
    UnknownGxid(u32),

    #[error("No prepared transaction for gid '{0}'")]
    UnknownGid(String),

    #[error("GID '{0}' already in use by an open transaction")]
    DuplicateGid(String),

    #[error("Max global transactions limit reached ({0})")]
    Capacity(usize),

    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    #[error("Not accepting commands to avoid wraparound data loss")]
    WraparoundStop,

    #[error("Running in standby mode -- cannot issue new transaction ids")]
    StandbyMode,

    #[error("Shutting down -- cannot issue new transaction ids")]
    ShuttingDown,

    #[error("Standby communication error: {0}")]
    StandbyUnreachable(String),

    #[error("Server reported error: {0}")]
    Remote(String),

    #[error("Control file error: {0}")]
    ControlFile(String),
}

pub type Result<T> = std::result::Result<T, GtmError>;
