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

//! GXID Arithmetic
//!
//! The global transaction id (GXID) is a 32-bit sequence id that wraps.
//! Ordering is therefore modular: `a` precedes `b` iff the signed 32-bit
//! difference `a - b` is negative. Three low values never participate in
//! the modular ordering and are skipped when the counter advances:
//!
//! | Value | Meaning |
//! |-------|------------------------------|
//! | 0     | invalid (no GXID assigned)   |
//! | 1     | bootstrap                    |
//! | 2     | frozen (permanently visible) |
//!
//! The first id handed to a real transaction is `3`.
//!
//! Client identifiers issued to connections are also 32-bit counters that
//! wrap, so they get the same modular comparison treatment.

/// Global transaction id. 32-bit, wrapping, values 0-2 reserved.
pub type GlobalXid = u32;

/// No GXID assigned.
pub const INVALID_GLOBAL_XID: GlobalXid = 0;

/// Bootstrap transaction id.
pub const BOOTSTRAP_GLOBAL_XID: GlobalXid = 1;

/// Frozen transaction id, treated as older than every normal id.
pub const FROZEN_GLOBAL_XID: GlobalXid = 2;

/// First id assigned to a normal transaction.
pub const FIRST_NORMAL_GLOBAL_XID: GlobalXid = 3;

/// Is this GXID assigned at all?
#[inline]
pub fn is_valid(xid: GlobalXid) -> bool {
    xid != INVALID_GLOBAL_XID
}

/// Is this GXID a normal (non-reserved) id?
#[inline]
pub fn is_normal(xid: GlobalXid) -> bool {
    xid >= FIRST_NORMAL_GLOBAL_XID
}

/// Does `a` logically precede `b`?
///
/// Reserved ids sort with plain unsigned comparison; two normal ids
/// compare by the sign of their 32-bit difference, so ordering survives
/// wraparound as long as no transaction stays open for more than 2^31
/// allocations.
#[inline]
pub fn precedes(a: GlobalXid, b: GlobalXid) -> bool {
    if !is_normal(a) || !is_normal(b) {
        return a < b;
    }
    (a.wrapping_sub(b) as i32) < 0
}

/// Does `a` precede or equal `b` in modular order?
#[inline]
pub fn precedes_or_equals(a: GlobalXid, b: GlobalXid) -> bool {
    if !is_normal(a) || !is_normal(b) {
        return a <= b;
    }
    (a.wrapping_sub(b) as i32) <= 0
}

/// Does `a` logically follow `b`?
#[inline]
pub fn follows(a: GlobalXid, b: GlobalXid) -> bool {
    precedes(b, a)
}

/// Does `a` follow or equal `b` in modular order?
#[inline]
pub fn follows_or_equals(a: GlobalXid, b: GlobalXid) -> bool {
    precedes_or_equals(b, a)
}

/// Advance a GXID to its successor, skipping the reserved values on wrap.
#[inline]
pub fn advance(xid: &mut GlobalXid) {
    *xid = xid.wrapping_add(1);
    if *xid < FIRST_NORMAL_GLOBAL_XID {
        *xid = FIRST_NORMAL_GLOBAL_XID;
    }
}

/// Modular "greater than" for wrapped client identifiers.
#[inline]
pub fn client_id_follows(a: u32, b: u32) -> bool {
    a != b && (a.wrapping_sub(b) as i32) > 0
}

/// Equality for client identifiers (plain, spelled out for symmetry).
#[inline]
pub fn client_id_equals(a: u32, b: u32) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_values() {
        assert!(!is_valid(INVALID_GLOBAL_XID));
        assert!(is_valid(BOOTSTRAP_GLOBAL_XID));
        assert!(!is_normal(FROZEN_GLOBAL_XID));
        assert!(is_normal(FIRST_NORMAL_GLOBAL_XID));
    }

    #[test]
    fn test_precedes_simple() {
        assert!(precedes(3, 4));
        assert!(!precedes(4, 3));
        assert!(!precedes(4, 4));
        assert!(precedes_or_equals(4, 4));
        assert!(follows(10, 3));
        assert!(follows_or_equals(10, 10));
    }

    #[test]
    fn test_precedes_across_wraparound() {
        // Near the top of the id space, freshly wrapped ids must compare
        // as newer than ids just below u32::MAX.
        let old = u32::MAX - 5;
        let new = FIRST_NORMAL_GLOBAL_XID + 5;
        assert!(precedes(old, new));
        assert!(follows(new, old));
    }

    #[test]
    fn test_reserved_compare_plain() {
        // Frozen is older than everything normal, even wrapped ids.
        assert!(precedes(FROZEN_GLOBAL_XID, u32::MAX));
        assert!(precedes(FROZEN_GLOBAL_XID, FIRST_NORMAL_GLOBAL_XID));
        assert!(precedes(INVALID_GLOBAL_XID, BOOTSTRAP_GLOBAL_XID));
    }

    #[test]
    fn test_advance_skips_reserved() {
        let mut xid = u32::MAX;
        advance(&mut xid);
        assert_eq!(xid, FIRST_NORMAL_GLOBAL_XID);

        let mut xid = 41;
        advance(&mut xid);
        assert_eq!(xid, 42);
    }

    #[test]
    fn test_client_id_modular() {
        assert!(client_id_follows(2, 1));
        assert!(!client_id_follows(1, 2));
        assert!(!client_id_follows(7, 7));
        // Wrapped client id counts as newer.
        assert!(client_id_follows(1, u32::MAX));
    }
}
