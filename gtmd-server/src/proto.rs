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

//! Wire Protocol
//!
//! Every message on the wire, in either direction, is one frame:
//!
//! ```text
//! ┌──────────────┬───────────────────┬────────────────┬─────────────┐
//! │ OpCode (1 B) │ ConnId (4 B, LE)  │ Length (4 B,LE)│ Payload (N) │
//! └──────────────┴───────────────────┴────────────────┴─────────────┘
//! ```
//!
//! `ConnId` is the proxy connection id: proxies stamp the id of the
//! backend they multiplex, and every response echoes the id of the
//! request it answers. `-1` means the peer is not a proxy.
//!
//! Payload scalars are little-endian; strings are a `u32` length
//! followed by UTF-8 bytes. Responses reuse the request opcode with the
//! high bit set; `0x80` alone is the generic error response whose
//! payload is the error text.

use std::io::{Read, Write};

use gtmd_core::{GtmError, Result};

/// Largest accepted frame (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Conn id of a peer that is not a proxy.
pub const NO_PROXY_CONN: i32 = -1;

/// Request and response opcodes.
pub mod opcode {
    // Client -> server.
    pub const TXN_BEGIN: u8 = 0x10;
    pub const TXN_BEGIN_GETGXID: u8 = 0x11;
    pub const TXN_BEGIN_GETGXID_AUTOVACUUM: u8 = 0x12;
    pub const TXN_BEGIN_GETGXID_MULTI: u8 = 0x13;
    pub const TXN_PREPARE: u8 = 0x14;
    pub const TXN_START_PREPARED: u8 = 0x15;
    pub const TXN_COMMIT: u8 = 0x16;
    pub const TXN_COMMIT_PREPARED: u8 = 0x17;
    pub const TXN_COMMIT_MULTI: u8 = 0x18;
    pub const TXN_ROLLBACK: u8 = 0x19;
    pub const TXN_ROLLBACK_MULTI: u8 = 0x1A;
    pub const TXN_GET_GID_DATA: u8 = 0x1B;
    pub const TXN_GET_GXID: u8 = 0x1C;
    pub const TXN_GET_NEXT_GXID: u8 = 0x1D;
    pub const TXN_GXID_LIST: u8 = 0x1E;
    pub const REPORT_XMIN: u8 = 0x1F;

    // Master -> standby twins of the mutating opcodes. Applied without a
    // response and never forwarded further.
    pub const BKUP_TXN_BEGIN: u8 = 0x50;
    pub const BKUP_TXN_BEGIN_GETGXID: u8 = 0x51;
    pub const BKUP_TXN_BEGIN_GETGXID_AUTOVACUUM: u8 = 0x52;
    pub const BKUP_TXN_BEGIN_GETGXID_MULTI: u8 = 0x53;
    pub const BKUP_TXN_PREPARE: u8 = 0x54;
    pub const BKUP_TXN_START_PREPARED: u8 = 0x55;
    pub const BKUP_TXN_COMMIT: u8 = 0x56;
    pub const BKUP_TXN_COMMIT_PREPARED: u8 = 0x57;
    pub const BKUP_TXN_COMMIT_MULTI: u8 = 0x58;
    pub const BKUP_TXN_ROLLBACK: u8 = 0x59;
    pub const BKUP_TXN_ROLLBACK_MULTI: u8 = 0x5A;
    /// Synchronous flush marker; the only backup opcode with an ack.
    pub const BKUP_SYNC: u8 = 0x5F;

    // Server -> client.
    pub const ERROR: u8 = 0x80;
    pub const TXN_BEGIN_RESULT: u8 = 0x90;
    pub const TXN_BEGIN_GETGXID_RESULT: u8 = 0x91;
    pub const TXN_BEGIN_GETGXID_AUTOVACUUM_RESULT: u8 = 0x92;
    pub const TXN_BEGIN_GETGXID_MULTI_RESULT: u8 = 0x93;
    pub const TXN_PREPARE_RESULT: u8 = 0x94;
    pub const TXN_START_PREPARED_RESULT: u8 = 0x95;
    pub const TXN_COMMIT_RESULT: u8 = 0x96;
    pub const TXN_COMMIT_PREPARED_RESULT: u8 = 0x97;
    pub const TXN_COMMIT_MULTI_RESULT: u8 = 0x98;
    pub const TXN_ROLLBACK_RESULT: u8 = 0x99;
    pub const TXN_ROLLBACK_MULTI_RESULT: u8 = 0x9A;
    pub const TXN_GET_GID_DATA_RESULT: u8 = 0x9B;
    pub const TXN_GET_GXID_RESULT: u8 = 0x9C;
    pub const TXN_GET_NEXT_GXID_RESULT: u8 = 0x9D;
    pub const TXN_GXID_LIST_RESULT: u8 = 0x9E;
    pub const REPORT_XMIN_RESULT: u8 = 0x9F;
    pub const SYNC_RESULT: u8 = 0xDF;
}

/// One frame on the wire.
#[derive(Debug, Clone)]
pub struct Message {
    pub opcode: u8,
    /// Proxy connection id; echoed from request to response.
    pub conn_id: i32,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(opcode: u8, conn_id: i32, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            conn_id,
            payload,
        }
    }

    /// Generic error response carrying the error text.
    pub fn error(conn_id: i32, msg: &str) -> Self {
        Self::new(opcode::ERROR, conn_id, msg.as_bytes().to_vec())
    }

    /// Response opcode paired with a request opcode.
    #[inline]
    pub fn result_opcode(request: u8) -> u8 {
        request | 0x80
    }

    /// Read one frame. A clean EOF before the first byte maps to
    /// `ConnectionClosed`; a torn frame is an I/O error.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut opcode_buf = [0u8; 1];
        match reader.read_exact(&mut opcode_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(GtmError::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        }
        let opcode = opcode_buf[0];

        let mut conn_buf = [0u8; 4];
        reader.read_exact(&mut conn_buf)?;
        let conn_id = i32::from_le_bytes(conn_buf);

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(GtmError::FrameTooLarge(len, MAX_FRAME_SIZE));
        }

        let mut payload = vec![0u8; len];
        if len > 0 {
            reader.read_exact(&mut payload)?;
        }

        Ok(Self {
            opcode,
            conn_id,
            payload,
        })
    }

    /// Write one frame and flush.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[self.opcode])?;
        writer.write_all(&self.conn_id.to_le_bytes())?;
        writer.write_all(&(self.payload.len() as u32).to_le_bytes())?;
        if !self.payload.is_empty() {
            writer.write_all(&self.payload)?;
        }
        writer.flush()?;
        Ok(())
    }
}

// ============================================================================
// Payload codecs
// ============================================================================

/// Bounds-checked cursor over a request payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.offset + n > self.buf.len() {
            return Err(GtmError::Protocol(format!(
                "payload truncated at {}: need {} bytes at offset {}, have {}",
                what,
                n,
                self.offset,
                self.buf.len()
            )));
        }
        let out = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(out)
    }

    pub fn get_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub fn get_bool(&mut self, what: &str) -> Result<bool> {
        Ok(self.get_u8(what)? != 0)
    }

    pub fn get_u32(&mut self, what: &str) -> Result<u32> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    pub fn get_i32(&mut self, what: &str) -> Result<i32> {
        let bytes = self.take(4, what)?;
        Ok(i32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    pub fn get_i64(&mut self, what: &str) -> Result<i64> {
        let bytes = self.take(8, what)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    /// Length-prefixed UTF-8 string, bounded by `max` bytes.
    pub fn get_string(&mut self, max: usize, what: &str) -> Result<String> {
        let len = self.get_u32(what)? as usize;
        if len > max {
            return Err(GtmError::Protocol(format!(
                "{} too long: {} bytes (max: {})",
                what, len, max
            )));
        }
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| GtmError::Protocol(format!("invalid UTF-8 in {}", what)))
    }

    /// Fail if trailing bytes remain after the last expected field.
    pub fn expect_end(&self) -> Result<()> {
        if self.offset != self.buf.len() {
            return Err(GtmError::Protocol(format!(
                "{} trailing bytes after payload",
                self.buf.len() - self.offset
            )));
        }
        Ok(())
    }
}

#[inline]
pub fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

#[inline]
pub fn put_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(v as u8);
}

#[inline]
pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let original = Message::new(opcode::TXN_BEGIN, 7, b"hello".to_vec());

        let mut buffer = Vec::new();
        original.write_to(&mut buffer).unwrap();

        let mut cursor = std::io::Cursor::new(buffer);
        let decoded = Message::read_from(&mut cursor).unwrap();

        assert_eq!(decoded.opcode, original.opcode);
        assert_eq!(decoded.conn_id, 7);
        assert_eq!(decoded.payload, original.payload);
    }

    #[test]
    fn test_eof_maps_to_connection_closed() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(matches!(
            Message::read_from(&mut cursor),
            Err(GtmError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buffer = Vec::new();
        buffer.push(opcode::TXN_BEGIN);
        buffer.extend_from_slice(&(-1i32).to_le_bytes());
        buffer.extend_from_slice(&(u32::MAX).to_le_bytes());

        let mut cursor = std::io::Cursor::new(buffer);
        assert!(matches!(
            Message::read_from(&mut cursor),
            Err(GtmError::FrameTooLarge(_, _))
        ));
    }

    #[test]
    fn test_result_opcode_pairing() {
        assert_eq!(
            Message::result_opcode(opcode::TXN_COMMIT),
            opcode::TXN_COMMIT_RESULT
        );
        assert_eq!(
            Message::result_opcode(opcode::REPORT_XMIN),
            opcode::REPORT_XMIN_RESULT
        );
        assert_eq!(Message::result_opcode(opcode::BKUP_SYNC), opcode::SYNC_RESULT);
    }

    #[test]
    fn test_payload_scalars_roundtrip() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 42);
        put_bool(&mut buf, true);
        put_i32(&mut buf, -7);
        put_i64(&mut buf, 1_000_000_007);
        put_string(&mut buf, "session-1");

        let mut r = PayloadReader::new(&buf);
        assert_eq!(r.get_u32("a").unwrap(), 42);
        assert!(r.get_bool("b").unwrap());
        assert_eq!(r.get_i32("c").unwrap(), -7);
        assert_eq!(r.get_i64("d").unwrap(), 1_000_000_007);
        assert_eq!(r.get_string(64, "e").unwrap(), "session-1");
        r.expect_end().unwrap();
    }

    #[test]
    fn test_truncated_payload_errors() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 1000);
        let mut r = PayloadReader::new(&buf);
        // Claims a 1000-byte string but the buffer ends here.
        assert!(matches!(
            r.get_string(2000, "gid"),
            Err(GtmError::Protocol(_))
        ));
    }

    #[test]
    fn test_string_over_limit_rejected() {
        let mut buf = Vec::new();
        put_string(&mut buf, "way-too-long");
        let mut r = PayloadReader::new(&buf);
        assert!(matches!(r.get_string(4, "gid"), Err(GtmError::Protocol(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 1);
        put_u32(&mut buf, 2);
        let mut r = PayloadReader::new(&buf);
        r.get_u32("x").unwrap();
        assert!(r.expect_end().is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 2);
        buf.extend_from_slice(&[0xFF, 0xFE]);
        let mut r = PayloadReader::new(&buf);
        assert!(matches!(
            r.get_string(16, "session"),
            Err(GtmError::Protocol(_))
        ));
    }
}
