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

//! Control File
//!
//! The only durable state the transaction manager owns is a periodic
//! checkpoint of the GXID counter. On a clean restart the saved value
//! (plus headroom for ids issued since the last checkpoint) seeds
//! `next_xid`, so the node never reissues an id it already handed out.
//!
//! The file is a small JSON document with a CRC over the counter bytes,
//! written to a temp file and renamed into place so a torn write can
//! never corrupt the previous checkpoint.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use gtmd_core::{GlobalXid, GtmError, Result};
use tracing::{debug, info, warn};

/// Persistence seam for the GXID checkpoint. The registry calls `save`
/// with no internal lock held.
pub trait ControlStore: Send + Sync {
    /// Last checkpointed GXID, or `None` when no control file exists yet.
    fn load(&self) -> Result<Option<GlobalXid>>;

    /// Persist a new checkpoint.
    fn save(&self, xid: GlobalXid) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlPayload {
    next_gxid: u32,
    crc: u32,
}

impl ControlPayload {
    fn new(next_gxid: GlobalXid) -> Self {
        Self {
            next_gxid,
            crc: crc32fast::hash(&next_gxid.to_le_bytes()),
        }
    }

    fn verify(&self) -> bool {
        crc32fast::hash(&self.next_gxid.to_le_bytes()) == self.crc
    }
}

/// File-backed control store.
pub struct FileControlStore {
    path: PathBuf,
}

impl FileControlStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

impl ControlStore for FileControlStore {
    fn load(&self) -> Result<Option<GlobalXid>> {
        if !self.path.exists() {
            debug!("no control file at {:?}, starting fresh", self.path);
            return Ok(None);
        }

        let raw = fs::read_to_string(&self.path)?;
        let payload: ControlPayload = serde_json::from_str(&raw)
            .map_err(|e| GtmError::ControlFile(format!("unreadable control file: {}", e)))?;

        if !payload.verify() {
            return Err(GtmError::ControlFile(format!(
                "control file checksum mismatch for gxid {}",
                payload.next_gxid
            )));
        }

        info!("restored control gxid {}", payload.next_gxid);
        Ok(Some(payload.next_gxid))
    }

    fn save(&self, xid: GlobalXid) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let payload = ControlPayload::new(xid);
        let raw = serde_json::to_string(&payload)
            .map_err(|e| GtmError::ControlFile(format!("serialize failed: {}", e)))?;

        let tmp = self.temp_path();
        fs::write(&tmp, raw)?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            // Leave no stray temp file behind on a failed rename.
            let _ = fs::remove_file(&tmp);
            warn!("control file rename failed: {}", e);
            return Err(e.into());
        }

        debug!("checkpointed control gxid {}", xid);
        Ok(())
    }
}

/// In-memory control store for tests and for standby nodes that restore
/// their counter from the master instead of a local file.
#[derive(Debug, Default)]
pub struct MemoryControlStore {
    value: AtomicU32,
    saves: AtomicU64,
}

impl MemoryControlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints taken, for checkpoint-cadence assertions.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Acquire)
    }

    pub fn last_saved(&self) -> GlobalXid {
        self.value.load(Ordering::Acquire)
    }
}

impl ControlStore for MemoryControlStore {
    fn load(&self) -> Result<Option<GlobalXid>> {
        let v = self.value.load(Ordering::Acquire);
        Ok(if v == 0 { None } else { Some(v) })
    }

    fn save(&self, xid: GlobalXid) -> Result<()> {
        self.value.store(xid, Ordering::Release);
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = FileControlStore::new(dir.path().join("gtm.control"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileControlStore::new(dir.path().join("gtm.control"));

        store.save(12345).unwrap();
        assert_eq!(store.load().unwrap(), Some(12345));

        // A later checkpoint replaces the earlier one.
        store.save(99999).unwrap();
        assert_eq!(store.load().unwrap(), Some(99999));
    }

    #[test]
    fn test_corrupt_crc_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gtm.control");
        let store = FileControlStore::new(&path);

        store.save(4242).unwrap();

        // Tamper with the counter but keep the old CRC.
        let raw = std::fs::read_to_string(&path).unwrap();
        let tampered = raw.replace("4242", "4243");
        std::fs::write(&path, tampered).unwrap();

        match store.load() {
            Err(GtmError::ControlFile(msg)) => assert!(msg.contains("checksum")),
            other => panic!("expected checksum error, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gtm.control");
        std::fs::write(&path, "not json at all").unwrap();

        let store = FileControlStore::new(&path);
        assert!(matches!(store.load(), Err(GtmError::ControlFile(_))));
    }

    #[test]
    fn test_memory_store_counts_saves() {
        let store = MemoryControlStore::new();
        assert_eq!(store.load().unwrap(), None);
        store.save(10).unwrap();
        store.save(20).unwrap();
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.load().unwrap(), Some(20));
    }
}
