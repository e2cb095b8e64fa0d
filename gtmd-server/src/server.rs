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

//! GtmD TCP Server
//!
//! One listener, one handler thread per accepted connection. Each
//! connection is issued a client id from a wrapping counter; when the
//! connection goes away, every non-prepared transaction of that client
//! is removed from the registry.
//!
//! Each handler thread also owns its own link to the standby, so
//! replication traffic from concurrent clients never serializes on a
//! shared socket and the per-connection ordering guarantee falls out of
//! TCP ordering.

use parking_lot::Mutex;
use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use gtmd_core::{GtmError, Result};
use gtmd_txn::TxnRegistry;

use crate::dispatch::{dispatch, RequestContext};
use crate::proto::{opcode, Message};
use crate::standby::StandbyLink;

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub listen_addr: String,
    /// Standby to mirror mutations to, if any.
    pub standby_addr: Option<String>,
    /// Wait for the standby ack before answering non-proxy clients.
    pub synchronous_backup: bool,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6666".to_string(),
            standby_addr: None,
            synchronous_backup: false,
            max_connections: 1024,
        }
    }
}

impl ServerConfig {
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_standby(mut self, addr: impl Into<String>) -> Self {
        self.standby_addr = Some(addr.into());
        self
    }

    pub fn with_synchronous_backup(mut self, on: bool) -> Self {
        self.synchronous_backup = on;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub requests_error: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct ServerStatsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub requests_total: u64,
    pub requests_error: u64,
}

impl ServerStats {
    fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_error: self.requests_error.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Client Connection Handler
// ============================================================================

struct ClientHandler {
    registry: Arc<TxnRegistry>,
    stream: TcpStream,
    standby: StandbyLink,
    client_id: u32,
    synchronous_backup: bool,
    stats: Arc<ServerStats>,
}

impl ClientHandler {
    fn handle(&mut self) -> Result<()> {
        self.stream.set_nodelay(true)?;
        let mut reader = BufReader::new(self.stream.try_clone()?);
        let mut writer = BufWriter::new(self.stream.try_clone()?);
        let registry = Arc::clone(&self.registry);

        loop {
            let request = match Message::read_from(&mut reader) {
                Ok(msg) => msg,
                Err(GtmError::ConnectionClosed) => {
                    self.cleanup();
                    return Ok(());
                }
                Err(e) => {
                    self.cleanup();
                    return Err(e);
                }
            };

            self.stats.requests_total.fetch_add(1, Ordering::Relaxed);

            let mut ctx = RequestContext {
                registry: registry.as_ref(),
                standby: &mut self.standby,
                client_id: self.client_id,
                synchronous_backup: self.synchronous_backup,
            };

            match dispatch(&mut ctx, &request) {
                Ok(Some(response)) => {
                    if response.opcode == opcode::ERROR {
                        self.stats.requests_error.fetch_add(1, Ordering::Relaxed);
                    }
                    response.write_to(&mut writer)?;
                }
                Ok(None) => {}
                Err(e) => {
                    // Protocol violation: the connection is unusable.
                    self.stats.requests_error.fetch_add(1, Ordering::Relaxed);
                    self.cleanup();
                    return Err(e);
                }
            }
        }
    }

    /// Reap every non-prepared transaction this client left behind.
    fn cleanup(&mut self) {
        let removed = self.registry.remove_all(self.client_id, -1);
        if removed > 0 {
            info!(
                client_id = self.client_id,
                removed, "cleaned up transactions on disconnect"
            );
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// The GtmD network server.
pub struct GtmServer {
    registry: Arc<TxnRegistry>,
    config: ServerConfig,
    stats: Arc<ServerStats>,
    running: Arc<AtomicBool>,
    next_client_id: Arc<AtomicU32>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl GtmServer {
    pub fn new(registry: Arc<TxnRegistry>, config: ServerConfig) -> Self {
        Self {
            registry,
            config,
            stats: Arc::new(ServerStats::default()),
            running: Arc::new(AtomicBool::new(false)),
            next_client_id: Arc::new(AtomicU32::new(1)),
            listener_handle: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind the listener and start accepting in a background thread.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GtmError::InvalidState("server already running".to_string()));
        }

        let listener = TcpListener::bind(&self.config.listen_addr)?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);

        info!(addr = %local, standby = ?self.config.standby_addr, "gtmd listening");

        let registry = Arc::clone(&self.registry);
        let config = self.config.clone();
        let stats = Arc::clone(&self.stats);
        let running = Arc::clone(&self.running);
        let next_client_id = Arc::clone(&self.next_client_id);

        let handle = thread::spawn(move || {
            accept_loop(listener, registry, config, stats, running, next_client_id);
        });
        *self.listener_handle.lock() = Some(handle);
        Ok(())
    }

    /// Address the listener actually bound (relevant with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ServerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop accepting connections. Already-connected clients finish on
    /// their own threads.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Wake the blocking accept with a throwaway connection.
        if let Some(addr) = self.local_addr() {
            let _ = TcpStream::connect(addr);
        }

        if let Some(handle) = self.listener_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GtmServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    registry: Arc<TxnRegistry>,
    config: ServerConfig,
    stats: Arc<ServerStats>,
    running: Arc<AtomicBool>,
    next_client_id: Arc<AtomicU32>,
) {
    while running.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    warn!(error = %e, "accept failed");
                }
                continue;
            }
        };

        if !running.load(Ordering::SeqCst) {
            break;
        }

        let active = stats.connections_active.load(Ordering::Relaxed);
        if active >= config.max_connections as u64 {
            warn!(active, "connection limit reached, rejecting client");
            continue;
        }

        // Client ids wrap; 0 is reserved for "no client".
        let client_id = loop {
            let id = next_client_id.fetch_add(1, Ordering::AcqRel);
            if id != 0 {
                break id;
            }
        };

        stats.connections_total.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        debug!(client_id, "client connected");

        let mut handler = ClientHandler {
            registry: Arc::clone(&registry),
            stream,
            standby: StandbyLink::new(config.standby_addr.clone()),
            client_id,
            synchronous_backup: config.synchronous_backup,
            stats: Arc::clone(&stats),
        };
        let stats = Arc::clone(&stats);
        thread::spawn(move || {
            if let Err(e) = handler.handle() {
                error!(client_id = handler.client_id, error = %e, "client connection error");
            }
            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::GtmClient;
    use gtmd_core::{GtmNodeType, IsolationLevel, TxnStatus};
    use gtmd_txn::{MemoryControlStore, NullSequenceManager, RegistryConfig};
    use std::time::{Duration, Instant};

    fn start_server(config: RegistryConfig, server_config: ServerConfig) -> (GtmServer, SocketAddr) {
        let registry = Arc::new(TxnRegistry::new(
            config,
            Arc::new(MemoryControlStore::new()),
            Arc::new(NullSequenceManager),
        ));
        registry
            .set_next_xid(gtmd_core::FIRST_NORMAL_GLOBAL_XID)
            .unwrap();

        let server = GtmServer::new(registry, server_config.with_listen_addr("127.0.0.1:0"));
        server.start().unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_begin_commit_over_the_wire() {
        let (server, addr) = start_server(
            RegistryConfig {
                max_transactions: 64,
                ..Default::default()
            },
            ServerConfig::default(),
        );

        let mut client = GtmClient::connect(addr).unwrap();

        let (gxid, timestamp) = client
            .begin_get_gxid(IsolationLevel::ReadCommitted, false, "s1")
            .unwrap();
        assert_eq!(gxid, 3);
        assert!(timestamp > 0);

        assert_eq!(client.get_next_gxid().unwrap(), 4);
        assert_eq!(client.commit(gxid, &[]).unwrap(), TxnStatus::Ok);
        assert_eq!(server.registry.open_count(), 0);
        assert_eq!(server.registry.latest_completed_xid(), 3);

        server.stop();
    }

    #[test]
    fn test_begin_then_get_gxid_by_handle() {
        let (server, addr) = start_server(
            RegistryConfig {
                max_transactions: 64,
                ..Default::default()
            },
            ServerConfig::default(),
        );

        let mut client = GtmClient::connect(addr).unwrap();

        let (handle, timestamp) = client
            .begin(IsolationLevel::ReadCommitted, false, "s1")
            .unwrap();
        assert_eq!(handle, 0);
        assert!(timestamp > 0);

        let (echoed, gxid) = client.get_gxid(handle).unwrap();
        assert_eq!(echoed, handle);
        assert_eq!(gxid, 3);

        // A second fetch returns the same id instead of a new one.
        let (_, again) = client.get_gxid(handle).unwrap();
        assert_eq!(again, gxid);

        assert_eq!(client.commit(gxid, &[]).unwrap(), TxnStatus::Ok);
        assert_eq!(server.registry.latest_completed_xid(), 3);
        assert_eq!(server.registry.read_next_xid(), 4);

        server.stop();
    }

    #[test]
    fn test_two_phase_commit_over_the_wire() {
        let (server, addr) = start_server(
            RegistryConfig {
                max_transactions: 64,
                ..Default::default()
            },
            ServerConfig::default(),
        );

        let mut client = GtmClient::connect(addr).unwrap();
        let (gxid, _) = client
            .begin_get_gxid(IsolationLevel::ReadCommitted, false, "")
            .unwrap();
        client.start_prepared(gxid, "tx1", "n1,n2").unwrap();
        client.prepare(gxid).unwrap();

        // Another client finishes the prepared transaction via its GID.
        let mut other = GtmClient::connect(addr).unwrap();
        let (new_gxid, prepared_gxid, nodes) = other
            .get_gid_data(IsolationLevel::ReadCommitted, false, "tx1")
            .unwrap();
        assert_eq!(prepared_gxid, gxid);
        assert_eq!(nodes, "n1,n2");

        assert_eq!(
            other.commit_prepared(new_gxid, prepared_gxid, &[]).unwrap(),
            TxnStatus::Ok
        );
        assert_eq!(server.registry.open_count(), 0);

        server.stop();
    }

    #[test]
    fn test_delayed_commit_then_retry() {
        let (server, addr) = start_server(
            RegistryConfig {
                max_transactions: 64,
                ..Default::default()
            },
            ServerConfig::default(),
        );

        let mut client = GtmClient::connect(addr).unwrap();
        let (g0, _) = client
            .begin_get_gxid(IsolationLevel::ReadCommitted, false, "a")
            .unwrap();
        let (g1, _) = client
            .begin_get_gxid(IsolationLevel::ReadCommitted, false, "b")
            .unwrap();

        assert_eq!(client.commit(g1, &[g0]).unwrap(), TxnStatus::Delayed);
        assert_eq!(client.commit(g0, &[]).unwrap(), TxnStatus::Ok);
        assert_eq!(client.commit(g1, &[g0]).unwrap(), TxnStatus::Ok);

        server.stop();
    }

    #[test]
    fn test_proxy_conn_id_echo() {
        let (server, addr) = start_server(
            RegistryConfig {
                max_transactions: 64,
                ..Default::default()
            },
            ServerConfig::default(),
        );

        let mut client = GtmClient::connect(addr).unwrap();
        client.set_conn_id(11);
        let resp = client
            .request(opcode::TXN_GET_NEXT_GXID, Vec::new())
            .unwrap();
        assert_eq!(resp.opcode, opcode::TXN_GET_NEXT_GXID_RESULT);
        assert_eq!(resp.conn_id, 11);

        server.stop();
    }

    #[test]
    fn test_disconnect_cleans_up_client_transactions() {
        let (server, addr) = start_server(
            RegistryConfig {
                max_transactions: 64,
                ..Default::default()
            },
            ServerConfig::default(),
        );

        {
            let mut client = GtmClient::connect(addr).unwrap();
            client
                .begin_get_gxid(IsolationLevel::ReadCommitted, false, "s1")
                .unwrap();
            client
                .begin_get_gxid(IsolationLevel::ReadCommitted, false, "s2")
                .unwrap();
            assert_eq!(server.registry.open_count(), 2);
            // Dropped here: the socket closes.
        }

        assert!(
            wait_until(Duration::from_secs(5), || server.registry.open_count() == 0),
            "disconnect cleanup did not run"
        );

        server.stop();
    }

    #[test]
    fn test_disconnect_spares_prepared_transactions() {
        let (server, addr) = start_server(
            RegistryConfig {
                max_transactions: 64,
                ..Default::default()
            },
            ServerConfig::default(),
        );

        {
            let mut client = GtmClient::connect(addr).unwrap();
            let (gxid, _) = client
                .begin_get_gxid(IsolationLevel::ReadCommitted, false, "")
                .unwrap();
            client.start_prepared(gxid, "tx-live", "n1").unwrap();
            client.prepare(gxid).unwrap();
            client
                .begin_get_gxid(IsolationLevel::ReadCommitted, false, "doomed")
                .unwrap();
        }

        assert!(
            wait_until(Duration::from_secs(5), || server.registry.open_count() == 1),
            "cleanup did not settle to the prepared transaction"
        );

        // The survivor is completable through the GID by a new client.
        let mut client = GtmClient::connect(addr).unwrap();
        let (new_gxid, prepared_gxid, _) = client
            .get_gid_data(IsolationLevel::ReadCommitted, false, "tx-live")
            .unwrap();
        assert_eq!(
            client.commit_prepared(new_gxid, prepared_gxid, &[]).unwrap(),
            TxnStatus::Ok
        );

        server.stop();
    }

    #[test]
    fn test_protocol_error_closes_connection() {
        let (server, addr) = start_server(
            RegistryConfig {
                max_transactions: 64,
                ..Default::default()
            },
            ServerConfig::default(),
        );

        let mut client = GtmClient::connect(addr).unwrap();
        // Unknown opcode: the server drops the connection without a
        // response, so the read sees EOF.
        let result = client.request(0x01, Vec::new());
        assert!(result.is_err());

        server.stop();
    }

    #[test]
    fn test_standby_mirroring_synchronous() {
        // Standby first.
        let standby_registry = Arc::new(TxnRegistry::new(
            RegistryConfig {
                max_transactions: 64,
                standby: true,
                ..Default::default()
            },
            Arc::new(MemoryControlStore::new()),
            Arc::new(NullSequenceManager),
        ));
        standby_registry
            .set_next_xid(gtmd_core::FIRST_NORMAL_GLOBAL_XID)
            .unwrap();
        let standby_server = GtmServer::new(
            Arc::clone(&standby_registry),
            ServerConfig::default().with_listen_addr("127.0.0.1:0"),
        );
        standby_server.start().unwrap();
        let standby_addr = standby_server.local_addr().unwrap();

        // Master mirrors to it, synchronously so the ack ordering makes
        // the assertions deterministic.
        let master_registry = Arc::new(TxnRegistry::new(
            RegistryConfig {
                max_transactions: 64,
                ..Default::default()
            },
            Arc::new(MemoryControlStore::new()),
            Arc::new(NullSequenceManager),
        ));
        master_registry
            .set_next_xid(gtmd_core::FIRST_NORMAL_GLOBAL_XID)
            .unwrap();
        let master_server = GtmServer::new(
            Arc::clone(&master_registry),
            ServerConfig::default()
                .with_listen_addr("127.0.0.1:0")
                .with_standby(standby_addr.to_string())
                .with_synchronous_backup(true),
        );
        master_server.start().unwrap();
        let master_addr = master_server.local_addr().unwrap();

        let mut client = GtmClient::connect(master_addr).unwrap();

        let (gxid, _) = client
            .begin_get_gxid(IsolationLevel::ReadCommitted, false, "s1")
            .unwrap();
        assert!(standby_registry.is_gxid_in_progress(gxid));
        // The standby's counter followed the master's.
        assert_eq!(standby_registry.read_next_xid(), gxid + 1);

        assert_eq!(client.commit(gxid, &[]).unwrap(), TxnStatus::Ok);
        assert!(!standby_registry.is_gxid_in_progress(gxid));
        assert_eq!(standby_registry.latest_completed_xid(), gxid);

        // 2PC state travels too.
        let (g2, _) = client
            .begin_get_gxid(IsolationLevel::ReadCommitted, false, "s2")
            .unwrap();
        client.start_prepared(g2, "tx-m", "n1").unwrap();
        client.prepare(g2).unwrap();
        let standby_handle = standby_registry.gid_to_handle("tx-m").unwrap();
        assert_eq!(
            standby_registry.state_of(standby_handle).unwrap(),
            gtmd_core::TxnState::Prepared
        );

        client.rollback(g2).unwrap();
        assert!(!standby_registry.is_gxid_in_progress(g2));

        master_server.stop();
        standby_server.stop();
    }

    #[test]
    fn test_standby_refuses_gxid_issue() {
        let (server, addr) = {
            let registry = Arc::new(TxnRegistry::new(
                RegistryConfig {
                    max_transactions: 64,
                    standby: true,
                    ..Default::default()
                },
                Arc::new(MemoryControlStore::new()),
                Arc::new(NullSequenceManager),
            ));
            registry
                .set_next_xid(gtmd_core::FIRST_NORMAL_GLOBAL_XID)
                .unwrap();
            let server = GtmServer::new(
                registry,
                ServerConfig::default().with_listen_addr("127.0.0.1:0"),
            );
            server.start().unwrap();
            let addr = server.local_addr().unwrap();
            (server, addr)
        };

        let mut client = GtmClient::connect(addr).unwrap();
        let err = client
            .begin_get_gxid(IsolationLevel::ReadCommitted, false, "")
            .unwrap_err();
        assert!(matches!(err, GtmError::Remote(_)));

        server.stop();
    }

    #[test]
    fn test_report_xmin_over_the_wire() {
        let (server, addr) = start_server(
            RegistryConfig {
                max_transactions: 64,
                ..Default::default()
            },
            ServerConfig::default(),
        );

        let mut client = GtmClient::connect(addr).unwrap();
        let (latest, xmin, errcode) = client
            .report_xmin(20, GtmNodeType::Coordinator, "co1")
            .unwrap();
        assert_eq!(errcode, 0);
        assert_eq!(xmin, 20);
        assert_eq!(latest, server.registry.latest_completed_xid());

        server.stop();
    }

    #[test]
    fn test_gxid_list_snapshot() {
        let (server, addr) = start_server(
            RegistryConfig {
                max_transactions: 64,
                ..Default::default()
            },
            ServerConfig::default(),
        );

        let mut client = GtmClient::connect(addr).unwrap();
        client
            .begin_get_gxid(IsolationLevel::Serializable, false, "snap")
            .unwrap();

        let raw = client.gxid_list().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["open"].as_array().unwrap().len(), 1);
        assert_eq!(parsed["open"][0]["session_id"], "snap");

        server.stop();
    }

    #[test]
    fn test_multi_begin_and_batch_commit() {
        let (server, addr) = start_server(
            RegistryConfig {
                max_transactions: 64,
                ..Default::default()
            },
            ServerConfig::default(),
        );

        let mut client = GtmClient::connect(addr).unwrap();
        client.set_conn_id(3);

        let entries = vec![
            (IsolationLevel::ReadCommitted, false, "be1".to_string(), 1),
            (IsolationLevel::Serializable, true, "be2".to_string(), 2),
        ];
        let (gxids, _) = client.begin_get_gxid_multi(&entries).unwrap();
        assert_eq!(gxids, vec![3, 4]);

        let statuses = client.commit_multi(&gxids).unwrap();
        assert_eq!(statuses, vec![TxnStatus::Ok, TxnStatus::Ok]);
        assert_eq!(server.registry.open_count(), 0);

        server.stop();
    }
}
