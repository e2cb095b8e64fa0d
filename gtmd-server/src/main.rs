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

//! GtmD Daemon
//!
//! Runs the global transaction manager: restores the GXID counter from
//! the control file, opens the listener, and serves until killed.
//!
//! ## Usage
//!
//! ```bash
//! # Master on the default port
//! gtmd --data-dir /var/lib/gtmd
//!
//! # Master mirroring to a warm standby, waiting for standby acks
//! gtmd --data-dir /var/lib/gtmd --standby 10.0.0.2:6666 --synchronous-backup
//!
//! # The standby itself
//! gtmd --data-dir /var/lib/gtmd-standby --port 6666 --standby-mode
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gtmd_core::FIRST_NORMAL_GLOBAL_XID;
use gtmd_txn::registry::CONTROL_INTERVAL;
use gtmd_txn::{
    ControlStore, FileControlStore, NullSequenceManager, RegistryConfig, TxnRegistry,
};
use gtmd_server::{GtmServer, ServerConfig};

/// GtmD - Global Transaction Manager daemon
#[derive(Parser, Debug)]
#[command(name = "gtmd")]
#[command(about = "Global transaction manager for a distributed SQL cluster")]
#[command(version)]
struct Args {
    /// Host address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "6666")]
    port: u16,

    /// Directory holding the control file
    #[arg(long, default_value = "./gtmd-data")]
    data_dir: std::path::PathBuf,

    /// Address of the warm standby to replicate to
    #[arg(long)]
    standby: Option<String>,

    /// Run as a standby: apply mirrored mutations, never issue GXIDs
    #[arg(long)]
    standby_mode: bool,

    /// Wait for the standby ack before acknowledging clients
    #[arg(long)]
    synchronous_backup: bool,

    /// Maximum concurrent client connections
    #[arg(long, default_value = "1024")]
    max_connections: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let control = Arc::new(FileControlStore::new(args.data_dir.join("gtm.control")));

    // Seed the counter from the last checkpoint, with one interval of
    // headroom for ids issued after it was written.
    let restored = control.load().context("loading control file")?;
    let next_xid = match restored {
        Some(saved) => saved.wrapping_add(CONTROL_INTERVAL).max(FIRST_NORMAL_GLOBAL_XID),
        None => FIRST_NORMAL_GLOBAL_XID,
    };

    let registry = Arc::new(TxnRegistry::new(
        RegistryConfig {
            standby: args.standby_mode,
            ..Default::default()
        },
        control.clone(),
        Arc::new(NullSequenceManager),
    ));
    registry
        .set_next_xid(next_xid)
        .context("seeding gxid counter")?;
    control.save(next_xid).context("checkpointing start gxid")?;

    tracing::info!(
        next_xid,
        standby_mode = args.standby_mode,
        "gtmd starting"
    );

    let server_config = ServerConfig {
        listen_addr: format!("{}:{}", args.host, args.port),
        standby_addr: args.standby.clone(),
        synchronous_backup: args.synchronous_backup,
        max_connections: args.max_connections,
    };
    let server = GtmServer::new(Arc::clone(&registry), server_config);
    server.start().context("starting listener")?;

    tracing::info!("gtmd version {} serving", env!("CARGO_PKG_VERSION"));

    // Serve until the process is killed. Connection threads run free;
    // the listener thread owns the accept loop.
    loop {
        std::thread::park();
    }
}
