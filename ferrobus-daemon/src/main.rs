/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Ferrobus Daemon - the message bus broker.
//!
//! Listens on one or more addresses, prints or records the address clients
//! should use and routes messages until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use ferrobus_core::address::generate_guid;
use ferrobus_core::{BusAddress, BusConfig};
use ferrobus_daemon::Daemon;

#[derive(Parser, Debug)]
#[command(name = "ferrobus-daemon", version)]
#[command(about = "Message bus daemon")]
struct Args {
    /// Address to listen on; may be a `;`-separated list
    #[arg(short, long)]
    listen: Option<String>,

    /// Write the process id to this file
    #[arg(short, long)]
    pidfile: Option<PathBuf>,

    /// Write the bus address to this file
    #[arg(short, long)]
    addressfile: Option<PathBuf>,

    /// Print the bus address on stdout
    #[arg(short = 'r', long)]
    print_address: bool,

    /// Listen on a unix socket in the temporary directory (default)
    #[arg(short, long, conflicts_with = "tcp")]
    unix: bool,

    /// Listen on a tcp port on localhost
    #[arg(short, long)]
    tcp: bool,

    /// Configuration file, instead of the XDG lookup
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{e:#}");
        eprintln!("ferrobus-daemon: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => BusConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => BusConfig::load(),
    };
    let _guard = initialize_tracing(&config);
    info!("** Daemon startup **");

    let listen = listen_addresses(&args)?;
    let daemon = Daemon::bind(config, &listen)
        .await
        .context("starting listeners")?;
    let address = daemon.address();

    if args.print_address {
        println!("{address}");
    }
    if let Some(path) = &args.addressfile {
        std::fs::write(path, format!("{address}\n"))
            .with_context(|| format!("writing address file {}", path.display()))?;
    }
    if let Some(path) = &args.pidfile {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing pid file {}", path.display()))?;
    }
    info!(%address, "bus running");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!("Shutdown signal received");
        }
        () = daemon.wait() => {}
    }
    daemon.shutdown();
    daemon.wait().await;

    info!("** Daemon shutdown complete **");
    Ok(())
}

fn listen_addresses(args: &Args) -> Result<Vec<BusAddress>> {
    if let Some(listen) = &args.listen {
        return BusAddress::parse_list(listen)
            .with_context(|| format!("parsing listen address `{listen}'"));
    }
    let address = if args.tcp && !args.unix {
        BusAddress::tcp("localhost", 0)
    } else {
        let guid = generate_guid();
        BusAddress::unix(std::env::temp_dir().join(format!("ferrobus-{}", &guid[..8])))
    };
    Ok(vec![address])
}

/// Logs go to stderr, and also to rolling files when the configuration
/// names a directory. The returned guard flushes the file writer on drop.
fn initialize_tracing(config: &BusConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let stderr = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NONE)
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr);

    let (file, guard) = match &config.logging.directory {
        Some(directory) => {
            let appender = RollingFileAppender::new(
                Rotation::DAILY,
                directory,
                format!("{}.log", config.logging.file_prefix),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_ids(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    guard
}
