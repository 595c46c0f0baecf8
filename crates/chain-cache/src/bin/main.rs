// Chain Cache - freshness-bounded cache for upstream chain data
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
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

//! Chain Cache Server
//!
//! Polls an upstream Ethereum node and serves the latest values over HTTP and
//! WebSocket.

use chain_cache::CacheServerBuilder;
use chain_cache_common::init_logging;
use clap::Parser;
use eyre::Result;
use std::{net::IpAddr, net::SocketAddr, str::FromStr, time::Duration};
use tracing::{error, info};

/// Freshness-bounded cache for upstream chain data
#[derive(Parser, Debug)]
#[command(name = "chain-cache")]
#[command(about = "Freshness-bounded cache for upstream chain data")]
#[command(version)]
struct Args {
    // ========== Upstream Configuration ==========
    /// Upstream JSON-RPC URL
    /// Example: --upstream-url https://eth.llamarpc.com
    #[arg(long, env = "UPSTREAM_URL")]
    upstream_url: String,

    /// Delay between poll cycles in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "1000")]
    poll_interval_ms: u64,

    /// Bound on each upstream call in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "5000")]
    request_timeout_ms: u64,

    /// Do not cache block contents
    #[arg(long)]
    no_block: bool,

    /// Do not track the gas price
    #[arg(long)]
    no_gas_price: bool,

    // ========== Server Configuration ==========
    /// Address to bind to
    #[arg(long, env = "CACHE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "CACHE_PORT", default_value = "4000")]
    port: u16,

    /// Events queued per subscriber before it is dropped
    #[arg(long, default_value = "64")]
    subscriber_buffer: usize,

    // ========== Logging Configuration ==========
    /// Also write logs to a daily rolling file
    #[arg(long)]
    log_file: bool,

    /// Verbosity level (repeat for more: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenv::dotenv();
    let args = Args::parse();

    // Set RUST_LOG based on verbosity
    if std::env::var("RUST_LOG").is_err() && args.verbose > 0 {
        let level = match args.verbose {
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    init_logging("chain-cache", args.log_file)?;
    std::panic::set_hook(Box::new(|info| {
        error!("Panic: {}", info);
    }));

    if args.poll_interval_ms == 0 {
        eyre::bail!("--poll-interval-ms must be greater than zero");
    }

    let ip = IpAddr::from_str(&args.host)?;
    let addr = SocketAddr::from((ip, args.port));

    let server = CacheServerBuilder::new()
        .upstream_url(&args.upstream_url)
        .poll_interval(Duration::from_millis(args.poll_interval_ms))
        .request_timeout(Duration::from_millis(args.request_timeout_ms))
        .subscriber_buffer(args.subscriber_buffer)
        .track_blocks(!args.no_block)
        .track_gas_price(!args.no_gas_price)
        .build()
        .await?;

    info!("Starting chain cache on {} for {}", addr, args.upstream_url);
    server.serve(addr).await
}
