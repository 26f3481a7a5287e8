//! XCP server binary.
//!
//! # Usage
//!
//! ```bash
//! # Echo server on the default port
//! xcp-server --bind 0.0.0.0:9433
//!
//! # Compressed transport, 1 MiB frames
//! xcp-server --bind 0.0.0.0:9433 --compression --max-frame-bytes 1048576
//! ```

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use xcp_core::SessionConfig;
use xcp_server::{EchoHandler, Server};

/// XCP protocol server
#[derive(Parser, Debug)]
#[command(name = "xcp-server")]
#[command(about = "XCP message transport server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:9433")]
    bind: String,

    /// Upper bound on a single frame's payload, in bytes
    #[arg(long, default_value_t = xcp_core::config::DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: u32,

    /// Enable zstd compression of outbound payloads
    #[arg(long)]
    compression: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("xcp server starting");

    let config = SessionConfig {
        max_frame_bytes: args.max_frame_bytes,
        compression: args.compression,
        ..SessionConfig::default()
    };

    let server = Server::bind(&args.bind, config, Arc::new(EchoHandler)).await?;
    tracing::info!("listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}
