//! grow-a-pool: a prefork-style echo server
//!
//! Demonstration binary for the worker-pool library: every configured
//! address gets its own listener and worker pool, and connections are
//! served by a plain echo handler running on blocking worker threads.
//!
//! Features:
//! - TCP and Unix-domain listeners, several at once
//! - Static or dynamically growing per-listener worker pools
//! - Clean shutdown on SIGINT/SIGTERM, even mid-connection
//! - Configuration via CLI arguments or TOML file

use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use grow_a_pool::{Config, Connection, Handler, Server};

/// Read buffer size for the echo handler
const BUFFER_SIZE: usize = 4096;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listeners = config.listeners.len(),
        workers = config.tunables.workers,
        workers_max = config.tunables.workers_max,
        strategy = ?config.tunables.strategy,
        timeout = config.tunables.timeout_secs,
        "Starting grow-a-pool server"
    );

    let handler: Arc<Handler> = Arc::new(echo);
    let mut server = Server::new(config.tunables.clone(), handler);
    for addr in config.listeners {
        server.add_listener(addr)?;
    }
    server.set_signal_handling(true);

    server.bind()?;
    let status = server.run()?;
    std::process::exit(status);
}

/// Echo everything the peer sends until EOF or timeout.
fn echo(conn: &mut Connection) -> std::io::Result<()> {
    let mut buf = BytesMut::zeroed(BUFFER_SIZE);

    loop {
        match conn.recv(&mut buf) {
            Ok(0) => {
                debug!("Connection closed by peer");
                return Ok(());
            }
            Ok(n) => conn.send_all(&buf[..n])?,
            Err(ref e) if Connection::is_timeout(e) => {
                debug!(peer = ?conn.peer_addr(), "Dropping stalled connection");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}
