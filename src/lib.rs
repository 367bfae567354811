//! grow-a-pool: a prefork-style socket server library.
//!
//! Applications register one or more listening addresses (TCP or
//! Unix-domain) together with a connection handler, and a pool of
//! long-lived worker threads accepts and serves connections — one blocking
//! thread per unit of concurrency, no event loop. Under the dynamic
//! spawning strategy the pool grows beyond its configured floor while all
//! workers are busy, up to a per-listener maximum.
//!
//! ```no_run
//! use grow_a_pool::{Connection, Handler, Server, Tunables};
//! use std::sync::Arc;
//!
//! let handler: Arc<Handler> = Arc::new(|conn: &mut Connection| {
//!     let mut buf = [0u8; 1024];
//!     loop {
//!         let n = conn.recv(&mut buf)?;
//!         if n == 0 {
//!             return Ok(());
//!         }
//!         conn.send_all(&buf[..n])?;
//!     }
//! });
//!
//! let mut server = Server::new(Tunables::default(), handler);
//! server.add_listener("127.0.0.1:7000".parse()?)?;
//! server.set_signal_handling(true);
//! server.bind()?;
//! let status = server.run()?;
//! std::process::exit(status);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod addr;
pub mod config;
pub mod connection;
pub mod listener;
pub mod pool;
pub mod server;
pub mod signal;

pub use addr::{AddrParseError, ListenAddr};
pub use config::{Config, ConfigError, SpawnStrategy, Tunables};
pub use connection::Connection;
pub use listener::{AcceptError, Handler, Listener};
pub use pool::{Communicator, WorkerPool};
pub use server::Server;
