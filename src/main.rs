//! chat-relay: a line-oriented chat relay server.
//!
//! Clients connect over TCP and speak a tiny `\r\n`-framed protocol:
//! - `my name is <nick>` sets a nickname
//! - `folks` lists connected peers
//! - `send <msg>` broadcasts into the shared history
//! - `new` fetches messages since the client's last poll
//!
//! One thread multiplexes every connection with a readiness loop; all
//! outbound data lives in a fixed pool of buffers.

mod clock;
mod config;
mod history;
mod limits;
mod protocol;
mod runtime;

use config::Config;
use runtime::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(host = %config.host, port = config.port, "starting chat relay");

    let server = Server::bind(&config)?;
    server.run()?;
    Ok(())
}
