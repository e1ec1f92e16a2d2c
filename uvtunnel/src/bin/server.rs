//! Tunnel server daemon.
//!
//! Accepts virtual channels from allow-listed clients and forwards their
//! datagrams to a fixed UDP address; replies travel back the same way.
//!
//! # Usage
//!
//! ```sh
//! uvt-server --config server.json
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, mpsc};

use clap::Parser;

use uvtunnel::config::ServerConfig;
use uvtunnel::tunnel::{Server, Services, TunnelError};

/// UDP-over-TCP tunnel server.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, default_value = "server.json")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = uvtunnel::DEFAULT_FILTER)]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();
    uvtunnel::init_tracing_with(&cli.log_level);

    if let Err(e) = run(&cli) {
        eprintln!("uvt-server: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), TunnelError> {
    let config = ServerConfig::load(&cli.config)?;

    let services = Arc::new(Services::new(&config.tunnel));
    services.start_housekeeping(&config.tunnel)?;

    let server = Server::spawn(config, Arc::clone(&services))?;
    eprintln!("uvt-server: listening on {}", server.local_addr());

    wait_for_termination()?;
    eprintln!("uvt-server: shutting down");
    server.shutdown();
    services.stop();
    Ok(())
}

/// Blocks until SIGINT or SIGTERM.
fn wait_for_termination() -> io::Result<()> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(io::Error::other)?;
    // A closed channel means the handler is gone; treat it as a stop request.
    let _ = rx.recv();
    Ok(())
}
