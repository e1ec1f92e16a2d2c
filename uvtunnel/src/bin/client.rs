//! Tunnel client daemon.
//!
//! Listens for UDP datagrams on a local port and carries them to the tunnel
//! server over a virtual channel of several TCP connections.
//!
//! # Usage
//!
//! ```sh
//! uvt-client --config client.json
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, mpsc};

use clap::Parser;

use uvtunnel::config::ClientConfig;
use uvtunnel::tunnel::{Client, Services, TunnelError};

/// UDP-over-TCP tunnel client.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, default_value = "client.json")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = uvtunnel::DEFAULT_FILTER)]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();
    uvtunnel::init_tracing_with(&cli.log_level);

    if let Err(e) = run(&cli) {
        eprintln!("uvt-client: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), TunnelError> {
    let config = ClientConfig::load(&cli.config)?;

    let services = Arc::new(Services::new(&config.tunnel));
    services.start_housekeeping(&config.tunnel)?;

    let client = Client::spawn(config, Arc::clone(&services))?;
    eprintln!("uvt-client: accepting datagrams on {}", client.local_udp_addr());

    wait_for_termination()?;
    eprintln!("uvt-client: shutting down");
    client.shutdown();
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
