use std::{error::Error, sync::mpsc};

use blockwire::{ServerConfig, protocol::StorageServer};
use clap::Parser;
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Backing store size in MiB
    size_mb: usize,
    /// Worker threads, one completion queue each
    workers: usize,
    /// Listen for new connections at address
    #[arg(long, default_value = blockwire::config::DEFAULT_LISTEN_ADDRESS)]
    address: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let store_size = cli
        .size_mb
        .checked_mul(1 << 20)
        .ok_or("backing store size overflows")?;
    let config = ServerConfig {
        store_size,
        workers: cli.workers,
        ..ServerConfig::with_address(&cli.address)?
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    let server = StorageServer::start(config)?;
    println!("serving {} MiB at {}", cli.size_mb, server.local_addr());

    rx.recv()?;
    info!("interrupted");
    server.shutdown();
    Ok(())
}
