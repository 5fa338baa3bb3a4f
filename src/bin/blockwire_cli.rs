use std::{
    error::Error,
    io::{self, Write},
    sync::{Arc, mpsc},
};

use blockwire::{Completion, Direction, IoRequest, RemoteConfig, Token, target::RemoteTarget};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of a running blockwire-server
    address: String,
    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Fill a byte range with a repeated pattern
    Write {
        #[arg(long)]
        offset: u64,
        #[arg(long)]
        len: usize,
        /// Byte to write, decimal or 0x-prefixed hex
        #[arg(long, default_value = "0xAA", value_parser = parse_byte)]
        pattern: u8,
    },
    /// Dump a byte range as hex
    Read {
        #[arg(long)]
        offset: u64,
        #[arg(long)]
        len: usize,
    },
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid byte '{s}': {e}"))
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let (tx, rx) = mpsc::channel();
    let target = RemoteTarget::new(
        &RemoteConfig {
            address: cli.address,
            workers: 1,
        },
        Arc::new(move |completion: Completion| {
            let _ = tx.send(completion);
        }),
    )?;

    let request = match cli.action {
        Action::Write {
            offset,
            len,
            pattern,
        } => IoRequest::write(offset, vec![vec![pattern; len]], Token(0)),
        Action::Read { offset, len } => IoRequest::read(offset, &[len], Token(0)),
    };
    let direction = request.direction;
    target.submit(request);

    let completion = rx.recv()?;
    completion.result?;

    let mut stdout = io::stdout().lock();
    match direction {
        Direction::Write => writeln!(stdout, "ok")?,
        Direction::Read => {
            for (row, chunk) in completion.segments.concat().chunks(16).enumerate() {
                write!(stdout, "{:08x}:", row * 16)?;
                for byte in chunk {
                    write!(stdout, " {byte:02x}")?;
                }
                writeln!(stdout)?;
            }
        }
    }
    Ok(())
}
