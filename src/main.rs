//! drift - concurrent UDP file transfer
//!
//! One binary, two modes: the client streams a local file to a server;
//! the server accepts any number of concurrent senders and materializes
//! their files in its working directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;

use drift::client;
use drift::logger::{Logger, NoopLogger, TextLogger};
use drift::server::Server;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "drift - concurrent UDP file transfer")]
struct Args {
    /// Run in client mode (send the file) - the default
    #[arg(short = 'c', long, conflicts_with = "server")]
    client: bool,

    /// Run in server mode (receive files)
    #[arg(short = 's', long)]
    server: bool,

    /// Server address to send to
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    addr: String,

    /// UDP port
    #[arg(short = 'p', long, default_value_t = 2080)]
    port: u16,

    /// File to send
    #[arg(short = 'f', long, default_value = "test.c")]
    file: PathBuf,

    /// Print PDU detail for every datagram
    #[arg(short = 'd', long)]
    debug: bool,

    /// Append transfer events to this log file
    #[arg(long)]
    log: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let logger: Arc<dyn Logger> = match &args.log {
        Some(path) => Arc::new(TextLogger::new(path)?),
        None => Arc::new(NoopLogger),
    };

    let client_mode = args.client || !args.server;
    if !client_mode {
        let root = std::env::current_dir()?;
        let server = Server::bind(args.port, &root, args.debug, logger)?;
        println!("drift server listening on 0.0.0.0:{}", args.port);
        server.run()
    } else {
        let start = Instant::now();
        let bytes = client::send_file(&args.file, &args.addr, args.port, args.debug, logger.as_ref())?;
        let elapsed = start.elapsed().as_secs_f64();
        println!(
            "sent {} ({} bytes on the wire) in {:.2}s",
            args.file.display(),
            bytes,
            elapsed
        );
        Ok(())
    }
}
