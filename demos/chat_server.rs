//! Chat server: every message received from any client is broadcast to all
//! connected clients.
//!
//! One thread runs the accept loop, one reader thread per client decodes
//! incoming frames into the delivery queue, and a small consumer pool pops
//! messages and broadcasts them.

use clap::Parser;
use config::Config;
use framecomm::Server;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

const CONSUMER_POOL_SIZE: usize = 2;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for the framecomm crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return, // No tracing
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("framecomm={}", level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .pretty()
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Chat server", long_about = None)]
struct Args {
    /// Address to bind server to
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format)
    #[arg(long)]
    config: Option<String>,
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();

    init_tracing(args.verbose);

    // Create config - load from file if specified, otherwise use defaults
    let config = if let Some(config_path) = &args.config {
        match Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()
        {
            Ok(c) => c,
            Err(err) => {
                eprintln!("Failed to load config file '{}': {}", config_path, err);
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };

    let mut server = match Server::new(&config) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("Failed to initialize server: {err:?}");
            return ExitCode::FAILURE;
        }
    };
    let local_addr = match server.bind(&args.bind) {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("Failed to bind {}: {err:?}", args.bind);
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = server.listen() {
        eprintln!("Failed to listen on {local_addr}: {err:?}");
        return ExitCode::FAILURE;
    }
    println!("Chat server listening on {local_addr}");

    let server = Arc::new(server);

    // Consumers pop decoded messages and fan them out. They run until the
    // process exits.
    for i in 0..CONSUMER_POOL_SIZE {
        let server = Arc::clone(&server);
        thread::Builder::new()
            .name(format!("consumer-{i}"))
            .spawn(move || consumer_loop(server))
            .expect("Failed to spawn consumer thread");
    }

    // The accept loop runs on the main thread until the listener is closed.
    server.run();

    ExitCode::SUCCESS
}

// ============================================================================
// Consumer Thread
// ============================================================================

fn consumer_loop(server: Arc<Server>) {
    loop {
        let msg = server.pop();
        println!("[Server] {}", String::from_utf8_lossy(&msg));

        match server.broadcast(&msg) {
            Ok(failures) => {
                for failure in failures {
                    eprintln!(
                        "[Server] Failed to deliver to {}: {}",
                        failure.peer, failure.error
                    );
                }
            }
            Err(err) => eprintln!("[Server] Dropping message: {err}"),
        }
    }
}
