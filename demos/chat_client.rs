//! Chat client: sends every line read from stdin and prints every message the
//! server broadcasts.

use clap::Parser;
use config::Config;
use framecomm::Client;
use std::io::{self, BufRead};
use std::process::ExitCode;
use std::thread;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = format!("framecomm={}", level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Parser)]
#[command(author, version, about = "Chat client", long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    connect: String,

    /// Name prefixed to every line sent
    #[arg(short, long, default_value = "anonymous")]
    name: String,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut client = match Client::connect(&args.connect, &Config::default()) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("Failed to connect to {}: {err}", args.connect);
            return ExitCode::FAILURE;
        }
    };
    println!("Connected to {} as {}", client.peer_addr(), args.name);

    // The reader thread owns the client; stdin goes through the interface.
    let client_intf = client.get_client_interface();
    let reader = thread::spawn(move || loop {
        match client.recv() {
            Ok(Some(msg)) => println!("{}", String::from_utf8_lossy(&msg)),
            Ok(None) => {
                println!("Server closed the connection");
                return;
            }
            Err(err) => {
                eprintln!("Receive failed: {err}");
                return;
            }
        }
    });

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if line.is_empty() {
            continue;
        }
        let text = format!("{}: {}", args.name, line);
        if let Err(err) = client_intf.send(text.as_bytes()) {
            eprintln!("Send failed: {err}");
            break;
        }
    }

    // Stdin closed: hang up and let the reader observe the end of stream.
    let _ = client_intf.shutdown();
    let _ = reader.join();
    ExitCode::SUCCESS
}
