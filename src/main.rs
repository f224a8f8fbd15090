//! Console client: prints what the server sends and sends every stdin line.
//!
//! ```text
//! tideline 127.0.0.1:7000
//! RUST_LOG=tideline=debug tideline localhost:7000
//! ```

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use tideline::{ClientBuilder, ConnectionState, Inbound};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// Writes received text to stdout as it arrives.
struct Console;

impl Inbound for Console {
    fn on_text(&mut self, text: &str) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }

    fn on_state(&mut self, state: ConnectionState) {
        info!(%state, "connection state changed");
    }
}

fn install_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr));

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

fn main() -> ExitCode {
    install_tracing();

    let Some(address) = std::env::args().nth(1) else {
        eprintln!("usage: tideline <host:port>");
        return ExitCode::from(2);
    };

    let client = match ClientBuilder::new().address(address.as_str()).start(Console) {
        Ok(client) => client,
        Err(err) => {
            error!(%err, "failed to start client");
            return ExitCode::FAILURE;
        }
    };

    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "failed to read stdin");
                break;
            }
        };

        if let Err(err) = client.send(&format!("{line}\n")) {
            error!(%err, "message rejected");
            break;
        }
    }

    if let Err(err) = client.shutdown() {
        warn!(%err, "event loop already stopped");
    }
    client.join();

    ExitCode::SUCCESS
}
