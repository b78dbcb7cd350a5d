//! Command-line control surface for a running gracht server: subscribe or
//! unsubscribe a service, or attach and print every event a service emits
//! until interrupted.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

#[derive(Parser)]
#[command(name = "gracht-ctl", about = "Control a running gracht server's subscriptions")]
struct Cli {
    /// Address of the server's control link, e.g. 127.0.0.1:7040.
    #[arg(long, global = true)]
    addr: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Subscribe to a service's events.
    Subscribe {
        /// The service id to subscribe to.
        service_id: u8,
    },
    /// Unsubscribe from a service's events.
    Unsubscribe {
        /// The service id to unsubscribe from.
        service_id: u8,
    },
    /// Subscribe and print every event received until interrupted.
    Listen {
        /// The service id to listen on.
        service_id: u8,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Subscribe { service_id } => gracht_ctl::subscribe(cli.addr, service_id).map_err(|err| err.to_string()),
        Command::Unsubscribe { service_id } => gracht_ctl::unsubscribe(cli.addr, service_id).map_err(|err| err.to_string()),
        Command::Listen { service_id } => {
            let running = Arc::new(AtomicBool::new(true));
            let handler_running = running.clone();
            ctrlc::set_handler(move || handler_running.store(false, Ordering::Release))
                .expect("failed to install ctrl-c handler");
            gracht_ctl::listen(cli.addr, service_id, running).map_err(|err| err.to_string())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "gracht-ctl command failed");
            ExitCode::FAILURE
        }
    }
}
