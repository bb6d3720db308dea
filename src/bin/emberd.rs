use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use log::error;

use ember::{sys, Config, Server};

/// Static-content HTTP/1.1 origin server.
#[derive(Debug, Parser)]
#[command(name = "emberd", version, about)]
struct Args {
    /// Document root that request paths resolve under.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Listen port (0 picks an ephemeral port).
    #[arg(long, default_value_t = 9877)]
    port: u16,

    /// Connection records in the pool; one is taken by the listener.
    #[arg(long, default_value_t = 128)]
    max_connections: usize,

    /// Kernel readiness events accepted per reactor tick.
    #[arg(long, default_value_t = 128)]
    max_events: usize,

    /// Read-side inactivity timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Answer timed-out requests with 408 before closing instead of
    /// closing silently.
    #[arg(long)]
    timeout_response: bool,
}

fn main() -> ExitCode {
    env_logger::init();

    match serve(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn serve(args: Args) -> io::Result<()> {
    sys::ignore_sigpipe();

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let mut server = Server::new(Config {
        root: args.root,
        port: args.port,
        max_connections: args.max_connections,
        max_events: args.max_events,
        request_timeout_ms: args.timeout_ms,
        timeout_response: args.timeout_response,
    })?;

    println!("listening on port {}", server.local_port()?);
    server.run(&shutdown)
}
