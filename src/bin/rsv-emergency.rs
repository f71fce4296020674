//! RSVShop Emergency Recovery Server
//!
//! Standalone HTTP service for restoring the data store while the primary
//! application is down. Restores run in `rsv-recovery` worker processes.

use clap::{Arg, Command};
use rsvshop_recovery::cli::{self, Resolved};
use rsvshop_recovery::emergency::{EmergencyServer, WorkerCommand};
use rsvshop_recovery::logging::init_logging;
use rsvshop_recovery::{Error, RecoveryRuntime};
use std::path::PathBuf;
use tracing::Level;

fn main() {
    let matches = Command::new("rsv-emergency")
        .about("RSVShop Emergency Recovery Server")
        .version(env!("CARGO_PKG_VERSION"))
        .args(cli::global_args())
        .arg(
            Arg::new("port")
                .help("Port to listen on")
                .short('p')
                .long("port"),
        )
        .arg(
            Arg::new("worker")
                .help("Path to the rsv-recovery binary")
                .long("worker"),
        )
        .get_matches();

    if let Err(e) = run(&matches) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(matches: &clap::ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let resolved = Resolved::from_matches(matches)?;
    init_logging(Level::INFO, resolved.json_logs);

    let mut config = resolved.config.clone();
    if let Some(port) = matches.get_one::<String>("port") {
        config.emergency.port = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port '{}'", port)))?;
    }

    let worker = match matches
        .get_one::<String>("worker")
        .map(PathBuf::from)
        .or_else(|| config.emergency.worker_binary.clone())
    {
        Some(program) => WorkerCommand::new(program, resolved.worker_args()),
        None => WorkerCommand::sibling(resolved.worker_args())?,
    };

    let addr = format!("{}:{}", config.emergency.host, config.emergency.port);
    let runtime = RecoveryRuntime::open(config)?;
    let server = EmergencyServer::bind(&addr, runtime.emergency_context(worker))?;

    println!("RSVShop emergency recovery listening on http://{}", server.local_addr()?);
    println!("Available endpoints:");
    println!("  GET  /             - Operator page");
    println!("  POST /restore      - Restore a snapshot");
    println!("  POST /auto-recover - Automatic recovery");
    println!("  GET  /health       - Liveness");
    println!("  GET  /metrics      - Prometheus metrics");

    server.serve()?;
    Ok(())
}
