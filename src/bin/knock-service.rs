//! Knock service
//!
//! Binds the knock range, attributes connections to local processes and
//! reports completed knock sequences to the challenge server.

use std::sync::Arc;

use portknock::config::{parse_args, Command, Config};
use portknock::error::ServiceError;
use portknock::knock::KnockAccumulator;
use portknock::listener::{bind_ports, HttpReporter, KnockService};
use portknock::resolver::ProcNetResolver;
use tracing::{error, info};

fn print_usage() {
    println!("Usage: knock-service [--config <path>]");
    println!();
    println!("Binds port_base..port_base+port_range and reports knocks to http_addr.");
}

fn main() -> Result<(), ServiceError> {
    let path = match parse_args(std::env::args().skip(1))? {
        Command::Help => {
            print_usage();
            return Ok(());
        }
        Command::Run(path) => path,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::load(path.as_deref())?;
    let listeners = bind_ports(&config.ports())?;

    let accumulator =
        KnockAccumulator::new(config.tuple_size(), config.tolerance, config.knock_ttl());
    info!(batch_len = accumulator.batch_len(), "knock service starting");

    let service = Arc::new(KnockService::new(
        accumulator,
        ProcNetResolver::new(),
        HttpReporter::new(config.http_addr.clone()),
    ));

    for handle in service.run(listeners, &config) {
        if handle.join().is_err() {
            error!("knock service thread panicked");
        }
    }
    Ok(())
}
