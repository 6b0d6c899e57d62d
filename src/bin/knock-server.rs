//! Challenge server
//!
//! Issues port tuples on `GET /` and confirms knocks on `GET /session`.

use std::net::TcpListener;
use std::sync::Arc;

use portknock::config::{parse_args, Command, Config};
use portknock::error::ServiceError;
use portknock::server::Server;
use tracing::info;

fn print_usage() {
    println!("Usage: knock-server [--config <path>]");
    println!();
    println!("Endpoints:");
    println!("  GET /                           Issue a challenge");
    println!("  GET /session?ports=<p,..,>&pid= Confirm a knock");
    println!("  GET /metrics                    Export counters");
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
    info!(
        base = config.port_base,
        range = config.port_range,
        tuple_size = config.tuple_size(),
        tuples = config.tuples_per_challenge(),
        "configuration loaded"
    );

    let listener = TcpListener::bind(&config.http_addr)?;
    let server = Arc::new(Server::new(&config)?);
    server.run(listener, &config)
}
