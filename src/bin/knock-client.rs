//! Knock client
//!
//! Fetches a challenge, knocks its ports and waits for the server to confirm.

use portknock::client;
use portknock::config::{parse_args, Command, Config};
use portknock::error::ServiceError;

fn print_usage() {
    println!("Usage: knock-client [--config <path>]");
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
    client::run(&config)
}
