use std::io::Read;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use droplet_driver::{cli, DriverSettings, DropletDriver};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // stdout carries the response; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading request from stdin")?;

    let driver = DropletDriver::new(DriverSettings::from_env());
    let result = cli::dispatch(&driver, args.operation, &input).await;
    if let Err(e) = &result {
        tracing::error!("[driver] {} failed: {}", args.operation.as_str(), e);
    }

    println!("{}", serde_json::to_string(&cli::render(&result)).context("encoding response")?);
    Ok(if result.is_ok() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
