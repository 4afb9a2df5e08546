use clap::Parser;
use ptc::cli::Cli;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    ptc::cli::run(Cli::parse()).await
}
