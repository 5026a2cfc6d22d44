use std::time::Instant;

use clap::Parser;
use promigrate_cli::cli::{CLI, run};
use promigrate_cli::initializers::init_tracing;

#[tokio::main]
async fn main() {
    let started_at = Instant::now();
    let CLI { opts } = CLI::parse();

    init_tracing(&opts);

    let code = run(&opts, started_at).await;
    std::process::exit(code);
}
