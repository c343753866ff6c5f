//! Klaviyo source connector CLI
//!
//! Protocol messages on stdout, logs on stderr, exit 0 on success.

use clap::Parser;
use klaviyo_source::cli::{Cli, Runner};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let runner = Runner::new(cli);

    if let Err(e) = runner.run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
