// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use wicket::config::Config;
use wicket::proto::{encode_custom, latin1};

#[derive(Parser)]
#[command(
    name = "wicket",
    version,
    about = "RS-485 access-control field controller."
)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    subcommand: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Encode a protocol frame and print it (bench/test tooling).
    Frame {
        /// Module address (1..=99 on the wire).
        address: u8,
        /// Two-character opcode, e.g. S0, K1, P3.
        op: String,
        /// Payload text (Latin-1).
        #[arg(default_value = "")]
        payload: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.subcommand {
        Some(Commands::Frame { address, op, payload }) => {
            let frame = encode_custom(address, &op, payload.as_bytes());
            let hex: Vec<String> = frame.iter().map(|b| format!("{b:02X}")).collect();
            println!("{}", hex.join(" "));
            println!("{}", latin1(&frame).escape_default());
        }
        None => {
            let config = cli.config;

            if let Err(e) = config.validate() {
                eprintln!("error: {e}");
                std::process::exit(2);
            }

            if let Err(e) = wicket::run::run(config).await {
                error!("fatal: {e:#}");
                std::process::exit(1);
            }
        }
    }
}
