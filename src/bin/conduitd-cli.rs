//! `conduitd-cli`: a thin HTTP client for the management surface `conduitd`
//! exposes, mirroring the same channel lifecycle operations `rest_api`
//! serves so an operator never has to hand-craft requests.

use clap::{Parser, Subcommand};
use serde_json::json;

/// Command-line client for a running `conduitd` process.
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Base URL of the management HTTP surface.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    endpoint: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reports whether the management surface is reachable.
    Health,
    /// Lists every currently deployed channel.
    ListChannels,
    /// Deploys a channel from a JSON configuration file.
    Deploy {
        /// Channel id to deploy as.
        id: String,
        /// Path to a JSON file holding the channel's `ChannelConfig`.
        config_path: std::path::PathBuf,
    },
    /// Marks a deployed channel running.
    Start {
        /// Channel id.
        id: String,
    },
    /// Marks a running channel stopping.
    Stop {
        /// Channel id.
        id: String,
    },
    /// Removes a channel from the registry.
    Undeploy {
        /// Channel id.
        id: String,
    },
    /// Triggers an out-of-cycle pruner run and prints the summary.
    PruneNow,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();

    match args.command {
        Command::Health => {
            let response = client.get(format!("{}/api/v1/health", args.endpoint)).send().await?;
            println!("{}", response.text().await?);
        }
        Command::ListChannels => {
            let response = client.get(format!("{}/api/v1/channels", args.endpoint)).send().await?;
            println!("{}", response.text().await?);
        }
        Command::Deploy { id, config_path } => {
            let body = std::fs::read_to_string(&config_path)?;
            let config: serde_json::Value = serde_json::from_str(&body)?;
            let response =
                client.post(format!("{}/api/v1/channels/{id}/deploy", args.endpoint)).json(&config).send().await?;
            println!("deploy {id}: {}", response.status());
        }
        Command::Start { id } => {
            let response = client.post(format!("{}/api/v1/channels/{id}/start", args.endpoint)).send().await?;
            println!("start {id}: {}", response.status());
        }
        Command::Stop { id } => {
            let response = client.post(format!("{}/api/v1/channels/{id}/stop", args.endpoint)).send().await?;
            println!("stop {id}: {}", response.status());
        }
        Command::Undeploy { id } => {
            let response = client.delete(format!("{}/api/v1/channels/{id}", args.endpoint)).send().await?;
            println!("undeploy {id}: {}", response.status());
        }
        Command::PruneNow => {
            let response = client
                .post(format!("{}/api/v1/extensions/datapruner/_start", args.endpoint))
                .json(&json!({}))
                .send()
                .await?;
            println!("{}", response.text().await?);
        }
    }

    Ok(())
}
