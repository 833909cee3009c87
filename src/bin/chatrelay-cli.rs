//! Thin command-line client for the management HTTP surface, for operators who would rather
//! not curl JSON by hand.

use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;

/// Talks to a running `chatrelay` instance's management API.
#[derive(Parser)]
#[command(name = "chatrelay-cli", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Base URL of the management HTTP surface.
    #[arg(long, env = "CHATRELAY_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List configured instances.
    Instances,
    /// List configured platforms.
    Platforms,
    /// List configured rules.
    Rules,
    /// List in-memory listeners.
    Listeners,
    /// Print a point-in-time resource snapshot.
    Resources,
    /// Enable an instance.
    Enable {
        /// Instance id.
        instance_id: String,
    },
    /// Disable an instance.
    Disable {
        /// Instance id.
        instance_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = Client::new();

    let response = match args.command {
        Command::Instances => client.get(format!("{}/api/instances", args.api_url)).send().await?,
        Command::Platforms => client.get(format!("{}/api/platforms", args.api_url)).send().await?,
        Command::Rules => client.get(format!("{}/api/rules", args.api_url)).send().await?,
        Command::Listeners => client.get(format!("{}/api/listeners", args.api_url)).send().await?,
        Command::Resources => {
            client.get(format!("{}/api/system/resources", args.api_url)).send().await?
        }
        Command::Enable { instance_id } => {
            client
                .post(format!("{}/api/instances/{instance_id}/enable", args.api_url))
                .send()
                .await?
        }
        Command::Disable { instance_id } => {
            client
                .post(format!("{}/api/instances/{instance_id}/disable", args.api_url))
                .send()
                .await?
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body: Value = response.json().await.unwrap_or(Value::Null);
        anyhow::bail!("request failed with {status}: {body}");
    }

    let body: Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
