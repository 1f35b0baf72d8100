//! CLI surface: `serve` runs the orchestrator process; the `pipelines`
//! subcommands are a thin reqwest client against the dashboard API, for
//! operators who don't want to reach for curl.

use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "squadron-server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the orchestrator process and dashboard API.
    Serve,
    /// List loaded pipeline definitions.
    Pipelines {
        #[command(subcommand)]
        action: PipelinesAction,
    },
}

#[derive(Subcommand)]
pub enum PipelinesAction {
    /// List loaded pipeline definitions.
    List,
    /// List pipeline runs.
    Runs {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        pipeline_name: Option<String>,
    },
    /// Show one run's detail.
    Run { id: String },
    /// Cancel a run.
    Cancel { id: String },
}

fn dashboard_base() -> String {
    std::env::var("SQUADRON_DASHBOARD_URL").unwrap_or_else(|_| "http://127.0.0.1:8787".to_string())
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

fn authed(builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match std::env::var("SQUADRON_DASHBOARD_TOKEN") {
        Ok(token) if !token.is_empty() => builder.bearer_auth(token),
        _ => builder,
    }
}

pub async fn run_client_command(command: Command) -> anyhow::Result<()> {
    let base = dashboard_base();
    let http = client();

    let (url, body): (String, Option<Value>) = match command {
        Command::Serve => unreachable!("serve is dispatched before reaching the client path"),
        Command::Pipelines { action } => match action {
            PipelinesAction::List => (format!("{base}/pipelines"), None),
            PipelinesAction::Runs { status, pipeline_name } => {
                let mut url = format!("{base}/pipelines/runs?");
                if let Some(s) = status {
                    url.push_str(&format!("status={s}&"));
                }
                if let Some(p) = pipeline_name {
                    url.push_str(&format!("pipeline_name={p}&"));
                }
                (url, None)
            }
            PipelinesAction::Run { id } => (format!("{base}/pipelines/runs/{id}"), None),
            PipelinesAction::Cancel { id } => {
                let resp = authed(http.post(format!("{base}/pipelines/runs/{id}/cancel")))
                    .send()
                    .await?;
                println!("{}", resp.status());
                return Ok(());
            }
        },
    };

    let resp = authed(http.get(&url)).send().await?;
    let text = resp.text().await?;
    match serde_json::from_str::<Value>(&text) {
        Ok(v) => println!("{}", serde_json::to_string_pretty(&v)?),
        Err(_) => println!("{text}"),
    }
    Ok(())
}
