//! Command-line interface: `serve` runs the control plane; `rule`,
//! `notifier` and `query` are thin admin-API clients for scripting.

use clap::{Parser, Subcommand};

use crate::core::error::Result;

#[derive(Debug, Parser)]
#[command(name = "monitor-core", version, about = "Monitoring, alerting and notification control plane")]
pub struct Cli {
    /// Increase log verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn verbosity(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the ingest/admin/push services and background loops.
    Serve {
        #[arg(long, default_value = "0.0.0.0:9090")]
        grpc_addr: String,
        #[arg(long, default_value = "0.0.0.0:9091")]
        http_addr: String,
    },
    /// Manage alert rules via the admin HTTP API.
    Rule {
        #[command(subcommand)]
        action: RuleAction,
        #[arg(long, default_value = "http://127.0.0.1:9091")]
        admin_url: String,
    },
    /// Manage notifiers via the admin HTTP API.
    Notifier {
        #[command(subcommand)]
        action: NotifierAction,
        #[arg(long, default_value = "http://127.0.0.1:9091")]
        admin_url: String,
    },
    /// Query stored metrics via the admin HTTP API.
    Query {
        #[arg(long)]
        metric: String,
        #[arg(long)]
        category: String,
        #[arg(long, default_value = "http://127.0.0.1:9091")]
        admin_url: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum RuleAction {
    List,
    Delete { id: String },
    Enable { id: String },
    Disable { id: String },
}

#[derive(Debug, Subcommand)]
pub enum NotifierAction {
    List,
    Delete { id: String },
    Enable { id: String },
    Disable { id: String },
    Types,
}

/// Parse `std::env::args()` into a `Cli`.
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Dispatch a parsed command against the running admin API (or, for
/// `serve`, start the services themselves — handled by the caller in
/// `main.rs` since it owns the long-lived service handles).
pub async fn handle_admin_command(command: &Commands) -> Result<()> {
    let client = reqwest::Client::new();

    match command {
        Commands::Serve { .. } => unreachable!("serve is handled directly by main"),
        Commands::Rule { action, admin_url } => match action {
            RuleAction::List => {
                let rules: serde_json::Value = client
                    .get(format!("{admin_url}/alerts/rules"))
                    .send()
                    .await?
                    .json()
                    .await?;
                println!("{}", serde_json::to_string_pretty(&rules).unwrap_or_default());
            }
            RuleAction::Delete { id } => {
                client.delete(format!("{admin_url}/alerts/rules/{id}")).send().await?;
                println!("deleted rule {id}");
            }
            RuleAction::Enable { id } => {
                client
                    .post(format!("{admin_url}/alerts/rules/{id}/enabled"))
                    .json(&serde_json::json!({"enabled": true}))
                    .send()
                    .await?;
                println!("enabled rule {id}");
            }
            RuleAction::Disable { id } => {
                client
                    .post(format!("{admin_url}/alerts/rules/{id}/enabled"))
                    .json(&serde_json::json!({"enabled": false}))
                    .send()
                    .await?;
                println!("disabled rule {id}");
            }
        },
        Commands::Notifier { action, admin_url } => match action {
            NotifierAction::List => {
                let notifiers: serde_json::Value = client
                    .get(format!("{admin_url}/notifiers"))
                    .send()
                    .await?
                    .json()
                    .await?;
                println!("{}", serde_json::to_string_pretty(&notifiers).unwrap_or_default());
            }
            NotifierAction::Delete { id } => {
                client.delete(format!("{admin_url}/notifiers/{id}")).send().await?;
                println!("deleted notifier {id}");
            }
            NotifierAction::Enable { id } => {
                client
                    .post(format!("{admin_url}/notifiers/{id}/enabled"))
                    .json(&serde_json::json!({"enabled": true}))
                    .send()
                    .await?;
                println!("enabled notifier {id}");
            }
            NotifierAction::Disable { id } => {
                client
                    .post(format!("{admin_url}/notifiers/{id}/enabled"))
                    .json(&serde_json::json!({"enabled": false}))
                    .send()
                    .await?;
                println!("disabled notifier {id}");
            }
            NotifierAction::Types => {
                let types: serde_json::Value = client
                    .get(format!("{admin_url}/notifiers/types"))
                    .send()
                    .await?
                    .json()
                    .await?;
                println!("{}", serde_json::to_string_pretty(&types).unwrap_or_default());
            }
        },
        Commands::Query { metric, category, admin_url } => {
            let points: serde_json::Value = client
                .get(format!("{admin_url}/query/points"))
                .query(&[("metric", metric.as_str()), ("category", category.as_str())])
                .send()
                .await?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&points).unwrap_or_default());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_escalates_with_flag_count() {
        let cli = Cli::parse_from(["monitor-core", "-vv", "rule", "list"]);
        assert_eq!(cli.verbosity(), tracing::Level::TRACE);
    }

    #[test]
    fn parses_rule_delete() {
        let cli = Cli::parse_from(["monitor-core", "rule", "delete", "r1"]);
        match cli.command {
            Commands::Rule { action: RuleAction::Delete { id }, .. } => assert_eq!(id, "r1"),
            _ => panic!("expected rule delete"),
        }
    }
}
