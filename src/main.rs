mod api;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use api::AdminClient;
use courier_backend::settings::SettingsStatus;
use courier_backend::types::{BroadcastAttempt, BroadcastSummary, ConversationInfo};

#[derive(Debug, Parser)]
#[command(
    name = "courier",
    about = "Operator console for the courier Telegram agent",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "COURIER_ADMIN_URL",
        default_value = "http://127.0.0.1:8788",
        help = "Base URL of the courier backend admin API"
    )]
    admin_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show resolved settings and where each value comes from
    Status,
    /// Show or replace the system instructions
    Instructions {
        #[command(subcommand)]
        action: InstructionsAction,
    },
    /// Show or replace the broadcast target list and start message
    Targets {
        #[command(subcommand)]
        action: TargetsAction,
    },
    /// List conversations the agent has seen, for copying into the target list
    Conversations,
    /// Send the start message to every target now
    Broadcast,
    /// Show recent broadcast attempts, newest first
    Log {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
enum InstructionsAction {
    Show,
    Set { text: String },
}

#[derive(Debug, Subcommand)]
enum TargetsAction {
    Show,
    Set {
        /// Comma, semicolon or newline separated conversation ids
        targets: String,
        /// New start message; the current one is kept when omitted
        #[arg(long)]
        message: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,courier=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = AdminClient::new(&cli.admin_url);
    tracing::debug!("Admin API: {}", client.base_url());

    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    rt.block_on(run(client, cli.command))
}

async fn run(client: AdminClient, command: Command) -> Result<()> {
    match command {
        Command::Status => {
            client.health().await.context("backend is not reachable")?;
            print!("{}", render_status(&client.status().await?));
        }
        Command::Instructions { action } => match action {
            InstructionsAction::Show => println!("{}", client.get_instructions().await?),
            InstructionsAction::Set { text } => {
                let saved = client.set_instructions(&text).await?;
                println!("System instructions saved ({} chars).", saved.chars().count());
            }
        },
        Command::Targets { action } => match action {
            TargetsAction::Show => {
                let view = client.get_broadcast_settings().await?;
                println!("targets: {}", view.targets_raw);
                println!("start message: {}", view.start_message);
            }
            TargetsAction::Set { targets, message } => {
                let message = match message {
                    Some(message) => message,
                    None => client.get_broadcast_settings().await?.start_message,
                };
                let response = client.set_broadcast_settings(&targets, &message).await?;
                println!(
                    "Saved {} target(s): {}",
                    response.settings.targets.len(),
                    response.settings.targets_raw
                );
                if !response.rejected.is_empty() {
                    println!("Ignored invalid ids: {}", response.rejected.join(", "));
                }
            }
        },
        Command::Conversations => {
            print!("{}", render_conversations(&client.list_conversations().await?));
        }
        Command::Broadcast => {
            println!("{}", render_summary(&client.run_broadcast().await?));
        }
        Command::Log { limit } => {
            print!("{}", render_attempts(&client.recent_attempts(limit).await?));
        }
    }
    Ok(())
}

fn render_status(status: &SettingsStatus) -> String {
    let broadcast = &status.settings.broadcast;
    let targets = broadcast
        .targets
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "store: {}\ninstructions ({:?}): {}\ntargets ({:?}): {}\nstart message: {}\n",
        if status.store_available { "available" } else { "unavailable, using defaults" },
        status.instructions_source,
        status.settings.system_instructions,
        status.broadcast_source,
        if targets.is_empty() { "-" } else { targets.as_str() },
        broadcast.start_message,
    )
}

fn render_conversations(conversations: &[ConversationInfo]) -> String {
    if conversations.is_empty() {
        return "No conversations seen yet.\n".to_string();
    }
    conversations
        .iter()
        .map(|c| format!("{:>16}  {:<8} {}\n", c.id.get(), c.kind.as_db_str(), c.display_name))
        .collect()
}

fn render_summary(summary: &BroadcastSummary) -> String {
    let mut out = format!(
        "Broadcast {}: {} target(s), {} sent, {} failed",
        summary.run_id, summary.total, summary.succeeded, summary.failed
    );
    if summary.log_failures > 0 {
        out.push_str(&format!(" ({} not recorded)", summary.log_failures));
    }
    out
}

fn render_attempts(attempts: &[BroadcastAttempt]) -> String {
    if attempts.is_empty() {
        return "No broadcast attempts recorded.\n".to_string();
    }
    attempts
        .iter()
        .map(|a| {
            let outcome = if a.outcome.is_success() { "ok" } else { "FAILED" };
            let mut line = format!(
                "{}  {:>16}  {:<8} {:<20} {}",
                a.attempted_at.format("%Y-%m-%d %H:%M:%S"),
                a.target.get(),
                a.target_kind.as_db_str(),
                a.target_name,
                outcome
            );
            if let Some(detail) = &a.error_detail {
                line.push_str(&format!(": {}", detail));
            }
            line.push('\n');
            line
        })
        .collect()
}
