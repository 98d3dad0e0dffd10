use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bazar_core::{ChatEngine, CoreConfig, MessageKind};

#[derive(Parser)]
#[command(name = "bazar-cli")]
#[command(about = "Terminal harness for the chat synchronization engine")]
struct Cli {
    /// WebSocket endpoint of the messaging server
    #[arg(long, default_value = "ws://localhost:8080/chat")]
    socket_url: String,

    /// Base URL of the history REST API
    #[arg(long, default_value = "http://localhost:8080/api")]
    api_base: String,

    /// Base URL of the AI assistant API
    #[arg(long, default_value = "http://localhost:8080/ai")]
    assistant_base: String,

    /// Bearer token (or set BAZAR_TOKEN)
    #[arg(long, env = "BAZAR_TOKEN")]
    token: String,

    /// Acting user id
    #[arg(long)]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a conversation and keep following new messages
    Tail {
        /// Conversation id (use the ai-assistant-<user> form for the assistant)
        conversation_id: String,
    },

    /// Send one message to a conversation
    Send {
        conversation_id: String,
        content: String,
    },

    /// Ask the AI assistant a question
    Ask { content: String },

    /// Dump a conversation's full history, oldest first
    History { conversation_id: String },

    /// Show the server's hidden/deleted records for this user
    State,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = CoreConfig {
        socket_url: cli.socket_url.clone(),
        api_base: cli.api_base.clone(),
        assistant_base: cli.assistant_base.clone(),
        ..CoreConfig::default()
    };
    let engine =
        ChatEngine::new(cfg, &cli.token, cli.user.clone()).context("failed to start engine")?;

    match cli.command {
        Commands::Tail { conversation_id } => {
            let conversation = engine.open_conversation(&conversation_id).await?;
            let _ = conversation.mark_as_read().await;
            let mut printed = 0;
            loop {
                let messages = conversation.messages();
                for message in &messages[printed..] {
                    print_message(message);
                }
                printed = messages.len();
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        Commands::Send {
            conversation_id,
            content,
        } => {
            let conversation = engine.open_conversation(&conversation_id).await?;
            conversation.send(content, MessageKind::Text).await?;
            println!("sent");
        }
        Commands::Ask { content } => {
            let conversation = engine.open_assistant().await?;
            conversation.send(content, MessageKind::Text).await?;
            if let Some(reply) = conversation.messages().last() {
                print_message(reply);
            }
        }
        Commands::History { conversation_id } => {
            let conversation = engine.open_conversation(&conversation_id).await?;
            while conversation.has_more() {
                conversation.load_more().await?;
            }
            for message in conversation.messages() {
                print_message(&message);
            }
        }
        Commands::State => {
            let records = engine.conversation_state().await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}

fn print_message(message: &bazar_core::Message) {
    let seen = if message.read_at.is_some() { " ✓" } else { "" };
    println!(
        "[{}] {}: {}{}",
        message.sent_at,
        message.sender_id,
        message.text(),
        seen
    );
}
