use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use chat_sync::{
    ChatClient, ConversationApi, ConversationId, FileConfig, HttpConversationApi, Role, SyncConfig,
    SyncError, WsTransport,
};

#[derive(Parser)]
#[command(name = "chat-sync")]
#[command(about = "Talk to a streaming chat backend from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file (CHAT_SYNC_* env vars override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Bearer token for the API and the live connection
    #[arg(long, global = true, env = "CHAT_SYNC_TOKEN", default_value = "")]
    token: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List conversations
    List,

    /// Print a conversation's messages
    Show {
        /// Conversation id
        id: String,
    },

    /// Send a message and stream the reply
    Send {
        content: String,

        /// Continue an existing conversation instead of starting a new one
        #[arg(long)]
        conversation: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "chat_sync=debug,warn"
    } else {
        "chat_sync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let file_config = FileConfig::load(cli.config.as_deref()).context("loading config")?;
    let config = SyncConfig::from_file(&file_config);
    let api = HttpConversationApi::new(&config.api, cli.token.clone())?;

    match cli.command {
        Commands::List => list_command(&api).await,
        Commands::Show { id } => show_command(&api, &ConversationId::from(id)).await,
        Commands::Send {
            content,
            conversation,
        } => send_command(api, &config, &cli.token, &content, conversation).await,
    }
}

/// Point at the backend address when the failure is a connectivity one.
fn explain(err: SyncError) -> anyhow::Error {
    if err.is_transient() {
        anyhow::Error::new(err).context("backend unreachable, check api.base_url")
    } else {
        err.into()
    }
}

async fn list_command(api: &HttpConversationApi) -> Result<()> {
    let conversations = api.list_conversations().await.map_err(explain)?;
    if conversations.is_empty() {
        println!("No conversations.");
        return Ok(());
    }
    for convo in conversations {
        println!(
            "{}\t{}\t{}",
            convo.id,
            convo.updated_at.format("%Y-%m-%d %H:%M"),
            convo.title
        );
    }
    Ok(())
}

async fn show_command(api: &HttpConversationApi, id: &ConversationId) -> Result<()> {
    let detail = api.get_conversation(id).await.map_err(explain)?;
    println!("# {}", detail.conversation.title);
    for message in detail.messages {
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        println!("\n[{who}] {}", message.content);
    }
    Ok(())
}

async fn send_command(
    api: HttpConversationApi,
    config: &SyncConfig,
    token: &str,
    content: &str,
    conversation: Option<String>,
) -> Result<()> {
    let client = ChatClient::new(api, WsTransport::new(), config);
    let cancel = CancellationToken::new();
    let event_loop = client.spawn_event_loop(cancel.clone());

    if !client.connect(token).await {
        warn!("live connection unavailable, the reply will not stream");
    }
    if let Some(id) = conversation {
        client
            .load(&ConversationId::from(id))
            .await
            .map_err(explain)?;
    }

    let mut updates = client.subscribe_snapshot();
    let placeholder = client.send(content, None).await.map_err(explain)?;
    info!(message_id = %placeholder, "waiting for reply");

    let mut printed = 0;
    let reply = loop {
        let snapshot = updates.borrow_and_update().clone();
        let Some(reply) = snapshot.messages.iter().find(|m| m.id == placeholder).cloned() else {
            bail!("reply disappeared before it finished");
        };
        if let Some(fresh) = reply.content.get(printed..) {
            print!("{fresh}");
            io::stdout().flush()?;
            printed = reply.content.len();
        }
        if reply.status.is_terminal() {
            break reply;
        }
        if updates.changed().await.is_err() {
            bail!("client shut down");
        }
    };
    println!();

    if let Some(error) = reply.metadata.error {
        eprintln!("error: {error}");
    }
    if let Some(id) = client.snapshot().active_conversation {
        eprintln!("conversation: {id}");
    }

    cancel.cancel();
    event_loop.await?;
    client.disconnect();
    Ok(())
}
