// Command-line client for poking at a messaging server

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use uuid::Uuid;

use huddle_client::HttpTransport;
use huddle_core::attachment::AttachmentCandidate;
use huddle_core::mention::{KeyOutcome, MentionKey};
use huddle_core::reactions::ToggleOutcome;
use huddle_core::store::CacheSnapshot;
use huddle_core::{ChatConfig, ChatSession, Message, MessageStatus, SendOutcome, Viewer};

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "Huddle - school messaging from the terminal", long_about = None)]
struct Cli {
    /// Base URL of the messaging API
    #[arg(long, env = "HUDDLE_SERVER_URL", default_value = "http://localhost:3000/api")]
    server: String,

    /// Bearer token of the signed-in user
    #[arg(long, env = "HUDDLE_TOKEN")]
    token: String,

    /// Id of the signed-in user
    #[arg(long, env = "HUDDLE_USER_ID")]
    user_id: Uuid,

    /// Display name used for optimistic messages
    #[arg(long, env = "HUDDLE_USER_NAME", default_value = "me")]
    user_name: String,

    /// Institution whose roster feeds @mentions
    #[arg(long, env = "HUDDLE_INSTITUTION_ID")]
    institution: Option<Uuid>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List channels with unread counts
    Channels,

    /// Print a channel's history
    History {
        channel: Uuid,

        /// Older pages to load on top of the newest one
        #[arg(short, long, default_value = "0")]
        older: u32,
    },

    /// Send a message to a channel
    Send {
        channel: Uuid,

        /// Message text; "@name" completes against the roster
        #[arg(default_value = "")]
        text: String,

        /// File to attach
        #[arg(short, long)]
        attach: Option<PathBuf>,

        /// Id of the message being replied to
        #[arg(short, long)]
        reply_to: Option<Uuid>,
    },

    /// Send a direct message to a user
    Dm { user: Uuid, text: String },

    /// Toggle a reaction on a message
    React {
        channel: Uuid,
        message: Uuid,
        emoji: String,
    },

    /// Show roster members matching "@query"
    Mentions { query: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,huddle_core=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let transport = HttpTransport::new(&cli.server, &cli.token)?;
    let viewer = Viewer {
        user_id: cli.user_id,
        display_name: cli.user_name.clone(),
    };
    let session = ChatSession::new(Arc::new(transport), viewer, ChatConfig::from_env());
    info!("Using {} as {}", cli.server, cli.user_id);

    if let Some(institution) = cli.institution {
        if !session.load_roster(institution).await {
            warn!("Roster unavailable, @mentions are not completed");
        }
    }

    match cli.command {
        Commands::Channels => {
            for channel in session.refresh_directory().await? {
                let unread = match channel.unread_count {
                    0 => String::new(),
                    n => format!(" ({} unread)", n),
                };
                println!(
                    "{}  {:<24}{}  {}",
                    channel.id,
                    channel.display_name,
                    unread,
                    channel.last_message_summary.unwrap_or_default()
                );
            }
        }
        Commands::History { channel, older } => {
            session.select_channel(channel).await?;
            for _ in 0..older {
                if session.load_older(channel).await? == 0 {
                    break;
                }
            }
            let snapshot = ready_snapshot(&session, channel)?;
            for message in &snapshot.messages {
                print_message(message);
            }
            if snapshot.has_more {
                println!("(older messages available)");
            }
        }
        Commands::Send {
            channel,
            text,
            attach,
            reply_to,
        } => {
            let snapshot = session.select_channel(channel).await?;
            let text = complete_mentions(&session, &text);
            let mut composer = session.new_composer();
            composer.input(text.as_str(), text.len());

            if let Some(path) = attach {
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Cannot read {}", path.display()))?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "attachment".into());
                composer.attach(AttachmentCandidate::new(name, None, data))?;
            }
            if let Some(reply_id) = reply_to {
                let Some(target) = snapshot
                    .messages
                    .iter()
                    .find(|m| m.id.saved() == Some(reply_id))
                else {
                    bail!("Message {} is not among the loaded messages", reply_id);
                };
                composer.reply_to_message(target);
            }

            let draft = composer.take_draft()?;
            report_send(session.send(channel, draft).await?)?;
        }
        Commands::Dm { user, text } => {
            let mut composer = session.new_composer();
            composer.input(text.as_str(), text.len());
            let draft = composer.take_draft()?;
            report_send(session.send_direct(user, draft).await?)?;
        }
        Commands::React {
            channel,
            message,
            emoji,
        } => {
            session.select_channel(channel).await?;
            match session.toggle_reaction(channel, message, &emoji).await? {
                ToggleOutcome::Added => println!("Added {}", emoji),
                ToggleOutcome::Removed => println!("Removed {}", emoji),
                ToggleOutcome::RaceReconciled { viewer_has_reacted } => {
                    println!("Someone else changed {} meanwhile; yours: {}", emoji, viewer_has_reacted)
                }
                ToggleOutcome::RolledBack { error } => bail!("Reaction failed: {}", error),
            }
        }
        Commands::Mentions { query } => {
            let mut composer = session.new_composer();
            let text = format!("@{}", query.trim_start_matches('@'));
            composer.input(text.as_str(), text.len());
            match composer.mention_popup() {
                None => bail!("Mentions need HUDDLE_INSTITUTION_ID and a reachable roster"),
                Some(popup) if !popup.has_results() => println!("No results"),
                Some(popup) => {
                    for member in &popup.candidates {
                        println!("{}  {} ({})", member.id, member.name, member.role);
                    }
                }
            }
        }
    }

    Ok(())
}

fn ready_snapshot(session: &ChatSession, channel: Uuid) -> anyhow::Result<CacheSnapshot> {
    match session.view(channel) {
        huddle_core::store::CacheLookup::Ready(snapshot) => Ok(snapshot),
        _ => bail!("Channel {} is not loaded", channel),
    }
}

/// Complete every "@prefix" word to the first roster match.
fn complete_mentions(session: &ChatSession, text: &str) -> String {
    let mut composer = session.new_composer();
    let mut completed = String::new();
    for word in text.split(' ') {
        if !completed.is_empty() {
            completed.push(' ');
        }
        let current = format!("{}{}", completed, word);
        composer.input(current.as_str(), current.len());
        if !composer.mention_popup().is_some_and(|popup| !popup.query.is_empty()) {
            completed = current;
            continue;
        }
        match composer.handle_key(MentionKey::Enter) {
            KeyOutcome::Committed(commit) => completed = commit.text.trim_end().to_string(),
            _ => completed = current,
        }
    }
    completed
}

fn print_message(message: &Message) {
    let id = message
        .id
        .saved()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "pending".into());
    let status = match &message.status {
        MessageStatus::Delivered => String::new(),
        MessageStatus::Pending => " [sending]".into(),
        MessageStatus::Failed { reason } => format!(" [failed: {}]", reason),
    };
    let reactions: Vec<String> = message
        .reactions
        .iter()
        .map(|r| format!("{} {}", r.emoji, r.count()))
        .collect();

    println!(
        "{}  {}  {}{}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        id,
        message.author_name,
        status
    );
    if let Some(reply) = &message.reply_to {
        println!("    > {}: {}", reply.author_name, reply.body_excerpt);
    }
    if let Some(body) = message.body.as_deref().filter(|b| !b.trim().is_empty()) {
        println!("    {}", body);
    }
    if let Some(file) = &message.attachment {
        println!("    [{}] {}", file.mime_or_ext, file.name);
    }
    if !reactions.is_empty() {
        println!("    {}", reactions.join("  "));
    }
}

fn report_send(outcome: SendOutcome) -> anyhow::Result<()> {
    match outcome {
        SendOutcome::Delivered(message) => {
            println!("Sent {}", message.id.saved().unwrap_or_default());
            Ok(())
        }
        SendOutcome::Failed { error, .. } => bail!("Message not sent: {}", error),
    }
}
