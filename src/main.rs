//! welfare-chat - command line client for the welfare portal support chat
//!
//! Member and admin chat views over the portal's webhooks, plus an offline
//! `aggregate` command for inspecting raw webhook payloads.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use welfare_chat_sync::client::{detect_shape, extract_records, ResponseShape, WebhookClient};
use welfare_chat_sync::config::Config;
use welfare_chat_sync::conversation::{Conversation, Conversations};
use welfare_chat_sync::message::{CanonicalMessage, UserId};
use welfare_chat_sync::session::{Role, Session, SessionUser};
use welfare_chat_sync::sync::{
    ChatSync, HistorySource, InboxSource, RecordSource, SyncTrigger, ThreadSource,
};

/// Welfare chat - member and admin support chat
#[derive(Parser)]
#[command(name = "welfare-chat")]
#[command(about = "Welfare portal support chat from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the current user
    Login {
        /// User id
        #[arg(long)]
        id: i64,

        /// Organization id
        #[arg(long)]
        org_id: Option<i64>,

        /// Full name
        #[arg(long)]
        name: Option<String>,

        /// Phone number
        #[arg(long)]
        phone: Option<String>,

        /// Role (member, admin, treasurer, secretary, shop_admin)
        #[arg(long, default_value = "member")]
        role: String,
    },

    /// Forget the current user
    Logout,

    /// Show the current user
    Whoami,

    /// Print your conversation with the support team
    History,

    /// List conversations, most recent first (admin)
    Inbox {
        /// Every conversation, not only the admin queue
        #[arg(long)]
        all: bool,
    },

    /// Print one member's thread (admin)
    Thread {
        /// Member user id
        user_id: String,
    },

    /// Poll and print new messages until Ctrl-C
    Watch {
        /// Poll interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Watch the admin inbox instead of your own conversation
        #[arg(long)]
        inbox: bool,
    },

    /// Send a message to the support team
    Send {
        /// Message text
        text: String,
    },

    /// Reply into a member's conversation (admin)
    Reply {
        /// Member user id
        user_id: String,

        /// Reply text
        text: String,
    },

    /// Group a saved webhook payload into conversations (file or "-")
    Aggregate {
        /// JSON file, or "-" for stdin
        input: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Arc::new(Config::from_env()?);

    match cli.command {
        Commands::Login {
            id,
            org_id,
            name,
            phone,
            role,
        } => cmd_login(config, id, org_id, name, phone, role),
        Commands::Logout => cmd_logout(config),
        Commands::Whoami => cmd_whoami(config),
        Commands::History => cmd_history(config).await,
        Commands::Inbox { all } => cmd_inbox(config, all).await,
        Commands::Thread { user_id } => cmd_thread(config, &user_id).await,
        Commands::Watch { interval, inbox } => cmd_watch(config, interval, inbox).await,
        Commands::Send { text } => cmd_send(config, &text).await,
        Commands::Reply { user_id, text } => cmd_reply(config, &user_id, &text).await,
        Commands::Aggregate { input } => cmd_aggregate(&config, &input),
    }
}

// ============================================================================
// Session commands
// ============================================================================

fn cmd_login(
    config: Arc<Config>,
    id: i64,
    org_id: Option<i64>,
    name: Option<String>,
    phone: Option<String>,
    role: String,
) -> anyhow::Result<()> {
    let user = SessionUser {
        id,
        org_id,
        full_name: name,
        first_name: None,
        phone,
        role: Role::from(role),
    };
    let session = Session::anonymous(config).login(user)?;
    let user = session.require_user()?;
    println!(
        "Logged in as {} ({})",
        user.display_name(),
        String::from(user.role.clone())
    );
    Ok(())
}

fn cmd_logout(config: Arc<Config>) -> anyhow::Result<()> {
    let session = Session::restore(config)?;
    if session.user.is_none() {
        println!("Not logged in");
        return Ok(());
    }
    session.logout()?;
    println!("Logged out");
    Ok(())
}

fn cmd_whoami(config: Arc<Config>) -> anyhow::Result<()> {
    let session = Session::restore(config)?;
    match &session.user {
        Some(user) => {
            println!("{} (id {})", user.display_name(), user.id);
            println!("  role:  {}", String::from(user.role.clone()));
            println!("  org:   {}", display_opt(session.org_id()));
            println!("  phone: {}", user.phone.as_deref().unwrap_or("-"));
            println!("  admin: {}", user.is_admin());
        }
        None => println!("Not logged in"),
    }
    Ok(())
}

fn display_opt(value: Option<i64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

// ============================================================================
// Chat commands
// ============================================================================

fn client_for(session: &Session) -> anyhow::Result<Arc<WebhookClient>> {
    Ok(Arc::new(WebhookClient::new(&session.config, session.org_id())?))
}

fn require_admin(session: &Session) -> anyhow::Result<i64> {
    let user = session.require_user()?;
    if !user.is_admin() {
        bail!("{} is not a chat admin", user.display_name());
    }
    session
        .org_id()
        .context("No organization id; set WELFARE_ORG_ID or log in with --org-id")
}

fn parse_user_id(raw: &str) -> anyhow::Result<UserId> {
    UserId::from_value(&Value::String(raw.to_string()))
        .with_context(|| format!("Invalid user id: {:?}", raw))
}

fn history_sync(session: &Session) -> anyhow::Result<ChatSync<HistorySource>> {
    let user = session.require_user()?;
    let source = HistorySource::new(client_for(session)?, user.user_id());
    Ok(ChatSync::new(source, session.config.aliases.clone()))
}

fn format_message(message: &CanonicalMessage) -> String {
    let label = message.source_label();
    let sender = if label.is_empty() {
        message.sender.as_str().to_string()
    } else {
        format!("{} via {}", message.sender.as_str(), label)
    };
    format!("[{}] {}: {}", message.timestamp, sender, message.text)
}

fn print_thread(conversation: &Conversation) {
    println!(
        "{} ({}) {}",
        conversation.user_name, conversation.user_id, conversation.phone
    );
    for message in &conversation.messages {
        println!("  {}", format_message(message));
    }
}

fn print_inbox(conversations: &Conversations) {
    if conversations.is_empty() {
        println!("No conversations");
        return;
    }
    for conversation in conversations.by_recency() {
        println!(
            "{:<24} {:>8}  {:<26} {}",
            conversation.user_name,
            conversation.user_id.to_string(),
            conversation.last_message_time,
            conversation.preview(50)
        );
    }
}

async fn cmd_history(config: Arc<Config>) -> anyhow::Result<()> {
    let session = Session::restore(config)?;
    let sync = history_sync(&session)?;
    sync.sync(SyncTrigger::Initial).await?;

    let user_id = session.require_user()?.user_id();
    match sync.conversation(&user_id).await {
        Some(conversation) => println!("{}", serde_json::to_string_pretty(&conversation)?),
        None => println!("No messages yet"),
    }
    Ok(())
}

async fn cmd_inbox(config: Arc<Config>, all: bool) -> anyhow::Result<()> {
    let session = Session::restore(config)?;
    let org_id = require_admin(&session)?;
    let client = client_for(&session)?;
    let source = if all {
        InboxSource::all(client, org_id)
    } else {
        InboxSource::admin(client, org_id)
    };
    let sync = ChatSync::new(source, session.config.aliases.clone());
    sync.sync(SyncTrigger::Initial).await?;
    print_inbox(&sync.snapshot().await);
    Ok(())
}

async fn cmd_thread(config: Arc<Config>, user_id: &str) -> anyhow::Result<()> {
    let session = Session::restore(config)?;
    require_admin(&session)?;
    let user_id = parse_user_id(user_id)?;
    let source = ThreadSource::new(client_for(&session)?, user_id.clone());
    let sync = ChatSync::new(source, session.config.aliases.clone());
    sync.sync(SyncTrigger::Initial).await?;

    match sync.conversation(&user_id).await {
        Some(conversation) => print_thread(&conversation),
        None => println!("No messages for {}", user_id),
    }
    Ok(())
}

async fn cmd_watch(config: Arc<Config>, interval: Option<u64>, inbox: bool) -> anyhow::Result<()> {
    let session = Session::restore(config)?;
    let every = interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| session.config.poll_interval());
    if every.is_zero() {
        bail!("Interval must be positive");
    }

    if inbox {
        let org_id = require_admin(&session)?;
        let source = InboxSource::admin(client_for(&session)?, org_id);
        watch_loop(ChatSync::new(source, session.config.aliases.clone()), every).await
    } else {
        watch_loop(history_sync(&session)?, every).await
    }
}

/// Print everything once, then each newly merged message as polls bring it in
async fn watch_loop<S: RecordSource + 'static>(
    sync: ChatSync<S>,
    every: Duration,
) -> anyhow::Result<()> {
    sync.sync(SyncTrigger::Initial).await?;
    let mut printed: HashMap<String, usize> = HashMap::new();
    print_new(&sync.snapshot().await, &mut printed);

    let mut version = sync.subscribe();
    let handle = sync.start_polling(every);
    info!("Watching every {}s, Ctrl-C to stop", every.as_secs());

    loop {
        tokio::select! {
            changed = version.changed() => {
                if changed.is_err() {
                    break;
                }
                print_new(&sync.snapshot().await, &mut printed);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.stop().await;
    Ok(())
}

fn print_new(conversations: &Conversations, printed: &mut HashMap<String, usize>) {
    for conversation in conversations.iter() {
        let seen = printed.entry(conversation.user_id.key()).or_insert(0);
        for message in conversation.messages.iter().skip(*seen) {
            println!("{}: {}", conversation.user_name, format_message(message));
        }
        *seen = conversation.messages.len();
    }
}

async fn cmd_send(config: Arc<Config>, text: &str) -> anyhow::Result<()> {
    let session = Session::restore(config)?;
    let client = client_for(&session)?;
    let sync = history_sync(&session)?;

    let outcome = sync.send(&client, &session, text).await?;
    println!("{}", format_message(&outcome.sent));
    println!("{}", format_message(&outcome.reply));
    if !outcome.delivered {
        eprintln!("Message could not be delivered; it was not saved on the server");
    }
    Ok(())
}

async fn cmd_reply(config: Arc<Config>, user_id: &str, text: &str) -> anyhow::Result<()> {
    let session = Session::restore(config)?;
    require_admin(&session)?;
    let user_id = parse_user_id(user_id)?;
    let client = client_for(&session)?;
    let source = ThreadSource::new(Arc::clone(&client), user_id.clone());
    let sync = ChatSync::new(source, session.config.aliases.clone());

    if !sync.reply(&client, &session, &user_id, text).await? {
        bail!("Reply was not confirmed by the server");
    }
    match sync.conversation(&user_id).await {
        Some(conversation) => print_thread(&conversation),
        None => println!("Reply sent"),
    }
    Ok(())
}

// ============================================================================
// Offline tools
// ============================================================================

fn read_input(input: &str) -> anyhow::Result<String> {
    if input == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    std::fs::read_to_string(Path::new(input)).with_context(|| format!("Failed to read {}", input))
}

fn cmd_aggregate(config: &Config, input: &str) -> anyhow::Result<()> {
    let value: Value = serde_json::from_str(&read_input(input)?).context("Input is not JSON")?;
    let shape = detect_shape(&value);
    let records = extract_records(value);

    let grouped = shape == ResponseShape::Conversations
        || records
            .iter()
            .any(|r| r.get("messages").map_or(false, Value::is_array));

    let (conversations, quality) = if grouped {
        let (conversations, report) = Conversations::from_grouped(&records, &config.aliases);
        (conversations, report.quality)
    } else {
        Conversations::aggregate(&records, &config.aliases)
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "conversations": &conversations }))?
    );
    eprintln!(
        "{} records, {} conversations, {} dropped, {} unparsable timestamps",
        quality.records,
        conversations.len(),
        quality.dropped,
        quality.unparsable_timestamps
    );
    Ok(())
}
