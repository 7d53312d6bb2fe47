use anyhow::{anyhow, Result};
use clap::Parser;
use log::{info, LevelFilter};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

use magpie::config::{self, AccountConfig};
use magpie::events::{ClientEvent, EventBus};
use magpie::notifications::NotificationContext;
use magpie::storage::MessageDb;
use magpie::utils;
use magpie::xmpp::ChatClient;

/// Command line arguments for magpie
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "magpie: an XMPP chat client built around its message pipeline."
)]
struct Args {
    /// Bare JID of the account (user@domain); falls back to the saved
    /// configuration
    #[arg(long)]
    jid: Option<String>,

    /// Account password; saved (obfuscated) on first use
    #[arg(long)]
    password: Option<String>,

    /// Path of the message database
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Log file path
    #[arg(long, value_name = "PATH", default_value = "magpie.log")]
    log_file: PathBuf,

    /// Verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    utils::setup_logging(args.log_file.to_str(), level)?;
    info!("magpie starting up");

    let config = resolve_config(&args)?;
    let password = config
        .get_password()
        .ok_or_else(|| anyhow!("No password configured; pass --password once"))?;

    let db_path = match &args.db {
        Some(path) => path.clone(),
        None => config.message_db_path()?,
    };
    info!("Using message database at {}", db_path.display());

    let events = EventBus::new();
    let db = MessageDb::open(db_path, events.clone())?;
    let notifications = NotificationContext::new();
    // A headless shell has no window to lose focus; treat it as focused
    // so the notification suppression for the open chat applies.
    notifications.set_window_focused(true);

    let client = ChatClient::new(&config.jid, db.clone(), events.clone(), notifications.clone())?;

    println!("Connecting as {}...", config.jid);
    client.connect(&password).await?;
    println!("Connected. Type /help for commands.");

    tokio::spawn(print_events(client.clone()));

    run_command_loop(&client, &db).await?;

    client.disconnect().await?;
    Ok(())
}

fn resolve_config(args: &Args) -> Result<AccountConfig> {
    if let Some(jid) = &args.jid {
        let mut cfg = match &args.password {
            Some(password) => AccountConfig::new(jid, password),
            None => {
                let saved = config::load_config()?
                    .filter(|saved| &saved.jid == jid)
                    .ok_or_else(|| anyhow!("No saved password for {}; pass --password", jid))?;
                saved
            }
        };
        if args.db.is_some() {
            cfg.db_path = args.db.clone();
        }
        config::save_config(&cfg)?;
        return Ok(cfg);
    }

    config::load_config()?
        .ok_or_else(|| anyhow!("No configuration found; pass --jid and --password"))
}

async fn print_events(client: ChatClient) {
    let mut events = client.subscribe();
    while let Ok(event) = events.recv().await {
        match event {
            ClientEvent::MessageAdded { message, origin } => {
                println!(
                    "[{:?}] {} -> {}: {}",
                    origin, message.from, message.to, message.body
                );
            }
            ClientEvent::DeliveryStateChanged {
                id,
                state,
                error_text,
            } => match error_text {
                Some(text) if !text.is_empty() => {
                    println!("[delivery] {} is now {:?}: {}", id, state, text)
                }
                _ => println!("[delivery] {} is now {:?}", id, state),
            },
            ClientEvent::PassiveNotification { text } => println!("[info] {}", text),
            ClientEvent::ShowMessageNotification {
                contact_name, body, ..
            } => {
                println!("[notify] {}: {}", contact_name, body);
            }
        }
    }
}

async fn run_command_loop(client: &ChatClient, db: &MessageDb) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(2, ' ');
        let command = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default();

        match command {
            "/help" => print_help(),
            "/quit" => break,
            "/msg" => {
                let (to, body) = split_arg(rest);
                if to.is_empty() || body.is_empty() {
                    println!("usage: /msg <jid> <text>");
                    continue;
                }
                match client.dispatcher().send_message(to, body, false, "").await {
                    Ok(id) => println!("[sent] {}", id),
                    Err(e) => println!("[error] {}", e),
                }
            }
            "/spoiler" => {
                let (to, body) = split_arg(rest);
                if to.is_empty() || body.is_empty() {
                    println!("usage: /spoiler <jid> <text>");
                    continue;
                }
                match client
                    .dispatcher()
                    .send_message(to, body, true, "spoiler")
                    .await
                {
                    Ok(id) => println!("[sent] {}", id),
                    Err(e) => println!("[error] {}", e),
                }
            }
            "/edit" => {
                let (to, rest) = split_arg(rest);
                let (id, body) = split_arg(rest);
                if to.is_empty() || id.is_empty() || body.is_empty() {
                    println!("usage: /edit <jid> <message-id> <text>");
                    continue;
                }
                if let Err(e) = client.dispatcher().correct_message(to, id, body).await {
                    println!("[error] {}", e);
                }
            }
            "/history" => {
                let (jid, skip) = split_arg(rest);
                if jid.is_empty() {
                    println!("usage: /history <jid> [skip]");
                    continue;
                }
                let skip: u32 = skip.parse().unwrap_or(0);
                match db.fetch_messages(client.account_jid(), jid, skip).await {
                    Ok(messages) => {
                        for message in messages {
                            println!(
                                "{} {} {}: {}",
                                message.stamp.format("%Y-%m-%d %H:%M"),
                                message.id,
                                message.from,
                                message.body
                            );
                        }
                    }
                    Err(e) => println!("[error] {}", e),
                }
            }
            "/open" => {
                let (jid, _) = split_arg(rest);
                if jid.is_empty() {
                    client.notifications().set_active_chat(None);
                    println!("[chat closed]");
                } else {
                    client.notifications().set_active_chat(Some(jid));
                    println!("[chat open: {}]", jid);
                }
            }
            "/mute" => {
                let (jid, _) = split_arg(rest);
                client.notifications().set_muted(jid, true);
            }
            "/unmute" => {
                let (jid, _) = split_arg(rest);
                client.notifications().set_muted(jid, false);
            }
            "/clear" => {
                let (jid, _) = split_arg(rest);
                let chat = if jid.is_empty() { None } else { Some(jid) };
                match db.remove_messages(client.account_jid(), chat).await {
                    Ok(()) => println!("[history cleared]"),
                    Err(e) => println!("[error] {}", e),
                }
            }
            other => println!("unknown command {}; try /help", other),
        }
    }

    Ok(())
}

fn split_arg(input: &str) -> (&str, &str) {
    let mut parts = input.splitn(2, ' ');
    (
        parts.next().unwrap_or_default().trim(),
        parts.next().unwrap_or_default().trim(),
    )
}

fn print_help() {
    println!("/msg <jid> <text>              send a message");
    println!("/spoiler <jid> <text>          send a spoiler message");
    println!("/edit <jid> <id> <text>        correct an earlier message");
    println!("/history <jid> [skip]          show stored history, newest first");
    println!("/open [jid]                    set or clear the active chat");
    println!("/mute <jid> | /unmute <jid>    toggle notifications for a contact");
    println!("/clear [jid]                   remove stored messages");
    println!("/quit                          disconnect and exit");
}
