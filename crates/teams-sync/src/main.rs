use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::Parser;
use shared_types::{ChatSummary, ConversationId};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use teams_sync::display::{meeting_line, MessageFormatter};
use teams_sync::{
    load_chat_list, resolve_chat, ChannelNotifier, ChatSession, Config, DueNotification,
    GraphClient, MeetingReconciler, MessageWindow, ReminderScheduler,
};

#[derive(Debug, Parser)]
#[command(name = "teams-sync", about = "Follow a Teams chat and meeting reminders from the terminal")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Chat to open, e.g. 19:abc@thread.v2 (default: most recent chat)
    #[arg(long)]
    conversation: Option<String>,

    /// Print an example config and exit
    #[arg(long)]
    print_example_config: bool,
}

const HELP: &str = "/snooze, /dismiss  answer the pending reminder batch
/meetings          list known meetings
/older             load older messages
/chats             list your chats
/switch <n|id>     open a listed chat by number, or any chat by id
/quit              exit
anything else      post as a reply";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "teams_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.print_example_config {
        print!("{}", toml::to_string_pretty(&Config::example())?);
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env()?;

    let client = Arc::new(GraphClient::new(&config.graph)?);
    let me = match client.me().await {
        Ok(user) => {
            tracing::info!(
                "Signed in as {}",
                user.display_name.as_deref().unwrap_or(&user.id)
            );
            Some(user.id)
        }
        Err(e) => {
            tracing::warn!("Could not resolve signed-in user: {}", e);
            None
        }
    };
    let formatter = MessageFormatter::new(me.clone(), &config.chat);

    let mut listed: Vec<ChatSummary> = Vec::new();
    let conversation = match cli.conversation.as_deref() {
        Some(raw) => ConversationId::parse(raw)?,
        None => {
            listed = load_chat_list(client.as_ref(), config.chat.max_chats)
                .await
                .context("Failed to list chats")?;
            let Some(first) = listed.first() else {
                bail!("No chats found; pass --conversation");
            };
            print_chats(&listed, me.as_deref());
            first.id.clone()
        }
    };

    let session = ChatSession::open(client.clone(), conversation, &config.chat).await;
    let mut revisions = session.subscribe();
    let mut printed = HashSet::new();
    print_new_messages(&session.window().await, &mut printed, &formatter);

    let (notifier, mut notifications) = ChannelNotifier::new(4);
    let mut reminders_active = config.reminders.enabled;
    let reminders = if reminders_active {
        let reconciler = Arc::new(MeetingReconciler::new(client.clone(), &config.reminders));
        let scheduler = Arc::new(ReminderScheduler::new(
            reconciler,
            Arc::new(notifier),
            &config.reminders,
        ));
        let poll = Arc::clone(&scheduler).start(config.reminders.poll_interval());
        Some((scheduler, poll))
    } else {
        tracing::info!("Reminder notifications disabled");
        drop(notifier);
        None
    };

    let mut pending: Option<DueNotification> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{}", HELP);

    loop {
        tokio::select! {
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                print_new_messages(&session.window().await, &mut printed, &formatter);
            }
            notification = notifications.recv(), if reminders_active => match notification {
                Some(notification) => {
                    println!("== Reminders ==");
                    for meeting in &notification.batch.meetings {
                        println!("  {}", meeting);
                    }
                    println!(
                        "/snooze ({} mins) or /dismiss",
                        notification.batch.snooze_minutes
                    );
                    pending = Some(notification);
                }
                None => reminders_active = false,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let line = line.trim();

                match line {
                    "" => {}
                    "/quit" => break,
                    "/help" => println!("{}", HELP),
                    "/snooze" | "/dismiss" => match pending.take() {
                        Some(notification) => {
                            let answered = if line == "/snooze" {
                                notification.snooze_all()
                            } else {
                                notification.dismiss_all()
                            };
                            if !answered {
                                println!("Reminder batch expired");
                            }
                        }
                        None => println!("No reminders pending"),
                    },
                    "/meetings" => match &reminders {
                        Some((scheduler, _)) => {
                            let meetings = scheduler.reconciler().snapshot().await;
                            if meetings.is_empty() {
                                println!("No meetings with reminders yet");
                            }
                            for meeting in meetings.by_start() {
                                println!("  {}", meeting_line(meeting));
                            }
                        }
                        None => println!("Reminders are disabled"),
                    },
                    "/older" => match session.load_older_page().await {
                        Ok(0) => println!("No older messages"),
                        Ok(count) => println!("Loaded {} older messages", count),
                        Err(e) => println!("Failed to load older messages: {}", e),
                    },
                    "/chats" => match load_chat_list(client.as_ref(), config.chat.max_chats).await {
                        Ok(chats) => {
                            listed = chats;
                            if listed.is_empty() {
                                println!("No chats found");
                            }
                            print_chats(&listed, me.as_deref());
                        }
                        Err(e) => println!("Failed to list chats: {}", e),
                    },
                    _ if line.starts_with("/switch ") => {
                        match resolve_chat(&line["/switch ".len()..], &listed) {
                            Ok(id) => match session.switch_conversation(id).await {
                                Ok(window) => {
                                    printed.clear();
                                    print_new_messages(&window, &mut printed, &formatter);
                                }
                                Err(e) => println!("Failed to open chat: {}", e),
                            },
                            Err(e) => println!("{}", e),
                        }
                    }
                    text => {
                        if let Err(e) = session.post_reply(text).await {
                            println!("Message not sent: {}", e);
                        }
                    }
                }
            }
            _ = signal::ctrl_c() => {
                tracing::info!("Shutdown signal received, stopping...");
                break;
            }
        }
    }

    session.stop();
    if let Some((_, poll)) = &reminders {
        poll.stop();
    }

    Ok(())
}

fn print_chats(chats: &[ChatSummary], me: Option<&str>) {
    for (i, chat) in chats.iter().enumerate() {
        println!("{:>3}. {}", i + 1, chat.label(me));
    }
}

fn print_new_messages(
    window: &MessageWindow,
    printed: &mut HashSet<String>,
    formatter: &MessageFormatter,
) {
    let now = Local::now();
    for message in window.chronological() {
        if printed.insert(message.id.clone()) {
            println!("{}", formatter.line(message, &now));
        }
    }
}
