use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{
    ChatClient, ChatEntry, ClientEvent, Conversation, EntryStatus, FileSelectionStore,
};
use shared::domain::{MessageKind, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal chat client")]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:5000")]
    server_url: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    /// Register this username before logging in.
    #[arg(long)]
    register: Option<String>,
    #[arg(long, default_value = "./data/selection.json")]
    selection_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let client = ChatClient::new(Arc::new(FileSelectionStore::new(&args.selection_file)));
    let profile = match &args.register {
        Some(username) => {
            client
                .register(&args.server_url, username, &args.email, &args.password)
                .await?
        }
        None => {
            client
                .login(&args.server_url, &args.email, &args.password)
                .await?
        }
    };
    println!("logged in as {} (id {})", profile.username, profile.id);

    let printer = tokio::spawn(print_events(Arc::clone(&client), profile.id));

    if let Some(conversation) = client.restore_selection().await? {
        println!("restored conversation with {}", conversation.title());
        for entry in client.messages().await {
            println!("{}", render(&entry, profile.id));
        }
    }
    println!("commands: /to <user id>, /ai, /users, /online, /read, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_command(&client, line).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(err) => eprintln!("! {err}"),
        }
    }

    client.logout().await?;
    printer.abort();
    Ok(())
}

/// Returns true when the session should end.
async fn run_command(client: &Arc<ChatClient>, line: &str) -> Result<bool> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "/quit" => return Ok(true),
        "/to" => {
            let id: i64 = rest.trim().parse()?;
            let users = client.rest().await?.users().await?;
            let partner = users
                .into_iter()
                .find(|user| user.id == UserId(id))
                .ok_or_else(|| anyhow!("no user with id {id}"))?;
            println!("-- conversation with {} --", partner.username);
            client.select_conversation(Conversation::direct(partner)).await?;
        }
        "/ai" => {
            println!("-- conversation with the assistant --");
            client.select_conversation(Conversation::Assistant).await?;
        }
        "/users" => {
            for user in client.rest().await?.users().await? {
                let state = if user.is_online { "online" } else { "offline" };
                println!("{:>5}  {} ({state})", user.id, user.username);
            }
        }
        "/online" => client.request_online_users().await?,
        "/read" => client.mark_conversation_read().await?,
        _ if command.starts_with('/') => println!("unknown command {command}"),
        _ => match client.selection().await {
            Some(Conversation::Assistant) => client.send_assistant_message(line).await?,
            Some(Conversation::Direct { .. }) => {
                client.send_message(line, MessageKind::Text, None).await?;
            }
            None => println!("pick a conversation first with /to <user id> or /ai"),
        },
    }
    Ok(false)
}

async fn print_events(client: Arc<ChatClient>, me: UserId) {
    let mut events = client.subscribe_events();
    while let Ok(event) = events.recv().await {
        match event {
            ClientEvent::MessagesChanged => {
                if let Some(last) = client.messages().await.last() {
                    println!("{}", render(last, me));
                }
            }
            ClientEvent::IncomingMessage(message) => {
                println!("[new message from {}] {}", message.sender.username, message.content)
            }
            ClientEvent::TypingChanged(users) if !users.is_empty() => {
                let names: Vec<_> = users.iter().map(|u| u.username.as_str()).collect();
                println!("... {} typing", names.join(", "));
            }
            ClientEvent::PresenceChanged(change) => {
                let state = if change.is_online { "online" } else { "offline" };
                println!("* {} is {state}", change.username);
            }
            ClientEvent::OnlineUsers(users) => {
                let names: Vec<_> = users.iter().map(|u| u.username.as_str()).collect();
                println!("online: {}", names.join(", "));
            }
            ClientEvent::MessagesRead { reader_name, .. } => println!("* {reader_name} read your messages"),
            ClientEvent::Disconnected => println!("* disconnected"),
            ClientEvent::Error(err) => eprintln!("! {err}"),
            _ => {}
        }
    }
}

fn render(entry: &ChatEntry, me: UserId) -> String {
    let who = if entry.sender.id == me {
        "you"
    } else {
        entry.sender.username.as_str()
    };
    let marker = match entry.status {
        EntryStatus::Optimistic => " (sending)",
        EntryStatus::Unconfirmed => " (not confirmed)",
        EntryStatus::Thinking | EntryStatus::Failed => "",
        EntryStatus::Confirmed if entry.sender.id == me && entry.read => " (read)",
        EntryStatus::Confirmed => "",
    };
    format!("{} {who}: {}{marker}", entry.created_at.format("%H:%M"), entry.content)
}
