use crate::call_session::{format_duration, CallDirection, CallOutcome, SimulatedAnswer};
use crate::config::Config;
use crate::contact_store::Contact;
use crate::messenger::{Messenger, Page};
use crate::messenger_types::{DeliveryState, Message, Payload};
use crate::presence::StaticPresence;
use crate::transport::MemoryTransport;
use colored::*;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_HISTORY: usize = 20;

/// `parley` command dispatch. `command` is the positional arguments left
/// after config flags were parsed.
pub async fn run(bin: &str, config: Config, command: Vec<String>) -> anyhow::Result<()> {
    let Some(name) = command.first() else {
        print_usage(bin);
        return Ok(());
    };
    let args = &command[1..];

    // No network in the CLI: a loopback transport marks sends delivered
    let messenger = Messenger::open(
        &config,
        Arc::new(MemoryTransport::loopback()),
        Arc::new(StaticPresence::new()),
    )?;
    let resumed = messenger.engine().resume().await?;
    if resumed > 0 {
        println!("{} Flushed {} unsent message(s)", "↻".yellow(), resumed);
    }

    match name.as_str() {
        "conversations" => {
            let query = args.join(" ");
            list_conversations(&messenger, &query)?;
        }
        "history" => {
            let Some(conversation_id) = args.first() else {
                eprintln!("{}", format!("Usage: {} history <conversation_id> [limit]", bin).yellow());
                return Ok(());
            };
            let limit = args
                .get(1)
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(DEFAULT_HISTORY);
            show_history(&messenger, conversation_id, limit).await?;
        }
        "start" => {
            if args.is_empty() {
                eprintln!("{}", format!("Usage: {} start <user_id> [user_id...]", bin).yellow());
                return Ok(());
            }
            let summary = messenger.start_conversation(args).await?;
            println!(
                "{} Conversation {}",
                "✓".green().bold(),
                summary.conversation_id.cyan()
            );
        }
        "send" => {
            if args.len() < 2 {
                eprintln!("{}", format!("Usage: {} send <conversation_id> <message>", bin).yellow());
                return Ok(());
            }
            let text = args[1..].join(" ");
            let message = messenger.send_message(&args[0], Payload::text(text)).await?;
            println!(
                "{} Message {} (seq {}) {}",
                "✓".green().bold(),
                message.id.cyan(),
                message.sequence,
                state_label(message.delivery_state)
            );
        }
        "open" => {
            let Some(conversation_id) = args.first() else {
                eprintln!("{}", format!("Usage: {} open <conversation_id>", bin).yellow());
                return Ok(());
            };
            let view = messenger.open_conversation(conversation_id).await?;
            println!(
                "{} {} marked read (through seq {})",
                "✓".green().bold(),
                view.title.bright_white(),
                view.summary.read_through
            );
            show_history(&messenger, conversation_id, DEFAULT_HISTORY).await?;
            messenger.close_conversation().await;
        }
        "contacts" => {
            let query = args.join(" ");
            list_contacts(&messenger, &query)?;
        }
        "add-contact" => {
            if args.len() < 2 {
                eprintln!("{}", format!("Usage: {} add-contact <user_id> <display name>", bin).yellow());
                return Ok(());
            }
            let contact = Contact::new(args[0].clone(), args[1..].join(" "));
            messenger.contacts().add_contact(&contact)?;
            println!(
                "{} Added {} ({})",
                "✓".green().bold(),
                contact.display_name.bright_white(),
                contact.user_id.dimmed()
            );
        }
        "rebuild" => {
            let summaries = messenger.rebuild_index().await?;
            println!(
                "{} Rebuilt {} conversation summar{}",
                "✓".green().bold(),
                summaries.len(),
                if summaries.len() == 1 { "y" } else { "ies" }
            );
        }
        "call" => {
            let Some(conversation_id) = args.first() else {
                eprintln!("{}", format!("Usage: {} call <conversation_id> [seconds]", bin).yellow());
                return Ok(());
            };
            let seconds = args.get(1).and_then(|s| s.parse::<u64>().ok()).unwrap_or(5);
            place_call(&messenger, &config, conversation_id, seconds).await?;
        }
        "calls" => {
            list_calls(&messenger).await?;
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), name.red());
            print_usage(bin);
        }
    }

    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "💬 Parley".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} [--user <id>] [--data-dir <path>] [--memory] <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} [query]              List conversations, newest first", "conversations".cyan());
    println!("  {} <conv> [limit]             Show the latest messages", "history".cyan());
    println!("  {} <user_id>...                 Start a conversation", "start".cyan());
    println!("  {} <conv> <message>              Send a text message", "send".cyan());
    println!("  {} <conv>                        Read a conversation", "open".cyan());
    println!("  {} [query]                   List or search contacts", "contacts".cyan());
    println!("  {} <user_id> <name>       Add a contact", "add-contact".cyan());
    println!("  {}                            Rebuild the conversation index", "rebuild".cyan());
    println!("  {} <conv> [seconds]              Place a simulated call", "call".cyan());
    println!("  {}                              Show call history", "calls".cyan());
}

fn state_label(state: DeliveryState) -> ColoredString {
    match state {
        DeliveryState::Pending => "pending".yellow(),
        DeliveryState::Sent => "sent".cyan(),
        DeliveryState::Delivered => "delivered".green(),
        DeliveryState::Failed => "failed".red(),
    }
}

fn list_conversations(messenger: &Messenger, query: &str) -> anyhow::Result<()> {
    let views = messenger.search_conversations(query)?;
    if views.is_empty() {
        println!("{}", "No conversations".yellow());
        return Ok(());
    }
    println!(
        "{}",
        format!("Conversations ({})", views.len()).bright_cyan().bold()
    );
    println!("{}", "─".repeat(60).dimmed());
    for view in views {
        let dot = if view.online { "●".green() } else { "○".dimmed() };
        let unread = if view.summary.unread_count > 0 {
            format!(" [{}]", view.summary.unread_count).red().bold()
        } else {
            "".normal()
        };
        println!(
            "  {} {}{}  {}",
            dot,
            view.title.bright_white(),
            unread,
            view.summary.conversation_id.dimmed()
        );
        if let Some(preview) = view.last_preview {
            println!(
                "      {} {}",
                view.summary.updated_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
                preview
            );
        }
    }
    Ok(())
}

async fn show_history(
    messenger: &Messenger,
    conversation_id: &str,
    limit: usize,
) -> anyhow::Result<()> {
    let messages = messenger
        .list_messages(conversation_id, Page::Latest { limit })
        .await?;
    if messages.is_empty() {
        println!("{}", "No messages".yellow());
        return Ok(());
    }
    for m in &messages {
        print_message(messenger.local_user_id(), m);
    }
    Ok(())
}

fn print_message(local_user_id: &str, m: &Message) {
    let author = if m.author_id == local_user_id {
        "you".green().bold()
    } else {
        m.author_id.cyan().bold()
    };
    println!(
        "  {:>4} {} {}: {} {}",
        m.sequence.to_string().dimmed(),
        m.created_at.format("%H:%M").to_string().dimmed(),
        author,
        m.payload.preview(),
        if m.author_id == local_user_id {
            state_label(m.delivery_state)
        } else {
            "".normal()
        }
    );
}

fn list_contacts(messenger: &Messenger, query: &str) -> anyhow::Result<()> {
    let contacts = messenger.search_contacts(query)?;
    if contacts.is_empty() {
        println!("{}", "No contacts found".yellow());
        return Ok(());
    }
    println!("{}", format!("Contacts ({})", contacts.len()).bright_cyan().bold());
    println!("{}", "─".repeat(60).dimmed());
    for c in contacts {
        let phone = c.phone_number.as_deref().unwrap_or("");
        let badge = if c.registered { "".normal() } else { " (invite)".yellow() };
        println!(
            "  {}{} {} {}",
            c.display_name.bright_white(),
            badge,
            c.user_id.dimmed(),
            phone.dimmed()
        );
    }
    Ok(())
}

async fn place_call(
    messenger: &Messenger,
    config: &Config,
    conversation_id: &str,
    seconds: u64,
) -> anyhow::Result<()> {
    let call = messenger
        .start_call(conversation_id, CallDirection::Outgoing)
        .await?;
    println!("{} Calling {}...", "☎".cyan(), conversation_id.bright_white());
    SimulatedAnswer::spawn(call.clone(), config.simulated_answer).await?;
    println!("{} Connected", "✓".green().bold());

    tokio::time::sleep(Duration::from_secs(seconds)).await;
    if let Some(record) = messenger.hang_up().await? {
        println!(
            "{} Call ended after {}",
            "✓".green().bold(),
            format_duration(chrono::Duration::seconds(record.duration_secs)).cyan()
        );
    }
    Ok(())
}

async fn list_calls(messenger: &Messenger) -> anyhow::Result<()> {
    let calls = messenger.call_history().await?;
    if calls.is_empty() {
        println!("{}", "No calls yet".yellow());
        return Ok(());
    }
    println!("{}", format!("Calls ({})", calls.len()).bright_cyan().bold());
    println!("{}", "─".repeat(60).dimmed());
    for r in calls {
        let arrow = match r.direction {
            CallDirection::Incoming => "↙",
            CallDirection::Outgoing => "↗",
        };
        let outcome = match r.outcome {
            CallOutcome::Answered => "answered".green(),
            CallOutcome::Missed => "missed".red(),
            CallOutcome::Cancelled => "cancelled".yellow(),
        };
        println!(
            "  {} {} {} {} {}",
            arrow,
            r.started_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
            r.conversation_id.bright_white(),
            outcome,
            format_duration(chrono::Duration::seconds(r.duration_secs)).cyan()
        );
    }
    Ok(())
}
