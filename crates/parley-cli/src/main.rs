//! # parley
//!
//! Line-oriented terminal client for the Parley conversation backend.
//!
//! Plain input is sent to the active conversation; commands start with `/`
//! (see `/help`). Output follows the session's event stream, so results of
//! mutations and background refreshes are printed as they land.

mod display;

use std::collections::HashSet;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use parley_client::{
    CacheKey, ClientConfig, ConversationId, MessageId, Model,
    MutationHandle, MutationOutcome, Session, SessionEvent,
};

const HELP: &str = "\
commands:
  /list                 list conversations
  /use <n|id>           switch conversation
  /new <name>           create a conversation
  /del <n|id>           delete a conversation
  /rename <name>        rename the active conversation
  /config key=value...  set temperature, max_tokens, model or system
  /show                 print the active thread
  /refresh              reload the conversation list
  /quit                 exit
anything else is sent to the active conversation";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,parley_client=debug,parley_gateway=debug")
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    // -----------------------------------------------------------------------
    // 2. Load configuration and start the session
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let session = Session::connect(config).context("failed to start session")?;

    // -----------------------------------------------------------------------
    // 3. Print session events in the background
    // -----------------------------------------------------------------------
    let printer = tokio::spawn(print_events(session.clone()));

    // -----------------------------------------------------------------------
    // 4. Read commands until EOF, /quit or Ctrl+C
    // -----------------------------------------------------------------------
    println!("Parley v{} (type /help)", env!("CARGO_PKG_VERSION"));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if !handle_line(&session, line.trim()) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C");
                break;
            }
        }
    }

    printer.abort();
    session.teardown();
    Ok(())
}

/// Run one input line. Returns false to quit.
fn handle_line(session: &Session, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    match run_command(session, line) {
        Ok(keep_going) => keep_going,
        Err(e) => {
            println!("error: {e:#}");
            true
        }
    }
}

fn run_command(session: &Session, line: &str) -> anyhow::Result<bool> {
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "/quit" | "/exit" => return Ok(false),
        "/help" => println!("{HELP}"),
        "/list" => print_list(session),
        "/show" => print_thread(session),
        "/refresh" => session.refresh(CacheKey::Conversations),
        "/use" => session.select_conversation(&resolve(session, rest))?,
        "/new" => report(session.create_conversation(rest)?),
        "/del" => report(session.delete_conversation(&resolve(session, rest))?),
        "/rename" => report(session.rename_conversation(&active(session)?, rest)?),
        "/config" => report(configure(session, rest)?),
        _ if command.starts_with('/') => println!("unknown command {command}, try /help"),
        _ => {
            report(session.submit_message(line)?);
            println!("thinking...");
        }
    }
    Ok(true)
}

/// Print the outcome of a mutation once it settles.
fn report(handle: MutationHandle) {
    tokio::spawn(async move {
        match handle.settled().await {
            Ok(()) => debug!(mutation = %handle.id(), "Mutation committed"),
            Err(e) => println!("{} failed: {e}", handle.kind()),
        }
    });
}

fn active(session: &Session) -> parley_client::Result<ConversationId> {
    session
        .active_conversation_id()
        .ok_or(parley_client::ClientError::NoActiveConversation)
}

/// A 1-based list position or a conversation id.
fn resolve(session: &Session, arg: &str) -> ConversationId {
    let list = session.conversation_list().unwrap_or_default();
    arg.parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| list.get(i))
        .map(|conversation| conversation.id.clone())
        .unwrap_or_else(|| ConversationId::new(arg))
}

fn configure(session: &Session, args: &str) -> anyhow::Result<MutationHandle> {
    let id = active(session)?;
    let mut params = session
        .active_conversation()
        .map(|c| c.params)
        .unwrap_or_default();

    for pair in args.split_whitespace() {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("expected key=value, got {pair}"))?;
        match key {
            "temperature" => params.temperature = value.parse().context("bad temperature")?,
            "max_tokens" => {
                params.max_completion_tokens = value.parse().context("bad max_tokens")?
            }
            "model" => {
                params.model = Model::parse(value).with_context(|| {
                    let known: Vec<_> = Model::ALL.iter().map(Model::as_str).collect();
                    format!("unknown model {value}, expected one of {}", known.join(", "))
                })?
            }
            "system" => params.system_prompt = value.replace('_', " "),
            other => anyhow::bail!("unknown setting {other}"),
        }
    }

    Ok(session.update_conversation_config(&id, params)?)
}

fn print_list(session: &Session) {
    if let Some(line) = display::status_line(&session.read_status(&CacheKey::Conversations)) {
        println!("{line}");
    }
    let Some(list) = session.conversation_list() else {
        return;
    };
    if list.is_empty() {
        println!("no conversations yet, create one with /new <name>");
        return;
    }
    let now = chrono::Local::now();
    let active = session.active_conversation_id();
    for (i, conversation) in list.iter().enumerate() {
        println!(
            "{}",
            display::conversation_line(i + 1, conversation, active.as_ref(), &now)
        );
    }
}

fn print_thread(session: &Session) {
    let Some(conversation) = session.active_conversation() else {
        println!("no active conversation");
        return;
    };
    println!("== {} ({})", conversation.name, conversation.params.model);
    let key = CacheKey::Messages(conversation.id.clone());
    if let Some(line) = display::status_line(&session.read_status(&key)) {
        println!("{line}");
    }
    for message in session.messages_for(&conversation.id).unwrap_or_default() {
        println!("{}", display::message_line(&message));
    }
}

/// Follow the event stream and the active thread, printing what changes.
async fn print_events(session: Session) {
    let mut events = session.subscribe();
    let mut thread = session.active_messages();
    let mut shown: HashSet<MessageId> = HashSet::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Event printer lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                match event {
                    SessionEvent::SelectionChanged { active } => {
                        shown.clear();
                        match active {
                            Some(_) => print_thread(&session),
                            None => println!("no active conversation"),
                        }
                        // Already printed in full; don't repeat it below.
                        shown.extend(thread.borrow_and_update().iter().map(|m| m.id.clone()));
                    }
                    SessionEvent::MutationSettled { outcome: MutationOutcome::RolledBack(_), .. } => {
                        // Reported by the mutation's own waiter.
                    }
                    SessionEvent::ReadFailed { key, error } => {
                        println!("could not load {key}: {error}");
                    }
                    _ => {}
                }
            }
            changed = thread.changed() => {
                if changed.is_err() {
                    break;
                }
                let messages = thread.borrow_and_update().clone();
                for message in messages {
                    if message.id.is_optimistic() || !shown.insert(message.id.clone()) {
                        continue;
                    }
                    println!("{}", display::message_line(&message));
                }
            }
        }
    }
}
