use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{
    state::BoardSnapshot,
    timer::{SystemClock, TimerPhase},
    ClientEvent, ConnectionStatus, ControllerConfig, HttpRecordStore, RetroController,
    WsEventTransport, WsTransportConfig,
};
use shared::domain::{ActionId, CardId, ParticipantId, SessionId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Join a retro board from the terminal")]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    session_id: SessionId,
    /// Stable identity across reconnects; a random one is used if omitted.
    #[arg(long)]
    participant_id: Option<String>,
    #[arg(long)]
    name: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Show,
    Add { column: String, text: String },
    Edit { card: String, text: String },
    Delete { card: String },
    Vote { card: String },
    Unvote { card: String },
    TimerStart { minutes: u32 },
    TimerPause,
    TimerResume,
    TimerReset,
    TimerAdjust { minutes: i32 },
    Action { title: String },
    DoneAction { action: String },
    Complete,
    Help,
    Quit,
}

const HELP: &str = "\
commands:
  show                          render the board
  add <column> <text>           add a card
  edit <card> <text>            edit one of your cards
  del <card>                    delete one of your cards
  vote <card> | unvote <card>   spend or refund a vote
  timer start <min> | pause | resume | reset | +<min> | -<min>
  action <title>                record an action item
  done <action>                 remove an action item
  complete                      finish the retro
  quit";

fn split_first(rest: &str) -> Option<(&str, &str)> {
    let rest = rest.trim();
    let (head, tail) = rest.split_once(char::is_whitespace)?;
    let tail = tail.trim();
    if tail.is_empty() {
        return None;
    }
    Some((head, tail))
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let need = |usage: &str| format!("usage: {usage}");

    match verb {
        "show" | "" => Ok(Command::Show),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        "complete" => Ok(Command::Complete),
        "add" => split_first(rest)
            .map(|(column, text)| Command::Add {
                column: column.to_string(),
                text: text.to_string(),
            })
            .ok_or_else(|| need("add <column> <text>")),
        "edit" => split_first(rest)
            .map(|(card, text)| Command::Edit {
                card: card.to_string(),
                text: text.to_string(),
            })
            .ok_or_else(|| need("edit <card> <text>")),
        "del" | "delete" if !rest.is_empty() => Ok(Command::Delete {
            card: rest.to_string(),
        }),
        "vote" if !rest.is_empty() => Ok(Command::Vote {
            card: rest.to_string(),
        }),
        "unvote" if !rest.is_empty() => Ok(Command::Unvote {
            card: rest.to_string(),
        }),
        "action" if !rest.is_empty() => Ok(Command::Action {
            title: rest.to_string(),
        }),
        "done" if !rest.is_empty() => Ok(Command::DoneAction {
            action: rest.to_string(),
        }),
        "timer" => parse_timer(rest),
        other => Err(format!("unknown command '{other}'; try 'help'")),
    }
}

fn parse_timer(rest: &str) -> Result<Command, String> {
    let mut parts = rest.split_whitespace();
    let sub = parts.next().unwrap_or_default();
    let bad_minutes = |raw: &str| format!("'{raw}' is not a number of minutes");
    match sub {
        "start" => {
            let raw = parts.next().unwrap_or("5");
            let minutes = raw.parse().map_err(|_| bad_minutes(raw))?;
            Ok(Command::TimerStart { minutes })
        }
        "pause" => Ok(Command::TimerPause),
        "resume" => Ok(Command::TimerResume),
        "reset" => Ok(Command::TimerReset),
        adjust if adjust.starts_with('+') || adjust.starts_with('-') => {
            let minutes = adjust
                .trim_start_matches('+')
                .parse()
                .map_err(|_| bad_minutes(adjust))?;
            Ok(Command::TimerAdjust { minutes })
        }
        _ => Err("usage: timer start <min> | pause | resume | reset | +<min> | -<min>".into()),
    }
}

fn short(id: impl ToString) -> String {
    id.to_string().chars().take(8).collect()
}

/// Resolves the short id shown by `show` to a card on the board.
fn resolve_card(view: &BoardSnapshot, prefix: &str) -> Result<CardId> {
    let mut matches = view
        .columns
        .iter()
        .flat_map(|column| column.cards.iter())
        .filter(|card| card.id.to_string().starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(card), None) => Ok(card.id),
        (Some(_), Some(_)) => Err(anyhow!("'{prefix}' matches more than one card")),
        (None, _) => Err(anyhow!("no card matches '{prefix}'")),
    }
}

fn resolve_action(view: &BoardSnapshot, prefix: &str) -> Result<ActionId> {
    let mut matches = view
        .actions
        .iter()
        .filter(|action| action.id.to_string().starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(action), None) => Ok(action.id),
        (Some(_), Some(_)) => Err(anyhow!("'{prefix}' matches more than one action")),
        (None, _) => Err(anyhow!("no action matches '{prefix}'")),
    }
}

fn render(view: &BoardSnapshot) -> String {
    let mut out = String::new();
    let status = if view.completed { " (completed)" } else { "" };
    out.push_str(&format!("== {}{status} ==\n", view.title));
    let timer = match view.timer.phase {
        TimerPhase::Idle => "--:--".to_string(),
        TimerPhase::Paused => format!("{} paused", view.timer.display),
        TimerPhase::Running | TimerPhase::Expired => view.timer.display.clone(),
    };
    out.push_str(&format!(
        "timer {timer} | votes left {}/{}",
        view.votes_remaining, view.max_votes_per_person
    ));
    if view.connection == ConnectionStatus::Connecting {
        out.push_str(" | offline, board may be stale");
    }
    out.push('\n');

    for column in &view.columns {
        out.push_str(&format!("\n-- {} [{}] --\n", column.column.title, column.column.id));
        for card in &column.cards {
            let author = card.author_name.as_deref().unwrap_or("anonymous");
            let votes = if view.votes_hidden {
                String::new()
            } else {
                format!(" +{}", card.votes)
            };
            let mark = if card.voted_by_me { "*" } else { "" };
            let pending = if card.pending { " ..." } else { "" };
            out.push_str(&format!(
                "  [{}] {} ({author}){votes}{mark}{pending}\n",
                short(card.id),
                card.content
            ));
        }
    }

    if !view.recommendations.is_empty() {
        out.push_str("\nrecommendations:\n");
        for recommendation in &view.recommendations {
            out.push_str(&format!("  - {recommendation}\n"));
        }
    }
    if !view.actions.is_empty() {
        out.push_str("\naction items:\n");
        for action in &view.actions {
            let assignee = action
                .assignee
                .as_deref()
                .map(|a| format!(" @{a}"))
                .unwrap_or_default();
            out.push_str(&format!("  [{}] {}{assignee}\n", short(action.id), action.title));
        }
    }
    out
}

async fn run_command(controller: &RetroController, command: Command) -> Result<()> {
    let view = controller.snapshot().await;
    match command {
        Command::Show => print!("{}", render(&view)),
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
        Command::Add { column, text } => {
            let id = controller.add_card(&column, &text, None).await?;
            println!("added [{}]", short(id));
        }
        Command::Edit { card, text } => {
            controller
                .edit_card(resolve_card(&view, &card)?, Some(text), None)
                .await?;
        }
        Command::Delete { card } => controller.delete_card(resolve_card(&view, &card)?).await?,
        Command::Vote { card } => {
            controller.vote(resolve_card(&view, &card)?).await?;
        }
        Command::Unvote { card } => {
            controller.unvote(resolve_card(&view, &card)?).await?;
        }
        Command::TimerStart { minutes } => controller.start_timer(minutes).await?,
        Command::TimerPause => controller.pause_timer().await?,
        Command::TimerResume => controller.resume_timer().await?,
        Command::TimerReset => controller.reset_timer().await?,
        Command::TimerAdjust { minutes } => controller.adjust_timer(minutes).await?,
        Command::Action { title } => {
            let action = controller.add_action(&title, None).await?;
            println!("action [{}] recorded", short(action.id));
        }
        Command::DoneAction { action } => {
            controller
                .remove_action(resolve_action(&view, &action)?)
                .await?;
        }
        Command::Complete => controller.complete_session().await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let participant_id = args
        .participant_id
        .map(ParticipantId::new)
        .unwrap_or_else(|| ParticipantId::new(short(SessionId::new())));
    let store = Arc::new(HttpRecordStore::new(&args.server_url));
    let transport = Arc::new(WsEventTransport::new(
        &args.server_url,
        WsTransportConfig::default(),
    )?);
    let controller = RetroController::new(
        ControllerConfig::new(args.session_id, participant_id, args.name),
        store,
        transport,
        Arc::new(SystemClock),
    );

    let mut events = controller.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::TimerExpired => println!("\x07*** time's up! ***"),
                ClientEvent::SessionCompleted => {
                    println!("*** retro completed; the board is now read-only ***")
                }
                ClientEvent::ConnectionChanged(ConnectionStatus::Connecting) => {
                    println!("(offline, reconnecting...)")
                }
                ClientEvent::ConnectionChanged(ConnectionStatus::Connected) => {
                    println!("(connected)")
                }
                ClientEvent::Error(message) => println!("error: {message}"),
                ClientEvent::BoardChanged | ClientEvent::TimerTick { .. } => {}
            }
        }
    });

    if let Err(err) = controller.mount().await {
        warn!(error = %err, "initial load failed; waiting for the connection to retry");
    }
    print!("{}", render(&controller.snapshot().await));
    println!("type 'help' for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(err) = run_command(&controller, command).await {
                    println!("error: {err}");
                }
            }
            Err(usage) => println!("{usage}"),
        }
    }

    controller.shutdown().await;
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
