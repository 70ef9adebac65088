use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use shared::{
    domain::{ConfidentialSettings, SessionId, SessionMetadata},
    template::{builtin_templates, find_template, DEFAULT_TEMPLATE_ID},
};
use storage::Storage;

#[derive(Parser, Debug)]
#[command(about = "Administer retro sessions directly in the database")]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/retro.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the built-in column layouts.
    Templates,
    CreateSession {
        title: String,
        #[arg(long, default_value = DEFAULT_TEMPLATE_ID)]
        template: String,
        #[arg(long)]
        anonymous: bool,
        #[arg(long)]
        hide_votes: bool,
    },
    ListSessions,
    /// Print cards ranked by votes, plus action items.
    Summary {
        session_id: SessionId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Templates = cli.command {
        for template in builtin_templates() {
            let columns: Vec<&str> = template.columns.iter().map(|c| c.id.as_str()).collect();
            println!(
                "{}\t{}\t{} votes\t{}",
                template.id,
                template.name,
                template.max_votes_per_person,
                columns.join(",")
            );
        }
        return Ok(());
    }

    let storage = Storage::new(&cli.database_url).await?;
    match cli.command {
        Command::Templates => {}
        Command::CreateSession {
            title,
            template,
            anonymous,
            hide_votes,
        } => {
            if find_template(&template).is_none() {
                return Err(anyhow!("unknown template '{template}'"));
            }
            let metadata = SessionMetadata {
                recommendations: Vec::new(),
                confidential: ConfidentialSettings {
                    anonymous_cards: anonymous,
                    hide_votes_until_complete: hide_votes,
                },
            };
            let session = storage.create_session(&title, &template, &metadata).await?;
            println!("created session_id={}", session.id);
        }
        Command::ListSessions => {
            for session in storage.list_sessions().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    session.id,
                    session.status.as_str(),
                    session.template_id,
                    session.title
                );
            }
        }
        Command::Summary { session_id } => {
            let session = storage
                .get_session(session_id)
                .await?
                .ok_or_else(|| anyhow!("session {session_id} not found"))?;
            let votes = storage.list_votes(session_id).await?;
            let mut cards: Vec<(usize, _)> = storage
                .list_cards(session_id)
                .await?
                .into_iter()
                .map(|card| {
                    let count = votes.iter().filter(|v| v.card_id == card.id).count();
                    (count, card)
                })
                .collect();
            cards.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.created_at.cmp(&b.1.created_at)));

            println!("# {} ({})", session.title, session.status.as_str());
            for (count, card) in &cards {
                println!("{count:>3}  [{}] {}", card.column_id, card.content);
            }
            let actions = storage.list_actions(session_id).await?;
            if !actions.is_empty() {
                println!("\naction items:");
                for action in actions {
                    match action.assignee {
                        Some(assignee) => println!("- {} (@{assignee})", action.title),
                        None => println!("- {}", action.title),
                    }
                }
            }
        }
    }

    Ok(())
}
