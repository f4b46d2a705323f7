use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use convo_agent::{Agent, CancelHandle};
use convo_config::AgentConfig;
use convo_conversation::{ListOptions, SessionSummary, SessionTreeNode, SortBy};
use convo_tools::ToolRegistry;
use convo_turn::TurnEvent;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "convo-agent")]
#[command(about = "Conversational agent with forkable, compressible sessions", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE", default_value_os_t = AgentConfig::default_config_path())]
    config: PathBuf,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive conversation mode
    Chat {
        /// Resume an existing session
        #[arg(short, long)]
        session: Option<String>,
    },

    /// List sessions
    Sessions {
        #[arg(long, value_enum, default_value_t = SortArg::LastActive)]
        sort: SortArg,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Show sessions grouped by fork parent
    Tree,

    /// Print a stored session as JSON
    Show { id: String },

    /// Fork a session at an item index (defaults to the last item)
    Fork {
        id: String,

        #[arg(long)]
        at: Option<usize>,
    },

    /// Summarize the older part of a session now
    Compress { id: String },

    /// Delete a session
    Delete { id: String },

    /// Export a session to a standalone JSON file
    Export {
        id: String,

        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    LastActive,
    Created,
    Items,
}

impl From<SortArg> for SortBy {
    fn from(sort: SortArg) -> Self {
        match sort {
            SortArg::LastActive => SortBy::LastActive,
            SortArg::Created => SortBy::Created,
            SortArg::Items => SortBy::ItemCount,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config = if cli.config.exists() {
        info!("Loading configuration from: {:?}", cli.config);
        AgentConfig::from_yaml(&cli.config)?
    } else {
        info!("Using default configuration");
        AgentConfig::default()
    };

    let agent = Agent::from_config(config, ToolRegistry::new()).await?;

    match cli.command {
        Commands::Chat { session } => {
            interactive_chat(agent, session).await?;
        }
        Commands::Sessions { sort, limit, offset } => {
            let sessions = agent
                .manager()
                .await
                .list_sessions(ListOptions {
                    sort_by: sort.into(),
                    limit,
                    offset,
                })
                .await?;
            if sessions.is_empty() {
                println!("No sessions yet.");
            }
            for summary in &sessions {
                print_summary(summary, 0);
            }
        }
        Commands::Tree => {
            let tree = agent.manager().await.get_session_tree().await?;
            for node in &tree {
                print_tree(node, 0);
            }
        }
        Commands::Show { id } => {
            let session = agent
                .manager()
                .await
                .get_session(&id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Session not found: {id}"))?;
            println!("{:#}", session.to_json()?);
        }
        Commands::Fork { id, at } => {
            let fork = agent.manager().await.fork_session(&id, at).await?;
            println!(
                "Forked {} at item {} -> {}",
                id,
                fork.fork_at_item_index().unwrap_or_default(),
                fork.id()
            );
        }
        Commands::Compress { id } => {
            let outcome = agent.manager().await.compress_session(&id).await?;
            match outcome.summary {
                Some(summary) if outcome.compressed => println!("Compressed {id}:\n{summary}"),
                _ => println!("Nothing to compress in {id}"),
            }
        }
        Commands::Delete { id } => {
            agent.manager().await.delete_session(&id).await?;
            println!("Deleted {id}");
        }
        Commands::Export { id, output } => {
            agent.manager().await.export_session(&id, &output).await?;
            println!("Exported {id} to {}", output.display());
        }
    }

    Ok(())
}

async fn interactive_chat(agent: Agent, session: Option<String>) -> Result<()> {
    let handle = agent.cancel_handle();
    let in_flight = Arc::new(AtomicBool::new(false));
    let replying = Arc::clone(&in_flight);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !interrupt(&replying, &handle) {
                println!("\nGoodbye!");
                std::process::exit(130);
            }
        }
    });

    println!("Convo Agent Interactive Chat");
    println!("Type 'exit' or 'quit' to end the conversation, Ctrl-C cancels a reply or exits at the prompt");
    let session_id = match session {
        Some(id) => {
            println!("Resuming session {id}");
            id
        }
        None => {
            let created = agent.manager().await.create_session(None).await?;
            println!("Started session {}", created.id());
            created.id().to_string()
        }
    };
    println!();

    loop {
        print!("You> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            println!("Goodbye!");
            break;
        }

        print!("\nAssistant> ");
        io::stdout().flush()?;

        in_flight.store(true, Ordering::SeqCst);
        let result = agent.chat(Some(&session_id), input, print_event).await;
        in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(outcome) => {
                println!("\n");
                if outcome.hit_round_limit {
                    println!("(stopped after {} tool rounds)", outcome.rounds);
                }
                println!("(Session: {} | Tokens: {})\n", outcome.session_id, outcome.usage.total_tokens);
            }
            Err(e) => {
                warn!("Chat failed: {}", e);
                println!("\n[error] {e}\n");
            }
        }
    }

    Ok(())
}

/// Cancels the reply in flight. Returns false when there is none, meaning the
/// interrupt should end the program.
fn interrupt(in_flight: &AtomicBool, handle: &CancelHandle) -> bool {
    if in_flight.load(Ordering::SeqCst) {
        handle.cancel();
        true
    } else {
        false
    }
}

fn print_event(event: &TurnEvent) {
    match event {
        TurnEvent::ContentDelta { delta } => {
            print!("{delta}");
            io::stdout().flush().ok();
        }
        TurnEvent::ToolCallStart { name, .. } => println!("\n[tool] {name}"),
        TurnEvent::ToolCallComplete { name, duration, .. } => {
            println!("[tool] {name} done in {duration:.2?}")
        }
        TurnEvent::ToolCallError { name, error, .. } => println!("[tool] {name} failed: {error}"),
        _ => {}
    }
}

fn print_summary(summary: &SessionSummary, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{indent}{}  {} items  {}  {}",
        summary.id,
        summary.item_count,
        summary.last_active_at.format("%Y-%m-%d %H:%M"),
        summary.preview
    );
}

fn print_tree(node: &SessionTreeNode, depth: usize) {
    print_summary(&node.session, depth);
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    Ok(())
}
