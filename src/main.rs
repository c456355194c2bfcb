mod coach;
mod commands;
mod config;
mod db;
mod judge;
mod models;
mod repl;
mod scheduler;
mod session;
mod store;

use clap::{Parser, Subcommand};
use std::io;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use commands::Context;
use config::Config;
use db::Database;
use judge::{judges_from_config, Judge};
use repl::Repl;

#[derive(Parser)]
#[command(name = "learnlock")]
#[command(about = "Spaced repetition with an adversarial Socratic coach")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Without a subcommand, start the interactive prompt
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage sources
    #[command(subcommand)]
    Source(SourceCommands),

    /// Manage concepts
    #[command(subcommand)]
    Concept(ConceptCommands),

    /// Show concepts due for review
    Due,

    /// Show learning statistics
    Stats,

    /// Skip a concept by (partial) name
    Skip {
        /// Case-insensitive part of the concept name
        name: String,
    },

    /// Restore a skipped concept, or list skipped concepts
    Unskip {
        /// Case-insensitive part of the concept name
        name: Option<String>,
    },

    /// Study due concepts
    Study {
        /// Grade each answer once instead of holding a dialogue
        #[arg(long, short)]
        quick: bool,
    },

    /// Show the effective configuration
    Config,
}

#[derive(Subcommand)]
enum SourceCommands {
    /// Register a source
    Add {
        /// Source URL
        url: String,

        /// Source title
        #[arg(long, short)]
        title: String,

        /// Source kind (article, youtube, pdf, ...)
        #[arg(long, short)]
        kind: Option<String>,
    },

    /// List sources with concept counts
    List,
}

#[derive(Subcommand)]
enum ConceptCommands {
    /// Add a concept
    Add {
        /// Concept name
        name: String,

        /// Ground-truth passage from the source
        #[arg(long, short)]
        quote: String,

        /// Challenge question to open the dialogue with
        #[arg(long)]
        question: Option<String>,

        /// Owning source ID
        #[arg(long, short)]
        source: Option<i64>,
    },

    /// List concepts grouped by source
    List,

    /// Show concept details and history
    Show {
        /// Concept ID
        id: i64,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn log_directive<F>(verbose: bool, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    set("LEARNLOCK_LOG")
        .or_else(|| set("RUST_LOG"))
        .unwrap_or_else(|| if verbose { "debug" } else { "warn" }.to_string())
}

fn init_tracing(verbose: bool) {
    let directive = log_directive(verbose, |key| std::env::var(key).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::open(&config.db_path)?;
    db.init()?;
    debug!(db = %config.db_path.display(), "database ready");

    let ctx = Context::new(&db, &config, cli.json);
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut out = io::stdout();

    let Some(command) = cli.command else {
        let judges = judges_from_config(&config.judge, &config.grading)?;
        let refs: Vec<&dyn Judge> = judges.iter().map(|j| j as &dyn Judge).collect();
        return Repl::new(&ctx, &refs).run(&mut input, &mut out);
    };

    match command {
        Commands::Init => ctx.init(&config.db_path, &mut out),

        Commands::Source(source_cmd) => match source_cmd {
            SourceCommands::Add { url, title, kind } => {
                ctx.source_add(&url, &title, kind.as_deref(), &mut out)
            }
            SourceCommands::List => ctx.source_list(&mut out),
        },

        Commands::Concept(concept_cmd) => match concept_cmd {
            ConceptCommands::Add {
                name,
                quote,
                question,
                source,
            } => ctx.concept_add(&name, &quote, question.as_deref(), source, &mut out),
            ConceptCommands::List => ctx.concept_list(&mut out),
            ConceptCommands::Show { id } => ctx.concept_show(id, &mut out),
        },

        Commands::Due => ctx.due(&mut out),
        Commands::Stats => ctx.stats(&mut out),
        Commands::Skip { name } => ctx.skip(&name, &mut out),
        Commands::Unskip { name } => ctx.unskip(name.as_deref(), &mut out),
        Commands::Study { quick } => ctx.study(quick, &mut input, &mut out),
        Commands::Config => ctx.show_config(&mut out),
    }
}
