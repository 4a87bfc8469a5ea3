mod args;
mod context;
mod handlers;
mod llm;

pub use args::{Cli, Commands};

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use context::CliContext;

pub fn run(cli: Cli) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();

    let context = CliContext::resolve(cli.root.as_deref())?;

    match cli.command {
        Commands::Init => handlers::init(&context),
        Commands::Mission { command } => handlers::mission(&context, command),
        Commands::Queue { command } => handlers::queue(&context, command),
        Commands::Snapshot { command } => handlers::snapshot(&context, command),
        Commands::Kb { command } => handlers::kb(&context, command),
        Commands::Analytics { command } => handlers::analytics(&context, command),
    }
}
