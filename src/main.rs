use clap::Parser;

use polysandbox::cli::args::{Cli, Commands};
use polysandbox::cli::commands;
use polysandbox::config::loader::load_config;
use polysandbox::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.global_opts.verbose);

    // Load configuration (file + environment overrides)
    let config = load_config(cli.global_opts.config.as_deref())?;
    let format = cli.global_opts.format.clone();

    match cli.command {
        Commands::Exec(args) => {
            commands::exec(args, config, format).await?;
        }
        Commands::Languages => {
            commands::languages(config, format).await?;
        }
        Commands::Init(args) => {
            commands::init(args).await?;
        }
        Commands::Config(args) => {
            commands::config(args, config).await?;
        }
    }

    Ok(())
}

fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so stdout carries only program output
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
