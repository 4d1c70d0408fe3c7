use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::IsolationMode;

#[derive(Parser, Debug)]
#[clap(name = "polysandbox")]
#[clap(version, about = "Run untrusted code snippets in isolated containers")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "POLYSANDBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute one code snippet and print the result
    Exec(ExecArgs),

    /// List supported languages with their images and quotas
    Languages,

    /// Initialize a new polysandbox configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Language of the snippet (e.g., python, js, go, c++)
    pub language: String,

    /// Read the snippet from a file
    #[clap(long, short = 'f', conflicts_with = "code")]
    pub file: Option<PathBuf>,

    /// Pass the snippet inline; without --file or --code it is read from stdin
    #[clap(long)]
    pub code: Option<String>,

    /// Project used to scope workspaces and package caches
    #[clap(long, short = 'p', default_value = "")]
    pub project: String,

    /// Execution ID (generated when omitted)
    #[clap(long)]
    pub id: Option<String>,

    /// Isolation mode (defaults to the configured mode)
    #[clap(long, short = 'i', value_enum)]
    pub isolation: Option<IsolationMode>,

    /// Timeout (e.g., "30s", "2m"); defaults to the language quota
    #[clap(long, short = 't')]
    pub timeout: Option<String>,

    /// File whose content is fed to the program's stdin
    #[clap(long)]
    pub stdin_file: Option<PathBuf>,

    /// Environment variables to set in the sandbox (KEY=VALUE)
    #[clap(long = "env", short = 'e', value_parser = parse_env_var)]
    pub env_vars: Vec<(String, String)>,

    /// Auxiliary files to stage next to the snippet (relative/path=host_path)
    #[clap(long = "aux", value_parser = parse_aux_file)]
    pub aux_files: Vec<AuxFile>,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

/// An auxiliary file: where it lands in the workspace and where to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxFile {
    pub workspace_path: String,
    pub host_path: PathBuf,
}

fn parse_aux_file(s: &str) -> Result<AuxFile, String> {
    match s.split_once('=') {
        Some((rel, host)) if !rel.is_empty() && !host.is_empty() => Ok(AuxFile {
            workspace_path: rel.to_string(),
            host_path: PathBuf::from(host),
        }),
        _ => Err("Auxiliary file format: relative/path=host_path".to_string()),
    }
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| "Environment variable format: KEY=VALUE".to_string())
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exec() {
        let cli = Cli::parse_from([
            "polysandbox",
            "exec",
            "py",
            "--code",
            "print(1)",
            "-e",
            "A=1",
            "--aux",
            "data/in.csv=./in.csv",
            "--isolation",
            "gvisor",
            "--format",
            "json",
        ]);
        let Commands::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.language, "py");
        assert_eq!(args.code.as_deref(), Some("print(1)"));
        assert_eq!(args.env_vars, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(args.aux_files[0].workspace_path, "data/in.csv");
        assert_eq!(args.isolation, Some(IsolationMode::Gvisor));
        assert!(matches!(cli.global_opts.format, OutputFormat::Json));
    }

    #[test]
    fn test_file_conflicts_with_code() {
        let parsed = Cli::try_parse_from([
            "polysandbox",
            "exec",
            "go",
            "--code",
            "x",
            "--file",
            "main.go",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_aux_file_requires_both_sides() {
        assert!(parse_aux_file("a.txt=/tmp/a").is_ok());
        assert!(parse_aux_file("=/tmp/a").is_err());
        assert!(parse_aux_file("a.txt").is_err());
    }
}
