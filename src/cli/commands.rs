use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cli::args::{ConfigAction, ConfigArgs, ExecArgs, InitArgs, OutputFormat};
use crate::config::loader::{default_config_toml, get_config_path};
use crate::config::units::{format_duration, parse_duration};
use crate::config::PolysandboxConfig;
use crate::error::{Result, SandboxError};
use crate::sandbox::{DockerCli, ExecuteRequest, ExecuteResult, Executor, Manager, SandboxExecutor};

// ============================================================================
// Execution Commands
// ============================================================================

/// Execute one snippet and print its result
pub async fn exec(args: ExecArgs, config: PolysandboxConfig, format: OutputFormat) -> Result<()> {
    let code = match (&args.file, &args.code) {
        (Some(path), _) => tokio::fs::read_to_string(path).await?,
        (None, Some(code)) => code.clone(),
        (None, None) => {
            let mut code = String::new();
            tokio::io::stdin().read_to_string(&mut code).await?;
            code
        }
    };

    let mut files = BTreeMap::new();
    for aux in &args.aux_files {
        let content = tokio::fs::read_to_string(&aux.host_path).await?;
        files.insert(aux.workspace_path.clone(), content);
    }

    let id = args
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut request = ExecuteRequest::new(&args.language, code)
        .with_id(&id)
        .with_project(&args.project);
    request.env = args.env_vars.iter().cloned().collect();
    request.files = files;
    request.isolation = args.isolation;
    if let Some(timeout) = &args.timeout {
        request.timeout = Some(parse_duration(timeout)?);
    }
    if let Some(path) = &args.stdin_file {
        request.stdin = Some(tokio::fs::read_to_string(path).await?);
    }

    let manager = Arc::new(Manager::new(config.sandbox)?);
    let isolation = request
        .isolation
        .unwrap_or(manager.config().default_isolation);
    if !isolation.uses_proxy() {
        let docker = DockerCli::new(manager.config().docker_host.clone());
        if !docker.is_available().await {
            return Err(SandboxError::Runtime(
                "Docker daemon is not accessible. Ensure Docker is installed and running."
                    .to_string(),
            ));
        }
    }

    let executor = Arc::new(SandboxExecutor::new(manager));
    info!(execution_id = %id, language = %args.language, isolation = %isolation, "Executing snippet");

    // Ctrl-C kills the run; the result is still printed
    let interrupt = {
        let executor = Arc::clone(&executor);
        let id = id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                if let Err(e) = executor.kill(&id).await {
                    warn!(execution_id = %id, error = %e, "Failed to kill execution");
                }
            }
        })
    };

    let result = executor.execute(request).await;
    interrupt.abort();

    output_execute_result(&result?, format)
}

/// List supported languages
pub async fn languages(config: PolysandboxConfig, format: OutputFormat) -> Result<()> {
    let manager = Manager::new(config.sandbox)?;
    let templates = manager.templates();

    match format {
        OutputFormat::Text => {
            println!(
                "{:<12} {:<28} {:>8} {:>6} {:>6} {:>8}",
                "LANGUAGE", "IMAGE", "MEMORY", "CPUS", "PIDS", "TIMEOUT"
            );
            println!("{}", "-".repeat(74));
            for template in &templates {
                let quota = manager.effective_quota(&template.language);
                println!(
                    "{:<12} {:<28} {:>7}M {:>6} {:>6} {:>8}",
                    template.language,
                    template.image,
                    quota.memory_bytes >> 20,
                    quota.cpu_cores,
                    quota.pids_limit,
                    format_duration(quota.timeout),
                );
            }
        }
        OutputFormat::Json => {
            let entries: Vec<_> = templates
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "language": t.language,
                        "image": t.image,
                        "file_name": t.file_name,
                        "command": t.command_template,
                        "quota": manager.effective_quota(&t.language),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&config_path, default_config_toml()?)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Run a snippet");
    println!("  polysandbox exec python --code 'print(\"hello\")'");
    println!();
    println!("  # Run a file under gVisor with a tighter timeout");
    println!("  polysandbox exec go --file main.go --isolation gvisor --timeout 20s");
    println!();
    println!("  # See what languages are available");
    println!("  polysandbox languages");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: PolysandboxConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| SandboxError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn output_execute_result(result: &ExecuteResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            if !result.stdout.is_empty() {
                print!("{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                eprint!("{}", result.stderr);
            }
            if result.timed_out {
                eprintln!("[timed out after {}ms]", result.duration.as_millis());
            } else if result.killed {
                eprintln!("[killed]");
            }
            // Exit with the program's exit code
            if result.exit_code != 0 {
                std::process::exit(result.exit_code);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
    }
    Ok(())
}
