use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use tracing::info;

use crate::cli::args::{
    ConfigAction, ConfigArgs, CreateArgs, DeleteArgs, ExecArgs, InitArgs, OutputFormat,
    RunCodeArgs, StartArgs, UrlArgs, WriteArgs,
};
use crate::client::SandboxClient;
use crate::config::loader::get_config_path;
use crate::config::types::SandgateConfig;
use crate::error::{Result, SandgateError};
use crate::sandbox::{ExecOptions, ExecutionResult, RemoteShell};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Sandbox Commands
// ============================================================================

/// Create a new sandbox
pub async fn create(args: CreateArgs, config: SandgateConfig, format: OutputFormat) -> Result<()> {
    info!(template = %args.template, "Creating sandbox");

    let client = SandboxClient::new(&config)?;
    let metadata: HashMap<String, String> = args.metadata.into_iter().collect();
    let handle = client.create_sandbox(&args.template, metadata).await?;

    match format {
        OutputFormat::Text => println!("{}", handle.id),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&handle)?),
    }
    Ok(())
}

/// Execute a command in a sandbox
pub async fn exec(args: ExecArgs, config: SandgateConfig, format: OutputFormat) -> Result<()> {
    info!(sandbox = %args.sandbox, command = %args.command, "Executing command");

    let client = SandboxClient::new(&config)?;
    let options = ExecOptions {
        cwd: args.cwd,
        envs: args.env_vars.into_iter().collect(),
        timeout: args.timeout_ms.map(Duration::from_millis),
    };

    let result = match client
        .execute_command(&args.sandbox, &args.command, &options)
        .await
    {
        Ok(result) => result,
        Err(SandgateError::CommandTimeout {
            command,
            timeout_ms,
            partial,
        }) => {
            // Show what arrived before the deadline, then fail
            output_command_result(&partial, format.clone());
            return Err(SandgateError::CommandTimeout {
                command,
                timeout_ms,
                partial,
            });
        }
        Err(e) => return Err(e),
    };

    output_command_result(&result, format);
    Ok(())
}

/// Write a file from a local path or stdin
pub async fn write(args: WriteArgs, config: SandgateConfig, format: OutputFormat) -> Result<()> {
    let content = match &args.from {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let client = SandboxClient::new(&config)?;
    client.write_file(&args.sandbox, &args.path, &content).await?;

    match format {
        OutputFormat::Text => println!("Wrote {} bytes to {}", content.len(), args.path),
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "path": args.path,
                "bytes": content.len(),
            })
        ),
    }
    Ok(())
}

/// Run Python code
pub async fn run_code(args: RunCodeArgs, config: SandgateConfig, format: OutputFormat) -> Result<()> {
    let client = SandboxClient::new(&config)?;
    let result = client.run_code(&args.sandbox, &args.code).await?;

    match format {
        OutputFormat::Text => {
            print!("{}", result.stdout);
            if let Some(error) = &result.error {
                eprint!("{}", error);
                std::process::exit(result.exit_code);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
    }
    Ok(())
}

/// Start a background command, optionally waiting for its HTTP port
pub async fn start(args: StartArgs, config: SandgateConfig, format: OutputFormat) -> Result<()> {
    let client = SandboxClient::new(&config)?;
    client
        .start_background(&args.sandbox, &args.command, &args.log)
        .await?;

    let ready = match args.wait_port {
        Some(port) => Some(
            client
                .wait_for_http(&args.sandbox, port, args.attempts, POLL_INTERVAL)
                .await?,
        ),
        None => None,
    };

    match format {
        OutputFormat::Text => {
            println!("Started; output in {}", args.log);
            match (ready, args.wait_port) {
                (Some(true), Some(port)) => println!("Port {} is answering", port),
                (Some(false), Some(port)) => {
                    eprintln!("Port {} did not answer after {} attempts", port, args.attempts);
                    std::process::exit(1);
                }
                _ => {}
            }
        }
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "log": args.log,
                "port": args.wait_port,
                "ready": ready,
            })
        ),
    }
    Ok(())
}

/// Print the public URL for a sandbox port
pub async fn url(args: UrlArgs, config: SandgateConfig, format: OutputFormat) -> Result<()> {
    let client = SandboxClient::new(&config)?;
    let url = client.get_sandbox_url(&args.sandbox, args.port).await?;

    match format {
        OutputFormat::Text => println!("{}", url),
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "sandbox": args.sandbox,
                "port": args.port,
                "url": url,
            })
        ),
    }
    Ok(())
}

/// Delete a sandbox
pub async fn delete(args: DeleteArgs, config: SandgateConfig, format: OutputFormat) -> Result<()> {
    info!(sandbox = %args.sandbox, "Deleting sandbox");

    let client = SandboxClient::new(&config)?;
    client.delete_sandbox(&args.sandbox).await?;

    match format {
        OutputFormat::Text => println!("Sandbox '{}' deleted", args.sandbox),
        OutputFormat::Json => println!("{}", serde_json::json!({ "deleted": args.sandbox })),
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

    let default_config = SandgateConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| SandgateError::Config(e.to_string()))?;

    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Create a sandbox");
    println!("  sandgate create --template base");
    println!();
    println!("  # Run a command in it");
    println!("  sandgate exec <sandbox-id> \"echo hello\"");
    println!();
    println!("  # Expose a web server running on port 3000");
    println!("  sandgate url <sandbox-id> --port 3000");
    println!();
    println!("  # Delete it when done");
    println!("  sandgate delete <sandbox-id>");

    Ok(())
}

pub async fn config(args: ConfigArgs, mut config: SandgateConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            if config.api.api_key.is_some() {
                config.api.api_key = Some("********".to_string());
            }
            let toml_str =
                toml::to_string_pretty(&config).map_err(|e| SandgateError::Config(e.to_string()))?;
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

fn output_command_result(result: &ExecutionResult, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            if !result.stdout.is_empty() {
                print!("{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                eprint!("{}", result.stderr);
            }
            // Exit with the command's exit code
            if result.exit_code != 0 && !result.timed_out {
                std::process::exit(result.exit_code);
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "stdout": result.stdout,
                    "stderr": result.stderr,
                    "exit_code": result.exit_code,
                    "timed_out": result.timed_out,
                })
            );
        }
    }
}
