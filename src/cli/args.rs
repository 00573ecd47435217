use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "sandgate")]
#[clap(version, about = "Run commands in remote sandboxes and expose their ports")]
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
    #[clap(short, long, global = true, env = "SANDGATE_CONFIG")]
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
    /// Create a new sandbox
    Create(CreateArgs),

    /// Execute a shell command in a sandbox
    Exec(ExecArgs),

    /// Write a file inside a sandbox
    Write(WriteArgs),

    /// Run Python code in a sandbox
    RunCode(RunCodeArgs),

    /// Start a long-running command in the background
    Start(StartArgs),

    /// Print the public URL of a sandbox port, opening a relay if needed
    Url(UrlArgs),

    /// Delete a sandbox and its relays
    Delete(DeleteArgs),

    /// Initialize a new sandgate configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Sandbox Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Template to create the sandbox from
    #[clap(long, short = 't', default_value = "base")]
    pub template: String,

    /// Metadata attached to the sandbox (KEY=VALUE)
    #[clap(long = "metadata", short = 'm', value_parser = parse_key_value)]
    pub metadata: Vec<(String, String)>,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Sandbox ID
    pub sandbox: String,

    /// Command to execute
    pub command: String,

    /// Working directory inside the sandbox
    #[clap(long)]
    pub cwd: Option<String>,

    /// Environment variables to set (KEY=VALUE)
    #[clap(long = "env", short = 'e', value_parser = parse_key_value)]
    pub env_vars: Vec<(String, String)>,

    /// Timeout in milliseconds (defaults to execution.default_timeout_ms)
    #[clap(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
pub struct WriteArgs {
    /// Sandbox ID
    pub sandbox: String,

    /// Destination path inside the sandbox
    pub path: String,

    /// Local file to upload (reads stdin when omitted)
    #[clap(long, short = 'f')]
    pub from: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RunCodeArgs {
    /// Sandbox ID
    pub sandbox: String,

    /// Python source
    pub code: String,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Sandbox ID
    pub sandbox: String,

    /// Command to run detached
    pub command: String,

    /// Log file inside the sandbox
    #[clap(long, default_value = "/tmp/sandgate-background.log")]
    pub log: String,

    /// Wait until an HTTP server answers on this port
    #[clap(long)]
    pub wait_port: Option<u16>,

    /// Number of readiness checks
    #[clap(long, default_value = "30")]
    pub attempts: u32,
}

#[derive(Args, Debug)]
pub struct UrlArgs {
    /// Sandbox ID
    pub sandbox: String,

    /// Port inside the sandbox
    #[clap(long, short = 'p', default_value = "80")]
    pub port: u16,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Sandbox ID
    pub sandbox: String,
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

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| "Expected format: KEY=VALUE".to_string())
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
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("NODE_ENV=production").unwrap(),
            ("NODE_ENV".to_string(), "production".to_string())
        );
        assert_eq!(
            parse_key_value("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_key_value("missing").is_err());
    }

    #[test]
    fn test_parse_exec() {
        let cli = Cli::parse_from([
            "sandgate",
            "exec",
            "sb1",
            "npm install",
            "--cwd",
            "/root/app",
            "-e",
            "CI=1",
            "--timeout-ms",
            "500",
        ]);
        match cli.command {
            Commands::Exec(args) => {
                assert_eq!(args.sandbox, "sb1");
                assert_eq!(args.command, "npm install");
                assert_eq!(args.cwd.as_deref(), Some("/root/app"));
                assert_eq!(args.env_vars, vec![("CI".to_string(), "1".to_string())]);
                assert_eq!(args.timeout_ms, Some(500));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_url_defaults() {
        let cli = Cli::parse_from(["sandgate", "--format", "json", "url", "sb1"]);
        assert!(matches!(cli.global_opts.format, OutputFormat::Json));
        match cli.command {
            Commands::Url(args) => assert_eq!(args.port, 80),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
