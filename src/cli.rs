//! Command-line entry points: tool discovery, module generation and one-shot
//! code runs.

use crate::agent::{CodeTaskRunner, ToolCatalog, Workbench};
use crate::codegen::{render_summaries, support_files};
use crate::config::Config;
use crate::mcp::{FailureStage, ProviderStatus, ToolRegistry};
use crate::session::{ExecutionError, ExecutionOutput, SessionError};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Programmatic tool calling: generated tool modules, sandboxed sessions and
/// background tasks
#[derive(Parser, Debug)]
#[command(name = "ptc", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Discover providers and print the tool summaries
    Tools(ToolsArgs),
    /// Write generated modules and docs to a directory
    Generate(GenerateArgs),
    /// Run a code file in a fresh session
    Run(RunArgs),
    /// View configuration
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct ToolsArgs {
    /// Output format
    #[arg(short = 'o', long, default_value = "text", value_enum)]
    pub output_format: OutputFormat,
}

#[derive(Parser, Debug)]
pub struct GenerateArgs {
    /// Directory to write `tools/` into
    #[arg(long)]
    pub out: PathBuf,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Code file to run (use "-" to read from stdin)
    pub file: PathBuf,

    /// Seconds before the run is stopped
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Where to copy the session's results/ directory
    #[arg(long, default_value = "results")]
    pub export: PathBuf,

    /// Output format
    #[arg(short = 'o', long, default_value = "text", value_enum)]
    pub output_format: OutputFormat,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show config file path
    Path,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// JSON output of `ptc run`.
#[derive(Serialize)]
struct RunReport<'a> {
    status: &'static str,
    output: Option<&'a ExecutionOutput>,
    exported: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    Ok(config)
}

/// Installs the tracing subscriber.
///
/// `PTC_LOG=<file>` logs everything from this crate to a file; otherwise
/// `RUST_LOG` or the config level filters a stderr logger.
pub fn init_logging(config: &Config, verbose: bool) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    if let Ok(path) = std::env::var("PTC_LOG") {
        match std::fs::File::create(&path) {
            Ok(file) => {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false);
                let filter = EnvFilter::new("ptc=debug");
                let _ = tracing_subscriber::registry()
                    .with(file_layer.with_filter(filter))
                    .try_init();
                return;
            }
            Err(err) => {
                eprintln!("Failed to create log file {path}: {err}");
            }
        }
    }

    let filter = if verbose {
        EnvFilter::new("ptc=debug")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Entry point for every subcommand.
pub async fn run(cli: Cli) -> ExitCode {
    match run_inner(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run_inner(cli: Cli) -> Result<ExitCode> {
    if let Commands::Config(ConfigArgs {
        action: ConfigAction::Path,
    }) = &cli.command
    {
        println!("{}", Config::config_path().display());
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Tools(args) => tools(&config, args).await,
        Commands::Generate(args) => generate(&config, &args).await,
        Commands::Run(args) => run_file(&config, args).await,
        Commands::Config(_) => Ok(ExitCode::SUCCESS),
    }
}

async fn discover(config: &Config) -> (ToolRegistry, ToolCatalog) {
    let registry = ToolRegistry::default().with_invoke_timeout(config.invoke_timeout());
    let catalog = ToolCatalog::build(&registry, &config.provider_specs()).await;
    (registry, catalog)
}

fn status_line(name: &str, status: &ProviderStatus) -> String {
    match status {
        ProviderStatus::Ready { tool_count } => format!("  {name}: ready ({tool_count} tools)"),
        ProviderStatus::Failed { stage, message } => {
            let stage = match stage {
                FailureStage::Connect => "connect",
                FailureStage::Discover => "discovery",
            };
            format!("  {name}: failed during {stage}: {message}")
        }
        ProviderStatus::Disabled => format!("  {name}: disabled"),
    }
}

async fn tools(config: &Config, args: ToolsArgs) -> Result<ExitCode> {
    let (registry, catalog) = discover(config).await;
    let summaries = render_summaries(
        &catalog.modules,
        &config.provider_specs(),
        config.mcp.tool_exposure_mode,
    );
    registry.shutdown().await;

    match args.output_format {
        OutputFormat::Text => {
            println!("{summaries}");
            if !catalog.report.statuses.is_empty() {
                println!("\nProviders:");
                for (name, status) in &catalog.report.statuses {
                    println!("{}", status_line(name, status));
                }
            }
            for (provider, error) in &catalog.failures {
                eprintln!("Warning: {provider}: {error}");
            }
        }
        OutputFormat::Json => {
            let failures: BTreeMap<&String, String> = catalog
                .failures
                .iter()
                .map(|(provider, error)| (provider, error.to_string()))
                .collect();
            let json = serde_json::json!({
                "providers": catalog.report.statuses,
                "generation_failures": failures,
                "summaries": summaries,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn generate(config: &Config, args: &GenerateArgs) -> Result<ExitCode> {
    let (registry, catalog) = discover(config).await;
    registry.shutdown().await;

    let mut files: Vec<(String, &str)> = support_files()
        .into_iter()
        .map(|(path, content)| (path.to_string(), content))
        .collect();
    for module in &catalog.modules {
        files.extend(module.files());
    }
    for (path, content) in &files {
        let target = args.out.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&target, content).with_context(|| format!("writing {}", target.display()))?;
    }

    for (name, status) in catalog.report.failures() {
        eprintln!("Warning: {}", status_line(name, status).trim_start());
    }
    for (provider, error) in &catalog.failures {
        eprintln!("Warning: {provider}: {error}");
    }
    println!(
        "Wrote {} module(s) to {}",
        catalog.modules.len(),
        args.out.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn read_code(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
    }
}

async fn run_file(config: &Config, args: RunArgs) -> Result<ExitCode> {
    let code = read_code(&args.file)?;
    if code.trim().is_empty() {
        anyhow::bail!("Empty code file");
    }

    let (workbench, catalog) = Workbench::bootstrap(config, Arc::new(CodeTaskRunner)).await?;
    for (name, status) in catalog.report.failures() {
        tracing::warn!(provider = %name, "Provider unavailable: {:?}", status);
    }

    let timeout = args.timeout.map(Duration::from_secs);
    let result = workbench.execute_code(&code, timeout).await;
    let exported = match workbench.session().export_results(&args.export).await {
        Ok(summary) => summary.files,
        Err(e) => {
            tracing::warn!("Failed to export results: {}", e);
            Vec::new()
        }
    };
    workbench.close().await;

    let (status, output, error, exit) = match &result {
        Ok(output) => ("ok", Some(output), None, ExitCode::SUCCESS),
        Err(SessionError::Execution(e @ ExecutionError::Timeout { .. })) => {
            ("timeout", e.output(), Some(e.to_string()), ExitCode::from(3))
        }
        Err(SessionError::Execution(e @ ExecutionError::Runtime { .. })) => {
            ("runtime", e.output(), Some(e.to_string()), ExitCode::from(1))
        }
        Err(e) => return Err(anyhow::anyhow!("{e}")),
    };

    match args.output_format {
        OutputFormat::Text => {
            if let Some(output) = output {
                print!("{}", output.stdout);
                eprint!("{}", output.stderr);
            }
            if let Some(error) = &error {
                eprintln!("Error: {error}");
            }
            if !exported.is_empty() {
                eprintln!(
                    "Exported {} file(s) to {}",
                    exported.len(),
                    args.export.display()
                );
            }
        }
        OutputFormat::Json => {
            let report = RunReport {
                status,
                output,
                exported,
                error,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from(["ptc", "run", "job.py", "--timeout", "5"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.file, PathBuf::from("job.py"));
        assert_eq!(args.timeout, Some(5));
        assert_eq!(args.export, PathBuf::from("results"));
        assert_eq!(args.output_format, OutputFormat::Text);

        let cli = Cli::try_parse_from(["ptc", "generate", "--out", "gen", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Generate(ref a) if a.out == Path::new("gen")));

        let cli = Cli::try_parse_from(["ptc", "tools", "-o", "json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Tools(ToolsArgs {
                output_format: OutputFormat::Json
            })
        ));

        assert!(Cli::try_parse_from(["ptc", "generate"]).is_err());
        assert!(Cli::try_parse_from(["ptc"]).is_err());
    }

    #[test]
    fn test_status_line() {
        assert_eq!(
            status_line("alpha", &ProviderStatus::Ready { tool_count: 3 }),
            "  alpha: ready (3 tools)"
        );
        assert_eq!(
            status_line(
                "beta",
                &ProviderStatus::Failed {
                    stage: FailureStage::Connect,
                    message: "connection refused".to_string(),
                }
            ),
            "  beta: failed during connect: connection refused"
        );
    }

    #[tokio::test]
    async fn test_run_file_exports_results() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().join("data");
        config.mcp.bridge = false;
        config.session.interpreter = "sh".to_string();
        config.session.code_extension = "sh".to_string();
        config.orchestrator.roles_dir = Some(dir.path().join("roles"));

        let script = dir.path().join("job.sh");
        std::fs::write(&script, "echo done\necho 42 > results/answer.txt\n").unwrap();
        let export = dir.path().join("out");
        run_file(
            &config,
            RunArgs {
                file: script,
                timeout: Some(10),
                export: export.clone(),
                output_format: OutputFormat::Json,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(export.join("answer.txt")).unwrap(),
            "42\n"
        );
    }
}
