//! Operator CLI over the gateway core: server/tool inspection, direct tool
//! calls, one-shot agent turns and session reports.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::bail;
use clap::Parser;
use clap::Subcommand;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use agentgate_core::Agent;
use agentgate_core::AgentConfig;
use agentgate_core::CleanupRegistry;
use agentgate_core::ConnectionManager;
use agentgate_core::Gateway;
use agentgate_core::GatewayConfig;
use agentgate_core::GatewayOptions;
use agentgate_core::NoRetrieval;
use agentgate_core::ResilientGenerator;
use agentgate_core::config::DEFAULT_CONFIG_PATH;
use agentgate_core::shutdown::DEFAULT_TASK_DEADLINE;
use agentgate_core::shutdown::SHUTDOWN_HARD_CAP;
use agentgate_core::shutdown::wait_for_shutdown_signal;
use agentgate_ollama::OllamaClient;

const SESSION_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Local-first gateway between a chat loop, stdio tool servers and a local
/// Ollama instance.
#[derive(Debug, Parser)]
#[command(name = "agentgate", version)]
pub struct Cli {
    /// Path to the gateway configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List configured tool servers and their state.
    Servers,
    /// List tools, for one server or across all ready servers.
    Tools {
        server: Option<String>,
    },
    /// Invoke one tool with JSON arguments through the full middleware
    /// stack.
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object.
        args: String,
        /// Serve repeated identical calls from the general cache.
        #[arg(long)]
        cached: bool,
    },
    /// Run one full agent turn: tool selection, execution, synthesis.
    Ask {
        message: String,
        /// Skip tool selection and answer generation-only.
        #[arg(long)]
        no_tools: bool,
    },
    /// Disconnect one server and establish a fresh session.
    Reconnect {
        server: String,
    },
    /// List models known to the inference service.
    Models,
    /// Print the most recently saved session report.
    Report,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("AGENTGATE_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = GatewayConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    init_tracing(&config);

    match cli.command {
        Command::Models => run_models(&config).await,
        Command::Report => run_report(&config),
        command => {
            let gateway = Gateway::new(GatewayOptions::from(&config));
            Gateway::start_cache_sweeper(&gateway);
            let manager = Arc::new(ConnectionManager::new(&config, Arc::clone(&gateway)));
            manager.connect_all().await;

            let result = tokio::select! {
                result = run_command(command, &config, &gateway, &manager) => result,
                _ = wait_for_shutdown_signal() => Ok(()),
            };

            run_cleanup_chain(&gateway, &manager).await;
            result
        }
    }
}

async fn run_command(
    command: Command,
    config: &GatewayConfig,
    gateway: &Arc<Gateway>,
    manager: &Arc<ConnectionManager>,
) -> anyhow::Result<()> {
    match command {
        Command::Servers => {
            for status in manager.list_servers().await {
                let state = if status.ready {
                    format!("ready ({} tools)", status.tool_count)
                } else {
                    format!(
                        "not ready ({})",
                        status.detail.as_deref().unwrap_or("unknown")
                    )
                };
                let description = status.description.as_deref().unwrap_or("");
                println!("{:<20} {state:<32} {description}", status.name);
            }
        }
        Command::Tools { server } => {
            let tools = manager
                .list_tools(server.as_deref())
                .await
                .map_err(|err| anyhow::anyhow!("{err} ({})", err.kind()))?;
            if tools.is_empty() {
                println!("no tools available");
            }
            for tool in tools {
                let description = tool.description.as_deref().unwrap_or("");
                println!("{:<40} {description}", tool.qualified_name());
            }
        }
        Command::Call {
            server,
            tool,
            args,
            cached,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("arguments must be valid JSON")?;
            match manager
                .call_tool(&server, &tool, arguments, None, cached)
                .await
            {
                Ok(result) => println!("{}", result.text_content()),
                Err(err) => bail!("tool call failed: {err} ({})", err.kind()),
            }
        }
        Command::Ask { message, no_tools } => {
            let client = Arc::new(OllamaClient::new(
                config.ollama.base_url.clone(),
                config.ollama.model.clone(),
            ));
            let generator = ResilientGenerator::new(client, Arc::clone(gateway));
            let agent_config = AgentConfig {
                tools_enabled: !no_tools,
                ..AgentConfig::default()
            };
            let mut agent = Agent::new(
                Arc::clone(manager),
                generator,
                NoRetrieval,
                agent_config,
            );

            let turn = agent.handle_turn(&message).await;
            println!("{}", turn.answer);

            if !turn.actions.is_empty() {
                eprintln!();
                for action in &turn.actions {
                    let target = match (&action.server, &action.tool) {
                        (Some(server), Some(tool)) => format!(" {server}.{tool}"),
                        _ => String::new(),
                    };
                    let status = if action.success { "ok" } else { "failed" };
                    eprintln!(
                        "[{:?}{target}] {status} in {}ms",
                        action.kind, action.duration_ms
                    );
                }
            }

            if !agent.session_log().is_empty() {
                match agent.session_log().save(&config.logging.dir) {
                    Ok(saved) => eprintln!("session log: {}", saved.json_path.display()),
                    Err(err) => warn!("failed to save session log: {err}"),
                }
            }
        }
        Command::Reconnect { server } => match manager.reconnect(&server).await {
            Ok(tool_count) => println!("{server}: ready ({tool_count} tools)"),
            Err(err) => bail!("reconnect failed: {err} ({})", err.kind()),
        },
        Command::Models | Command::Report => unreachable!("handled before connect"),
    }
    Ok(())
}

async fn run_models(config: &GatewayConfig) -> anyhow::Result<()> {
    let client = OllamaClient::new(config.ollama.base_url.clone(), config.ollama.model.clone());
    let models = client
        .list_models()
        .await
        .map_err(|err| anyhow::anyhow!("{err} ({})", err.kind()))?;
    let current = client.current_model().await;
    if models.is_empty() {
        println!("no models installed");
    }
    for model in models {
        let marker = if model.name == current { "*" } else { " " };
        println!("{marker} {}", model.name);
    }
    Ok(())
}

fn run_report(config: &GatewayConfig) -> anyhow::Result<()> {
    match latest_report(&config.logging.dir) {
        Some(path) => {
            let report = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            print!("{report}");
            Ok(())
        }
        None => {
            println!(
                "no session reports found in {}",
                config.logging.dir.display()
            );
            Ok(())
        }
    }
}

/// Most recent `report_session_*.txt` in the log directory; the timestamp
/// suffix makes lexicographic order chronological.
fn latest_report(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| {
                    name.starts_with("report_session_") && name.ends_with(".txt")
                })
        })
        .max()
}

async fn run_cleanup_chain(gateway: &Arc<Gateway>, manager: &Arc<ConnectionManager>) {
    let mut registry = CleanupRegistry::new();

    {
        let gateway = Arc::clone(gateway);
        registry.register("save metrics summary", async move {
            let summary = gateway.metrics().summary();
            for (endpoint, stats) in &summary.endpoints {
                tracing::info!(
                    endpoint = %endpoint,
                    calls = stats.calls,
                    errors = stats.errors,
                    p95_ms = stats.p95_ms,
                    "final metrics"
                );
            }
            Ok(())
        });
    }
    {
        let gateway = Arc::clone(gateway);
        registry.register("clear caches", async move {
            gateway.stop_cache_sweeper();
            gateway.caches().clear_all();
            Ok(())
        });
    }
    {
        let manager = Arc::clone(manager);
        registry.register("disconnect tool servers", async move {
            manager.shutdown(SESSION_SHUTDOWN_GRACE).await;
            Ok(())
        });
    }

    if tokio::time::timeout(SHUTDOWN_HARD_CAP, registry.run(DEFAULT_TASK_DEADLINE))
        .await
        .is_err()
    {
        warn!("shutdown hard cap exceeded; exiting anyway");
    }
}

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn latest_report_picks_the_newest_timestamp() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in [
            "report_session_aaaa_20250101_000000.txt",
            "report_session_bbbb_20250601_120000.txt",
            "report_session_cccc_20250301_080000.txt",
            "session_bbbb_20250601_120000.json",
            "unrelated.txt",
        ] {
            fs::write(dir.path().join(name), "x").expect("write");
        }
        let latest = latest_report(dir.path()).expect("latest");
        assert_eq!(
            latest.file_name().and_then(|n| n.to_str()),
            Some("report_session_bbbb_20250601_120000.txt")
        );
    }

    #[test]
    fn latest_report_handles_missing_directory() {
        assert!(latest_report(Path::new("/nonexistent/agentgate-logs")).is_none());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "agentgate",
            "call",
            "filesystem",
            "read_file",
            r#"{"path": "/tmp/hello.txt"}"#,
            "--cached",
        ])
        .expect("parse");
        match cli.command {
            Command::Call {
                server,
                tool,
                cached,
                ..
            } => {
                assert_eq!(server, "filesystem");
                assert_eq!(tool, "read_file");
                assert!(cached);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
