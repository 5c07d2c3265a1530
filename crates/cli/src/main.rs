use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use serde_json::Value;
use strata_engine::config::{EngineConfig, load_config, load_config_from_path};
use strata_engine::{
    Executor, JsonStateStore, ResolveInputs, ResolvedTemplate, SimulatedProvider, StateStore, parse_template_file, plan_apply, plan_destroy,
    resolve_template,
};
use strata_types::RunEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "strata", version, about = "Provision infrastructure from declarative templates")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding stack state files
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse and resolve a template without touching any stack
    Validate {
        template: PathBuf,
        #[command(flatten)]
        stack: StackArgs,
    },
    /// Show what `apply` would change
    Plan {
        template: PathBuf,
        #[command(flatten)]
        stack: StackArgs,
        /// Leave resources the template no longer declares in place
        #[arg(long)]
        keep_orphans: bool,
    },
    /// Create or update a stack from a template
    Apply {
        template: PathBuf,
        #[command(flatten)]
        stack: StackArgs,
        /// Maximum provider calls in flight
        #[arg(long)]
        concurrency: Option<usize>,
        /// Delete what this run created when a resource fails
        #[arg(long)]
        rollback: bool,
        /// Leave resources the template no longer declares in place
        #[arg(long)]
        keep_orphans: bool,
    },
    /// Delete every resource of a stack
    Destroy {
        #[arg(long, short)]
        stack: String,
        /// Print the deletions without making them
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the outputs and exports recorded for a stack
    Outputs {
        #[arg(long, short)]
        stack: String,
    },
    /// List stacks with recorded state
    List,
}

#[derive(Debug, Args)]
struct StackArgs {
    /// Stack name
    #[arg(long, short, default_value = "default")]
    stack: String,
    /// Parameter value as Key=Value; may be repeated
    #[arg(long = "parameter", short = 'p', value_parser = parse_key_value)]
    parameters: Vec<(String, String)>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config_from_path(path)?,
        None => load_config()?,
    };
    let store: Arc<dyn StateStore> = match &cli.state_dir {
        Some(directory) => Arc::new(JsonStateStore::new(directory.clone())),
        None => config.state_store(),
    };

    match cli.command {
        Command::Validate { template, stack } => {
            let resolved = resolve(&template, &stack, &config, store.as_ref())?;
            let order: Vec<&str> = resolved.graph.creation_order().iter().map(String::as_str).collect();
            print_json(&serde_json::json!({
                "stack_name": resolved.stack_name,
                "resources": resolved.graph.len(),
                "creation_order": order,
                "parameters": resolved.display_parameters,
            }))
        }
        Command::Plan {
            template,
            stack,
            keep_orphans,
        } => {
            let resolved = resolve(&template, &stack, &config, store.as_ref())?;
            let state = store.load(&resolved.stack_name)?;
            let plan = plan_apply(&resolved, state.as_ref(), config.delete_orphans && !keep_orphans)?;
            print_json(&plan)
        }
        Command::Apply {
            template,
            stack,
            concurrency,
            rollback,
            keep_orphans,
        } => {
            let resolved = resolve(&template, &stack, &config, store.as_ref())?;
            let mut options = config.apply_options();
            if let Some(concurrency) = concurrency {
                options.max_concurrency = concurrency.max(1);
            }
            options.rollback_on_failure |= rollback;
            options.delete_orphans &= !keep_orphans;

            let (sender, receiver) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_events(receiver));
            let executor = Executor::new(provider(&config, store.as_ref())?, store.clone())
                .with_options(options)
                .with_events(sender);
            let report = executor.apply(&resolved, cancel_on_ctrl_c()).await;
            drop(executor);
            let _ = printer.await;

            let report = report?;
            print_json(&report)?;
            report.ensure_success()?;
            Ok(())
        }
        Command::Destroy { stack, dry_run } => {
            if dry_run {
                let state = store
                    .load(&stack)?
                    .with_context(|| format!("no state recorded for stack '{stack}'"))?;
                return print_json(&plan_destroy(&state)?);
            }
            let (sender, receiver) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_events(receiver));
            let executor = Executor::new(provider(&config, store.as_ref())?, store.clone())
                .with_options(config.apply_options())
                .with_events(sender);
            let report = executor.destroy(&stack, cancel_on_ctrl_c()).await;
            drop(executor);
            let _ = printer.await;

            let report = report?;
            print_json(&report)?;
            report.ensure_success()?;
            Ok(())
        }
        Command::Outputs { stack } => {
            let state = store
                .load(&stack)?
                .with_context(|| format!("no state recorded for stack '{stack}'"))?;
            print_json(&serde_json::json!({
                "stack_name": state.stack_name,
                "outputs": state.outputs,
                "exports": state.exports,
            }))
        }
        Command::List => print_json(&store.list_stacks()?),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .try_init();
}

/// `RUST_LOG` when set, `info` otherwise.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw.split_once('=').ok_or_else(|| format!("expected Key=Value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing parameter name in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn resolve(template: &Path, stack: &StackArgs, config: &EngineConfig, store: &dyn StateStore) -> Result<ResolvedTemplate> {
    let parsed = parse_template_file(template)?;
    let exports: IndexMap<String, Value> = store
        .exports()?
        .into_iter()
        .filter(|(_, record)| record.stack_name != stack.stack)
        .map(|(name, record)| (name, record.value))
        .collect();

    let mut inputs = ResolveInputs::new(&stack.stack)
        .with_region(&config.region)
        .with_account_id(&config.account_id)
        .with_exports(exports);
    for (name, value) in &stack.parameters {
        inputs = inputs.with_parameter(name, value);
    }
    resolve_template(&parsed, &inputs).with_context(|| format!("cannot resolve {}", template.display()))
}

/// The provider keeps nothing between processes, so it is seeded with every recorded stack.
fn provider(config: &EngineConfig, store: &dyn StateStore) -> Result<Arc<SimulatedProvider>> {
    let provider = SimulatedProvider::new(&config.region, &config.account_id);
    for stack_name in store.list_stacks()? {
        if let Some(state) = store.load(&stack_name)? {
            provider.seed(&state);
        }
    }
    Ok(Arc::new(provider))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight calls");
            trigger.cancel();
        }
    });
    cancel
}

async fn print_events(mut receiver: mpsc::UnboundedReceiver<RunEvent>) {
    while let Some(event) = receiver.recv().await {
        match event {
            RunEvent::RunStarted { stack_name, operation, .. } => info!(stack = %stack_name, ?operation, "run started"),
            RunEvent::ResourceStarted { logical_id, action, .. } => info!(resource = %logical_id, ?action, "started"),
            RunEvent::ResourceRetrying {
                logical_id, attempt, error, ..
            } => warn!(resource = %logical_id, attempt, %error, "retrying"),
            RunEvent::ResourceFinished {
                logical_id, status, error, ..
            } => match error {
                Some(error) => warn!(resource = %logical_id, ?status, %error, "failed"),
                None => info!(resource = %logical_id, ?status, "finished"),
            },
            RunEvent::ResourceSkipped { logical_id, reason } => info!(resource = %logical_id, %reason, "skipped"),
            RunEvent::RunCompleted { status, .. } => info!(?status, "run completed"),
        }
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn log_filter_follows_rust_log() {
        use tracing::level_filters::LevelFilter;

        temp_env::with_var("RUST_LOG", None::<&str>, || {
            assert_eq!(log_filter().max_level_hint(), Some(LevelFilter::INFO));
        });
        temp_env::with_var("RUST_LOG", Some("debug"), || {
            assert_eq!(log_filter().max_level_hint(), Some(LevelFilter::DEBUG));
        });
        temp_env::with_var("RUST_LOG", Some("warn"), || {
            assert_eq!(log_filter().max_level_hint(), Some(LevelFilter::WARN));
        });
    }

    #[test]
    fn parameters_are_key_value_pairs() {
        assert_eq!(parse_key_value("VpcCidr=10.0.0.0/16").unwrap(), ("VpcCidr".into(), "10.0.0.0/16".into()));
        assert_eq!(parse_key_value("Tags=a=b").unwrap(), ("Tags".into(), "a=b".into()));
        assert!(parse_key_value("VpcCidr").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn apply_arguments_parse() {
        let cli = Cli::try_parse_from([
            "strata",
            "--state-dir",
            "/tmp/state",
            "apply",
            "web.yaml",
            "--stack",
            "web",
            "-p",
            "InstanceType=t3.small",
            "--concurrency",
            "2",
            "--rollback",
        ])
        .unwrap();
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/state")));
        match cli.command {
            Command::Apply {
                stack, concurrency, rollback, ..
            } => {
                assert_eq!(stack.stack, "web");
                assert_eq!(stack.parameters, vec![("InstanceType".to_string(), "t3.small".to_string())]);
                assert_eq!(concurrency, Some(2));
                assert!(rollback);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn resolve_reads_exports_of_other_stacks() {
        let temp_dir = tempfile::tempdir().unwrap();
        let template = temp_dir.path().join("app.yaml");
        std::fs::write(
            &template,
            "Resources:\n  Group:\n    Type: AWS::EC2::SecurityGroup\n    Properties:\n      GroupDescription: app\n      VpcId: !ImportValue network-VpcId\n",
        )
        .unwrap();
        let store = JsonStateStore::new(temp_dir.path().join("state"));
        let mut network = strata_engine::StackState::new("network");
        network.exports.insert("network-VpcId".into(), serde_json::json!("vpc-0a1b2c3d4e5f67890"));
        store.save(&network).unwrap();

        let stack = StackArgs {
            stack: "app".into(),
            parameters: Vec::new(),
        };
        let resolved = resolve(&template, &stack, &EngineConfig::default(), &store).unwrap();
        assert!(resolved.imports.contains("network-VpcId"));
    }
}
