#![deny(unsafe_code)]

//! Burn CLI: runs a bundle, serves as the elevated companion, prints plans.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use burn_config::EngineConfig;
use burn_core::apply::{CommandLineExecutor, FileCache};
use burn_core::ba::{BaCommand, NullBa};
use burn_core::build_info;
use burn_core::detect::{self, SystemSnapshot};
use burn_core::elevation::companion::{self, CompanionPipes};
use burn_core::elevation::{CompanionArgs, CompanionServices, ElevationOptions};
use burn_core::engine::LocalServices;
use burn_core::logging::pipe_log_layer;
use burn_core::model::{BundleAction, RelationType};
use burn_core::plan::{self, PlanRequest};
use burn_core::{BundleModel, EngineContext, Variables, variables};
use clap::{Args, Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use zeroize::Zeroizing;

/// Lines the companion buffers while its log pipe is busy.
const COMPANION_LOG_QUEUE: usize = 1024;

/// Burn: detect, plan and apply a bundle of packages.
#[derive(Parser)]
#[command(name = "burn", version, long_version = build_info::LONG_VERSION, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, default_value = "burn.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a bundle.
    Run(RunArgs),

    /// Serve an engine as its elevated companion. Started by the engine.
    #[command(hide = true)]
    Companion(CompanionSwitches),

    /// Detect and plan a bundle, printing the plan as JSON.
    Plan {
        /// Bundle manifest (TOML or JSON).
        manifest: PathBuf,

        /// Registration state to detect against. Empty when omitted.
        #[arg(long)]
        state: Option<PathBuf>,

        #[arg(long, default_value = "install", value_parser = parse_action)]
        action: BundleAction,

        /// Layout directory, for `--action layout`.
        #[arg(long)]
        layout: Option<PathBuf>,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Bundle manifest (TOML or JSON).
    manifest: PathBuf,

    #[arg(long, default_value = "install", value_parser = parse_action)]
    action: BundleAction,

    /// Run without an application, accepting every default.
    #[arg(long)]
    passive: bool,

    /// Application executable, overriding `[ba] path`.
    #[arg(long)]
    ba: Option<PathBuf>,

    /// Registration state file, overriding `[cache] state`.
    #[arg(long)]
    state: Option<PathBuf>,

    /// Layout directory, for `--action layout`.
    #[arg(long)]
    layout: Option<PathBuf>,

    /// Provider key of the bundle that launched this one.
    #[arg(long)]
    parent: Option<String>,

    /// Passed through to the application.
    #[arg(last = true)]
    arguments: Vec<String>,
}

#[derive(Args)]
struct CompanionSwitches {
    #[arg(long = "pipe")]
    pipe: String,

    #[arg(long = "pipe-dir")]
    pipe_dir: PathBuf,

    #[arg(long = "secret")]
    secret: String,

    #[arg(long = "parent-pid")]
    parent_pid: u32,
}

fn parse_action(s: &str) -> Result<BundleAction, String> {
    match s.to_ascii_lowercase().as_str() {
        "install" => Ok(BundleAction::Install),
        "uninstall" => Ok(BundleAction::Uninstall),
        "modify" => Ok(BundleAction::Modify),
        "repair" => Ok(BundleAction::Repair),
        "layout" => Ok(BundleAction::Layout),
        "cache" => Ok(BundleAction::Cache),
        "help" => Ok(BundleAction::Help),
        other => Err(format!(
            "unknown action '{other}' (expected install, uninstall, modify, repair, layout, cache or help)"
        )),
    }
}

fn log_filter(config_level: &str, verbose: u8) -> EnvFilter {
    let level = match verbose {
        0 => config_level,
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    let init_logging = |config: &EngineConfig| {
        tracing_subscriber::fmt()
            .with_env_filter(log_filter(&config.logging.level, cli.verbose))
            .init();
        if !cli.config.exists() {
            info!(path = %cli.config.display(), "Config file not found, using defaults");
        }
    };

    match cli.command {
        Commands::Run(args) => {
            init_logging(&config);
            let code = cmd_run(&cli.config, config, args).await?;
            if code != 0 {
                std::process::exit(code as i32);
            }
        }
        Commands::Companion(switches) => {
            let code = cmd_companion(config, switches, cli.verbose).await?;
            std::process::exit(code as i32);
        }
        Commands::Plan {
            manifest,
            state,
            action,
            layout,
        } => {
            init_logging(&config);
            cmd_plan(&manifest, state.as_deref(), action, layout).await?;
        }
        Commands::Config { show } => {
            init_logging(&config);
            cmd_config(&cli.config, &config, show)?;
        }
    }

    Ok(())
}

async fn cmd_run(config_path: &Path, mut config: EngineConfig, args: RunArgs) -> Result<u32> {
    let model = BundleModel::load(&args.manifest)
        .await
        .with_context(|| format!("loading manifest {}", args.manifest.display()))?;
    if let Some(ba) = args.ba {
        config.ba.path = Some(ba);
    }
    let state = args.state.unwrap_or_else(|| config.cache.state_file());
    let snapshot = Arc::new(SystemSnapshot::open(&state).await?);
    let services = LocalServices::from_config(&config, snapshot);

    let mut arguments = args.arguments;
    if let Some(layout) = &args.layout {
        arguments.extend(["-layout".to_string(), layout.display().to_string()]);
    }
    if let Some(parent) = &args.parent {
        arguments.extend(["-parent".to_string(), parent.clone()]);
    }
    let command = BaCommand {
        action: Some(args.action),
        relation_type: RelationType::None,
        passive: args.passive,
        arguments,
    };

    let mut elevation = ElevationOptions::from_config(&config);
    if config_path.exists()
        && let Ok(path) = std::path::absolute(config_path)
    {
        elevation.extra_args = vec!["--config".to_string(), path.display().to_string()];
    }

    info!(
        bundle = %model.bundle.id,
        action = ?args.action,
        passive = command.passive,
        engine = build_info::LONG_VERSION,
        "Running bundle"
    );
    let engine = EngineContext::new(model, config, command, services)?.with_elevation(elevation);
    let exit = engine.run().await?;
    Ok(exit.exit_code)
}

async fn cmd_companion(config: EngineConfig, switches: CompanionSwitches, verbose: u8) -> Result<u32> {
    let (layer, drain) = pipe_log_layer(COMPANION_LOG_QUEUE);
    tracing_subscriber::registry()
        .with(log_filter(&config.logging.level, verbose))
        .with(layer)
        .init();

    let args = CompanionArgs {
        pipe: switches.pipe,
        directory: switches.pipe_dir,
        secret: Zeroizing::new(switches.secret),
        parent_pid: switches.parent_pid,
    };
    let CompanionPipes {
        main,
        cache,
        mut log,
    } = companion::connect_to_parent(&args).await?;

    let (stop_tx, stop_rx) = oneshot::channel();
    let forwarder = tokio::spawn(async move { drain.forward(&mut log, stop_rx).await });

    let snapshot = Arc::new(SystemSnapshot::open(&config.cache.state_file()).await?);
    let services = CompanionServices {
        executor: Arc::new(CommandLineExecutor::new()),
        cache: Arc::new(FileCache::new(&config.cache.machine_root)),
        registrar: snapshot,
        trusted: config.trusted_roots(),
    };
    let result = companion::serve(main, cache, services).await;

    let _ = stop_tx.send(());
    match forwarder.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => eprintln!("burn companion: log pipe failed: {e}"),
        Err(e) => eprintln!("burn companion: log forwarder failed: {e}"),
    }
    Ok(result?.exit_code)
}

async fn cmd_plan(
    manifest: &Path,
    state: Option<&Path>,
    action: BundleAction,
    layout: Option<PathBuf>,
) -> Result<()> {
    let mut model = BundleModel::load(manifest)
        .await
        .with_context(|| format!("loading manifest {}", manifest.display()))?;
    let snapshot = match state {
        Some(path) => SystemSnapshot::open(path).await?,
        None => SystemSnapshot::default(),
    };

    let mut vars = Variables::new();
    vars.initialize_system()?;
    model.initialize_variables(&mut vars)?;
    let vars = variables::shared(vars);

    detect::detect(&mut model, &vars, &NullBa, &snapshot, action).await?;
    let mut request = PlanRequest::new(action);
    request.layout_directory = layout;
    let plan = plan::plan(&mut model, &vars, &NullBa, &request).await?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn cmd_config(config_path: &Path, config: &EngineConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<EngineConfig> {
    if path.exists() {
        EngineConfig::load(path)
            .await
            .with_context(|| format!("loading config {}", path.display()))
    } else {
        Ok(EngineConfig::default())
    }
}
