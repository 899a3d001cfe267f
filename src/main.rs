use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info, warn};

use audio_topology_controller::audio::{ProfileSelection, RoutingPlanner};
use audio_topology_controller::config::{Config, ConfigLoader};
use audio_topology_controller::diagnostics;
use audio_topology_controller::logging::{self, LoggingConfig};
use audio_topology_controller::service::ServiceManager;
use audio_topology_controller::system::{AudioServerConnector, BluetoothCtl, PactlConnector};

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser)]
#[command(name = "audio-topology-controller")]
#[command(about = "Keeps the PulseAudio routing graph in line with a device policy")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation daemon
    Daemon {
        /// Log as JSON
        #[arg(long)]
        json_logs: bool,
    },
    /// Validate configuration file
    CheckConfig,
    /// Scan the server once and show how every device is classified
    ListDevices {
        /// Show card profiles and presence entries too
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print the operations a fresh controller would apply, without applying them
    Plan,
    /// Dump every raw server object per category as JSON
    Diagnostics,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Daemon { json_logs }) => {
            run_daemon(cli.config, cli.verbose, json_logs).await
        }
        None => {
            // No command specified, run in daemon mode
            run_daemon(cli.config, cli.verbose, false).await
        }
        Some(Commands::CheckConfig) => {
            let config = one_shot_setup(cli.config.as_deref(), cli.verbose)?;
            check_config(&config, cli.config.as_deref())
        }
        Some(Commands::ListDevices { verbose }) => {
            let config = one_shot_setup(cli.config.as_deref(), cli.verbose)?;
            list_devices(&config, verbose)
        }
        Some(Commands::Plan) => {
            let config = one_shot_setup(cli.config.as_deref(), cli.verbose)?;
            show_plan(&config)
        }
        Some(Commands::Diagnostics) => {
            one_shot_setup(cli.config.as_deref(), cli.verbose)?;
            dump_diagnostics()
        }
    }
}

/// Console logging plus configuration for the one-shot commands.
fn one_shot_setup(config_path: Option<&str>, verbose: bool) -> Result<Config> {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    logging::initialize_logging(LoggingConfig::console(level))?;
    Config::load(config_path)
}

async fn run_daemon(config_path: Option<String>, verbose: bool, json_logs: bool) -> Result<()> {
    let config = Config::load(config_path.as_deref())?;

    let mut logging_config = LoggingConfig::for_daemon(&config.general, verbose);
    logging_config.json_format = json_logs;
    let (_guard, log_dir) = logging::initialize_logging(logging_config)?;

    info!("Starting audio topology controller");
    if let Some(dir) = log_dir {
        info!("Logging to {}", dir.display());
        if let Err(e) = logging::cleanup_old_logs(&dir, LOG_RETENTION_DAYS) {
            warn!("Log cleanup failed: {:#}", e);
        }
    }
    for warning in config.validation_warnings() {
        warn!("Configuration: {}", warning);
    }

    let mut service = ServiceManager::new_production(config, config_path)?;
    service.start().await
}

fn check_config(config: &Config, config_path: Option<&str>) -> Result<()> {
    let path = match config_path {
        Some(path) => path.into(),
        None => ConfigLoader::default_config_path()?,
    };

    println!("Configuration: {}", path.display());
    println!("  ✓ Parsed successfully");
    println!("  Mode: {:?}", config.policy.mode);
    println!(
        "  Multiple sinks: {}, multiple sources: {}",
        config.policy.allow_multiple_sinks, config.policy.allow_multiple_sources
    );
    println!(
        "  Monitor sink: {}, aggregate sink: {}",
        config.policy.monitor_sink_name, config.policy.aggregate_sink_name
    );
    println!(
        "  Manual tables: {} cards, {} sinks, {} sources",
        config.manual.cards.len(),
        config.manual.sinks.len(),
        config.manual.sources.len()
    );

    let warnings = config.validation_warnings();
    if warnings.is_empty() {
        println!("  ✓ No problems found");
    }
    for warning in warnings {
        println!("  ⚠ {}", warning);
    }

    Ok(())
}

fn list_devices(config: &Config, verbose: bool) -> Result<()> {
    let client = PactlConnector
        .connect()
        .context("Audio server is not reachable")?;
    let planner = RoutingPlanner::new(config);
    let catalog = diagnostics::scan_catalog(client.as_ref(), &BluetoothCtl, &planner)?;

    println!("Sinks:");
    if catalog.sinks().is_empty() {
        println!("  No sinks found!");
    }
    for sink in catalog.sinks().iter() {
        println!(
            "  {} [{}] eligible={} volume={:.2}",
            sink.info.name, sink.class, sink.eligible, sink.volume
        );
    }

    println!("Sources:");
    if catalog.sources().is_empty() {
        println!("  No sources found!");
    }
    for source in catalog.sources().iter() {
        println!(
            "  {} [{}] {:?} eligible={} volume={:.2}",
            source.info.name, source.class, source.kind, source.eligible, source.volume
        );
    }

    if verbose {
        let classifier = planner.classifier();
        println!("Cards:");
        for card in catalog.cards().iter() {
            let selection = match classifier.select_card_profile(&card.info) {
                ProfileSelection::Selected(profile) => profile,
                ProfileSelection::NoMatch => "no qualifying profile".to_string(),
                ProfileSelection::PolicyIncomplete => "policy incomplete".to_string(),
            };
            println!(
                "  {} (active: {}, policy: {})",
                card.info.name,
                card.info.active_profile.as_deref().unwrap_or("none"),
                selection
            );
            for profile in &card.info.profiles {
                let marker = if profile.available { " " } else { "x" };
                println!("    [{}] {}", marker, profile.name);
            }
        }

        println!("Bluetooth peers:");
        for peer in catalog.bluetooth_peers().iter() {
            println!("  {} {}", peer.address, peer.name);
        }

        println!("Companion streams:");
        for stream in catalog.companions().iter() {
            println!("  {} ({}) stream #{}", stream.binary, stream.kind, stream.stream_index);
        }
    }

    Ok(())
}

fn show_plan(config: &Config) -> Result<()> {
    let client = PactlConnector
        .connect()
        .context("Audio server is not reachable")?;
    let planner = RoutingPlanner::new(config);
    let run = diagnostics::dry_run(client.as_ref(), &BluetoothCtl, &planner)?;

    if run.plan.card_policy_incomplete {
        println!("⚠ Card-profile policy is incomplete, cards are left alone");
    }

    let mut count = 0;
    for op in run.ops() {
        println!("{}", op);
        count += 1;
    }
    if count == 0 {
        println!("Nothing to do: topology already matches policy");
    }

    Ok(())
}

fn dump_diagnostics() -> Result<()> {
    let client = PactlConnector
        .connect()
        .context("Audio server is not reachable")?;
    let dump = diagnostics::collect_raw(client.as_ref(), &BluetoothCtl);

    let json = serde_json::to_string_pretty(&dump).context("Failed to serialize diagnostics")?;
    println!("{}", json);
    Ok(())
}
