//! Hybrid Planner - Entry Point
//!
//! Loads a scenario, prints the time-annotated plan and runs it against
//! the local executor.

use hybrid_planner::{
    Config, Coordinator, HtnPlanner, LocalDispatcher, RetryingDispatcher, ScenarioLoader, StateStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().skip(1).collect();
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");
    let dry_run = args.iter().any(|a| a == "--dry-run" || a == "-n");
    let json_logs = args.iter().any(|a| a == "--json");
    let scenario_path = args.iter().find(|a| !a.starts_with('-')).map(PathBuf::from);

    let Some(scenario_path) = scenario_path.filter(|_| !help_mode) else {
        println!("Hybrid Planner v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: hybrid-planner <scenario.toml> [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --dry-run, -n   Print the plan without executing it");
        println!("  --json          Log to stderr as JSON");
        println!("  --help, -h      Show this help");
        println!();
        println!("Environment variables:");
        println!("  PLANNER_MAX_DEPTH              Decomposition depth bound (default: 32)");
        println!("  PLANNER_FW_THRESHOLD           Full recompute below this many time points (default: 64)");
        println!("  PLANNER_MAX_IN_FLIGHT          Concurrent intents (default: 8)");
        println!("  PLANNER_MAX_REPLANS            Repairs per run (default: 16)");
        println!("  PLANNER_DISPATCH_TIMEOUT_SECS  Dispatcher timeout (default: 30)");
        println!("  PLANNER_TIME_SCALE             Wall seconds per plan second (default: 0)");
        println!("  PLANNER_SEQUENTIAL_GOALS       Order goals one after another (default: true)");
        return Ok(());
    };

    // Setup logging
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Hybrid Planner v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let scenario = ScenarioLoader::load(&scenario_path).await?;
    let store = Arc::new(StateStore::new(scenario.initial_state()));

    let planner = HtnPlanner::with_config(Arc::new(scenario.domain), config.planner_config());
    let executor = LocalDispatcher::new(store.clone()).with_time_scale(config.time_scale);
    let dispatcher = RetryingDispatcher::new(executor);
    let mut coordinator = Coordinator::with_config(planner, dispatcher, store, config.coordinator_config());

    let plan = coordinator.plan(&scenario.goals)?;
    println!("{}", plan.render());

    if dry_run {
        return Ok(());
    }

    match coordinator.run(plan).await {
        Ok(report) => {
            println!();
            println!("{}", report.plan.render());
            println!("{}", report.summary());
            Ok(())
        }
        Err(e) => {
            error!("{}: {}", e.kind(), e.reason());
            Err(e.into())
        }
    }
}
