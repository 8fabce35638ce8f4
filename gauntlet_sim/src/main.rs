//! Gauntlet Simulator CLI
//!
//! Run deterministic tournament scenarios against generated entries.

use clap::Parser;
use gauntlet_sim::scenarios::ScenarioId;
use gauntlet_sim::{ScenarioResult, ScenarioRunner, SimConfig};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Gauntlet Deterministic Tournament Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "gauntlet-sim")]
#[command(about = "Run deterministic tournament scenarios", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time; default 42 or the config's)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Number of generated participants (default 4 or the config's)
    #[arg(short, long)]
    participants: Option<usize>,

    /// Scenario to run (race_round_robin, race_free_for_all, hoard_best_of, crash_isolation, pause_resume, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Maximum idle workers kept by the unit pool
    #[arg(long)]
    pool_size: Option<usize>,

    /// JSON config file (fields default when missing)
    #[arg(short, long)]
    config: Option<String>,

    /// Print a representative game of the bracket and exit
    #[arg(long)]
    preview: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export the progress stream and result to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    if !args.json {
        info!("Gauntlet Simulator v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            eprintln!("Available scenarios: race_round_robin, race_free_for_all, hoard_best_of, crash_isolation, pause_resume, all");
            std::process::exit(1);
        })]
    };

    // Flags override the config file only when given
    let config = match &args.config {
        Some(path) => SimConfig::from_file(path).unwrap_or_else(|e| {
            eprintln!("Error: cannot load {}: {}", path, e);
            std::process::exit(1);
        }),
        None => SimConfig::default(),
    }
    .with_overrides(args.seed, args.participants, args.pool_size);

    // Determine base seed
    let base_seed = if config.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        config.seed
    };

    if args.preview {
        let runner = ScenarioRunner::from_config(config.with_seed(base_seed));
        for scenario in &scenarios {
            match runner.preview(*scenario) {
                Ok(preview) => println!(
                    "{}: {}",
                    scenario.name(),
                    serde_json::to_string(&preview).unwrap_or_default()
                ),
                Err(e) => {
                    error!("✗ {} preview failed: {}", scenario.name(), e);
                    std::process::exit(1);
                }
            }
        }
        return;
    }

    // Handle --export mode
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            std::process::exit(1);
        }

        info!("Running with export to: {}", export_path);
        let runner = ScenarioRunner::from_config(config.with_seed(base_seed));
        let (result, export) = match runner.run_with_export(scenarios[0]) {
            Ok(run) => run,
            Err(e) => {
                error!("✗ {} could not run: {}", scenarios[0].name(), e);
                std::process::exit(1);
            }
        };

        if let Err(e) = export.write_to_file(export_path) {
            error!("Failed to write export: {:?}", e);
        } else {
            info!("Exported {} progress frames to {}", export.frames.len(), export_path);
        }

        if result.passed {
            info!("✓ {} (seed={}) PASSED - exported to {}", scenarios[0].name(), base_seed, export_path);
        } else {
            error!(
                "✗ {} FAILED: {}",
                scenarios[0].name(),
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
            std::process::exit(1);
        }
        return;
    }

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::from_config(config.clone()).with_seed(seed);

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!(
                        "✓ {} (seed={}) PASSED winners={:?}",
                        scenario.name(),
                        seed,
                        result.result.as_ref().map(|r| r.winners()).unwrap_or_default()
                    );
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "root_seed": r.root_seed.as_ref().map(|s| s.to_string()),
                    "passed": r.passed,
                    "winners": r.result.as_ref().map(|m| m.winners()),
                    "progress_reports": r.metrics.progress_reports,
                    "pool": r.metrics.pool,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            for result in &all_results {
                if !result.passed {
                    error!(
                        "  - {} seed={}: {}",
                        result.scenario.name(),
                        result.seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
