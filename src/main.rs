mod boundary;
mod config;
mod driver;
mod error;
mod fields;
mod io;
mod recorder;
mod reduced;
mod schedule;
mod sensitivity;
mod solver;
mod updater;


use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::boundary::AdjointOutletCondition;
use crate::driver::{Collaborators, Driver, DriverSettings, IterationSummary, Termination};
use crate::fields::DesignField;
use crate::recorder::{
    CsvRecorder, DiagnosticsFilter, FanoutRecorder, HistoryRecorder, LogRecorder, SolverStatus,
    StatusFileRecorder,
};
use crate::reduced::ReducedModel;
use crate::schedule::schedule_table;
use crate::sensitivity::ThermalFluidCost;
use crate::solver::IterationBudget;
use crate::updater::MoveLimitUpdater;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SCHEMA_VERSION: &str = "1.0.0";

#[derive(Parser, Debug)]
#[command(name = "mto-thermal")]
#[command(version)]
#[command(about = "Adjoint topology optimization driver for conjugate heat transfer in turbulent flow")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to TOML case file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Output path for the iteration history CSV
    #[arg(short, long, global = true)]
    out: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the optimization loop
    Run {
        /// Write a JSON run summary with manifest
        #[arg(long)]
        json: bool,
        /// Resume from a solver-status JSON written by an earlier run
        #[arg(long)]
        restart: Option<String>,
    },
    /// Validate a case file
    Validate,
    /// Print the turbulence-adjoint lagging table
    Schedule {
        /// Number of outer iterations to tabulate
        #[arg(long, default_value = "20")]
        iterations: usize,
    },
    /// Print version information
    Version,
}

// ============================================================================
// JSON Output Structures
// ============================================================================

#[derive(Serialize)]
struct Manifest {
    schema_version: String,
    solver_version: String,
    program: String,
    timestamp_utc: String,
    platform: String,
    config_hash: String,
    config_snapshot: config::Root,
}

#[derive(Serialize)]
struct RunSummary {
    termination: Termination,
    first_iteration: usize,
    iterations: usize,
    last_objective: Option<f64>,
    final_volume: f64,
    peak_temperature: f64,
    turb_adj_solves: usize,
    turb_adj_reused: usize,
    wall_time_ms: f64,
}

#[derive(Serialize)]
struct ResultBundle<'a> {
    manifest: Manifest,
    summary: RunSummary,
    history: &'a [IterationSummary],
}

// ============================================================================
// Helper Functions
// ============================================================================

fn compute_hash(data: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn get_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let secs_per_day = 86400u64;
    let days_since_epoch = now / secs_per_day;
    let secs_today = now % secs_per_day;
    let hours = secs_today / 3600;
    let mins = (secs_today % 3600) / 60;
    let secs = secs_today % 60;

    let is_leap = |y: u64| y % 4 == 0 && (y % 100 != 0 || y % 400 == 0);
    let mut year = 1970u64;
    let mut remaining_days = days_since_epoch;
    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }
    let month_days = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 1u64;
    for &days in &month_days {
        let d = if month == 2 && is_leap(year) { 29 } else { days };
        if remaining_days < d {
            break;
        }
        remaining_days -= d;
        month += 1;
    }
    let day = remaining_days + 1;

    format!("{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z", year, month, day, hours, mins, secs)
}

fn create_manifest(cfg: &config::Root, cfg_text: &str) -> Manifest {
    Manifest {
        schema_version: SCHEMA_VERSION.to_string(),
        solver_version: VERSION.to_string(),
        program: cfg.case.program.clone(),
        timestamp_utc: get_timestamp(),
        platform: std::env::consts::OS.to_string(),
        config_hash: compute_hash(cfg_text),
        config_snapshot: cfg.clone(),
    }
}

fn load_config(cfg_path: &str) -> Result<(config::Root, String)> {
    let cfg_text = fs::read_to_string(cfg_path)
        .with_context(|| format!("failed to read config: {}", cfg_path))?;
    let cfg = config::Root::from_toml(&cfg_text)
        .with_context(|| format!("failed to parse config: {}", cfg_path))?;
    cfg.validate()
        .with_context(|| format!("invalid config: {}", cfg_path))?;
    Ok((cfg, cfg_text))
}

/// Sibling output file, e.g. `history.csv` -> `history.status.json`.
fn sibling(out_path: &Path, extension: &str) -> PathBuf {
    out_path.with_extension(extension)
}

fn build_recorder(cfg: &config::Root, out_path: &Path) -> FanoutRecorder {
    let mut fan = FanoutRecorder::new()
        .with(Box::new(LogRecorder))
        .with(Box::new(StatusFileRecorder::new(sibling(out_path, "status.json"))))
        .with(Box::new(HistoryRecorder::new(out_path)));
    if cfg.diagnostics.level > 0 {
        let metrics_path = sibling(out_path, "metrics.csv");
        match CsvRecorder::create(&metrics_path) {
            Ok(csv) => fan = fan.with(Box::new(csv)),
            Err(e) => warn!(
                "[mto] metrics CSV disabled, cannot create {}: {:#}",
                metrics_path.display(),
                e
            ),
        }
    }
    fan
}

fn initial_design(cfg: &config::Root, restart: Option<&str>) -> Result<(usize, DesignField)> {
    let cells = cfg.model.cells;
    match restart {
        None => Ok((1, DesignField::uniform(cells, cfg.design.initial))),
        Some(path) => {
            let status = SolverStatus::load(path)?;
            if status.design.len() != cells {
                bail!(
                    "restart design in {} has {} cells, case has {}",
                    path,
                    status.design.len(),
                    cells
                );
            }
            info!(
                "[mto] restarting from {} after opt={} (J={:.6e})",
                path, status.iteration, status.objective
            );
            Ok((status.iteration + 1, DesignField::new(status.design)))
        }
    }
}

/// Status file to resume from after a failure at `failed_at`, if one exists.
fn restart_hint(
    failed_at: usize,
    first: usize,
    restart: Option<&str>,
    status_path: &Path,
) -> Option<String> {
    if failed_at > first {
        Some(status_path.display().to_string())
    } else {
        restart.map(str::to_string)
    }
}

// ============================================================================
// Commands
// ============================================================================

fn run_optimization(
    cfg: &config::Root,
    cfg_text: &str,
    out_path: &str,
    json_output: bool,
    restart: Option<&str>,
) -> Result<()> {
    let out = Path::new(out_path);
    let model = ReducedModel::from_config(&cfg.model);
    let (primal, adjoint) = model.solvers();

    let settings = DriverSettings {
        scheduler: cfg.scheduler_config()?,
        bounds: cfg.bounds(),
        diagnostics: DiagnosticsFilter::from_config(&cfg.diagnostics, 0),
    };
    let collaborators = Collaborators {
        primal: Box::new(primal),
        adjoint: Box::new(adjoint),
        cost: Box::new(ThermalFluidCost::new(
            cfg.model.material(),
            cfg.model.power_weight,
            cfg.model.heat_weight,
        )),
        updater: Box::new(MoveLimitUpdater::new(
            cfg.design.volume_fraction,
            cfg.optimization.tol,
        )),
        recorder: Box::new(build_recorder(cfg, out)),
    };

    let (first, design) = initial_design(cfg, restart)?;
    let mut budget = IterationBudget {
        max_iter: cfg.max_iter(),
    };

    let start = Instant::now();
    let mut driver = Driver::new(settings, collaborators);
    let result = match restart {
        None => driver.run(design, &mut budget),
        Some(_) => driver.run_from(first, design, &mut budget),
    };
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(opt) = e.iteration() {
                let last = e
                    .last_objective()
                    .map(|j| format!("{:.6e}", j))
                    .unwrap_or_else(|| "none".to_string());
                match restart_hint(opt, first, restart, &sibling(out, "status.json")) {
                    Some(status) => error!(
                        "[mto] stopped at opt={} (last objective {}); restart with --restart {}",
                        opt, last, status
                    ),
                    None => error!(
                        "[mto] stopped at opt={} (last objective {}); no iteration was committed",
                        opt, last
                    ),
                }
            }
            return Err(e).with_context(|| format!("optimization of case '{}' failed", cfg.case.name));
        }
    };
    let wall_time_ms = start.elapsed().as_secs_f64() * 1000.0;
    let peak_temperature = outcome
        .fields
        .primal
        .t
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);

    let turb_adj_solves: usize = outcome.history.iter().map(|s| s.passes.turbulence_solves).sum();
    let turb_adj_reused: usize = outcome
        .history
        .iter()
        .map(|s| s.passes.turbulence_reused())
        .sum();

    info!(
        "[mto] {}: {} iterations, termination={:?}, volume={:.4}, peak T={:.4e}, turbulence adjoint solved {} / reused {}",
        cfg.case.name,
        outcome.iterations(),
        outcome.termination,
        outcome.design.mean(),
        peak_temperature,
        turb_adj_solves,
        turb_adj_reused
    );
    if outcome.iterations() == 0 {
        warn!("[mto] no iteration ran; {} left unchanged", out.display());
    } else {
        info!("[mto] history: {}", out.display());
    }

    if json_output {
        let json_path = sibling(out, "json");
        let bundle = ResultBundle {
            manifest: create_manifest(cfg, cfg_text),
            summary: RunSummary {
                termination: outcome.termination,
                first_iteration: first,
                iterations: outcome.iterations(),
                last_objective: outcome.last_objective(),
                final_volume: outcome.design.mean(),
                peak_temperature,
                turb_adj_solves,
                turb_adj_reused,
                wall_time_ms,
            },
            history: &outcome.history,
        };
        let json = serde_json::to_string_pretty(&bundle)?;
        fs::write(&json_path, json)
            .with_context(|| format!("failed to write {}", json_path.display()))?;
        info!("[mto] JSON bundle: {}", json_path.display());
    }

    if outcome.termination == Termination::BudgetExhausted {
        warn!("[mto] iteration budget exhausted before the design converged");
    }

    Ok(())
}

fn validate_config(cfg_path: &str) -> Result<()> {
    let (cfg, _) = load_config(cfg_path)?;
    let sched = cfg.scheduler_config()?;

    eprintln!("[mto] config valid: {}", cfg_path);
    eprintln!("  case: {} ({} v{})", cfg.case.name, cfg.case.program, cfg.case.version);
    eprintln!("  optimization: max_iter={}, tol={:.0e}",
              cfg.optimization.max_iter, cfg.optimization.tol);
    eprintln!("  scheduler: adjTurbLagEvery={}, adjTurbRampEnd={}, nAdjTurbPasses={}",
              sched.adj_turb_lag_every, sched.adj_turb_ramp_end, sched.n_adj_turb_passes);
    eprintln!("  design: initial={}, bounds=[{},{}], move_limit={}, volume_fraction={}",
              cfg.design.initial, cfg.design.lower, cfg.design.upper,
              cfg.design.move_limit, cfg.design.volume_fraction);
    eprintln!("  diagnostics: level={}, every={}, rank={}, opt_start={}",
              cfg.diagnostics.level, cfg.diagnostics.every,
              cfg.diagnostics.rank, cfg.diagnostics.opt_start);
    eprintln!("  model: cells={}, inlet_velocity={}, alpha_max={}, q_ramp={}",
              cfg.model.cells, cfg.model.inlet_velocity,
              cfg.model.alpha_max, cfg.model.q_ramp);

    if sched.n_adj_turb_passes == 0 {
        eprintln!("  note: nAdjTurbPasses=0 skips the turbulence, heat-velocity and momentum adjoints");
    }

    Ok(())
}

fn print_schedule(cfg: &config::Root, iterations: usize) -> Result<()> {
    let sched = cfg.scheduler_config()?;
    println!("iteration,do_turb_adj_solve,turb_adj_solves,turb_adj_reused");
    for row in schedule_table(&sched, iterations) {
        println!(
            "{},{},{},{}",
            row.iteration, row.do_turb_adj_solve, row.turbulence_solves, row.turbulence_reused
        );
    }
    Ok(())
}

fn print_version() {
    eprintln!("mto-thermal - adjoint topology optimization for thermal-fluid design");
    eprintln!();
    eprintln!("  Program:           {}", config::PROGRAM);
    eprintln!("  Solver Version:    {}", VERSION);
    eprintln!("  Schema Version:    {}", SCHEMA_VERSION);
    eprintln!("  Platform:          {}", std::env::consts::OS);
    eprintln!("  Architecture:      {}", std::env::consts::ARCH);
    eprintln!();
    eprintln!("Adjoint scheduling:");
    eprintln!("  - turbulence adjoint lagging (adj_turb_lag_every, adj_turb_ramp_end)");
    eprintln!("  - multi-pass adjoint chain kOmega -> Ub -> Ua (n_adj_turb_passes)");
    eprintln!();
    eprintln!("Built-in collaborators:");
    eprintln!("  - reduced-order Brinkman/RAMP thermal-fluid model");
    eprintln!("  - move-limited design update with volume constraint");
    eprintln!(
        "  - {} / {} outlet conditions",
        AdjointOutletCondition::PressurePower.name(),
        AdjointOutletCondition::VelocityHeat.name()
    );
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::Validate => {
            let cfg_path = args.config.context("--config required for validate")?;
            validate_config(&cfg_path)
        }
        Commands::Schedule { iterations } => {
            let cfg_path = args.config.context("--config required")?;
            let (cfg, _) = load_config(&cfg_path)?;
            print_schedule(&cfg, iterations)
        }
        Commands::Run { json, restart } => {
            let cfg_path = args.config.context("--config required")?;
            let out_path = args.out.unwrap_or_else(|| "results/history.csv".to_string());
            let (cfg, cfg_text) = load_config(&cfg_path)?;

            info!("[mto] {} v{} - {}", cfg.case.program, cfg.case.version, cfg.case.name);
            run_optimization(&cfg, &cfg_text, &out_path, json, restart.as_deref())
        }
    }
}
