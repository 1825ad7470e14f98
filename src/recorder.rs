//! Diagnostics and solver-status sinks.
//!
//! Sinks are best-effort: they report failures through `anyhow::Result` and
//! the driver logs and drops them. Nothing a sink does can change the
//! optimization.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config;
use crate::driver::IterationSummary;
use crate::io::CsvWriter;

pub const HEARTBEAT: &str = "Heartbeat";
pub const ADJOINT_LOOP: &str = "AdjointLoop";
pub const COST: &str = "Cost";
pub const DESIGN: &str = "Design";

/// One named scalar emitted during an outer iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub iteration: usize,
    /// Wall time since the run started
    pub elapsed_s: f64,
    pub category: &'static str,
    pub name: String,
    pub value: f64,
}

/// Scheduling flags of one outer iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFlags {
    pub do_turb_adj_solve: bool,
    pub turb_adj_solves: usize,
    pub turb_adj_reused: usize,
    /// Outer iterations since the turbulence adjoint was last solved
    pub turb_adj_lag: Option<usize>,
    pub converged: bool,
}

/// Restart and audit record written after every committed design update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverStatus {
    pub iteration: usize,
    pub objective: f64,
    pub flags: StatusFlags,
    pub max_change: f64,
    pub elapsed_s: f64,
    /// Design after this iteration's update
    pub design: Vec<f64>,
}

impl SolverStatus {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read status file: {}", path.display()))?;
        let status = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse status file: {}", path.display()))?;
        Ok(status)
    }
}

pub trait Recorder {
    fn log_metric(&mut self, metric: &Metric) -> Result<()>;

    fn write_status(&mut self, status: &SolverStatus) -> Result<()>;

    /// Called once per committed outer iteration, after its status record.
    fn record_iteration(&mut self, _summary: &IterationSummary) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Gating from the `[diagnostics]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsFilter {
    pub level: u8,
    pub every: usize,
    pub rank: usize,
    pub opt_start: usize,
    /// Rank of this process
    pub process_rank: usize,
}

impl Default for DiagnosticsFilter {
    fn default() -> Self {
        Self {
            level: 1,
            every: 1,
            rank: 0,
            opt_start: 0,
            process_rank: 0,
        }
    }
}

impl DiagnosticsFilter {
    pub fn from_config(diag: &config::Diagnostics, process_rank: usize) -> Self {
        Self {
            level: diag.level,
            every: diag.every.max(1),
            rank: diag.rank,
            opt_start: diag.opt_start,
            process_rank,
        }
    }

    pub fn allows(&self, category: &str, iteration: usize) -> bool {
        if self.level == 0 || self.process_rank != self.rank {
            return false;
        }
        if iteration < self.opt_start || iteration % self.every.max(1) != 0 {
            return false;
        }
        category != HEARTBEAT || self.level >= 2
    }
}

#[cfg(test)]
pub struct NullRecorder;

#[cfg(test)]
impl Recorder for NullRecorder {
    fn log_metric(&mut self, _metric: &Metric) -> Result<()> {
        Ok(())
    }

    fn write_status(&mut self, _status: &SolverStatus) -> Result<()> {
        Ok(())
    }
}

/// Writes metrics and status lines through the `log` facade.
pub struct LogRecorder;

impl Recorder for LogRecorder {
    fn log_metric(&mut self, m: &Metric) -> Result<()> {
        if m.category == HEARTBEAT {
            debug!("[mto] opt={} {}/{}={}", m.iteration, m.category, m.name, m.value);
        } else {
            info!("[mto] opt={} {}/{}={:.6e}", m.iteration, m.category, m.name, m.value);
        }
        Ok(())
    }

    fn write_status(&mut self, s: &SolverStatus) -> Result<()> {
        info!(
            "[mto] opt={} J={:.6e} max_change={:.3e} doTurbAdjSolve={} turb_solves={} converged={}",
            s.iteration,
            s.objective,
            s.max_change,
            s.flags.do_turb_adj_solve,
            s.flags.turb_adj_solves,
            s.flags.converged
        );
        Ok(())
    }
}

/// Appends every metric to a CSV file.
pub struct CsvRecorder {
    w: CsvWriter,
}

impl CsvRecorder {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let mut w = CsvWriter::create(path)?;
        w.write_metric_header()?;
        Ok(Self { w })
    }
}

impl Recorder for CsvRecorder {
    fn log_metric(&mut self, metric: &Metric) -> Result<()> {
        self.w.write_metric_row(metric)
    }

    fn write_status(&mut self, _status: &SolverStatus) -> Result<()> {
        self.w.flush()
    }

    fn flush(&mut self) -> Result<()> {
        self.w.flush()
    }
}

/// Keeps the latest `SolverStatus` as JSON, replaced atomically.
pub struct StatusFileRecorder {
    path: PathBuf,
}

impl StatusFileRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Recorder for StatusFileRecorder {
    fn log_metric(&mut self, _metric: &Metric) -> Result<()> {
        Ok(())
    }

    fn write_status(&mut self, status: &SolverStatus) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(status)?;
        fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Streams one history row per committed iteration.
///
/// The file is only created once the first row arrives, so a run that commits
/// nothing leaves an existing history untouched.
pub struct HistoryRecorder {
    path: PathBuf,
    w: Option<CsvWriter>,
}

impl HistoryRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            w: None,
        }
    }
}

impl Recorder for HistoryRecorder {
    fn log_metric(&mut self, _metric: &Metric) -> Result<()> {
        Ok(())
    }

    fn write_status(&mut self, _status: &SolverStatus) -> Result<()> {
        Ok(())
    }

    fn record_iteration(&mut self, summary: &IterationSummary) -> Result<()> {
        if self.w.is_none() {
            let mut w = CsvWriter::create(&self.path)
                .with_context(|| format!("failed to create {}", self.path.display()))?;
            w.write_history_header()?;
            self.w = Some(w);
        }
        match self.w.as_mut() {
            Some(w) => {
                w.write_history_row(summary)?;
                w.flush()
            }
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self.w.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

/// Forwards to every sink, even when an earlier one fails.
#[derive(Default)]
pub struct FanoutRecorder {
    sinks: Vec<Box<dyn Recorder>>,
}

impl FanoutRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Box<dyn Recorder>) -> Self {
        self.sinks.push(sink);
        self
    }

    fn each<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut dyn Recorder) -> Result<()>,
    {
        let mut first_err = None;
        for sink in self.sinks.iter_mut() {
            if let Err(e) = f(sink.as_mut()) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Recorder for FanoutRecorder {
    fn log_metric(&mut self, metric: &Metric) -> Result<()> {
        self.each(|s| s.log_metric(metric))
    }

    fn write_status(&mut self, status: &SolverStatus) -> Result<()> {
        self.each(|s| s.write_status(status))
    }

    fn record_iteration(&mut self, summary: &IterationSummary) -> Result<()> {
        self.each(|s| s.record_iteration(summary))
    }

    fn flush(&mut self) -> Result<()> {
        self.each(|s| s.flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::PassReport;
    use anyhow::bail;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn status(iteration: usize) -> SolverStatus {
        SolverStatus {
            iteration,
            objective: 2.5,
            flags: StatusFlags {
                do_turb_adj_solve: false,
                turb_adj_solves: 1,
                turb_adj_reused: 1,
                turb_adj_lag: Some(0),
                converged: false,
            },
            max_change: 0.1,
            elapsed_s: 0.5,
            design: vec![0.25, 0.75],
        }
    }

    fn metric(category: &'static str, iteration: usize) -> Metric {
        Metric {
            iteration,
            elapsed_s: 0.0,
            category,
            name: "x".to_string(),
            value: 1.0,
        }
    }

    #[test]
    fn filter_gates_level_every_rank_and_start() {
        let f = DiagnosticsFilter {
            level: 1,
            every: 2,
            rank: 0,
            opt_start: 3,
            process_rank: 0,
        };
        assert!(!f.allows(COST, 2));
        assert!(!f.allows(COST, 5));
        assert!(f.allows(COST, 4));
        assert!(!f.allows(HEARTBEAT, 4));

        let verbose = DiagnosticsFilter { level: 2, ..f };
        assert!(verbose.allows(HEARTBEAT, 4));

        let other_rank = DiagnosticsFilter { process_rank: 1, ..f };
        assert!(!other_rank.allows(COST, 4));

        let off = DiagnosticsFilter { level: 0, ..f };
        assert!(!off.allows(COST, 4));
    }

    #[test]
    fn status_file_round_trips_for_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("status.json");
        let mut rec = StatusFileRecorder::new(&path);
        rec.write_status(&status(3)).unwrap();
        rec.write_status(&status(4)).unwrap();
        let loaded = SolverStatus::load(&path).unwrap();
        assert_eq!(loaded, status(4));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn csv_recorder_writes_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let mut rec = CsvRecorder::create(&path).unwrap();
        rec.log_metric(&metric(COST, 1)).unwrap();
        rec.flush().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "iteration,elapsed_s,category,name,value");
        assert!(lines[1].starts_with("1,0.000,Cost,x,"));
    }

    fn summary(iteration: usize) -> IterationSummary {
        IterationSummary {
            iteration,
            objective: 1.5,
            components: vec![("power", 0.5), ("mean_T", 1.0), ("volume", 0.4)],
            do_turb_adj_solve: true,
            passes: PassReport {
                passes: 1,
                turbulence_solves: 1,
                heat_velocity_solves: 1,
                momentum_solves: 1,
            },
            max_change: 0.05,
            converged: false,
            elapsed_s: 0.1,
        }
    }

    #[test]
    fn history_recorder_streams_rows_as_they_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let mut rec = HistoryRecorder::new(&path);
        rec.record_iteration(&summary(1)).unwrap();
        rec.record_iteration(&summary(2)).unwrap();

        // rows are on disk without an explicit flush
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("iteration,objective,"));
        assert!(lines[1].starts_with("1,"));
        assert!(lines[2].starts_with("2,"));
    }

    #[test]
    fn history_recorder_leaves_existing_file_when_nothing_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.csv");
        fs::write(&path, "earlier run\n").unwrap();
        let mut rec = HistoryRecorder::new(&path);
        rec.write_status(&status(1)).unwrap();
        rec.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "earlier run\n");
    }

    struct Failing;

    impl Recorder for Failing {
        fn log_metric(&mut self, _metric: &Metric) -> Result<()> {
            bail!("disk full")
        }

        fn write_status(&mut self, _status: &SolverStatus) -> Result<()> {
            bail!("disk full")
        }
    }

    struct Counting(Rc<RefCell<usize>>);

    impl Recorder for Counting {
        fn log_metric(&mut self, _metric: &Metric) -> Result<()> {
            *self.0.borrow_mut() += 1;
            Ok(())
        }

        fn write_status(&mut self, _status: &SolverStatus) -> Result<()> {
            *self.0.borrow_mut() += 1;
            Ok(())
        }
    }

    #[test]
    fn fanout_reaches_every_sink_despite_failures() {
        let count = Rc::new(RefCell::new(0));
        let mut fan = FanoutRecorder::new()
            .with(Box::new(Failing))
            .with(Box::new(Counting(count.clone())));
        assert!(fan.log_metric(&metric(COST, 1)).is_err());
        assert!(fan.write_status(&status(1)).is_err());
        assert_eq!(*count.borrow(), 2);
    }
}
