//! Outer optimization loop.
//!
//! One outer iteration `opt` runs, strictly in this order:
//!
//! 1. turbulence correction, primal flow, primal thermal
//! 2. adjoint thermal (never lagged)
//! 3. the lagging decision, fixed for the rest of the iteration
//! 4. `n_adj_turb_passes` inner adjoint passes
//! 5. cost and sensitivity from the last pass's state
//! 6. design update
//! 7. diagnostics and the solver-status record
//!
//! Any delegated failure ends the run before the design update and status
//! record of that iteration, so the last status on disk always belongs to a
//! completed iteration.

use log::{debug, error, info, warn};
use serde::Serialize;
use std::time::Instant;

use crate::error::{Diverged, MtoError, StageFailure};
use crate::fields::{DesignField, FieldState, PassStamp};
use crate::recorder::{
    DiagnosticsFilter, Metric, Recorder, SolverStatus, StatusFlags, ADJOINT_LOOP, COST, DESIGN,
    HEARTBEAT,
};
use crate::schedule::{PassEvent, PassReport, SchedulerConfig, TurbulenceAdjointScheduler};
use crate::solver::{
    AdjointSolver, CostFunction, DesignBounds, DesignUpdater, LoopControl, PrimalSolver, Stage,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverSettings {
    pub scheduler: SchedulerConfig,
    pub bounds: DesignBounds,
    pub diagnostics: DiagnosticsFilter,
}

/// The external collaborators the driver sequences.
pub struct Collaborators {
    pub primal: Box<dyn PrimalSolver>,
    pub adjoint: Box<dyn AdjointSolver>,
    pub cost: Box<dyn CostFunction>,
    pub updater: Box<dyn DesignUpdater>,
    pub recorder: Box<dyn Recorder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Termination {
    /// The design updater reported convergence
    Converged,
    /// The loop-continuation predicate returned false
    BudgetExhausted,
}

/// What one committed outer iteration produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationSummary {
    pub iteration: usize,
    pub objective: f64,
    pub components: Vec<(&'static str, f64)>,
    pub do_turb_adj_solve: bool,
    pub passes: PassReport,
    pub max_change: f64,
    pub converged: bool,
    pub elapsed_s: f64,
}

impl IterationSummary {
    pub fn component(&self, name: &str) -> Option<f64> {
        self.components
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub design: DesignField,
    pub fields: FieldState,
    pub history: Vec<IterationSummary>,
    pub termination: Termination,
}

impl RunOutcome {
    pub fn iterations(&self) -> usize {
        self.history.len()
    }

    pub fn last_objective(&self) -> Option<f64> {
        self.history.last().map(|s| s.objective)
    }
}

/// Gated, failure-absorbing front of the recorder.
struct Telemetry {
    recorder: Box<dyn Recorder>,
    filter: DiagnosticsFilter,
    clock: Instant,
}

impl Telemetry {
    fn elapsed(&self) -> f64 {
        self.clock.elapsed().as_secs_f64()
    }

    fn metric(&mut self, iteration: usize, category: &'static str, name: &str, value: f64) {
        if !self.filter.allows(category, iteration) {
            return;
        }
        let metric = Metric {
            iteration,
            elapsed_s: self.elapsed(),
            category,
            name: name.to_string(),
            value,
        };
        if let Err(e) = self.recorder.log_metric(&metric) {
            warn!("[mto] dropped metric {}/{} at opt={}: {:#}", category, name, iteration, e);
        }
    }

    fn heartbeat(&mut self, iteration: usize, name: &str) {
        self.metric(iteration, HEARTBEAT, name, 1.0);
    }

    fn status(&mut self, status: &SolverStatus) {
        if let Err(e) = self.recorder.write_status(status) {
            warn!("[mto] failed to write solver status at opt={}: {:#}", status.iteration, e);
        }
    }

    fn iteration(&mut self, summary: &IterationSummary) {
        if let Err(e) = self.recorder.record_iteration(summary) {
            warn!("[mto] failed to record history row for opt={}: {:#}", summary.iteration, e);
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.recorder.flush() {
            warn!("[mto] failed to flush diagnostics: {:#}", e);
        }
    }
}

pub struct Driver {
    settings: DriverSettings,
    scheduler: TurbulenceAdjointScheduler,
    primal: Box<dyn PrimalSolver>,
    adjoint: Box<dyn AdjointSolver>,
    cost: Box<dyn CostFunction>,
    updater: Box<dyn DesignUpdater>,
    telemetry: Telemetry,
}

impl Driver {
    pub fn new(settings: DriverSettings, collaborators: Collaborators) -> Self {
        Self {
            scheduler: TurbulenceAdjointScheduler::new(settings.scheduler),
            settings,
            primal: collaborators.primal,
            adjoint: collaborators.adjoint,
            cost: collaborators.cost,
            updater: collaborators.updater,
            telemetry: Telemetry {
                recorder: collaborators.recorder,
                filter: settings.diagnostics,
                clock: Instant::now(),
            },
        }
    }

    pub fn run(
        &mut self,
        initial: DesignField,
        control: &mut dyn LoopControl,
    ) -> Result<RunOutcome, MtoError> {
        self.run_from(1, initial, control)
    }

    /// Run starting at outer iteration `first`, e.g. when restarting from a
    /// status record.
    pub fn run_from(
        &mut self,
        first: usize,
        initial: DesignField,
        control: &mut dyn LoopControl,
    ) -> Result<RunOutcome, MtoError> {
        self.check_initial(&initial)?;

        let sched = self.settings.scheduler;
        info!(
            "[mto] starting optimization at opt={}: {} cells, adjTurbLagEvery={} adjTurbRampEnd={} nAdjTurbPasses={}",
            first,
            initial.len(),
            sched.adj_turb_lag_every,
            sched.adj_turb_ramp_end,
            sched.n_adj_turb_passes
        );
        if sched.n_adj_turb_passes == 0 {
            warn!("[mto] nAdjTurbPasses=0: sensitivities use the adjoint thermal field only");
        }

        self.telemetry.clock = Instant::now();
        let mut fields = FieldState::zeros(initial.len());
        let mut design = initial;
        let mut history: Vec<IterationSummary> = Vec::new();
        let mut opt = first;

        let termination = loop {
            if !control.should_continue(opt) {
                break Termination::BudgetExhausted;
            }

            let last_objective = history.last().map(|s| s.objective);
            let summary = match self.iterate(opt, &mut design, &mut fields, last_objective) {
                Ok(summary) => summary,
                Err(e) => {
                    error!("[mto] run aborted: {}", e);
                    self.telemetry.flush();
                    return Err(e);
                }
            };

            self.telemetry.iteration(&summary);
            let converged = summary.converged;
            history.push(summary);
            if converged {
                break Termination::Converged;
            }
            opt += 1;
        };

        self.telemetry.flush();
        info!(
            "[mto] optimization finished after {} iterations ({:?}), last objective {}",
            history.len(),
            termination,
            history
                .last()
                .map(|s| format!("{:.6e}", s.objective))
                .unwrap_or_else(|| "none".to_string())
        );

        Ok(RunOutcome {
            design,
            fields,
            history,
            termination,
        })
    }

    fn check_initial(&self, design: &DesignField) -> Result<(), MtoError> {
        if design.is_empty() {
            return Err(MtoError::config("initial design has no cells"));
        }
        let bounds = &self.settings.bounds;
        if let Some(i) = design.values().iter().position(|&g| !bounds.contains(g)) {
            return Err(MtoError::config(format!(
                "initial design value {} in cell {} is outside [{}, {}]",
                design.values()[i],
                i,
                bounds.lower,
                bounds.upper
            )));
        }
        Ok(())
    }

    fn iterate(
        &mut self,
        opt: usize,
        design: &mut DesignField,
        fields: &mut FieldState,
        last_objective: Option<f64>,
    ) -> Result<IterationSummary, MtoError> {
        let diverged = move |stage: Stage| {
            move |e: Diverged| MtoError::SolverDivergence {
                stage,
                iteration: opt,
                reason: e.0,
                last_objective,
            }
        };

        self.telemetry.heartbeat(opt, "loop_enter");

        self.primal
            .correct_turbulence(&mut fields.primal)
            .map_err(diverged(Stage::TurbulenceCorrect))?;
        self.telemetry.heartbeat(opt, "after_turbulence_correct");

        self.primal
            .solve_flow(design, &mut fields.primal)
            .map_err(diverged(Stage::PrimalFlow))?;
        self.telemetry.heartbeat(opt, "after_primal_U");

        self.primal
            .solve_thermal(design, &mut fields.primal)
            .map_err(diverged(Stage::PrimalThermal))?;
        self.telemetry.heartbeat(opt, "after_primal_T");

        self.adjoint
            .solve_adjoint_thermal(design, &fields.primal, &mut fields.adjoint)
            .map_err(diverged(Stage::AdjointThermal))?;
        self.telemetry.heartbeat(opt, "after_adjoint_Tb");

        let do_turb_adj_solve = self.settings.scheduler.do_turb_adj_solve(opt);
        self.telemetry.metric(
            opt,
            ADJOINT_LOOP,
            "doTurbAdjSolve",
            if do_turb_adj_solve { 1.0 } else { 0.0 },
        );

        let passes = {
            let telemetry = &mut self.telemetry;
            let mut on_event = |ev: PassEvent| telemetry.heartbeat(opt, &ev.heartbeat_name());
            self.scheduler
                .run_passes(
                    opt,
                    do_turb_adj_solve,
                    self.adjoint.as_mut(),
                    design,
                    fields,
                    &mut on_event,
                )
                .map_err(|f: StageFailure| MtoError::SolverDivergence {
                    stage: f.stage,
                    iteration: opt,
                    reason: f.source.0,
                    last_objective,
                })?
        };
        if let Some(last) = passes.passes.checked_sub(1) {
            debug_assert_eq!(
                fields.adjoint.last_pass,
                Some(PassStamp {
                    iteration: opt,
                    pass: last
                })
            );
        }
        self.telemetry.metric(
            opt,
            ADJOINT_LOOP,
            "turbAdjSolves",
            passes.turbulence_solves as f64,
        );

        let cost = self.cost.evaluate(&fields.primal, &fields.adjoint, design);
        self.telemetry.metric(opt, COST, "objective", cost.objective);
        for (name, value) in &cost.components {
            self.telemetry.metric(opt, COST, name, *value);
        }
        self.telemetry.heartbeat(opt, "after_costfunction");

        let sens_norm = cost.sensitivity.iter().map(|s| s * s).sum::<f64>().sqrt();
        self.telemetry.metric(opt, DESIGN, "sensitivity_norm", sens_norm);
        self.telemetry.heartbeat(opt, "after_sensitivity");

        let rejected = |reason: String| MtoError::UpdaterRejection {
            iteration: opt,
            reason,
            last_objective: Some(cost.objective),
        };
        let update = self
            .updater
            .update(&cost, design, opt, &self.settings.bounds)
            .map_err(|r| rejected(r.0))?;
        if update.design.len() != design.len() {
            return Err(rejected(format!(
                "updated design has {} cells, expected {}",
                update.design.len(),
                design.len()
            )));
        }
        let bounds = self.settings.bounds;
        if let Some(i) = update.design.values().iter().position(|&g| !bounds.contains(g)) {
            return Err(rejected(format!(
                "updated design value {} in cell {} is outside [{}, {}]",
                update.design.values()[i],
                i,
                bounds.lower,
                bounds.upper
            )));
        }
        *design = update.design;
        self.telemetry.heartbeat(opt, "after_update");
        self.telemetry.metric(opt, DESIGN, "max_change", update.max_change);
        self.telemetry.metric(opt, DESIGN, "volume", design.mean());

        let elapsed_s = self.telemetry.elapsed();
        let status = SolverStatus {
            iteration: opt,
            objective: cost.objective,
            flags: StatusFlags {
                do_turb_adj_solve,
                turb_adj_solves: passes.turbulence_solves,
                turb_adj_reused: passes.turbulence_reused(),
                turb_adj_lag: fields.adjoint.turbulence_lag(opt),
                converged: update.converged,
            },
            max_change: update.max_change,
            elapsed_s,
            design: design.values().to_vec(),
        };
        self.telemetry.status(&status);
        self.telemetry.heartbeat(opt, "after_writeSolverStatus");

        debug!(
            "[mto] opt={} J={:.6e} max_change={:.3e} passes={} turb_solves={}",
            opt, cost.objective, update.max_change, passes.passes, passes.turbulence_solves
        );

        Ok(IterationSummary {
            iteration: opt,
            objective: cost.objective,
            components: cost.components,
            do_turb_adj_solve,
            passes,
            max_change: update.max_change,
            converged: update.converged,
            elapsed_s,
        })
    }
}
