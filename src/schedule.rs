//! Turbulence-adjoint lagging and the inner adjoint pass loop.
//!
//! The turbulence adjoint is the most expensive link of the adjoint chain.
//! Once the ramp-up phase is over it is only re-solved every
//! `adj_turb_lag_every` outer iterations; in between, the first inner pass
//! still refreshes it and later passes reuse that value.

use serde::Serialize;

use crate::error::{MtoError, StageFailure};
use crate::fields::{DesignField, FieldState, PassStamp};
use crate::solver::{AdjointSolver, Stage};

/// Immutable per-run scheduling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerConfig {
    /// Lag period; 0 or 1 disables lagging
    pub adj_turb_lag_every: usize,
    /// Iterations up to and including this one never lag
    pub adj_turb_ramp_end: i64,
    /// Inner adjoint passes per outer iteration
    pub n_adj_turb_passes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            adj_turb_lag_every: 1,
            adj_turb_ramp_end: 0,
            n_adj_turb_passes: 1,
        }
    }
}

impl SchedulerConfig {
    /// Build from raw case-file integers, rejecting negative counts.
    pub fn new(lag_every: i64, ramp_end: i64, passes: i64) -> Result<Self, MtoError> {
        if lag_every < 0 {
            return Err(MtoError::config(format!(
                "scheduler.adj_turb_lag_every must be >= 0, got {}",
                lag_every
            )));
        }
        if passes < 0 {
            return Err(MtoError::config(format!(
                "scheduler.n_adj_turb_passes must be >= 0, got {}",
                passes
            )));
        }
        Ok(Self {
            adj_turb_lag_every: lag_every as usize,
            adj_turb_ramp_end: ramp_end,
            n_adj_turb_passes: passes as usize,
        })
    }

    /// Whether every inner pass of outer iteration `opt` re-solves the
    /// turbulence adjoint.
    pub fn do_turb_adj_solve(&self, opt: usize) -> bool {
        self.adj_turb_lag_every <= 1
            || (opt as i64) <= self.adj_turb_ramp_end
            || opt % self.adj_turb_lag_every == 0
    }
}

/// Pass 0 always refreshes the turbulence adjoint.
pub fn solves_turbulence_in_pass(do_turb_adj_solve: bool, pass: usize) -> bool {
    do_turb_adj_solve || pass == 0
}

/// Sub-step counts of one run of the inner pass loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub passes: usize,
    pub turbulence_solves: usize,
    pub heat_velocity_solves: usize,
    pub momentum_solves: usize,
}

impl PassReport {
    pub fn turbulence_reused(&self) -> usize {
        self.passes - self.turbulence_solves
    }
}

/// Progress points of the inner pass loop, reported to the caller for
/// heartbeat diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassEvent {
    Enter { pass: usize },
    After { pass: usize, stage: Stage },
}

impl PassEvent {
    pub fn heartbeat_name(&self) -> String {
        match self {
            PassEvent::Enter { pass } => format!("adj_pass_{}_enter", pass),
            PassEvent::After { pass, stage } => {
                format!("adj_pass_{}_after_{}", pass, stage.pass_tag())
            }
        }
    }
}

pub struct TurbulenceAdjointScheduler {
    config: SchedulerConfig,
}

impl TurbulenceAdjointScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Run the inner passes of outer iteration `opt`.
    ///
    /// Passes are strictly sequential: turbulence adjoint (when scheduled),
    /// then heat-adjoint velocity, then flow-momentum adjoint. On return the
    /// adjoint state is stamped with the last completed pass.
    pub fn run_passes(
        &self,
        opt: usize,
        do_turb_adj_solve: bool,
        solver: &mut dyn AdjointSolver,
        design: &DesignField,
        fields: &mut FieldState,
        on_event: &mut dyn FnMut(PassEvent),
    ) -> Result<PassReport, StageFailure> {
        let mut report = PassReport::default();
        let primal = &fields.primal;
        let adjoint = &mut fields.adjoint;

        for pass in 0..self.config.n_adj_turb_passes {
            on_event(PassEvent::Enter { pass });

            if solves_turbulence_in_pass(do_turb_adj_solve, pass) {
                solver
                    .solve_adjoint_turbulence(design, primal, adjoint)
                    .map_err(|source| StageFailure {
                        stage: Stage::AdjointTurbulence,
                        source,
                    })?;
                adjoint.turbulence_solved_at = Some(opt);
                report.turbulence_solves += 1;
                on_event(PassEvent::After {
                    pass,
                    stage: Stage::AdjointTurbulence,
                });
            }

            solver
                .solve_adjoint_heat_velocity(design, primal, adjoint)
                .map_err(|source| StageFailure {
                    stage: Stage::AdjointHeatVelocity,
                    source,
                })?;
            report.heat_velocity_solves += 1;
            on_event(PassEvent::After {
                pass,
                stage: Stage::AdjointHeatVelocity,
            });

            solver
                .solve_adjoint_momentum(design, primal, adjoint)
                .map_err(|source| StageFailure {
                    stage: Stage::AdjointMomentum,
                    source,
                })?;
            report.momentum_solves += 1;
            adjoint.last_pass = Some(PassStamp {
                iteration: opt,
                pass,
            });
            on_event(PassEvent::After {
                pass,
                stage: Stage::AdjointMomentum,
            });

            report.passes += 1;
        }

        Ok(report)
    }
}

/// One row of the lagging decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleRow {
    pub iteration: usize,
    pub do_turb_adj_solve: bool,
    pub turbulence_solves: usize,
    pub turbulence_reused: usize,
}

/// Decision table for iterations `1..=iterations`, without running anything.
pub fn schedule_table(config: &SchedulerConfig, iterations: usize) -> Vec<ScheduleRow> {
    (1..=iterations)
        .map(|opt| {
            let doit = config.do_turb_adj_solve(opt);
            let solves = (0..config.n_adj_turb_passes)
                .filter(|&p| solves_turbulence_in_pass(doit, p))
                .count();
            ScheduleRow {
                iteration: opt,
                do_turb_adj_solve: doit,
                turbulence_solves: solves,
                turbulence_reused: config.n_adj_turb_passes - solves,
            }
        })
        .collect()
}
