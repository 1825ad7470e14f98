//! Collaborator seams consumed by the optimization driver.
//!
//! Each delegated solve is a single blocking transform over the shared field
//! state. Implementations may parallelize internally; the driver never calls
//! two of them at once.

use std::fmt;

use serde::Serialize;

use crate::error::{Diverged, Rejected};
use crate::fields::{AdjointState, CostSensitivity, DesignField, PrimalState};

/// Solve stages of one outer iteration, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    TurbulenceCorrect,
    PrimalFlow,
    PrimalThermal,
    AdjointThermal,
    AdjointTurbulence,
    AdjointHeatVelocity,
    AdjointMomentum,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::TurbulenceCorrect => "turbulence_correct",
            Stage::PrimalFlow => "primal_U",
            Stage::PrimalThermal => "primal_T",
            Stage::AdjointThermal => "adjoint_Tb",
            Stage::AdjointTurbulence => "adjoint_kOmega",
            Stage::AdjointHeatVelocity => "adjoint_Ub",
            Stage::AdjointMomentum => "adjoint_Ua",
        }
    }

    /// Short tag used in per-pass heartbeat names.
    pub fn pass_tag(&self) -> &'static str {
        match self {
            Stage::AdjointTurbulence => "kOmega",
            Stage::AdjointHeatVelocity => "Ub",
            Stage::AdjointMomentum => "Ua",
            other => other.name(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Advances the primal flow and thermal fields.
pub trait PrimalSolver {
    /// Update turbulence closure fields from the current velocity.
    fn correct_turbulence(&mut self, _primal: &mut PrimalState) -> Result<(), Diverged> {
        Ok(())
    }

    fn solve_flow(&mut self, design: &DesignField, primal: &mut PrimalState) -> Result<(), Diverged>;

    fn solve_thermal(&mut self, design: &DesignField, primal: &mut PrimalState) -> Result<(), Diverged>;
}

/// Advances the adjoint fields given a completed primal step.
pub trait AdjointSolver {
    fn solve_adjoint_thermal(
        &mut self,
        design: &DesignField,
        primal: &PrimalState,
        adjoint: &mut AdjointState,
    ) -> Result<(), Diverged>;

    fn solve_adjoint_turbulence(
        &mut self,
        design: &DesignField,
        primal: &PrimalState,
        adjoint: &mut AdjointState,
    ) -> Result<(), Diverged>;

    fn solve_adjoint_heat_velocity(
        &mut self,
        design: &DesignField,
        primal: &PrimalState,
        adjoint: &mut AdjointState,
    ) -> Result<(), Diverged>;

    fn solve_adjoint_momentum(
        &mut self,
        design: &DesignField,
        primal: &PrimalState,
        adjoint: &mut AdjointState,
    ) -> Result<(), Diverged>;
}

/// Objective and sensitivity evaluation. Must be a pure function of its inputs.
pub trait CostFunction {
    fn evaluate(
        &self,
        primal: &PrimalState,
        adjoint: &AdjointState,
        design: &DesignField,
    ) -> CostSensitivity;
}

/// Box and move-limit constraints handed to the design updater.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DesignBounds {
    pub lower: f64,
    pub upper: f64,
    pub move_limit: f64,
}

impl DesignBounds {
    pub fn contains(&self, value: f64) -> bool {
        (self.lower..=self.upper).contains(&value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesignUpdate {
    pub design: DesignField,
    pub converged: bool,
    pub max_change: f64,
}

/// Convex-approximation design step (MMA or a stand-in).
pub trait DesignUpdater {
    fn update(
        &mut self,
        cost: &CostSensitivity,
        design: &DesignField,
        iteration: usize,
        bounds: &DesignBounds,
    ) -> Result<DesignUpdate, Rejected>;
}

/// Loop-continuation predicate, checked before each outer iteration.
pub trait LoopControl {
    fn should_continue(&mut self, next_iteration: usize) -> bool;
}

impl<F> LoopControl for F
where
    F: FnMut(usize) -> bool,
{
    fn should_continue(&mut self, next_iteration: usize) -> bool {
        self(next_iteration)
    }
}

/// Stops after a fixed number of outer iterations.
#[derive(Debug, Clone, Copy)]
pub struct IterationBudget {
    pub max_iter: usize,
}

impl LoopControl for IterationBudget {
    fn should_continue(&mut self, next_iteration: usize) -> bool {
        next_iteration <= self.max_iter
    }
}
