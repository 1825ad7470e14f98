use serde::{Deserialize, Serialize};

use crate::error::MtoError;
use crate::schedule::SchedulerConfig;
use crate::sensitivity::MaterialModel;
use crate::solver::DesignBounds;

pub const PROGRAM: &str = "MTO_ThermalFluid";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Root {
    pub case: Case,
    pub optimization: Optimization,
    #[serde(default)]
    pub scheduler: Scheduler,
    #[serde(default)]
    pub design: Design,
    #[serde(default)]
    pub diagnostics: Diagnostics,
    #[serde(default)]
    pub model: Model,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Case {
    pub program: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Optimization {
    /// Outer-iteration budget
    pub max_iter: i64,
    /// Design-change convergence tolerance
    pub tol: f64,
}

/// Raw integers so that negative values can be reported rather than
/// rejected by the parser.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Scheduler {
    #[serde(default = "default_one_i64")]
    pub adj_turb_lag_every: i64,
    #[serde(default)]
    pub adj_turb_ramp_end: i64,
    #[serde(default = "default_one_i64")]
    pub n_adj_turb_passes: i64,
}

fn default_one_i64() -> i64 { 1 }

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            adj_turb_lag_every: 1,
            adj_turb_ramp_end: 0,
            n_adj_turb_passes: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Design {
    /// Uniform starting density
    #[serde(default = "default_initial")]
    pub initial: f64,
    #[serde(default)]
    pub lower: f64,
    #[serde(default = "default_upper")]
    pub upper: f64,
    #[serde(default = "default_move_limit")]
    pub move_limit: f64,
    /// Upper limit on the mean fluid fraction
    #[serde(default = "default_volume_fraction")]
    pub volume_fraction: f64,
}

fn default_initial() -> f64 { 0.5 }
fn default_upper() -> f64 { 1.0 }
fn default_move_limit() -> f64 { 0.2 }
fn default_volume_fraction() -> f64 { 0.5 }

impl Default for Design {
    fn default() -> Self {
        Self {
            initial: 0.5,
            lower: 0.0,
            upper: 1.0,
            move_limit: 0.2,
            volume_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Diagnostics {
    /// 0 = off, 1 = per-iteration metrics, 2 = per-sub-step heartbeat
    #[serde(default = "default_level")]
    pub level: u8,
    #[serde(default = "default_every")]
    pub every: usize,
    /// Process rank that emits diagnostics
    #[serde(default)]
    pub rank: usize,
    /// No diagnostics before this iteration
    #[serde(default)]
    pub opt_start: usize,
}

fn default_level() -> u8 { 1 }
fn default_every() -> usize { 1 }

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            level: 1,
            every: 1,
            rank: 0,
            opt_start: 0,
        }
    }
}

/// Parameters of the built-in reduced-order model.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Model {
    #[serde(default = "default_cells")]
    pub cells: usize,
    #[serde(default = "default_inlet_velocity")]
    pub inlet_velocity: f64,
    #[serde(default = "default_viscosity")]
    pub viscosity: f64,
    /// Mixing-length coefficient of the turbulence closure
    #[serde(default = "default_mixing")]
    pub mixing_coefficient: f64,
    #[serde(default = "default_heat_capacity_rate")]
    pub heat_capacity_rate: f64,
    #[serde(default = "default_heat_source")]
    pub heat_source: f64,
    #[serde(default = "default_relaxation")]
    pub relaxation: f64,
    #[serde(default = "default_alpha_max")]
    pub alpha_max: f64,
    #[serde(default = "default_q_ramp")]
    pub q_ramp: f64,
    #[serde(default = "default_k_fluid")]
    pub conductivity_fluid: f64,
    #[serde(default = "default_k_solid")]
    pub conductivity_solid: f64,
    #[serde(default = "default_weight")]
    pub power_weight: f64,
    #[serde(default = "default_weight")]
    pub heat_weight: f64,
    #[serde(default = "default_outlet_area")]
    pub outlet_area: f64,
    #[serde(default = "default_outlet_delta")]
    pub outlet_delta_coeff: f64,
}

fn default_cells() -> usize { 64 }
fn default_inlet_velocity() -> f64 { 1.0 }
fn default_viscosity() -> f64 { 1.0 }
fn default_mixing() -> f64 { 0.1 }
fn default_heat_capacity_rate() -> f64 { 2.0 }
fn default_heat_source() -> f64 { 10.0 }
fn default_relaxation() -> f64 { 0.7 }
fn default_alpha_max() -> f64 { 100.0 }
fn default_q_ramp() -> f64 { 0.1 }
fn default_k_fluid() -> f64 { 0.6 }
fn default_k_solid() -> f64 { 2.0 }
fn default_weight() -> f64 { 1.0 }
fn default_outlet_area() -> f64 { 0.1 }
fn default_outlet_delta() -> f64 { 20.0 }

impl Default for Model {
    fn default() -> Self {
        Self {
            cells: default_cells(),
            inlet_velocity: default_inlet_velocity(),
            viscosity: default_viscosity(),
            mixing_coefficient: default_mixing(),
            heat_capacity_rate: default_heat_capacity_rate(),
            heat_source: default_heat_source(),
            relaxation: default_relaxation(),
            alpha_max: default_alpha_max(),
            q_ramp: default_q_ramp(),
            conductivity_fluid: default_k_fluid(),
            conductivity_solid: default_k_solid(),
            power_weight: default_weight(),
            heat_weight: default_weight(),
            outlet_area: default_outlet_area(),
            outlet_delta_coeff: default_outlet_delta(),
        }
    }
}

impl Model {
    pub fn material(&self) -> MaterialModel {
        MaterialModel {
            alpha_max: self.alpha_max,
            q_ramp: self.q_ramp,
            conductivity_fluid: self.conductivity_fluid,
            conductivity_solid: self.conductivity_solid,
        }
    }
}

fn check(ok: bool, msg: &str) -> Result<(), MtoError> {
    if ok {
        Ok(())
    } else {
        Err(MtoError::config(msg))
    }
}

impl Root {
    pub fn from_toml(text: &str) -> Result<Self, MtoError> {
        toml::from_str(text).map_err(|e| MtoError::config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), MtoError> {
        check(self.case.program == PROGRAM, "case.program must be MTO_ThermalFluid")?;
        check(
            (1..=100_000).contains(&self.optimization.max_iter),
            "optimization.max_iter must be in [1, 100000]",
        )?;
        check(self.optimization.tol > 0.0, "optimization.tol must be positive")?;

        self.scheduler_config()?;

        let d = &self.design;
        check(d.lower < d.upper, "design.lower must be < design.upper")?;
        check(
            (d.lower..=d.upper).contains(&d.initial),
            "design.initial must lie within [design.lower, design.upper]",
        )?;
        check(
            d.move_limit > 0.0 && d.move_limit <= 1.0,
            "design.move_limit must be in (0, 1]",
        )?;
        check(
            d.volume_fraction > 0.0 && d.volume_fraction <= 1.0,
            "design.volume_fraction must be in (0, 1]",
        )?;

        check(self.diagnostics.level <= 2, "diagnostics.level must be 0, 1 or 2")?;
        check(self.diagnostics.every >= 1, "diagnostics.every must be >= 1")?;

        let m = &self.model;
        check(m.cells >= 1, "model.cells must be >= 1")?;
        check(m.viscosity > 0.0, "model.viscosity must be positive")?;
        check(m.mixing_coefficient >= 0.0, "model.mixing_coefficient must be >= 0")?;
        check(
            m.relaxation > 0.0 && m.relaxation <= 1.0,
            "model.relaxation must be in (0, 1]",
        )?;
        check(m.alpha_max >= 0.0, "model.alpha_max must be >= 0")?;
        check(m.q_ramp > 0.0, "model.q_ramp must be positive")?;
        check(
            m.conductivity_fluid > 0.0 && m.conductivity_solid > 0.0,
            "model conductivities must be positive",
        )?;
        check(m.heat_capacity_rate >= 0.0, "model.heat_capacity_rate must be >= 0")?;
        check(m.outlet_area > 0.0, "model.outlet_area must be positive")?;

        Ok(())
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig, MtoError> {
        SchedulerConfig::new(
            self.scheduler.adj_turb_lag_every,
            self.scheduler.adj_turb_ramp_end,
            self.scheduler.n_adj_turb_passes,
        )
    }

    pub fn bounds(&self) -> DesignBounds {
        DesignBounds {
            lower: self.design.lower,
            upper: self.design.upper,
            move_limit: self.design.move_limit,
        }
    }

    pub fn max_iter(&self) -> usize {
        self.optimization.max_iter.max(0) as usize
    }
}
