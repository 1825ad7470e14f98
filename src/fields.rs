//! Mesh-resident field state shared by the solve stages.
//!
//! Fields are stored cell-wise. The driver owns one `FieldState` per run and
//! hands it to each stage in turn; the sequential pipeline is the only
//! synchronization.

use nalgebra::Vector3;
use serde::Serialize;

pub type Vec3 = Vector3<f64>;

/// Per-cell design variable. 1 is fluid, 0 is solid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesignField {
    values: Vec<f64>,
}

impl DesignField {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn uniform(cells: usize, value: f64) -> Self {
        Self {
            values: vec![value; cells],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Mean density, i.e. the fluid volume fraction on a uniform mesh.
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Largest absolute per-cell difference to `other`.
    pub fn max_change(&self, other: &DesignField) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

/// Primal flow and thermal fields.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimalState {
    /// Velocity `U`
    pub u: Vec<Vec3>,
    /// Kinematic pressure `p`
    pub p: Vec<f64>,
    /// Temperature `T`
    pub t: Vec<f64>,
    /// Turbulent viscosity `nut`
    pub nut: Vec<f64>,
}

impl PrimalState {
    pub fn zeros(cells: usize) -> Self {
        Self {
            u: vec![Vec3::zeros(); cells],
            p: vec![0.0; cells],
            t: vec![0.0; cells],
            nut: vec![0.0; cells],
        }
    }

    pub fn cells(&self) -> usize {
        self.u.len()
    }
}

/// Where in the loop an adjoint field was last written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PassStamp {
    pub iteration: usize,
    pub pass: usize,
}

/// Adjoint counterparts of the primal fields.
///
/// `turbulence` may be older than the rest of the state when the scheduler
/// lags it; `turbulence_solved_at` records which outer iteration produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjointState {
    /// Flow (power) adjoint velocity `Ua`
    pub ua: Vec<Vec3>,
    /// Heat adjoint velocity `Ub`
    pub ub: Vec<Vec3>,
    /// Heat adjoint temperature `Tb`
    pub tb: Vec<f64>,
    /// Adjoint of the turbulence closure
    pub turbulence: Vec<f64>,
    /// Adjoint pressure on the outlet patch
    pub outlet_pa: f64,
    /// Heat adjoint velocity on the outlet patch
    pub outlet_ub: Vec3,
    pub turbulence_solved_at: Option<usize>,
    pub last_pass: Option<PassStamp>,
}

impl AdjointState {
    pub fn zeros(cells: usize) -> Self {
        Self {
            ua: vec![Vec3::zeros(); cells],
            ub: vec![Vec3::zeros(); cells],
            tb: vec![0.0; cells],
            turbulence: vec![0.0; cells],
            outlet_pa: 0.0,
            outlet_ub: Vec3::zeros(),
            turbulence_solved_at: None,
            last_pass: None,
        }
    }

    /// Number of outer iterations the turbulence adjoint lags behind `iteration`.
    pub fn turbulence_lag(&self, iteration: usize) -> Option<usize> {
        self.turbulence_solved_at
            .map(|solved| iteration.saturating_sub(solved))
    }
}

/// Everything the stages read and write during one outer iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldState {
    pub primal: PrimalState,
    pub adjoint: AdjointState,
}

impl FieldState {
    pub fn zeros(cells: usize) -> Self {
        Self {
            primal: PrimalState::zeros(cells),
            adjoint: AdjointState::zeros(cells),
        }
    }
}

/// Objective value and per-cell gradient for one outer iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct CostSensitivity {
    pub objective: f64,
    /// Named contributions to `objective`, reported as diagnostics
    pub components: Vec<(&'static str, f64)>,
    pub sensitivity: Vec<f64>,
}

/// Returns the index of the first non-finite entry, if any.
pub fn first_non_finite(values: &[f64]) -> Option<usize> {
    values.iter().position(|v| !v.is_finite())
}

pub fn first_non_finite_vec(values: &[Vec3]) -> Option<usize> {
    values
        .iter()
        .position(|v| !(v.x.is_finite() && v.y.is_finite() && v.z.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn design_mean_and_change() {
        let a = DesignField::new(vec![0.0, 0.5, 1.0]);
        let b = DesignField::new(vec![0.1, 0.5, 0.7]);
        assert!((a.mean() - 0.5).abs() < 1e-12);
        assert!((a.max_change(&b) - 0.3).abs() < 1e-12);
        assert_eq!(DesignField::new(vec![]).mean(), 0.0);
    }

    #[test]
    fn turbulence_lag_tracks_staleness() {
        let mut adj = AdjointState::zeros(2);
        assert_eq!(adj.turbulence_lag(4), None);
        adj.turbulence_solved_at = Some(4);
        assert_eq!(adj.turbulence_lag(4), Some(0));
        assert_eq!(adj.turbulence_lag(6), Some(2));
    }

    #[test]
    fn non_finite_detection() {
        assert_eq!(first_non_finite(&[1.0, f64::NAN, 2.0]), Some(1));
        assert_eq!(first_non_finite(&[1.0, 2.0]), None);
        let v = vec![Vec3::zeros(), Vec3::new(0.0, f64::INFINITY, 0.0)];
        assert_eq!(first_non_finite_vec(&v), Some(1));
    }
}
