//! Cost function and sensitivity assembly.
//!
//! The objective is a weighted sum of the power dissipated by the Brinkman
//! penalization and the mean temperature. Its gradient with respect to the
//! design is assembled cell by cell from the primal and adjoint fields:
//!
//! ```text
//! dJ/dγ = w_p α'(γ)|U|² + α'(γ) (Ua + Ub)·U - k'(γ) T Tb
//! ```
//!
//! where `α` is the RAMP-interpolated inverse permeability and `k` the
//! interpolated conductivity.

use serde::{Deserialize, Serialize};

use crate::fields::{AdjointState, CostSensitivity, DesignField, PrimalState};
use crate::solver::CostFunction;

/// Material interpolation between solid (γ = 0) and fluid (γ = 1).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct MaterialModel {
    /// Inverse permeability of the solid phase
    pub alpha_max: f64,
    /// RAMP penalization parameter
    pub q_ramp: f64,
    pub conductivity_fluid: f64,
    pub conductivity_solid: f64,
}

impl Default for MaterialModel {
    fn default() -> Self {
        Self {
            alpha_max: 100.0,
            q_ramp: 0.1,
            conductivity_fluid: 0.6,
            conductivity_solid: 2.0,
        }
    }
}

impl MaterialModel {
    /// `α(γ) = α_max q (1 - γ) / (q + γ)`
    pub fn alpha(&self, gamma: f64) -> f64 {
        self.alpha_max * self.q_ramp * (1.0 - gamma) / (self.q_ramp + gamma)
    }

    pub fn alpha_derivative(&self, gamma: f64) -> f64 {
        let q = self.q_ramp;
        -self.alpha_max * q * (1.0 + q) / ((q + gamma) * (q + gamma))
    }

    /// Linear blend of the two conductivities.
    pub fn conductivity(&self, gamma: f64) -> f64 {
        self.conductivity_solid + (self.conductivity_fluid - self.conductivity_solid) * gamma
    }

    pub fn conductivity_derivative(&self, _gamma: f64) -> f64 {
        self.conductivity_fluid - self.conductivity_solid
    }
}

/// Dissipated power plus mean temperature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalFluidCost {
    pub material: MaterialModel,
    pub power_weight: f64,
    pub heat_weight: f64,
}

impl ThermalFluidCost {
    pub fn new(material: MaterialModel, power_weight: f64, heat_weight: f64) -> Self {
        Self {
            material,
            power_weight,
            heat_weight,
        }
    }
}

impl CostFunction for ThermalFluidCost {
    fn evaluate(
        &self,
        primal: &PrimalState,
        adjoint: &AdjointState,
        design: &DesignField,
    ) -> CostSensitivity {
        let n = design.len();
        let mut power = 0.0;
        let mut temperature = 0.0;
        let mut sensitivity = Vec::with_capacity(n);

        for (i, &gamma) in design.values().iter().enumerate() {
            let u = primal.u[i];
            let u2 = u.norm_squared();
            let alpha = self.material.alpha(gamma);
            let d_alpha = self.material.alpha_derivative(gamma);
            let d_k = self.material.conductivity_derivative(gamma);

            power += alpha * u2;
            temperature += primal.t[i];

            let flow = self.power_weight * d_alpha * u2;
            let coupling = d_alpha * (adjoint.ua[i] + adjoint.ub[i]).dot(&u);
            let conduction = -d_k * primal.t[i] * adjoint.tb[i];
            sensitivity.push(flow + coupling + conduction);
        }

        let mean_temperature = if n > 0 { temperature / n as f64 } else { 0.0 };
        let power_term = self.power_weight * power;
        let heat_term = self.heat_weight * mean_temperature;

        CostSensitivity {
            objective: power_term + heat_term,
            components: vec![
                ("power", power),
                ("mean_T", mean_temperature),
                ("volume", design.mean()),
            ],
            sensitivity,
        }
    }
}
