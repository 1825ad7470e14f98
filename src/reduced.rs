//! Reduced-order conjugate thermal-fluid model.
//!
//! A row of `cells` parallel Brinkman channels, each with its own design
//! variable, driven by a common inlet velocity and a uniform volumetric heat
//! source. Flow, turbulence closure and heat balance are algebraic per cell
//! so the primal and adjoint stages are cheap, but they keep the coupling
//! structure of the full problem: the turbulence adjoint feeds the momentum
//! adjoint, the heat adjoint feeds the velocity adjoint, and the primal
//! fields are under-relaxed so they converge together with the design.
//!
//! Per cell, with `D = ν + α(γ) + ν_t`:
//!
//! ```text
//! flow        D u = ν U0
//! closure     ν_t = c_t |u|
//! heat        (k(γ) + c |u|) T = Q
//! ```

use crate::boundary::{AdjointOutletCondition, OutletFace};
use crate::config;
use crate::error::Diverged;
use crate::fields::{
    first_non_finite, first_non_finite_vec, AdjointState, DesignField, PrimalState, Vec3,
};
use crate::sensitivity::MaterialModel;
use crate::solver::{AdjointSolver, PrimalSolver};

const U_SMALL: f64 = 1.0e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReducedModel {
    pub material: MaterialModel,
    pub inlet_velocity: f64,
    pub viscosity: f64,
    pub mixing_coefficient: f64,
    pub heat_capacity_rate: f64,
    pub heat_source: f64,
    pub relaxation: f64,
    pub power_weight: f64,
    pub heat_weight: f64,
    pub outlet_area: f64,
    pub outlet_delta_coeff: f64,
}

impl ReducedModel {
    pub fn from_config(model: &config::Model) -> Self {
        Self {
            material: model.material(),
            inlet_velocity: model.inlet_velocity,
            viscosity: model.viscosity,
            mixing_coefficient: model.mixing_coefficient,
            heat_capacity_rate: model.heat_capacity_rate,
            heat_source: model.heat_source,
            relaxation: model.relaxation,
            power_weight: model.power_weight,
            heat_weight: model.heat_weight,
            outlet_area: model.outlet_area,
            outlet_delta_coeff: model.outlet_delta_coeff,
        }
    }

    /// Split into the primal and adjoint collaborators.
    pub fn solvers(&self) -> (ReducedPrimal, ReducedAdjoint) {
        (ReducedPrimal { model: *self }, ReducedAdjoint { model: *self })
    }

    fn resistance(&self, gamma: f64, nut: f64) -> f64 {
        self.viscosity + self.material.alpha(gamma) + nut
    }

    fn heat_transfer(&self, gamma: f64, speed: f64) -> f64 {
        self.material.conductivity(gamma) + self.heat_capacity_rate * speed
    }

    fn outlet_face(&self, primal: &PrimalState, u_adjoint: Vec3) -> Option<OutletFace> {
        let last = primal.cells().checked_sub(1)?;
        let sf = Vec3::x() * self.outlet_area;
        let u = primal.u[last];
        Some(OutletFace {
            sf,
            delta_coeff: self.outlet_delta_coeff,
            phi: u.dot(&sf),
            phi_adjoint: u_adjoint.dot(&sf),
            u,
            u_adjoint_neighbour: u_adjoint,
            nu: self.viscosity,
            nut: Some(primal.nut[last]),
        })
    }
}

/// Flow direction of a cell, falling back to +x when the cell is stagnant.
fn flow_direction(u: &Vec3) -> Vec3 {
    let speed = u.norm();
    if speed > U_SMALL {
        u / speed
    } else {
        Vec3::x()
    }
}

fn check_scalar(name: &str, values: &[f64]) -> Result<(), Diverged> {
    match first_non_finite(values) {
        Some(i) => Err(Diverged::new(format!("non-finite {} in cell {}", name, i))),
        None => Ok(()),
    }
}

fn check_vector(name: &str, values: &[Vec3]) -> Result<(), Diverged> {
    match first_non_finite_vec(values) {
        Some(i) => Err(Diverged::new(format!("non-finite {} in cell {}", name, i))),
        None => Ok(()),
    }
}

fn check_cells(design: &DesignField, cells: usize) -> Result<(), Diverged> {
    if design.len() != cells {
        return Err(Diverged::new(format!(
            "design has {} cells, fields have {}",
            design.len(),
            cells
        )));
    }
    Ok(())
}

pub struct ReducedPrimal {
    model: ReducedModel,
}

impl PrimalSolver for ReducedPrimal {
    fn correct_turbulence(&mut self, primal: &mut PrimalState) -> Result<(), Diverged> {
        let c_t = self.model.mixing_coefficient;
        for (nut, u) in primal.nut.iter_mut().zip(primal.u.iter()) {
            *nut = c_t * u.norm();
        }
        check_scalar("nut", &primal.nut)
    }

    fn solve_flow(&mut self, design: &DesignField, primal: &mut PrimalState) -> Result<(), Diverged> {
        check_cells(design, primal.cells())?;
        let m = &self.model;
        for (i, &gamma) in design.values().iter().enumerate() {
            let d = m.resistance(gamma, primal.nut[i]);
            if d <= 0.0 {
                return Err(Diverged::new(format!(
                    "non-positive flow resistance {:.3e} in cell {}",
                    d, i
                )));
            }
            let target = Vec3::x() * (m.viscosity * m.inlet_velocity / d);
            let current = primal.u[i];
            primal.u[i] = current + (target - current) * m.relaxation;
            primal.p[i] = (m.material.alpha(gamma) + primal.nut[i]) * primal.u[i].norm();
        }
        check_vector("U", &primal.u)?;
        check_scalar("p", &primal.p)
    }

    fn solve_thermal(&mut self, design: &DesignField, primal: &mut PrimalState) -> Result<(), Diverged> {
        check_cells(design, primal.cells())?;
        let m = &self.model;
        for (i, &gamma) in design.values().iter().enumerate() {
            let h = m.heat_transfer(gamma, primal.u[i].norm());
            if h <= 0.0 {
                return Err(Diverged::new(format!(
                    "non-positive heat transfer coefficient in cell {}",
                    i
                )));
            }
            let target = m.heat_source / h;
            primal.t[i] += (target - primal.t[i]) * m.relaxation;
        }
        check_scalar("T", &primal.t)
    }
}

pub struct ReducedAdjoint {
    model: ReducedModel,
}

impl AdjointSolver for ReducedAdjoint {
    fn solve_adjoint_thermal(
        &mut self,
        design: &DesignField,
        primal: &PrimalState,
        adjoint: &mut AdjointState,
    ) -> Result<(), Diverged> {
        check_cells(design, primal.cells())?;
        let m = &self.model;
        let weight = m.heat_weight / design.len().max(1) as f64;
        for (i, &gamma) in design.values().iter().enumerate() {
            let h = m.heat_transfer(gamma, primal.u[i].norm());
            adjoint.tb[i] = weight / h;
        }
        check_scalar("Tb", &adjoint.tb)
    }

    fn solve_adjoint_turbulence(
        &mut self,
        _design: &DesignField,
        primal: &PrimalState,
        adjoint: &mut AdjointState,
    ) -> Result<(), Diverged> {
        for i in 0..primal.cells() {
            let e = flow_direction(&primal.u[i]);
            let lambda = (adjoint.ua[i] + adjoint.ub[i]).dot(&e);
            adjoint.turbulence[i] = -lambda * primal.u[i].norm();
        }
        check_scalar("turbulence adjoint", &adjoint.turbulence)
    }

    fn solve_adjoint_heat_velocity(
        &mut self,
        design: &DesignField,
        primal: &PrimalState,
        adjoint: &mut AdjointState,
    ) -> Result<(), Diverged> {
        let m = &self.model;
        for (i, &gamma) in design.values().iter().enumerate() {
            let d = m.resistance(gamma, primal.nut[i]);
            let e = flow_direction(&primal.u[i]);
            adjoint.ub[i] = e * (adjoint.tb[i] * m.heat_capacity_rate * primal.t[i] / d);
        }
        check_vector("Ub", &adjoint.ub)?;

        if let Some(last) = adjoint.ub.last().copied() {
            if let Some(face) = m.outlet_face(primal, last) {
                if let Some(ub) = AdjointOutletCondition::VelocityHeat
                    .compute_boundary_value(&face)
                    .vector()
                {
                    check_vector("outlet Ub", &[ub])?;
                    adjoint.outlet_ub = ub;
                }
            }
        }
        Ok(())
    }

    fn solve_adjoint_momentum(
        &mut self,
        design: &DesignField,
        primal: &PrimalState,
        adjoint: &mut AdjointState,
    ) -> Result<(), Diverged> {
        let m = &self.model;
        for (i, &gamma) in design.values().iter().enumerate() {
            let d = m.resistance(gamma, primal.nut[i]);
            let e = flow_direction(&primal.u[i]);
            let speed = primal.u[i].norm();
            let dissipation = 2.0 * m.power_weight * m.material.alpha(gamma) * speed;
            let closure = adjoint.turbulence[i] * m.mixing_coefficient;
            adjoint.ua[i] = e * ((closure - dissipation) / d);
        }
        check_vector("Ua", &adjoint.ua)?;

        if let Some(last) = adjoint.ua.last().copied() {
            if let Some(face) = m.outlet_face(primal, last) {
                if let Some(pa) = AdjointOutletCondition::PressurePower
                    .compute_boundary_value(&face)
                    .scalar()
                {
                    check_scalar("outlet pa", &[pa])?;
                    adjoint.outlet_pa = pa;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldState;
    use crate::sensitivity::ThermalFluidCost;
    use crate::solver::CostFunction;

    fn model() -> ReducedModel {
        ReducedModel {
            material: MaterialModel::default(),
            inlet_velocity: 1.0,
            viscosity: 1.0,
            mixing_coefficient: 0.2,
            heat_capacity_rate: 2.0,
            heat_source: 10.0,
            relaxation: 1.0,
            power_weight: 1.0,
            heat_weight: 1.0,
            outlet_area: 0.1,
            outlet_delta_coeff: 20.0,
        }
    }

    /// Drive primal and adjoint to their fixed points for a frozen design.
    fn converge(m: &ReducedModel, design: &DesignField) -> FieldState {
        let (mut primal, mut adjoint) = m.solvers();
        let mut fields = FieldState::zeros(design.len());
        for _ in 0..200 {
            primal.correct_turbulence(&mut fields.primal).unwrap();
            primal.solve_flow(design, &mut fields.primal).unwrap();
            primal.solve_thermal(design, &mut fields.primal).unwrap();
        }
        adjoint
            .solve_adjoint_thermal(design, &fields.primal, &mut fields.adjoint)
            .unwrap();
        for _ in 0..200 {
            adjoint
                .solve_adjoint_turbulence(design, &fields.primal, &mut fields.adjoint)
                .unwrap();
            adjoint
                .solve_adjoint_heat_velocity(design, &fields.primal, &mut fields.adjoint)
                .unwrap();
            adjoint
                .solve_adjoint_momentum(design, &fields.primal, &mut fields.adjoint)
                .unwrap();
        }
        fields
    }

    #[test]
    fn clear_channel_flows_at_inlet_velocity_without_turbulence() {
        let mut m = model();
        m.mixing_coefficient = 0.0;
        let design = DesignField::uniform(3, 1.0);
        let fields = converge(&m, &design);
        for u in &fields.primal.u {
            assert!((u.x - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn solid_cells_block_flow() {
        let m = model();
        let design = DesignField::new(vec![0.0, 1.0]);
        let fields = converge(&m, &design);
        assert!(fields.primal.u[0].x < 0.1 * fields.primal.u[1].x);
    }

    #[test]
    fn adjoint_sensitivity_matches_finite_difference() {
        let m = model();
        let cost = ThermalFluidCost::new(m.material, m.power_weight, m.heat_weight);
        let design = DesignField::new(vec![0.3, 0.6, 0.9]);
        let fields = converge(&m, &design);
        let base = cost.evaluate(&fields.primal, &fields.adjoint, &design);

        let h = 1e-6;
        for i in 0..design.len() {
            let mut plus = design.values().to_vec();
            let mut minus = design.values().to_vec();
            plus[i] += h;
            minus[i] -= h;
            let plus = DesignField::new(plus);
            let minus = DesignField::new(minus);
            let fp = converge(&m, &plus);
            let fm = converge(&m, &minus);
            let jp = cost.evaluate(&fp.primal, &fp.adjoint, &plus).objective;
            let jm = cost.evaluate(&fm.primal, &fm.adjoint, &minus).objective;
            let fd = (jp - jm) / (2.0 * h);
            let adj = base.sensitivity[i];
            assert!(
                (fd - adj).abs() < 1e-4 * fd.abs().max(1.0),
                "cell {}: fd={} adjoint={}",
                i,
                fd,
                adj
            );
        }
    }

    #[test]
    fn mismatched_design_is_reported_as_divergence() {
        let (mut primal, _) = model().solvers();
        let mut state = PrimalState::zeros(2);
        let err = primal
            .solve_flow(&DesignField::uniform(3, 1.0), &mut state)
            .unwrap_err();
        assert!(err.0.contains("3 cells"));
    }

    #[test]
    fn non_finite_source_is_divergence() {
        let mut m = model();
        m.heat_source = f64::NAN;
        let (mut primal, _) = m.solvers();
        let design = DesignField::uniform(2, 1.0);
        let mut state = PrimalState::zeros(2);
        primal.solve_flow(&design, &mut state).unwrap();
        let err = primal.solve_thermal(&design, &mut state).unwrap_err();
        assert!(err.0.contains("non-finite T"));
    }

    #[test]
    fn under_relaxed_flow_moves_part_way_to_target() {
        let mut half = model();
        half.relaxation = 0.5;
        let design = DesignField::new(vec![0.4, 1.0]);

        let mut full_state = PrimalState::zeros(2);
        let mut half_state = PrimalState::zeros(2);
        model().solvers().0.solve_flow(&design, &mut full_state).unwrap();
        half.solvers().0.solve_flow(&design, &mut half_state).unwrap();

        for (h, f) in half_state.u.iter().zip(full_state.u.iter()) {
            assert!(f.x > 0.0);
            assert!((h.x - 0.5 * f.x).abs() < 1e-12);
        }

        // a second step closes half of the remaining gap
        half.solvers().0.solve_flow(&design, &mut half_state).unwrap();
        for (h, f) in half_state.u.iter().zip(full_state.u.iter()) {
            assert!((h.x - 0.75 * f.x).abs() < 1e-12);
        }
    }

    #[test]
    fn non_finite_outlet_values_are_divergence() {
        let mut m = model();
        m.outlet_delta_coeff = f64::NAN;
        let (mut primal, mut adjoint) = m.solvers();
        let design = DesignField::uniform(2, 1.0);
        let mut fields = FieldState::zeros(2);
        primal.solve_flow(&design, &mut fields.primal).unwrap();
        primal.solve_thermal(&design, &mut fields.primal).unwrap();
        adjoint
            .solve_adjoint_thermal(&design, &fields.primal, &mut fields.adjoint)
            .unwrap();

        let err = adjoint
            .solve_adjoint_heat_velocity(&design, &fields.primal, &mut fields.adjoint)
            .unwrap_err();
        assert!(err.0.contains("non-finite outlet Ub"));
        assert_eq!(fields.adjoint.outlet_ub, Vec3::zeros());

        let err = adjoint
            .solve_adjoint_momentum(&design, &fields.primal, &mut fields.adjoint)
            .unwrap_err();
        assert!(err.0.contains("non-finite outlet pa"));
        assert_eq!(fields.adjoint.outlet_pa, 0.0);
    }

    #[test]
    fn outlet_conditions_are_applied_to_last_cell() {
        let m = model();
        let design = DesignField::uniform(2, 1.0);
        let fields = converge(&m, &design);
        assert!(fields.adjoint.outlet_pa.is_finite());
        assert!(fields.adjoint.outlet_pa != 0.0);
        assert!(fields.adjoint.outlet_ub.x.is_finite());
    }
}
