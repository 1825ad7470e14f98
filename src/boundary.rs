//! Adjoint outlet boundary conditions.
//!
//! Both conditions are fixed-value closures evaluated face by face from the
//! neighbouring primal and adjoint interior values.

use crate::fields::Vec3;

/// Floor applied to face areas and denominators.
pub const VSMALL: f64 = 1.0e-300;

/// Geometry and neighbouring field values of one outlet face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutletFace {
    /// Face area vector `Sf`, pointing out of the domain
    pub sf: Vec3,
    /// Inverse centre-to-face distance
    pub delta_coeff: f64,
    /// Primal face flux `phi`
    pub phi: f64,
    /// Adjoint face flux (`phia` for the flow adjoint, `phib` for the heat adjoint)
    pub phi_adjoint: f64,
    /// Primal velocity on the face
    pub u: Vec3,
    /// Adjoint velocity in the cell next to the face
    pub u_adjoint_neighbour: Vec3,
    pub nu: f64,
    /// Turbulent viscosity, when a turbulence model is active
    pub nut: Option<f64>,
}

impl OutletFace {
    pub fn mag_sf(&self) -> f64 {
        self.sf.norm().max(VSMALL)
    }

    pub fn normal(&self) -> Vec3 {
        self.sf / self.mag_sf()
    }

    pub fn nu_eff(&self) -> f64 {
        self.nu + self.nut.unwrap_or(0.0)
    }
}

/// Value produced by a boundary condition for one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundaryValue {
    Scalar(f64),
    Vector(Vec3),
}

impl BoundaryValue {
    pub fn scalar(&self) -> Option<f64> {
        match self {
            BoundaryValue::Scalar(v) => Some(*v),
            BoundaryValue::Vector(_) => None,
        }
    }

    pub fn vector(&self) -> Option<Vec3> {
        match self {
            BoundaryValue::Vector(v) => Some(*v),
            BoundaryValue::Scalar(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjointOutletCondition {
    /// Adjoint pressure at an outlet for the dissipated-power objective
    PressurePower,
    /// Heat-adjoint velocity at an outlet
    VelocityHeat,
}

impl AdjointOutletCondition {
    pub fn name(&self) -> &'static str {
        match self {
            AdjointOutletCondition::PressurePower => "adjointOutletPressurePower",
            AdjointOutletCondition::VelocityHeat => "adjointOutletVelocityHeat",
        }
    }

    pub fn compute_boundary_value(&self, face: &OutletFace) -> BoundaryValue {
        match self {
            AdjointOutletCondition::PressurePower => {
                BoundaryValue::Scalar(outlet_pressure_power(face))
            }
            AdjointOutletCondition::VelocityHeat => {
                BoundaryValue::Vector(outlet_velocity_heat(face))
            }
        }
    }
}

/// `pa = Up_n Ua_n + 2 nu_eff delta (Ua_n - Ua_neigh_n) - |U|^2/2 - (U.n)^2`
fn outlet_pressure_power(face: &OutletFace) -> f64 {
    let mag_sf = face.mag_sf();
    let n = face.normal();
    let up_n = face.phi / mag_sf;
    let ua_n = face.phi_adjoint / mag_sf;
    let ua_neigh_n = face.u_adjoint_neighbour.dot(&n);
    let u_dot_n = face.u.dot(&n);

    up_n * ua_n + 2.0 * face.nu_eff() * face.delta_coeff * (ua_n - ua_neigh_n)
        - 0.5 * face.u.norm_squared()
        - u_dot_n * u_dot_n
}

/// Tangential part from a viscous balance against the neighbour cell,
/// normal part from the adjoint flux.
fn outlet_velocity_heat(face: &OutletFace) -> Vec3 {
    let mag_sf = face.mag_sf();
    let n = face.normal();
    let nu_delta = face.nu_eff() * face.delta_coeff;
    let up_n = face.phi / mag_sf;

    let neigh = face.u_adjoint_neighbour;
    let neigh_t = neigh - n * neigh.dot(&n);

    let ub_t = neigh_t * (nu_delta / (up_n + nu_delta + VSMALL));
    let ub_n = face.sf * (face.phi_adjoint / (mag_sf * mag_sf).max(VSMALL));
    ub_t + ub_n
}
