//! Built-in design updater.
//!
//! A move-limited, sensitivity-scaled step projected onto the design bounds,
//! with a bisection on the multiplier of the fluid volume constraint
//! `mean(γ) <= volume_fraction`. It stands in for MMA behind the same
//! `DesignUpdater` seam.

use crate::error::Rejected;
use crate::fields::{first_non_finite, CostSensitivity, DesignField};
use crate::solver::{DesignBounds, DesignUpdate, DesignUpdater};

const BISECTION_STEPS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveLimitUpdater {
    pub volume_fraction: f64,
    /// Converged once no cell moves by more than this
    pub tol: f64,
}

impl MoveLimitUpdater {
    pub fn new(volume_fraction: f64, tol: f64) -> Self {
        Self {
            volume_fraction,
            tol,
        }
    }

    fn step(
        design: &[f64],
        sensitivity: &[f64],
        scale: f64,
        multiplier: f64,
        bounds: &DesignBounds,
    ) -> Vec<f64> {
        design
            .iter()
            .zip(sensitivity.iter())
            .map(|(&g, &s)| {
                let proposed = g - bounds.move_limit * (s + multiplier) / scale;
                let lo = (g - bounds.move_limit).max(bounds.lower);
                let hi = (g + bounds.move_limit).min(bounds.upper);
                proposed.max(lo).min(hi)
            })
            .collect()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

impl DesignUpdater for MoveLimitUpdater {
    fn update(
        &mut self,
        cost: &CostSensitivity,
        design: &DesignField,
        _iteration: usize,
        bounds: &DesignBounds,
    ) -> Result<DesignUpdate, Rejected> {
        let sens = &cost.sensitivity;
        if sens.len() != design.len() {
            return Err(Rejected(format!(
                "sensitivity has {} entries for {} design cells",
                sens.len(),
                design.len()
            )));
        }
        if let Some(i) = first_non_finite(sens) {
            return Err(Rejected(format!("non-finite sensitivity in cell {}", i)));
        }
        if !cost.objective.is_finite() {
            return Err(Rejected("non-finite objective".to_string()));
        }

        let scale = sens.iter().fold(0.0_f64, |m, s| m.max(s.abs())).max(f64::MIN_POSITIVE);
        let x = design.values();

        let mut next = Self::step(x, sens, scale, 0.0, bounds);
        if mean(&next) > self.volume_fraction {
            // At 2*scale every cell is pushed down by the full move limit.
            let (mut lo, mut hi) = (0.0, 2.0 * scale);
            for _ in 0..BISECTION_STEPS {
                let mid = 0.5 * (lo + hi);
                if mean(&Self::step(x, sens, scale, mid, bounds)) > self.volume_fraction {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            next = Self::step(x, sens, scale, hi, bounds);
        }

        let next = DesignField::new(next);
        let max_change = next.max_change(design);
        Ok(DesignUpdate {
            converged: max_change < self.tol,
            max_change,
            design: next,
        })
    }
}
