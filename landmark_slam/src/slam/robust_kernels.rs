//! Robust loss functions for outlier-resistant optimization
//!
//! Robust kernels reduce the influence of outliers by re-weighting residuals.
//! Instead of minimizing sum(r^2 / 2), we minimize sum(rho(r)) where `r` is
//! the Mahalanobis distance of one constraint and rho a robust loss.
//!
//! The optimizer uses iteratively reweighted least squares: each whitened
//! block is scaled by `sqrt(weight(r))` before linearization.
//!
//! ## Kernels
//! - **Linear**: plain least squares
//! - **Huber**: quadratic inside the threshold, linear outside
//! - **SoftL1**: smooth approximation of Huber
//! - **Cauchy**: heavy-tailed, strongly down-weights outliers
//! - **Arctan**: bounded cost, saturates for large residuals
//! - **Tukey**: complete rejection beyond the threshold
//!
//! ## References
//! - [Robust Estimation](https://en.wikipedia.org/wiki/Robust_statistics)
//! - [M-estimators](https://en.wikipedia.org/wiki/M-estimator)

use serde::{Deserialize, Serialize};

/// Trait for robust kernel functions
///
/// `cost(r)` is normalized so that every kernel behaves like `r^2 / 2` for
/// small residuals; `weight(r)` is `rho'(r) / r`, the IRLS weight.
pub trait RobustKernel {
    /// Weight for a given residual magnitude
    fn weight(&self, residual_abs: f64) -> f64;

    /// Robust cost rho(r) for a given residual magnitude
    fn cost(&self, residual_abs: f64) -> f64;
}

/// Trivial kernel - standard least squares (no robustification)
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialKernel;

impl RobustKernel for TrivialKernel {
    fn weight(&self, _residual_abs: f64) -> f64 {
        1.0
    }

    fn cost(&self, residual_abs: f64) -> f64 {
        0.5 * residual_abs * residual_abs
    }
}

/// Huber robust kernel
///
/// rho(r) = 0.5 * r^2           if |r| <= k
///        = k * |r| - 0.5 * k^2  if |r| > k
///
/// weight(r) = 1                if |r| <= k
///           = k / |r|          if |r| > k
#[derive(Debug, Clone, Copy)]
pub struct HuberKernel {
    pub k: f64,
}

impl HuberKernel {
    pub fn new(k: f64) -> Self {
        Self { k: k.abs().max(1e-6) }
    }
}

impl RobustKernel for HuberKernel {
    fn weight(&self, residual_abs: f64) -> f64 {
        if residual_abs <= self.k {
            1.0
        } else {
            self.k / residual_abs
        }
    }

    fn cost(&self, residual_abs: f64) -> f64 {
        if residual_abs <= self.k {
            0.5 * residual_abs * residual_abs
        } else {
            self.k * residual_abs - 0.5 * self.k * self.k
        }
    }
}

/// Soft-L1 (pseudo-Huber) kernel
///
/// rho(r) = c^2 * (sqrt(1 + (r/c)^2) - 1)
/// weight(r) = 1 / sqrt(1 + (r/c)^2)
#[derive(Debug, Clone, Copy)]
pub struct SoftL1Kernel {
    pub c: f64,
}

impl SoftL1Kernel {
    pub fn new(c: f64) -> Self {
        Self { c: c.abs().max(1e-6) }
    }
}

impl RobustKernel for SoftL1Kernel {
    fn weight(&self, residual_abs: f64) -> f64 {
        let ratio = residual_abs / self.c;
        1.0 / (1.0 + ratio * ratio).sqrt()
    }

    fn cost(&self, residual_abs: f64) -> f64 {
        let ratio = residual_abs / self.c;
        self.c * self.c * ((1.0 + ratio * ratio).sqrt() - 1.0)
    }
}

/// Cauchy (Lorentzian) robust kernel
///
/// rho(r) = (c^2 / 2) * log(1 + (r/c)^2)
/// weight(r) = 1 / (1 + (r/c)^2)
#[derive(Debug, Clone, Copy)]
pub struct CauchyKernel {
    pub c: f64,
}

impl CauchyKernel {
    pub fn new(c: f64) -> Self {
        Self { c: c.abs().max(1e-6) }
    }
}

impl RobustKernel for CauchyKernel {
    fn weight(&self, residual_abs: f64) -> f64 {
        let ratio = residual_abs / self.c;
        1.0 / (1.0 + ratio * ratio)
    }

    fn cost(&self, residual_abs: f64) -> f64 {
        let ratio = residual_abs / self.c;
        0.5 * self.c * self.c * (1.0 + ratio * ratio).ln()
    }
}

/// Arctan kernel
///
/// rho(r) = (c^2 / 2) * atan((r/c)^2)
/// weight(r) = 1 / (1 + (r/c)^4)
#[derive(Debug, Clone, Copy)]
pub struct ArctanKernel {
    pub c: f64,
}

impl ArctanKernel {
    pub fn new(c: f64) -> Self {
        Self { c: c.abs().max(1e-6) }
    }
}

impl RobustKernel for ArctanKernel {
    fn weight(&self, residual_abs: f64) -> f64 {
        let z = (residual_abs / self.c).powi(2);
        1.0 / (1.0 + z * z)
    }

    fn cost(&self, residual_abs: f64) -> f64 {
        let z = (residual_abs / self.c).powi(2);
        0.5 * self.c * self.c * z.atan()
    }
}

/// Tukey's biweight (bisquare) kernel
///
/// rho(r) = (c^2/6) * (1 - (1 - (r/c)^2)^3)  if |r| <= c
///        = c^2/6                             if |r| > c
///
/// weight(r) = (1 - (r/c)^2)^2  if |r| <= c
///           = 0                if |r| > c
#[derive(Debug, Clone, Copy)]
pub struct TukeyKernel {
    pub c: f64,
}

impl TukeyKernel {
    pub fn new(c: f64) -> Self {
        Self { c: c.abs().max(1e-6) }
    }
}

impl RobustKernel for TukeyKernel {
    fn weight(&self, residual_abs: f64) -> f64 {
        if residual_abs <= self.c {
            let ratio = residual_abs / self.c;
            let term = 1.0 - ratio * ratio;
            term * term
        } else {
            0.0
        }
    }

    fn cost(&self, residual_abs: f64) -> f64 {
        let c2_6 = self.c * self.c / 6.0;
        if residual_abs <= self.c {
            let ratio = residual_abs / self.c;
            let term = 1.0 - ratio * ratio;
            c2_6 * (1.0 - term * term * term)
        } else {
            c2_6
        }
    }
}

/// Loss function selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// No robustification (standard least squares)
    Linear,
    /// Huber kernel (default, good balance)
    #[default]
    Huber,
    SoftL1,
    /// Cauchy kernel (heavy outliers)
    Cauchy,
    Arctan,
    /// Tukey kernel (complete rejection)
    Tukey,
}

/// Boxed robust kernel for dynamic dispatch
pub struct Loss {
    kernel: Box<dyn RobustKernel + Send + Sync>,
}

impl Loss {
    /// Kernel of the given kind with threshold/scale `scale`
    pub fn new(kind: LossKind, scale: f64) -> Self {
        let kernel: Box<dyn RobustKernel + Send + Sync> = match kind {
            LossKind::Linear => Box::new(TrivialKernel),
            LossKind::Huber => Box::new(HuberKernel::new(scale)),
            LossKind::SoftL1 => Box::new(SoftL1Kernel::new(scale)),
            LossKind::Cauchy => Box::new(CauchyKernel::new(scale)),
            LossKind::Arctan => Box::new(ArctanKernel::new(scale)),
            LossKind::Tukey => Box::new(TukeyKernel::new(scale)),
        };
        Self { kernel }
    }

    pub fn weight(&self, residual_abs: f64) -> f64 {
        self.kernel.weight(residual_abs)
    }

    pub fn cost(&self, residual_abs: f64) -> f64 {
        self.kernel.cost(residual_abs)
    }
}

/// Chi-squared thresholds for outlier detection
///
/// These are the critical values of chi-squared distribution for various DOFs.
pub mod chi_squared {
    /// Chi-squared threshold for 2 DOF (landmark observation) at 95%
    pub const DOF_2_95: f64 = 5.991;

    /// Chi-squared threshold for 3 DOF (pose constraint) at 95%
    pub const DOF_3_95: f64 = 7.815;

    /// Chi-squared threshold for 2 DOF at 99%
    pub const DOF_2_99: f64 = 9.210;

    /// Chi-squared threshold for 3 DOF at 99%
    pub const DOF_3_99: f64 = 11.345;

    /// Check if a Mahalanobis distance squared indicates an outlier
    ///
    /// d2 = r^T * Omega * r where Omega is the information matrix
    pub fn is_outlier(mahalanobis_sq: f64, dof: usize, confidence: f64) -> bool {
        mahalanobis_sq > threshold(dof, confidence)
    }

    /// Critical value for `dof` degrees of freedom at `confidence`
    pub fn threshold(dof: usize, confidence: f64) -> f64 {
        match (dof, (confidence * 100.0).round() as u32) {
            (2, 95) => DOF_2_95,
            (3, 95) => DOF_3_95,
            (2, 99) => DOF_2_99,
            (3, 99) => DOF_3_99,
            _ => {
                // Wilson-Hilferty approximation
                let z = normal_quantile(confidence);
                let dof_f = dof as f64;
                let term = 1.0 - 2.0 / (9.0 * dof_f) + z * (2.0 / (9.0 * dof_f)).sqrt();
                dof_f * term * term * term
            }
        }
    }

    /// Approximate normal quantile (inverse CDF), Abramowitz-Stegun 26.2.23
    fn normal_quantile(p: f64) -> f64 {
        let q = if p < 0.5 { p } else { 1.0 - p };
        let t = (-2.0 * q.ln()).sqrt();

        let c0 = 2.515517;
        let c1 = 0.802853;
        let c2 = 0.010328;
        let d1 = 1.432788;
        let d2 = 0.189269;
        let d3 = 0.001308;

        let result = t - (c0 + c1 * t + c2 * t * t) / (1.0 + d1 * t + d2 * t * t + d3 * t * t * t);

        if p < 0.5 {
            -result
        } else {
            result
        }
    }
}
