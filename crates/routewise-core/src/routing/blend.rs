//! Global/tenant blend ratios and exploration rates
//!
//! Tenants with little history lean on cross-tenant (global) statistics and
//! explore more; once a tenant accumulates samples its own data dominates.

/// Below this many tenant samples, global data dominates
pub const LOW_SAMPLE_THRESHOLD: u64 = 20;
/// Above this many tenant samples, tenant data dominates
pub const HIGH_SAMPLE_THRESHOLD: u64 = 100;

/// Global weight (`alpha`) and tenant weight (`beta`); they always sum to 1
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendRatio {
    pub alpha: f64,
    pub beta: f64,
}

impl BlendRatio {
    /// Blend a global and a tenant value
    pub fn blend(&self, global: f64, tenant: f64) -> f64 {
        self.alpha * global + self.beta * tenant
    }
}

/// Blend ratio for a tenant's sample count
pub fn compute_alpha_beta(tenant_samples: u64) -> BlendRatio {
    if tenant_samples < LOW_SAMPLE_THRESHOLD {
        BlendRatio {
            alpha: 0.85,
            beta: 0.15,
        }
    } else if tenant_samples <= HIGH_SAMPLE_THRESHOLD {
        BlendRatio {
            alpha: 0.60,
            beta: 0.40,
        }
    } else {
        BlendRatio {
            alpha: 0.35,
            beta: 0.65,
        }
    }
}

/// Exploration rate for a tenant's sample count
pub fn compute_epsilon(tenant_samples: u64) -> f64 {
    if tenant_samples < LOW_SAMPLE_THRESHOLD {
        0.20
    } else if tenant_samples <= HIGH_SAMPLE_THRESHOLD {
        0.10
    } else {
        0.05
    }
}
