//! The discrete operators of the functional, defined per voxel.
//!
//! The gradient maps `c` primal channels to `3c` dual channels (one
//! forward difference per spatial axis and channel) with zero
//! Dirichlet boundary beyond the far faces; [`gradient_adjoint`] is
//! its exact adjoint under the voxel-wise inner product, which the
//! tests verify through the integration-by-parts identity.
//!
//! [`DataTerm`] and [`Regularizer`] hold the scalar parameters of the
//! two energy terms and apply their proximal operators to the small
//! per-voxel scratch slices the engines iterate with. Infinite
//! parameters are represented as IEEE infinity.

use crate::{
    engine::Real,
    util::{vec_norm, vec_norm_squared, vec_scale},
    volume::{ArrayDim, VolumeRef},
    Par,
};

// ======================================================================
// CONST - CRATE

// Row-sum bounds of the linear operator, used as initial step sizes:
// dual step 1/2 (forward difference), primal step 1/6 (adjoint).
pub(crate) const GRADIENT_SUM_COEFFS: f64 = 2.0;
pub(crate) const ADJOINT_SUM_COEFFS: f64 = 6.0;

// ======================================================================
// FUNCTIONS - PUBLIC - linear operator

/// Number of dual channels for `c` primal channels.
pub fn range_channels(c: usize) -> usize {
    3 * c
}

/// Upper bound for the norm of one voxel's gradient over `c` channels
/// of data in `[0, 1]`.
pub fn max_range_norm<R: Real>(c: usize) -> R {
    R::from_f64(3.0).sqrt() * R::from_f64(range_channels(c) as f64)
}

/// Forward-difference gradient of `u` at `(x, y, z)`, written to
/// `out[0..3c]`. Differences across the far faces are zero.
#[inline]
pub fn gradient<R: Real>(out: &mut [R], u: &VolumeRef<'_, R>, x: usize, y: usize, z: usize) {
    let dim = u.dim();
    for i in 0..dim.c {
        let u0 = u.get(x, y, z, i);
        out[3 * i] = if x + 1 < dim.w {
            u.get(x + 1, y, z, i) - u0
        } else {
            R::zero()
        };
        out[3 * i + 1] = if y + 1 < dim.h {
            u.get(x, y + 1, z, i) - u0
        } else {
            R::zero()
        };
        out[3 * i + 2] = if z + 1 < dim.d {
            u.get(x, y, z + 1, i) - u0
        } else {
            R::zero()
        };
    }
}

/// Adjoint of [`gradient`] (negative divergence) of the dual field
/// `p` at `(x, y, z)`, written to `out[0..c]`.
///
/// Every term carries the bound check matching the gradient side, so
/// that `<grad u, p> == <u, adjoint p>` holds exactly, voxel-wise.
#[inline]
pub fn gradient_adjoint<R: Real>(
    out: &mut [R],
    p: &VolumeRef<'_, R>,
    x: usize,
    y: usize,
    z: usize,
    c: usize,
) {
    let dim = p.dim();
    for i in 0..c {
        let px_0 = if x + 1 < dim.w {
            p.get(x, y, z, 3 * i)
        } else {
            R::zero()
        };
        let px_m = if x > 0 {
            p.get(x - 1, y, z, 3 * i)
        } else {
            R::zero()
        };

        let py_0 = if y + 1 < dim.h {
            p.get(x, y, z, 3 * i + 1)
        } else {
            R::zero()
        };
        let py_m = if y > 0 {
            p.get(x, y - 1, z, 3 * i + 1)
        } else {
            R::zero()
        };

        let pz_0 = if z + 1 < dim.d {
            p.get(x, y, z, 3 * i + 2)
        } else {
            R::zero()
        };
        let pz_m = if z > 0 {
            p.get(x, y, z - 1, 3 * i + 2)
        } else {
            R::zero()
        };

        out[i] = px_m - px_0 + py_m - py_0 + pz_m - pz_0;
    }
}

// ======================================================================
// DataTerm - PUBLIC

/// Scalar parameters of the quadratic data term
/// `coeff * (u - f)²`, optionally coupled to the previous solution by
/// `temporal * |u - prev_u|^(3/2)`.
#[derive(Clone, Copy, Debug)]
pub struct DataTerm<R> {
    /// Coefficient of the quadratic term.
    pub coeff: R,
    /// Temporal coupling strength; `0` disables the coupling and
    /// infinity freezes `u` at the previous solution.
    pub temporal: R,
}

impl<R: Real> DataTerm<R> {
    /// Returns `true` if the temporal coupling is active.
    pub fn has_temporal(&self) -> bool {
        self.temporal != R::zero()
    }

    /// Proximal operator of the data term at `(x, y, z)`, applied to
    /// the voxel values in `u_sh`.
    pub fn prox(
        &self,
        u_sh: &mut [R],
        f: VolumeRef<'_, R>,
        prev_u: Option<VolumeRef<'_, R>>,
        x: usize,
        y: usize,
        z: usize,
        dt: R,
    ) {
        // arg min_u  (u - u0)^2 / (2 dt)  +  coeff (u - f)^2
        let shrink = R::one() + R::from_f64(2.0) * dt * self.coeff;
        for (i, u) in u_sh.iter_mut().enumerate() {
            let f0 = f.get(x, y, z, i);
            *u = f0 + (*u - f0) / shrink;
        }

        let prev_u = match prev_u {
            Some(prev_u) if self.has_temporal() => prev_u,
            _ => return,
        };

        for (i, u) in u_sh.iter_mut().enumerate() {
            *u = *u - prev_u.get(x, y, z, i);
        }
        let nrm = vec_norm(u_sh);
        if nrm > R::zero() {
            let mut mult = R::zero();
            if self.temporal.is_finite() {
                let gamma = self.temporal * dt / shrink;
                let a = gamma * R::from_f64(1.5) / nrm.sqrt();
                let m = R::from_f64(2.0) / (a + (a * a + R::from_f64(4.0)).sqrt());
                mult = m * m;
            }
            vec_scale(u_sh, mult);
        }
        for (i, u) in u_sh.iter_mut().enumerate() {
            *u = *u + prev_u.get(x, y, z, i);
        }
    }

    /// Value of the data term at `(x, y, z)` for the voxel values in
    /// `u_sh`.
    pub fn value(
        &self,
        u_sh: &[R],
        f: VolumeRef<'_, R>,
        prev_u: Option<VolumeRef<'_, R>>,
        x: usize,
        y: usize,
        z: usize,
    ) -> R {
        let mut diff_f = R::zero();
        for (i, &u) in u_sh.iter().enumerate() {
            let diff = u - f.get(x, y, z, i);
            diff_f = diff_f + diff * diff;
        }
        let mut val = self.coeff * diff_f;

        if let Some(prev_u) = prev_u {
            if self.has_temporal() {
                let mut diff_prev = R::zero();
                for (i, &u) in u_sh.iter().enumerate() {
                    let diff = u - prev_u.get(x, y, z, i);
                    diff_prev = diff_prev + diff * diff;
                }
                let nrm = diff_prev.sqrt();
                if nrm > R::zero() {
                    val = val + self.temporal * nrm * nrm.sqrt();
                }
            }
        }

        val
    }
}

// ======================================================================
// Regularizer - PUBLIC

/// Scalar parameters of the truncated-quadratic regularizer
/// `min(alpha * |grad u|², lambda * w)`.
#[derive(Clone, Copy, Debug)]
pub struct Regularizer<R> {
    /// Discontinuity length penalty; infinity forbids discontinuities.
    pub lambda: R,
    /// Smoothness penalty; infinity gives the piecewise constant
    /// (cartoon) limit.
    pub alpha: R,
}

impl<R: Real> Regularizer<R> {
    /// Proximal operator of the convex conjugate, applied to the dual
    /// voxel values in `p_sh` with the per-voxel weight `weight0`.
    pub fn prox_star(&self, p_sh: &mut [R], weight0: R, dt: R) {
        let two = R::from_f64(2.0);
        let nrm2 = vec_norm_squared(p_sh);
        let a = if self.alpha.is_finite() {
            two * self.alpha / (dt + two * self.alpha)
        } else {
            R::one()
        };
        let l = if self.lambda.is_finite() {
            two * dt * self.lambda * weight0
        } else {
            R::infinity()
        };
        let mult = if nrm2 * a <= l { a } else { R::zero() };
        vec_scale(p_sh, mult);
    }

    /// Value of the regularizer for the gradient voxel values in
    /// `p_sh`.
    pub fn value(&self, p_sh: &[R], weight0: R) -> R {
        let l = if self.lambda.is_finite() {
            self.lambda * weight0
        } else {
            R::infinity()
        };
        let nrm = vec_norm(p_sh);
        if self.alpha.is_finite() {
            (self.alpha * nrm * nrm).min(l)
        } else {
            // Piecewise constant limit: any gradient above round-off
            // is a discontinuity.
            if nrm > R::from_f64(1e-6) {
                l
            } else {
                R::zero()
            }
        }
    }

    /// Edge indicator in `[0, 1]` for the gradient voxel values in
    /// `p_sh`: zero below the truncation threshold, approaching one
    /// for the steepest representable gradient.
    pub fn edge_indicator(&self, p_sh: &[R], weight0: R, max_range_norm: R) -> R {
        let l = if self.lambda.is_finite() {
            self.lambda * weight0
        } else {
            R::infinity()
        };
        // A voxel is an edge if the second argument wins the minimum
        // in min(alpha |g|^2, lambda w), i.e. |g| > sqrt(L / A).
        let threshold = if l.is_finite() {
            if self.alpha.is_finite() {
                (l / self.alpha).sqrt()
            } else {
                R::zero()
            }
        } else {
            R::infinity()
        };
        let threshold = threshold.max(R::from_f64(5e-3));

        let nrm = vec_norm(p_sh);
        if nrm > threshold {
            // max_range_norm >= nrm, so the quotient of logs is in
            // (0, 1].
            let max_range_norm = max_range_norm.max(nrm);
            (nrm / threshold).ln() / (max_range_norm / threshold).ln()
        } else {
            R::zero()
        }
    }
}

// ======================================================================
// PdVars - PUBLIC

/// Scalar state of the primal-dual iteration, together with the
/// decoded operator parameters for one run.
#[derive(Clone, Copy, Debug)]
pub struct PdVars<R> {
    /// Primal step size.
    pub dt_p: R,
    /// Dual step size.
    pub dt_d: R,
    /// Extrapolation factor.
    pub theta: R,
    /// Strong convexity constant of the data term.
    pub gamma_data: R,
    /// Parameter adaptation scale; `1` when adaptation is off.
    pub omega: R,
    /// Decoded data term parameters.
    pub dataterm: DataTerm<R>,
    /// Decoded regularizer parameters.
    pub regularizer: Regularizer<R>,
}

impl<R: Real> PdVars<R> {
    /// Decodes the user parameters for a volume of shape `dim` and
    /// initializes the iteration state. `has_prev` says whether a
    /// previous solution is available for temporal coupling.
    pub fn init(par: &Par, dim: ArrayDim, has_prev: bool) -> Self {
        let omega = if par.adapt_params {
            if dim.h > 1 {
                let voxels = (dim.w * dim.h * dim.d) as f64;
                R::from_f64(voxels.sqrt() / (500.0f64 * 500.0 * 500.0).sqrt())
            } else {
                R::from_f64(dim.w as f64 / 500.0)
            }
        } else {
            R::one()
        };

        let temporal = if has_prev && par.temporal != 0.0 {
            decode_infinite(par.temporal)
        } else {
            R::zero()
        };

        let alpha = decode_infinite::<R>(par.alpha);
        let alpha = if par.adapt_params && alpha.is_finite() {
            alpha * omega * omega
        } else {
            alpha
        };
        let lambda = decode_infinite::<R>(par.lambda);
        let lambda = if par.adapt_params && lambda.is_finite() {
            lambda * omega
        } else {
            lambda
        };

        Self {
            dt_p: R::one() / R::from_f64(ADJOINT_SUM_COEFFS),
            dt_d: R::one() / R::from_f64(GRADIENT_SUM_COEFFS),
            theta: R::one(),
            gamma_data: R::from_f64(2.0),
            omega,
            dataterm: DataTerm {
                coeff: R::one(),
                temporal,
            },
            regularizer: Regularizer { lambda, alpha },
        }
    }

    /// Accelerated step size schedule, applied once per iteration
    /// before the dual sweep.
    pub fn update(&mut self) {
        self.dt_p = self.dt_p * self.theta;
        self.dt_d = self.dt_d / self.theta;
        self.theta =
            R::one() / (R::one() + R::from_f64(2.0) * self.gamma_data * self.dt_p).sqrt();
    }
}

// ======================================================================
// FUNCTIONS - PUBLIC

/// Decodes the negative-means-infinity parameter convention.
pub fn decode_infinite<R: Real>(v: f64) -> R {
    if v < 0.0 {
        R::infinity()
    } else {
        R::from_f64(v)
    }
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::volume::{Layout, Volume};

    fn random_volume(dim: ArrayDim, seed: u8) -> Volume<f64> {
        let mut rng = ChaCha8Rng::from_seed([seed; 32]);
        let mut v = Volume::new(dim, Layout::Layered);
        for x in v.data_mut() {
            *x = rng.gen_range(-1.0..1.0);
        }
        v
    }

    // ============================================================
    // gradient / gradient_adjoint

    #[test]
    fn gradient_is_zero_at_far_faces() {
        let dim = ArrayDim::new(3, 4, 5, 2);
        let u = random_volume(dim, 1);
        let mut g = vec![0.0; range_channels(dim.c)];

        gradient(&mut g, &u.as_ref(), 2, 1, 1);
        assert_eq!(g[0], 0.0);
        assert_ne!(g[1], 0.0);

        gradient(&mut g, &u.as_ref(), 1, 3, 1);
        assert_eq!(g[1], 0.0);

        gradient(&mut g, &u.as_ref(), 2, 3, 4);
        assert_eq!(&g[..3], &[0.0, 0.0, 0.0]);
        assert_eq!(&g[3..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn gradient_forward_difference() {
        let dim = ArrayDim::new(2, 2, 2, 1);
        let mut u = Volume::<f64>::new(dim, Layout::Layered);
        u.set(0, 0, 0, 0, 1.0);
        u.set(1, 0, 0, 0, 3.0);
        u.set(0, 1, 0, 0, 6.0);
        u.set(0, 0, 1, 0, 11.0);

        let mut g = [0.0; 3];
        gradient(&mut g, &u.as_ref(), 0, 0, 0);
        assert_eq!(g, [2.0, 5.0, 10.0]);
    }

    #[test]
    fn adjoint_satisfies_integration_by_parts() {
        // <grad u, p> == <u, adjoint p> for random u and p.
        let dim = ArrayDim::new(5, 4, 3, 2);
        let dim_p = dim.with_channels(range_channels(dim.c));
        let u = random_volume(dim, 2);
        let p = random_volume(dim_p, 3);

        let mut lhs = 0.0;
        let mut rhs = 0.0;
        let mut g = vec![0.0; dim_p.c];
        let mut div = vec![0.0; dim.c];
        for z in 0..dim.d {
            for y in 0..dim.h {
                for x in 0..dim.w {
                    gradient(&mut g, &u.as_ref(), x, y, z);
                    for (i, &gi) in g.iter().enumerate() {
                        lhs += gi * p.get(x, y, z, i);
                    }
                    gradient_adjoint(&mut div, &p.as_ref(), x, y, z, dim.c);
                    for (i, &di) in div.iter().enumerate() {
                        rhs += di * u.get(x, y, z, i);
                    }
                }
            }
        }
        assert!((lhs - rhs).abs() < 1e-12, "lhs {} rhs {}", lhs, rhs);
    }

    // ============================================================
    // DataTerm

    #[test]
    fn data_prox_pulls_towards_f() {
        let dim = ArrayDim::new(1, 1, 1, 1);
        let mut f = Volume::<f64>::new(dim, Layout::Layered);
        f.set(0, 0, 0, 0, 2.0);

        let dataterm = DataTerm {
            coeff: 1.0,
            temporal: 0.0,
        };
        let mut u = [6.0];
        dataterm.prox(&mut u, f.as_ref(), None, 0, 0, 0, 0.5);
        // f + (u - f) / (1 + 2 dt) = 2 + 4 / 2
        assert_eq!(u, [4.0]);
    }

    #[test]
    fn data_prox_infinite_temporal_freezes_at_prev() {
        let dim = ArrayDim::new(1, 1, 1, 2);
        let mut f = Volume::<f64>::new(dim, Layout::Layered);
        f.set(0, 0, 0, 0, 1.0);
        let mut prev = Volume::<f64>::new(dim, Layout::Layered);
        prev.set(0, 0, 0, 0, 0.25);
        prev.set(0, 0, 0, 1, -0.5);

        let dataterm = DataTerm {
            coeff: 1.0,
            temporal: f64::INFINITY,
        };
        let mut u = [0.7, 0.1];
        dataterm.prox(&mut u, f.as_ref(), Some(prev.as_ref()), 0, 0, 0, 0.25);
        assert_eq!(u, [0.25, -0.5]);
    }

    #[test]
    fn data_value_quadratic_plus_temporal() {
        let dim = ArrayDim::new(1, 1, 1, 1);
        let f = Volume::<f64>::new(dim, Layout::Layered);
        let prev = Volume::<f64>::new(dim, Layout::Layered);

        let dataterm = DataTerm {
            coeff: 1.0,
            temporal: 2.0,
        };
        let u = [4.0];
        // (4 - 0)^2 + 2 * 4^(3/2)
        let expected = 16.0 + 2.0 * 8.0;
        let got = dataterm.value(&u, f.as_ref(), Some(prev.as_ref()), 0, 0, 0);
        assert!((got - expected).abs() < 1e-12);
    }

    #[test]
    fn data_value_infinite_temporal_is_finite_at_prev() {
        let dim = ArrayDim::new(1, 1, 1, 1);
        let f = Volume::<f64>::new(dim, Layout::Layered);
        let prev = Volume::<f64>::new(dim, Layout::Layered);

        let dataterm = DataTerm {
            coeff: 1.0,
            temporal: f64::INFINITY,
        };
        let got = dataterm.value(&[0.0], f.as_ref(), Some(prev.as_ref()), 0, 0, 0);
        assert_eq!(got, 0.0);
    }

    // ============================================================
    // Regularizer

    #[test]
    fn prox_star_shrinks_small_and_kills_large() {
        let reg = Regularizer::<f64> {
            lambda: 0.1,
            alpha: 20.0,
        };
        let dt = 0.5;
        let a = 2.0 * 20.0 / (dt + 2.0 * 20.0);

        let mut small = [0.01, 0.0, 0.0];
        reg.prox_star(&mut small, 1.0, dt);
        assert!((small[0] - 0.01 * a).abs() < 1e-12);

        let mut large = [5.0, 0.0, 0.0];
        reg.prox_star(&mut large, 1.0, dt);
        assert_eq!(large, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn prox_star_infinite_lambda_never_truncates() {
        let reg = Regularizer {
            lambda: f64::INFINITY,
            alpha: f64::INFINITY,
        };
        let mut p = [100.0, -3.0, 0.5];
        reg.prox_star(&mut p, 1.0, 0.5);
        // A = 1 and L = infinity: p is unchanged.
        assert_eq!(p, [100.0, -3.0, 0.5]);
    }

    #[test]
    fn value_truncates_at_lambda() {
        let reg = Regularizer::<f64> {
            lambda: 0.2,
            alpha: 1.0,
        };
        assert!((reg.value(&[0.1, 0.0, 0.0], 1.0) - 0.01).abs() < 1e-12);
        assert_eq!(reg.value(&[10.0, 0.0, 0.0], 1.0), 0.2);
        // The weight scales the truncation level.
        assert_eq!(reg.value(&[10.0, 0.0, 0.0], 0.5), 0.1);
    }

    #[test]
    fn edge_indicator_is_in_unit_interval() {
        let reg = Regularizer {
            lambda: 0.1,
            alpha: 20.0,
        };
        let m = max_range_norm::<f64>(1);
        assert_eq!(reg.edge_indicator(&[0.0, 0.0, 0.0], 1.0, m), 0.0);
        let strong = reg.edge_indicator(&[1.0, 1.0, 1.0], 1.0, m);
        assert!(strong > 0.0 && strong <= 1.0);
        let weak = reg.edge_indicator(&[0.1, 0.0, 0.0], 1.0, m);
        assert!(weak < strong);
    }

    #[test]
    fn edge_indicator_infinite_lambda_marks_nothing() {
        let reg = Regularizer {
            lambda: f64::INFINITY,
            alpha: 20.0,
        };
        let m = max_range_norm::<f64>(1);
        assert_eq!(reg.edge_indicator(&[5.0, 5.0, 5.0], 1.0, m), 0.0);
    }

    // ============================================================
    // PdVars

    #[test]
    fn init_step_sizes_and_decoding() {
        let mut par = Par::default();
        par.lambda = -1.0;
        par.temporal = 0.5;
        let pd = PdVars::<f64>::init(&par, ArrayDim::new(8, 8, 8, 1), true);

        assert_eq!(pd.dt_p, 1.0 / 6.0);
        assert_eq!(pd.dt_d, 0.5);
        assert_eq!(pd.theta, 1.0);
        assert_eq!(pd.omega, 1.0);
        assert!(pd.regularizer.lambda.is_infinite());
        assert_eq!(pd.regularizer.alpha, par.alpha);
        assert_eq!(pd.dataterm.temporal, 0.5);
    }

    #[test]
    fn temporal_needs_previous_solution() {
        let mut par = Par::default();
        par.temporal = -1.0;
        let pd = PdVars::<f32>::init(&par, ArrayDim::new(8, 8, 8, 1), false);
        assert!(!pd.dataterm.has_temporal());
    }

    #[test]
    fn adapt_params_scales_with_volume_size() {
        let mut par = Par::default();
        par.adapt_params = true;
        let dim = ArrayDim::new(250, 250, 500, 1);
        let pd = PdVars::<f64>::init(&par, dim, false);

        let omega = (250.0f64 * 250.0 * 500.0).sqrt() / (500.0f64 * 500.0 * 500.0).sqrt();
        assert!((pd.omega - omega).abs() < 1e-12);
        assert!((pd.regularizer.lambda - par.lambda * omega).abs() < 1e-12);
        assert!((pd.regularizer.alpha - par.alpha * omega * omega).abs() < 1e-12);

        // 1D signals scale by width alone.
        let pd = PdVars::<f64>::init(&par, ArrayDim::new(250, 1, 1, 1), false);
        assert_eq!(pd.omega, 0.5);
    }

    #[test]
    fn update_schedule_decreases_theta() {
        let par = Par::default();
        let mut pd = PdVars::<f64>::init(&par, ArrayDim::new(8, 8, 1, 1), false);
        pd.update();
        assert_eq!(pd.dt_p, 1.0 / 6.0);
        assert_eq!(pd.dt_d, 0.5);
        let theta1 = pd.theta;
        assert!((theta1 - 1.0 / (1.0 + 4.0 / 6.0f64).sqrt()).abs() < 1e-12);

        pd.update();
        assert!((pd.dt_p - theta1 / 6.0).abs() < 1e-12);
        assert!((pd.dt_d - 0.5 / theta1).abs() < 1e-12);
        assert!(pd.theta < theta1);
    }
}
