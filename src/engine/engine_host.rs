use rayon::prelude::*;

use crate::{
    engine::{Engine, Real},
    solver::ops::{self, DataTerm, Regularizer},
    util::KahanSum,
    volume::{convert, AnyMut, AnyRef, ArrayDim, Elem, Layout, SolverVolume, Volume},
    Error,
};

// ======================================================================
// HostEngine - PUBLIC

/// Multi-threaded CPU engine.
///
/// Sweeps are data-parallel over the outer spatial axis: each worker
/// processes whole `z` slices with private per-voxel scratch, and the
/// join at the end of the parallel loop is the barrier between
/// sweeps. The global sum runs single-threaded with compensated
/// summation, so results are bit-identical for any thread count.
#[derive(Clone)]
pub struct HostEngine;

impl HostEngine {
    /// Creates new [`HostEngine`].
    pub fn new() -> Self {
        Self
    }
}

impl Default for HostEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ======================================================================
// FUNCTIONS - PRIVATE

// Groups the depth slabs of a layered buffer by spatial slice.
//
// In layered layout slab `bz` holds channel `bz / d` of spatial slice
// `bz % d`, so grouping slabs by the residue hands every worker
// exclusive mutable access to all channels of its `z`.
fn slabs_by_z<'a, T: Elem>(data: &'a mut [T], dim: &ArrayDim) -> Vec<Vec<&'a mut [T]>> {
    let slab = dim.w * dim.h;
    let mut per_z: Vec<Vec<&'a mut [T]>> = (0..dim.d).map(|_| Vec::with_capacity(dim.c)).collect();
    for (bz, chunk) in data.chunks_mut(slab).enumerate() {
        per_z[bz % dim.d].push(chunk);
    }
    per_z
}

// ======================================================================
// HostEngine - IMPL Engine

impl<R: Real> Engine<R> for HostEngine {
    type Array = Volume<R>;

    fn name(&self) -> String {
        format!("cpu ({} threads)", rayon::current_num_threads())
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn alloc(&mut self, dim: ArrayDim) -> Result<Volume<R>, Error> {
        Ok(Volume::new(dim, Layout::Layered))
    }

    fn set_zero(&self, a: &mut Volume<R>) {
        a.data_mut().fill(R::zero());
    }

    fn copy(&self, dst: &mut Volume<R>, src: &Volume<R>) {
        debug_assert_eq!(dst.dim(), src.dim());
        dst.data_mut().copy_from_slice(src.data());
    }

    fn load(&self, dst: &mut Volume<R>, src: AnyRef<'_>) -> Result<(), Error> {
        convert::copy_any(dst.as_any_mut(), src)
    }

    fn store(&self, src: &Volume<R>, dst: AnyMut<'_>) -> Result<(), Error> {
        convert::copy_any(dst, src.as_any())
    }

    fn sum(&self, a: &Volume<R>) -> R {
        debug_assert_eq!(a.dim().c, 1);
        let mut summation = KahanSum::new();
        for &x in a.data() {
            summation.add(x);
        }
        summation.sum()
    }

    fn synchronize(&self) {}

    fn run_dual(
        &self,
        p: &mut Volume<R>,
        ubar: &Volume<R>,
        weight: Option<&Volume<R>>,
        regularizer: Regularizer<R>,
        dt: R,
    ) {
        let dim = ubar.dim();
        let p_dim = p.dim();
        debug_assert_eq!(p_dim.c, ops::range_channels(dim.c));
        let u = ubar.as_ref();
        let weight = weight.map(|w| w.as_ref());

        slabs_by_z(p.data_mut(), &p_dim)
            .into_par_iter()
            .enumerate()
            .for_each(|(z, mut channels)| {
                let mut p_sh = vec![R::zero(); p_dim.c];
                for y in 0..dim.h {
                    let row = y * dim.w;
                    for x in 0..dim.w {
                        ops::gradient(&mut p_sh, &u, x, y, z);
                        for (k, slab) in channels.iter().enumerate() {
                            p_sh[k] = slab[row + x] + p_sh[k] * dt;
                        }
                        let weight0 = weight.map_or(R::one(), |w| w.get(x, y, z, 0));
                        regularizer.prox_star(&mut p_sh, weight0, dt);
                        for (k, slab) in channels.iter_mut().enumerate() {
                            slab[row + x] = p_sh[k];
                        }
                    }
                }
            });
    }

    fn run_primal(
        &self,
        u: &mut Volume<R>,
        ubar: &mut Volume<R>,
        p: &Volume<R>,
        f: &Volume<R>,
        prev_u: Option<&Volume<R>>,
        dataterm: DataTerm<R>,
        theta: R,
        dt: R,
    ) {
        let dim = u.dim();
        let p_ref = p.as_ref();
        let f_ref = f.as_ref();
        let prev_u = prev_u.map(|v| v.as_ref());

        slabs_by_z(u.data_mut(), &dim)
            .into_par_iter()
            .zip(slabs_by_z(ubar.data_mut(), &dim))
            .enumerate()
            .for_each(|(z, (mut u_channels, mut ubar_channels))| {
                let mut u_sh = vec![R::zero(); dim.c];
                let mut old_sh = vec![R::zero(); dim.c];
                for y in 0..dim.h {
                    let row = y * dim.w;
                    for x in 0..dim.w {
                        ops::gradient_adjoint(&mut u_sh, &p_ref, x, y, z, dim.c);
                        for (i, slab) in u_channels.iter().enumerate() {
                            let old = slab[row + x];
                            u_sh[i] = old - u_sh[i] * dt;
                            old_sh[i] = old;
                        }
                        dataterm.prox(&mut u_sh, f_ref, prev_u, x, y, z, dt);
                        for i in 0..dim.c {
                            let new = u_sh[i];
                            u_channels[i][row + x] = new;
                            ubar_channels[i][row + x] = new + (new - old_sh[i]) * theta;
                        }
                    }
                }
            });
    }

    fn energy_density(
        &self,
        u: &Volume<R>,
        f: &Volume<R>,
        prev_u: Option<&Volume<R>>,
        weight: Option<&Volume<R>>,
        dataterm: DataTerm<R>,
        regularizer: Regularizer<R>,
        aux: &mut Volume<R>,
    ) {
        let dim = u.dim();
        let u_ref = u.as_ref();
        let f_ref = f.as_ref();
        let prev_u = prev_u.map(|v| v.as_ref());
        let weight = weight.map(|w| w.as_ref());

        aux.data_mut()
            .par_chunks_mut(dim.w * dim.h)
            .enumerate()
            .for_each(|(z, aux_slab)| {
                let mut p_sh = vec![R::zero(); ops::range_channels(dim.c)];
                let mut u_sh = vec![R::zero(); dim.c];
                for y in 0..dim.h {
                    let row = y * dim.w;
                    for x in 0..dim.w {
                        ops::gradient(&mut p_sh, &u_ref, x, y, z);
                        let weight0 = weight.map_or(R::one(), |w| w.get(x, y, z, 0));
                        let mut energy = regularizer.value(&p_sh, weight0);
                        for (i, u) in u_sh.iter_mut().enumerate() {
                            *u = u_ref.get(x, y, z, i);
                        }
                        energy = energy + dataterm.value(&u_sh, f_ref, prev_u, x, y, z);
                        aux_slab[row + x] = energy;
                    }
                }
            });
    }

    fn add_edges(
        &self,
        out: &mut Volume<R>,
        u: &Volume<R>,
        weight: Option<&Volume<R>>,
        regularizer: Regularizer<R>,
    ) {
        let dim = u.dim();
        let u_ref = u.as_ref();
        let weight = weight.map(|w| w.as_ref());
        let max_range_norm = ops::max_range_norm::<R>(dim.c);

        slabs_by_z(out.data_mut(), &dim)
            .into_par_iter()
            .enumerate()
            .for_each(|(z, mut channels)| {
                let mut p_sh = vec![R::zero(); ops::range_channels(dim.c)];
                for y in 0..dim.h {
                    let row = y * dim.w;
                    for x in 0..dim.w {
                        ops::gradient(&mut p_sh, &u_ref, x, y, z);
                        let weight0 = weight.map_or(R::one(), |w| w.get(x, y, z, 0));
                        let indicator =
                            regularizer.edge_indicator(&p_sh, weight0, max_range_norm);
                        let mult = R::one() - indicator;
                        for (i, slab) in channels.iter_mut().enumerate() {
                            slab[row + x] = u_ref.get(x, y, z, i) * mult;
                        }
                    }
                }
            });
    }

    fn weight_norm_grad(&self, w: &mut Volume<R>, f: &Volume<R>) {
        let dim = f.dim();
        let f_ref = f.as_ref();

        w.data_mut()
            .par_chunks_mut(dim.w * dim.h)
            .enumerate()
            .for_each(|(z, w_slab)| {
                let mut g_sh = vec![R::zero(); ops::range_channels(dim.c)];
                for y in 0..dim.h {
                    let row = y * dim.w;
                    for x in 0..dim.w {
                        ops::gradient(&mut g_sh, &f_ref, x, y, z);
                        w_slab[row + x] = crate::util::vec_norm(&g_sh);
                    }
                }
            });
    }

    fn weight_exp(&self, w: &mut Volume<R>, coeff: R) {
        let eps = R::from_f64(1e-6);
        w.data_mut().par_iter_mut().for_each(|x| {
            *x = eps.max((-coeff * *x).exp());
        });
    }

    fn abs_diff(&self, a: &Volume<R>, b: &Volume<R>, aux: &mut Volume<R>) {
        let dim = a.dim();
        let a_ref = a.as_ref();
        let b_ref = b.as_ref();

        aux.data_mut()
            .par_chunks_mut(dim.w * dim.h)
            .enumerate()
            .for_each(|(z, aux_slab)| {
                for y in 0..dim.h {
                    let row = y * dim.w;
                    for x in 0..dim.w {
                        let mut diff = R::zero();
                        for i in 0..dim.c {
                            diff = diff + (a_ref.get(x, y, z, i) - b_ref.get(x, y, z, i)).abs();
                        }
                        aux_slab[row + x] = diff;
                    }
                }
            });
    }
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    fn engine() -> HostEngine {
        HostEngine::new()
    }

    fn filled(dim: ArrayDim, values: &[f64]) -> Volume<f64> {
        Volume::from_vec(values.to_vec(), dim, Layout::Layered).unwrap()
    }

    // ============================================================
    // reductions

    #[test]
    fn sum_is_exact_for_small_arrays() {
        let dim = ArrayDim::new(2, 2, 1, 1);
        let a = filled(dim, &[1.0, 2.0, 3.0, 4.5]);
        assert_eq!(Engine::<f64>::sum(&engine(), &a), 10.5);
    }

    #[test]
    fn abs_diff_sums_channels() {
        let dim = ArrayDim::new(1, 1, 2, 2);
        let a = filled(dim, &[1.0, 2.0, 3.0, 4.0]);
        let b = filled(dim, &[0.0, 4.0, 2.5, 4.0]);
        let mut engine = engine();
        let mut aux = engine.alloc(dim.with_channels(1)).unwrap();

        Engine::<f64>::abs_diff(&engine, &a, &b, &mut aux);
        // z = 0 sees channels at slabs 0 and 2, z = 1 at 1 and 3.
        assert_eq!(aux.get(0, 0, 0, 0), 1.0 + 0.5);
        assert_eq!(aux.get(0, 0, 1, 0), 2.0 + 0.0);
    }

    // ============================================================
    // sweeps

    #[test]
    fn primal_sweep_without_dual_is_data_prox() {
        let dim = ArrayDim::new(2, 1, 1, 1);
        let mut engine = engine();
        let mut u = filled(dim, &[0.0, 1.0]);
        let mut ubar = engine.alloc(dim).unwrap();
        let p = engine.alloc(dim.with_channels(3)).unwrap();
        let f = filled(dim, &[1.0, 1.0]);

        let dataterm = DataTerm {
            coeff: 1.0,
            temporal: 0.0,
        };
        let dt = 0.5;
        let theta = 1.0;
        engine.run_primal(&mut u, &mut ubar, &p, &f, None, dataterm, theta, dt);

        // u = f + (u - f) / (1 + 2 dt) voxelwise, ubar extrapolates.
        assert_eq!(u.get(0, 0, 0, 0), 0.5);
        assert_eq!(u.get(1, 0, 0, 0), 1.0);
        assert_eq!(ubar.get(0, 0, 0, 0), 1.0);
        assert_eq!(ubar.get(1, 0, 0, 0), 1.0);
    }

    #[test]
    fn dual_sweep_accumulates_scaled_gradient() {
        let dim = ArrayDim::new(2, 1, 1, 1);
        let mut engine = engine();
        let ubar = filled(dim, &[0.0, 1.0]);
        let mut p = engine.alloc(dim.with_channels(3)).unwrap();

        // Infinite lambda and alpha: prox* is the identity, so p
        // accumulates dt * grad(ubar).
        let regularizer = Regularizer {
            lambda: f64::INFINITY,
            alpha: f64::INFINITY,
        };
        engine.run_dual(&mut p, &ubar, None, regularizer, 0.5);
        assert_eq!(p.get(0, 0, 0, 0), 0.5);
        assert_eq!(p.get(1, 0, 0, 0), 0.0);
        assert_eq!(p.get(0, 0, 0, 1), 0.0);

        engine.run_dual(&mut p, &ubar, None, regularizer, 0.5);
        assert_eq!(p.get(0, 0, 0, 0), 1.0);
    }

    #[test]
    fn weight_passes_match_definition() {
        let dim = ArrayDim::new(2, 1, 1, 1);
        let mut engine = engine();
        let f = filled(dim, &[0.0, 3.0]);
        let mut w = engine.alloc(dim.with_channels(1)).unwrap();

        Engine::<f64>::weight_norm_grad(&engine, &mut w, &f);
        assert_eq!(w.get(0, 0, 0, 0), 3.0);
        assert_eq!(w.get(1, 0, 0, 0), 0.0);

        Engine::<f64>::weight_exp(&engine, &mut w, 1.0);
        assert!((w.get(0, 0, 0, 0) - (-3.0f64).exp()).abs() < 1e-12);
        assert_eq!(w.get(1, 0, 0, 0), 1.0);
    }

    #[test]
    fn weight_exp_clamps_to_eps() {
        let dim = ArrayDim::new(1, 1, 1, 1);
        let mut engine = HostEngine::new();
        let mut w: Volume<f64> = engine.alloc(dim).unwrap();
        w.set(0, 0, 0, 0, 1e9);
        Engine::<f64>::weight_exp(&engine, &mut w, 1.0);
        assert_eq!(w.get(0, 0, 0, 0), 1e-6);
    }

    #[test]
    fn add_edges_attenuates_discontinuities() {
        let dim = ArrayDim::new(4, 1, 1, 1);
        let mut engine = engine();
        let u = filled(dim, &[0.2, 0.2, 1.0, 1.0]);
        let mut out = engine.alloc(dim).unwrap();

        let regularizer = Regularizer {
            lambda: 0.01,
            alpha: 100.0,
        };
        Engine::<f64>::add_edges(&engine, &mut out, &u, None, regularizer);

        // The voxel before the jump is attenuated, flat voxels are
        // untouched.
        assert!(out.get(1, 0, 0, 0) < 0.5 * u.get(1, 0, 0, 0));
        assert_eq!(out.get(0, 0, 0, 0), 0.2);
        assert_eq!(out.get(3, 0, 0, 0), 1.0);
    }
}
