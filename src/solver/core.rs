use std::marker::PhantomData;

use log::info;

use crate::{
    engine::{Engine, EngineArray, Real},
    solver::ops::PdVars,
    util::Timer,
    volume::{AnyMut, AnyRef, ArrayDim},
    Error, Par,
};

// ======================================================================
// Work - PRIVATE

// The eight working arrays of one solver instance. Allocated on first
// use and kept across runs; re-allocated only when the shape changes.
struct Work<A> {
    dim: ArrayDim,
    u: A,
    ubar: A,
    f: A,
    p: A,
    prev_u: A,
    weight: A,
    aux_result: A,
    aux_reduce: A,
    mem: usize,
}

// ======================================================================
// Stats - PRIVATE

#[derive(Default)]
struct Stats {
    alloc_mem: usize,
    stop_iteration: Option<usize>,
    time_compute: f64,
    time_compute_sum: f64,
    time: f64,
    time_sum: f64,
    num_runs: usize,
    energy: f64,
}

// ======================================================================
// VolumeSolver - CRATE

// One concrete (precision, backend) solver instantiation.
pub(crate) struct VolumeSolver<R: Real, E: Engine<R>> {
    engine: E,
    work: Option<Work<E::Array>>,
    u_is_computed: bool,
    stats: Stats,
    _real: PhantomData<R>,
}

impl<R: Real, E: Engine<R>> VolumeSolver<R, E> {
    pub(crate) fn new(engine: E) -> Self {
        Self {
            engine,
            work: None,
            u_is_computed: false,
            stats: Stats::default(),
            _real: PhantomData,
        }
    }

    pub(crate) fn run(
        &mut self,
        input: AnyRef<'_>,
        output: AnyMut<'_>,
        par: &Par,
    ) -> Result<(), Error> {
        let dim = input.dim();
        if dim.is_empty() {
            return Err(Error::EmptyDim { dim });
        }
        if !self.engine.is_valid() {
            return Err(Error::Backend {
                detail: format!("engine {} is not operational", self.engine.name()),
            });
        }

        let mut timer_all = Timer::new();
        timer_all.start();

        // Allocate, or re-use the arrays of the previous run when the
        // shape still matches.
        let mut work = match self.work.take() {
            Some(work) if work.dim == dim => {
                self.stats.alloc_mem = 0;
                work
            }
            _ => {
                self.u_is_computed = false;
                let work = self.alloc_work(dim)?;
                self.stats.alloc_mem = work.mem;
                work
            }
        };

        // Initialize.
        self.engine.load(&mut work.f, input)?;
        if par.temporal == 0.0 {
            self.u_is_computed = false;
        }
        if self.u_is_computed {
            self.engine.copy(&mut work.prev_u, &work.u);
        }
        self.engine.copy(&mut work.u, &work.f);
        self.engine.copy(&mut work.ubar, &work.u);
        self.engine.set_zero(&mut work.p);
        if par.weight {
            self.init_weight(&mut work);
        }
        let mut pd = PdVars::<R>::init(par, dim, self.u_is_computed);

        // Iterate.
        let voxels = R::from_f64(dim.dim3().num_voxels() as f64);
        let stop_eps = R::from_f64(par.stop_eps);
        let mut timer_compute = Timer::new();
        timer_compute.start();
        self.stats.stop_iteration = None;
        for iteration in 0..par.iterations {
            pd.update();
            self.engine.run_dual(
                &mut work.p,
                &work.ubar,
                par.weight.then_some(&work.weight),
                pd.regularizer,
                pd.dt_d,
            );
            self.engine.run_primal(
                &mut work.u,
                &mut work.ubar,
                &work.p,
                &work.f,
                pd.dataterm.has_temporal().then_some(&work.prev_u),
                pd.dataterm,
                pd.theta,
                pd.dt_p,
            );
            if par.stop_k > 0 && (iteration + 1) % par.stop_k == 0 {
                self.engine
                    .abs_diff(&work.u, &work.ubar, &mut work.aux_reduce);
                let diff = self.engine.sum(&work.aux_reduce) / voxels;
                if diff / pd.theta <= stop_eps {
                    self.stats.stop_iteration = Some(iteration);
                    break;
                }
            }
        }
        self.engine.synchronize();
        timer_compute.end();
        self.u_is_computed = true;

        // Energy of the solution, in the unscaled parameters.
        self.engine.energy_density(
            &work.u,
            &work.f,
            pd.dataterm.has_temporal().then_some(&work.prev_u),
            par.weight.then_some(&work.weight),
            pd.dataterm,
            pd.regularizer,
            &mut work.aux_reduce,
        );
        let energy = self.engine.sum(&work.aux_reduce) / (pd.omega * pd.omega);
        self.stats.energy = energy.as_f64();

        // Emit the solution, with edges overlaid when requested.
        self.engine.copy(&mut work.aux_result, &work.u);
        if par.edges {
            self.engine.add_edges(
                &mut work.aux_result,
                &work.u,
                par.weight.then_some(&work.weight),
                pd.regularizer,
            );
        }
        self.engine.store(&work.aux_result, output)?;
        self.engine.synchronize();

        timer_all.end();
        self.stats.time_compute = timer_compute.get();
        self.stats.time_compute_sum += self.stats.time_compute;
        self.stats.time = timer_all.get();
        self.stats.time_sum += self.stats.time;
        self.stats.num_runs += 1;
        if par.verbose {
            self.print_stats(par, &pd, dim);
        }

        self.work = Some(work);
        Ok(())
    }

    fn alloc_work(&mut self, dim: ArrayDim) -> Result<Work<E::Array>, Error> {
        let dim_p = dim.with_channels(crate::solver::ops::range_channels(dim.c));
        let dim_scalar = dim.with_channels(1);

        let work = Work {
            dim,
            u: self.engine.alloc(dim)?,
            ubar: self.engine.alloc(dim)?,
            f: self.engine.alloc(dim)?,
            p: self.engine.alloc(dim_p)?,
            prev_u: self.engine.alloc(dim)?,
            weight: self.engine.alloc(dim_scalar)?,
            aux_result: self.engine.alloc(dim)?,
            aux_reduce: self.engine.alloc(dim_scalar)?,
            mem: 0,
        };
        let mem = work.u.num_bytes()
            + work.ubar.num_bytes()
            + work.f.num_bytes()
            + work.p.num_bytes()
            + work.prev_u.num_bytes()
            + work.weight.num_bytes()
            + work.aux_result.num_bytes()
            + work.aux_reduce.num_bytes();
        Ok(Work { mem, ..work })
    }

    // Two-pass edge weight: |grad f|, then exp(-2 |grad f| / sigma)
    // with sigma the mean gradient norm over the volume.
    fn init_weight(&mut self, work: &mut Work<E::Array>) {
        self.engine.weight_norm_grad(&mut work.weight, &work.f);
        let voxels = R::from_f64(work.dim.dim3().num_voxels() as f64);
        let sigma = self.engine.sum(&work.weight) / voxels;
        let coeff = if sigma > R::zero() {
            R::from_f64(2.0) / sigma
        } else {
            R::zero()
        };
        self.engine.weight_exp(&mut work.weight, coeff);
    }

    fn print_stats(&self, par: &Par, pd: &PdVars<R>, dim: ArrayDim) {
        let stats = &self.stats;
        let mut msg = String::new();
        if stats.alloc_mem > 0 {
            msg.push_str(&format!(
                "alloc {} MB for {}, ",
                (stats.alloc_mem + (1 << 20) - 1) >> 20,
                dim
            ));
        }
        msg.push_str(&format!(
            "{}, {:.4} s compute / {:.4} s all (+ {:.4})",
            self.engine.name(),
            stats.time_compute,
            stats.time,
            stats.time - stats.time_compute
        ));
        if stats.num_runs > 1 {
            let runs = stats.num_runs as f64;
            msg.push_str(&format!(
                ", average {:.4} s / {:.4} s (+ {:.4})",
                stats.time_compute_sum / runs,
                stats.time_sum / runs,
                (stats.time_sum - stats.time_compute_sum) / runs
            ));
        }
        match stats.stop_iteration {
            Some(iteration) => msg.push_str(&format!(", {} iterations", iteration + 1)),
            None => msg.push_str(&format!(", did not stop after {} iterations", par.iterations)),
        }
        msg.push_str(&format!(", lambda {}", par.lambda));
        if par.adapt_params {
            msg.push_str(&format!(" (adapted {})", pd.regularizer.lambda));
        }
        msg.push_str(&format!(", alpha {}", par.alpha));
        if par.adapt_params {
            msg.push_str(&format!(" (adapted {})", pd.regularizer.alpha));
        }
        if par.temporal != 0.0 {
            msg.push_str(&format!(", temporal {}", par.temporal));
        }
        if par.weight {
            msg.push_str(", weighting");
        }
        msg.push_str(&format!(", energy {:.4}", stats.energy));
        info!("{}", msg);
    }
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::HostEngine,
        volume::{Layout, SolverVolume, Volume},
    };

    #[test]
    fn working_set_is_reused_for_matching_shape() {
        let dim = ArrayDim::new(8, 8, 2, 1);
        let input = Volume::<f32>::new(dim, Layout::Layered);
        let mut output = input.new_same_shape();

        let mut par = Par::default();
        par.iterations = 3;

        let mut solver = VolumeSolver::<f32, HostEngine>::new(HostEngine::new());
        solver
            .run(input.as_any(), output.as_any_mut(), &par)
            .unwrap();
        assert!(solver.stats.alloc_mem > 0);

        solver
            .run(input.as_any(), output.as_any_mut(), &par)
            .unwrap();
        assert_eq!(solver.stats.alloc_mem, 0);

        // A different shape triggers re-allocation, not an error.
        let small = Volume::<f32>::new(ArrayDim::new(4, 4, 1, 1), Layout::Layered);
        let mut small_out = small.new_same_shape();
        solver
            .run(small.as_any(), small_out.as_any_mut(), &par)
            .unwrap();
        assert!(solver.stats.alloc_mem > 0);
    }

    #[test]
    fn empty_dim_is_rejected() {
        let dim = ArrayDim::new(4, 0, 1, 1);
        let input = Volume::<f32>::new(dim, Layout::Layered);
        let mut output = input.new_same_shape();

        let mut solver = VolumeSolver::<f32, HostEngine>::new(HostEngine::new());
        assert_eq!(
            solver.run(input.as_any(), output.as_any_mut(), &Par::default()),
            Err(Error::EmptyDim { dim })
        );
    }

    #[test]
    fn working_set_memory_covers_all_arrays() {
        let dim = ArrayDim::new(4, 4, 4, 2);
        let mut solver = VolumeSolver::<f64, HostEngine>::new(HostEngine::new());
        let work = solver.alloc_work(dim).unwrap();

        // Five shape-sized arrays, one with 3c channels, two scalar.
        let elem = 4 * 4 * 4 * 8;
        assert_eq!(work.mem, elem * (5 * 2 + 3 * 2 + 2));
    }
}
