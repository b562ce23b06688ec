//! Backend abstraction for the solver sweeps.
//!
//! An [`Engine`] provides storage for working arrays and executes the
//! per-voxel sweeps and reductions of the primal-dual iteration on
//! one backend:
//!
//! - [`HostEngine`]
//!     - Multi-threaded CPU engine, data-parallel over the outer
//!       spatial axis.
//! - `CudaEngine` (cargo feature `cuda`)
//!     - One kernel launch per sweep on a CUDA device.
//! - [`DefaultEngine`]
//!     - Alias for [`HostEngine`].
//!
//! Voxels are independent within every sweep, so an engine is free to
//! schedule them in any order; each logical thread only needs private
//! scratch of `c` (primal) or `3c` (dual) values. Between sweeps the
//! solver core relies on the engine having finished all writes.

use std::fmt::Display;

use num_traits::Float;

use crate::{
    solver::ops::{DataTerm, Regularizer},
    volume::{AnyMut, AnyRef, ArrayDim, Elem, Volume},
    Error,
};

pub use self::engine_host::HostEngine;

#[cfg(feature = "cuda")]
pub use self::engine_cuda::CudaEngine;

mod engine_host;

#[cfg(feature = "cuda")]
mod engine_cuda;

// ======================================================================
// TYPE ALIASES - PUBLIC

/// Default [`Engine`], currently just alias to [`HostEngine`].
pub type DefaultEngine = HostEngine;

// ======================================================================
// Real - PUBLIC

/// Internal computation precision, `f32` or `f64`.
pub trait Real: Elem + Float + Display {
    /// Converts a constant. Lossy for `f32`.
    fn from_f64(v: f64) -> Self;

    /// Widens to `f64`, for statistics.
    fn as_f64(self) -> f64;
}

impl Real for f32 {
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn as_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Real for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }

    fn as_f64(self) -> f64 {
        self
    }
}

// ======================================================================
// EngineArray - PUBLIC

/// A working array resident on some engine's backend.
pub trait EngineArray {
    /// Shape of the array.
    fn dim(&self) -> ArrayDim;

    /// Allocated size in bytes.
    fn num_bytes(&self) -> usize;
}

impl<T: Elem> EngineArray for Volume<T> {
    fn dim(&self) -> ArrayDim {
        self.dim()
    }

    fn num_bytes(&self) -> usize {
        self.num_bytes()
    }
}

// ======================================================================
// Engine - PUBLIC

/// Execution backend for the primal-dual volume solver.
///
/// Working arrays live behind [`Engine::Array`] so that each backend
/// keeps its data where its sweeps run; the solver core moves data in
/// and out only through [`Engine::load`] and [`Engine::store`].
pub trait Engine<R: Real> {
    /// Backend-resident working array, always in layered layout.
    type Array: EngineArray;

    /// Short backend description, for run statistics.
    fn name(&self) -> String;

    /// Returns `true` if the backend is operational.
    fn is_valid(&self) -> bool;

    /// Allocates a zero-filled array of the given shape.
    fn alloc(&mut self, dim: ArrayDim) -> Result<Self::Array, Error>;

    /// Fills an array with zeros.
    fn set_zero(&self, a: &mut Self::Array);

    /// Copies between two arrays of identical shape and element type.
    fn copy(&self, dst: &mut Self::Array, src: &Self::Array);

    /// Copies a host volume into an engine array, converting element
    /// kind and layout as needed.
    fn load(&self, dst: &mut Self::Array, src: AnyRef<'_>) -> Result<(), Error>;

    /// Copies an engine array into a host volume, converting element
    /// kind and layout as needed.
    fn store(&self, src: &Self::Array, dst: AnyMut<'_>) -> Result<(), Error>;

    /// Sum of a single-channel array, compensated so that the result
    /// does not depend on the backend's work partition.
    fn sum(&self, a: &Self::Array) -> R;

    /// Blocks until all previously issued work has finished.
    fn synchronize(&self);

    /// Dual sweep: `p <- prox*( p + dt * grad(ubar) )`.
    fn run_dual(
        &self,
        p: &mut Self::Array,
        ubar: &Self::Array,
        weight: Option<&Self::Array>,
        regularizer: Regularizer<R>,
        dt: R,
    );

    /// Primal sweep: `u <- prox( u - dt * div*(p) )` followed by the
    /// extrapolation `ubar <- u_new + theta * (u_new - u_old)`.
    #[allow(clippy::too_many_arguments)]
    fn run_primal(
        &self,
        u: &mut Self::Array,
        ubar: &mut Self::Array,
        p: &Self::Array,
        f: &Self::Array,
        prev_u: Option<&Self::Array>,
        dataterm: DataTerm<R>,
        theta: R,
        dt: R,
    );

    /// Writes the per-voxel energy density
    /// `regularizer.value(grad u) + dataterm.value(u)` into `aux`.
    #[allow(clippy::too_many_arguments)]
    fn energy_density(
        &self,
        u: &Self::Array,
        f: &Self::Array,
        prev_u: Option<&Self::Array>,
        weight: Option<&Self::Array>,
        dataterm: DataTerm<R>,
        regularizer: Regularizer<R>,
        aux: &mut Self::Array,
    );

    /// Writes `u` into `out` with every channel attenuated by
    /// `1 - edge_indicator(grad u)`.
    fn add_edges(
        &self,
        out: &mut Self::Array,
        u: &Self::Array,
        weight: Option<&Self::Array>,
        regularizer: Regularizer<R>,
    );

    /// First weight pass: `w(x,y,z) <- |grad f(x,y,z)|`.
    fn weight_norm_grad(&self, w: &mut Self::Array, f: &Self::Array);

    /// Second weight pass: `w <- max(1e-6, exp(-coeff * w))`.
    fn weight_exp(&self, w: &mut Self::Array, coeff: R);

    /// Writes the per-voxel channel-summed absolute difference of `a`
    /// and `b` into `aux`.
    fn abs_diff(&self, a: &Self::Array, b: &Self::Array, aux: &mut Self::Array);
}
