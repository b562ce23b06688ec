//! The solver facade dispatching over precision and backend.
//!
//! [`Solver`] owns at most one concrete solver instantiation out of
//! the `(f32 | f64) x (cpu | cuda)` matrix at a time, selected from
//! the parameters of each run. The instance keeps its working arrays
//! between runs, so repeated calls with the same volume shape,
//! precision and backend do not allocate; it is disposed and rebuilt
//! only when precision or backend change.
//!
//! A request for the CUDA engine when it is unavailable falls back to
//! the CPU engine with a single logged warning and never fails.

use std::sync::Once;

use log::warn;

use crate::{
    engine::HostEngine,
    solver::core::VolumeSolver,
    volume::{AnyMut, AnyRef, ArrayDim, Layout, SolverVolume, Volume, VolumeRef},
    EngineKind, Error, Par,
};

#[cfg(feature = "cuda")]
use crate::engine::CudaEngine;

pub(crate) mod core;
pub mod ops;

// ======================================================================
// Instance - PRIVATE

enum Instance {
    HostF32(VolumeSolver<f32, HostEngine>),
    HostF64(VolumeSolver<f64, HostEngine>),
    #[cfg(feature = "cuda")]
    CudaF32(VolumeSolver<f32, CudaEngine>),
    #[cfg(feature = "cuda")]
    CudaF64(VolumeSolver<f64, CudaEngine>),
}

impl Instance {
    fn kind(&self) -> (bool, EngineKind) {
        match self {
            Instance::HostF32(_) => (false, EngineKind::Cpu),
            Instance::HostF64(_) => (true, EngineKind::Cpu),
            #[cfg(feature = "cuda")]
            Instance::CudaF32(_) => (false, EngineKind::Cuda),
            #[cfg(feature = "cuda")]
            Instance::CudaF64(_) => (true, EngineKind::Cuda),
        }
    }

    fn run(&mut self, input: AnyRef<'_>, output: AnyMut<'_>, par: &Par) -> Result<(), Error> {
        match self {
            Instance::HostF32(solver) => solver.run(input, output, par),
            Instance::HostF64(solver) => solver.run(input, output, par),
            #[cfg(feature = "cuda")]
            Instance::CudaF32(solver) => solver.run(input, output, par),
            #[cfg(feature = "cuda")]
            Instance::CudaF64(solver) => solver.run(input, output, par),
        }
    }
}

// ======================================================================
// FUNCTIONS - PRIVATE

static CUDA_FALLBACK_WARNING: Once = Once::new();

fn cuda_fallback(detail: &str) {
    let detail = detail.to_string();
    CUDA_FALLBACK_WARNING.call_once(move || {
        warn!("could not select cuda engine, using cpu instead ({})", detail);
    });
}

// The backend that will actually run, after availability checks.
fn resolved_engine(par: &Par) -> EngineKind {
    match par.engine {
        EngineKind::Cpu => EngineKind::Cpu,
        EngineKind::Cuda => {
            #[cfg(feature = "cuda")]
            if CudaEngine::is_available() {
                return EngineKind::Cuda;
            }
            #[cfg(feature = "cuda")]
            cuda_fallback("no usable cuda device");
            #[cfg(not(feature = "cuda"))]
            cuda_fallback("built without the cuda feature");
            EngineKind::Cpu
        }
    }
}

fn host_instance(use_double: bool) -> Instance {
    if use_double {
        Instance::HostF64(VolumeSolver::new(HostEngine::new()))
    } else {
        Instance::HostF32(VolumeSolver::new(HostEngine::new()))
    }
}

fn new_instance(use_double: bool, engine: EngineKind) -> Instance {
    match engine {
        EngineKind::Cpu => host_instance(use_double),
        EngineKind::Cuda => {
            #[cfg(feature = "cuda")]
            match CudaEngine::new() {
                Ok(engine) => {
                    return if use_double {
                        Instance::CudaF64(VolumeSolver::new(engine))
                    } else {
                        Instance::CudaF32(VolumeSolver::new(engine))
                    };
                }
                Err(err) => cuda_fallback(&err.to_string()),
            }
            host_instance(use_double)
        }
    }
}

// ======================================================================
// Solver - PUBLIC

/// Piecewise-smooth approximation solver with allocation caching
/// across runs.
///
/// See [simple usage](crate#simple-usage) and
/// [basic usage](crate#basic-usage) for examples.
pub struct Solver {
    instance: Option<Instance>,
}

impl Solver {
    /// Creates a new solver. Nothing is allocated until the first
    /// run.
    pub fn new() -> Self {
        Self { instance: None }
    }

    /// Runs the solver on `input`, returning an output volume of the
    /// same shape, element kind and layout.
    pub fn run<V: SolverVolume>(&mut self, input: &V, par: &Par) -> Result<V, Error> {
        let mut output = input.new_same_shape();
        self.run_any(input.as_any(), output.as_any_mut(), par)?;
        Ok(output)
    }

    /// Runs the solver on an untyped input view, writing the result
    /// into an untyped output view of identical shape.
    pub fn run_any(
        &mut self,
        input: AnyRef<'_>,
        output: AnyMut<'_>,
        par: &Par,
    ) -> Result<(), Error> {
        if output.dim() != input.dim() {
            return Err(Error::DifferentDim {
                expected: input.dim(),
                got: output.dim(),
            });
        }
        self.select(par).run(input, output, par)
    }

    /// Runs the solver on a layered `f32` buffer of shape `dim`.
    pub fn run_layered_f32(
        &mut self,
        input: &[f32],
        dim: ArrayDim,
        par: &Par,
    ) -> Result<Vec<f32>, Error> {
        let input = VolumeRef::new(input, dim, Layout::Layered)?;
        let mut output = Volume::<f32>::new(dim, Layout::Layered);
        self.run_any(input.into_any(), output.as_any_mut(), par)?;
        Ok(output.into_vec())
    }

    /// Runs the solver on a layered `f64` buffer of shape `dim`.
    pub fn run_layered_f64(
        &mut self,
        input: &[f64],
        dim: ArrayDim,
        par: &Par,
    ) -> Result<Vec<f64>, Error> {
        let input = VolumeRef::new(input, dim, Layout::Layered)?;
        let mut output = Volume::<f64>::new(dim, Layout::Layered);
        self.run_any(input.into_any(), output.as_any_mut(), par)?;
        Ok(output.into_vec())
    }

    /// Runs the solver on an interlaced `u8` buffer of shape `dim`,
    /// such as raw voxel data with interleaved color channels.
    pub fn run_interlaced_u8(
        &mut self,
        input: &[u8],
        dim: ArrayDim,
        par: &Par,
    ) -> Result<Vec<u8>, Error> {
        let input = VolumeRef::new(input, dim, Layout::Interlaced)?;
        let mut output = Volume::<u8>::new(dim, Layout::Interlaced);
        self.run_any(input.into_any(), output.as_any_mut(), par)?;
        Ok(output.into_vec())
    }

    fn select(&mut self, par: &Par) -> &mut Instance {
        let wanted = (par.use_double, resolved_engine(par));
        let matches = self
            .instance
            .as_ref()
            .map_or(false, |instance| instance.kind() == wanted);
        if !matches {
            self.instance = Some(new_instance(wanted.0, wanted.1));
        }
        match self.instance.as_mut() {
            Some(instance) => instance,
            None => unreachable!(),
        }
    }
}

impl Default for Solver {
    fn default() -> Self {
        Self::new()
    }
}

// ======================================================================
// TESTS
