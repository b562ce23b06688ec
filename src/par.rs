// ======================================================================
// EngineKind - PUBLIC

/// Requested execution backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineKind {
    /// Multi-threaded CPU engine.
    Cpu,
    /// CUDA engine (cargo feature `cuda`). Falls back to
    /// [`EngineKind::Cpu`] with a warning when unavailable.
    Cuda,
}

// ======================================================================
// Par - PUBLIC

/// Solver parameters.
///
/// The penalties `lambda`, `alpha` and `temporal` use the convention
/// that any negative value means infinity.
#[derive(Clone, Debug, PartialEq)]
pub struct Par {
    /// Length penalty for the discontinuity set.
    ///
    /// Larger values give fewer discontinuities; `0` reproduces the
    /// input, infinity (any negative value) gives a globally smooth
    /// solution without any discontinuities.
    pub lambda: f64,

    /// Smoothness penalty inside regions.
    ///
    /// Larger values flatten the solution between discontinuities;
    /// `0` reproduces the input, infinity (any negative value) is the
    /// piecewise constant cartoon limit used for segmentation.
    pub alpha: f64,

    /// Temporal coupling between consecutive runs of one solver.
    ///
    /// `0` disables the coupling, infinity (any negative value)
    /// freezes the solution at the previous run's result.
    pub temporal: f64,

    /// Upper bound on the number of iterations.
    pub iterations: usize,

    /// Stop once the mean per-voxel change of the solution drops to
    /// this threshold.
    pub stop_eps: f64,

    /// Check the stopping criterion every `stop_k` iterations; `0`
    /// disables the check so that all `iterations` are run.
    pub stop_k: usize,

    /// Rescale `lambda` and `alpha` with the volume size so results
    /// look alike across resolutions of the same data.
    pub adapt_params: bool,

    /// Weight the length penalty per voxel by the input's gradient,
    /// smoothing less where the input already has strong edges.
    pub weight: bool,

    /// Overlay the detected discontinuity set on the output by
    /// darkening edge voxels.
    pub edges: bool,

    /// Compute in `f64` instead of `f32`.
    pub use_double: bool,

    /// Execution backend.
    pub engine: EngineKind,

    /// Log run statistics (allocation, timing, iterations, energy).
    pub verbose: bool,
}

impl Default for Par {
    fn default() -> Self {
        Self {
            lambda: 0.1,
            alpha: 20.0,
            temporal: 0.0,
            iterations: 10_000,
            stop_eps: 5e-5,
            stop_k: 10,
            adapt_params: false,
            weight: false,
            edges: false,
            use_double: false,
            engine: EngineKind::Cpu,
            verbose: false,
        }
    }
}
