use std::sync::Arc;

use cudarc::{
    driver::{
        CudaDevice, CudaFunction, CudaSlice, DeviceRepr, LaunchAsync, LaunchConfig,
        ValidAsZeroBits,
    },
    nvrtc::compile_ptx,
};
use log::error;
use once_cell::sync::Lazy;

use crate::{
    engine::{Engine, EngineArray, Real},
    solver::ops::{self, DataTerm, Regularizer},
    util::KahanSum,
    volume::{convert, AnyMut, AnyRef, ArrayDim, ElemKind, Layout, Volume},
    Error,
};

// ======================================================================
// CONST - PRIVATE

// Per-thread scratch in the kernels is statically sized; volumes with
// more channels are not supported by this engine.
const MAX_CHANNELS: usize = 8;

const MODULE_F32: &str = "ms_f32";
const MODULE_F64: &str = "ms_f64";

const KERNEL_NAMES: &[&str] = &[
    "run_dual",
    "run_primal",
    "energy_density",
    "add_edges",
    "weight_norm_grad",
    "weight_exp",
    "abs_diff",
];

// The sweeps, written once against a REAL typedef and compiled for
// float and double. Index math matches the layered host layout.
// Infinite parameters arrive as IEEE infinities with their finiteness
// pre-decoded into the flags of Pars, nvrtc has no isfinite().
const KERNEL_SRC: &str = r#"
#define MAX_CHANNELS 8

struct Dims { int w; int h; int d; int c; };

struct Pars
{
    REAL alpha;
    int alpha_finite;
    REAL lambda;
    int lambda_finite;
    REAL temporal;
    int temporal_finite;
};

__device__ __forceinline__ long idx(int x, int y, int z, int i, const Dims dims)
{
    return x + (long)dims.w * (y + (long)dims.h * (z + (long)dims.d * i));
}

__device__ __forceinline__ bool thread_voxel(int* x, int* y, int* z, const Dims dims)
{
    *x = blockIdx.x * blockDim.x + threadIdx.x;
    *y = blockIdx.y * blockDim.y + threadIdx.y;
    *z = blockIdx.z * blockDim.z + threadIdx.z;
    return *x < dims.w && *y < dims.h && *z < dims.d;
}

__device__ __forceinline__ void gradient(
    REAL* out, const REAL* u, int x, int y, int z, const Dims dims)
{
    for (int i = 0; i < dims.c; i++)
    {
        REAL u0 = u[idx(x, y, z, i, dims)];
        out[3 * i + 0] = (x + 1 < dims.w ? u[idx(x + 1, y, z, i, dims)] - u0 : (REAL)0);
        out[3 * i + 1] = (y + 1 < dims.h ? u[idx(x, y + 1, z, i, dims)] - u0 : (REAL)0);
        out[3 * i + 2] = (z + 1 < dims.d ? u[idx(x, y, z + 1, i, dims)] - u0 : (REAL)0);
    }
}

__device__ __forceinline__ REAL norm_squared(const REAL* xs, int n)
{
    REAL sum = (REAL)0;
    for (int k = 0; k < n; k++) { sum += xs[k] * xs[k]; }
    return sum;
}

extern "C" __global__ void run_dual(
    REAL* p, const REAL* ubar, const REAL* weight, int has_weight,
    const Pars pars, REAL dt, const Dims dims)
{
    int x, y, z;
    if (!thread_voxel(&x, &y, &z, dims)) { return; }

    REAL p_sh[3 * MAX_CHANNELS];
    int pc = 3 * dims.c;
    Dims p_dims = dims; p_dims.c = pc;

    gradient(p_sh, ubar, x, y, z, dims);
    for (int k = 0; k < pc; k++)
    {
        p_sh[k] = p[idx(x, y, z, k, p_dims)] + p_sh[k] * dt;
    }

    REAL a = (pars.alpha_finite
        ? (REAL)2 * pars.alpha / (dt + (REAL)2 * pars.alpha)
        : (REAL)1);
    REAL mult = a;
    if (pars.lambda_finite)
    {
        REAL weight0 = (has_weight ? weight[idx(x, y, z, 0, dims)] : (REAL)1);
        REAL l = (REAL)2 * dt * pars.lambda * weight0;
        if (norm_squared(p_sh, pc) * a > l) { mult = (REAL)0; }
    }

    for (int k = 0; k < pc; k++)
    {
        p[idx(x, y, z, k, p_dims)] = p_sh[k] * mult;
    }
}

extern "C" __global__ void run_primal(
    REAL* u, REAL* ubar, const REAL* p, const REAL* f, const REAL* prev_u,
    const Pars pars, REAL theta, REAL dt, const Dims dims)
{
    int x, y, z;
    if (!thread_voxel(&x, &y, &z, dims)) { return; }

    REAL u_sh[MAX_CHANNELS];
    REAL old_sh[MAX_CHANNELS];
    Dims p_dims = dims; p_dims.c = 3 * dims.c;

    for (int i = 0; i < dims.c; i++)
    {
        REAL px_0 = (x + 1 < dims.w ? p[idx(x, y, z, 3 * i + 0, p_dims)] : (REAL)0);
        REAL px_m = (x > 0 ? p[idx(x - 1, y, z, 3 * i + 0, p_dims)] : (REAL)0);
        REAL py_0 = (y + 1 < dims.h ? p[idx(x, y, z, 3 * i + 1, p_dims)] : (REAL)0);
        REAL py_m = (y > 0 ? p[idx(x, y - 1, z, 3 * i + 1, p_dims)] : (REAL)0);
        REAL pz_0 = (z + 1 < dims.d ? p[idx(x, y, z, 3 * i + 2, p_dims)] : (REAL)0);
        REAL pz_m = (z > 0 ? p[idx(x, y, z - 1, 3 * i + 2, p_dims)] : (REAL)0);

        REAL old = u[idx(x, y, z, i, dims)];
        old_sh[i] = old;
        u_sh[i] = old - (px_m - px_0 + py_m - py_0 + pz_m - pz_0) * dt;
    }

    REAL shrink = (REAL)1 + (REAL)2 * dt;
    for (int i = 0; i < dims.c; i++)
    {
        REAL f0 = f[idx(x, y, z, i, dims)];
        u_sh[i] = f0 + (u_sh[i] - f0) / shrink;
    }
    if (pars.temporal != (REAL)0)
    {
        for (int i = 0; i < dims.c; i++) { u_sh[i] -= prev_u[idx(x, y, z, i, dims)]; }
        REAL nrm = sqrt(norm_squared(u_sh, dims.c));
        if (nrm > (REAL)0)
        {
            REAL mult = (REAL)0;
            if (pars.temporal_finite)
            {
                REAL gamma = pars.temporal * dt / shrink;
                REAL a = gamma * (REAL)1.5 / sqrt(nrm);
                mult = (REAL)2 / (a + sqrt(a * a + (REAL)4));
                mult = mult * mult;
            }
            for (int i = 0; i < dims.c; i++) { u_sh[i] *= mult; }
        }
        for (int i = 0; i < dims.c; i++) { u_sh[i] += prev_u[idx(x, y, z, i, dims)]; }
    }

    for (int i = 0; i < dims.c; i++)
    {
        REAL new_u = u_sh[i];
        u[idx(x, y, z, i, dims)] = new_u;
        ubar[idx(x, y, z, i, dims)] = new_u + (new_u - old_sh[i]) * theta;
    }
}

extern "C" __global__ void energy_density(
    const REAL* u, const REAL* f, const REAL* prev_u, const REAL* weight,
    int has_weight, const Pars pars, REAL* aux, const Dims dims)
{
    int x, y, z;
    if (!thread_voxel(&x, &y, &z, dims)) { return; }

    REAL p_sh[3 * MAX_CHANNELS];
    gradient(p_sh, u, x, y, z, dims);

    REAL weight0 = (has_weight ? weight[idx(x, y, z, 0, dims)] : (REAL)1);
    REAL nrm = sqrt(norm_squared(p_sh, 3 * dims.c));
    REAL energy;
    if (pars.alpha_finite)
    {
        energy = pars.alpha * nrm * nrm;
        if (pars.lambda_finite) { energy = fmin(energy, pars.lambda * weight0); }
    }
    else
    {
        // pars.lambda holds IEEE infinity when not finite.
        energy = (nrm > (REAL)1e-6 ? pars.lambda * weight0 : (REAL)0);
    }

    REAL diff_f = (REAL)0;
    for (int i = 0; i < dims.c; i++)
    {
        REAL diff = u[idx(x, y, z, i, dims)] - f[idx(x, y, z, i, dims)];
        diff_f += diff * diff;
    }
    energy += diff_f;

    if (pars.temporal != (REAL)0)
    {
        REAL diff_prev = (REAL)0;
        for (int i = 0; i < dims.c; i++)
        {
            REAL diff = u[idx(x, y, z, i, dims)] - prev_u[idx(x, y, z, i, dims)];
            diff_prev += diff * diff;
        }
        REAL nrm_prev = sqrt(diff_prev);
        if (nrm_prev > (REAL)0) { energy += pars.temporal * nrm_prev * sqrt(nrm_prev); }
    }

    Dims aux_dims = dims; aux_dims.c = 1;
    aux[idx(x, y, z, 0, aux_dims)] = energy;
}

extern "C" __global__ void add_edges(
    REAL* out, const REAL* u, const REAL* weight, int has_weight,
    const Pars pars, REAL max_range_norm, const Dims dims)
{
    int x, y, z;
    if (!thread_voxel(&x, &y, &z, dims)) { return; }

    REAL p_sh[3 * MAX_CHANNELS];
    gradient(p_sh, u, x, y, z, dims);

    REAL indicator = (REAL)0;
    if (pars.lambda_finite)
    {
        REAL weight0 = (has_weight ? weight[idx(x, y, z, 0, dims)] : (REAL)1);
        REAL l = pars.lambda * weight0;
        REAL threshold = (pars.alpha_finite ? sqrt(l / pars.alpha) : (REAL)0);
        threshold = fmax(threshold, (REAL)5e-3);

        REAL nrm = sqrt(norm_squared(p_sh, 3 * dims.c));
        if (nrm > threshold)
        {
            REAL m = fmax(max_range_norm, nrm);
            indicator = log(nrm / threshold) / log(m / threshold);
        }
    }

    REAL mult = (REAL)1 - indicator;
    for (int i = 0; i < dims.c; i++)
    {
        out[idx(x, y, z, i, dims)] = u[idx(x, y, z, i, dims)] * mult;
    }
}

extern "C" __global__ void weight_norm_grad(REAL* wgt, const REAL* f, const Dims dims)
{
    int x, y, z;
    if (!thread_voxel(&x, &y, &z, dims)) { return; }

    REAL g_sh[3 * MAX_CHANNELS];
    gradient(g_sh, f, x, y, z, dims);

    Dims w_dims = dims; w_dims.c = 1;
    wgt[idx(x, y, z, 0, w_dims)] = sqrt(norm_squared(g_sh, 3 * dims.c));
}

extern "C" __global__ void weight_exp(REAL* wgt, REAL coeff, long n)
{
    long k = blockIdx.x * (long)blockDim.x + threadIdx.x;
    if (k >= n) { return; }
    wgt[k] = fmax((REAL)1e-6, exp(-coeff * wgt[k]));
}

extern "C" __global__ void abs_diff(
    const REAL* a, const REAL* b, REAL* aux, const Dims dims)
{
    int x, y, z;
    if (!thread_voxel(&x, &y, &z, dims)) { return; }

    REAL diff = (REAL)0;
    for (int i = 0; i < dims.c; i++)
    {
        diff += fabs(a[idx(x, y, z, i, dims)] - b[idx(x, y, z, i, dims)]);
    }

    Dims aux_dims = dims; aux_dims.c = 1;
    aux[idx(x, y, z, 0, aux_dims)] = diff;
}
"#;

// ======================================================================
// Dims / Pars - PRIVATE

#[repr(C)]
#[derive(Clone, Copy)]
struct Dims {
    w: i32,
    h: i32,
    d: i32,
    c: i32,
}

unsafe impl DeviceRepr for Dims {}

fn dims_of(dim: ArrayDim) -> Dims {
    Dims {
        w: dim.w as i32,
        h: dim.h as i32,
        d: dim.d as i32,
        c: dim.c as i32,
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Pars<R> {
    alpha: R,
    alpha_finite: i32,
    lambda: R,
    lambda_finite: i32,
    temporal: R,
    temporal_finite: i32,
}

unsafe impl<R: DeviceRepr> DeviceRepr for Pars<R> {}

fn pars_of<R: Real>(regularizer: Regularizer<R>, temporal: R) -> Pars<R> {
    Pars {
        alpha: regularizer.alpha,
        alpha_finite: i32::from(regularizer.alpha.is_finite()),
        lambda: regularizer.lambda,
        lambda_finite: i32::from(regularizer.lambda.is_finite()),
        temporal,
        temporal_finite: i32::from(temporal.is_finite()),
    }
}

// ======================================================================
// DeviceVolume - PUBLIC

/// A working array resident on a CUDA device, in layered layout with
/// an unpadded pitch.
pub struct DeviceVolume<R> {
    data: CudaSlice<R>,
    dim: ArrayDim,
}

impl<R: Real> EngineArray for DeviceVolume<R> {
    fn dim(&self) -> ArrayDim {
        self.dim
    }

    fn num_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<R>()
    }
}

// ======================================================================
// CudaEngine - PUBLIC

/// CUDA engine: one kernel launch per sweep, volumes resident on the
/// device, reductions staged through a host copy of the single-channel
/// auxiliary array.
///
/// Supports at most 8 channels per voxel (fixed per-thread scratch in
/// the kernels).
pub struct CudaEngine {
    dev: Arc<CudaDevice>,
}

static AVAILABLE: Lazy<bool> = Lazy::new(|| CudaDevice::new(0).is_ok());

impl CudaEngine {
    /// Returns `true` if a usable CUDA device is present. The probe
    /// runs once per process.
    pub fn is_available() -> bool {
        *AVAILABLE
    }

    /// Creates a new engine on device 0, compiling the sweep kernels
    /// for both precisions.
    pub fn new() -> Result<Self, Error> {
        let dev = CudaDevice::new(0).map_err(backend_err)?;

        let ptx_f32 = compile_ptx(KERNEL_SRC.replace("REAL", "float")).map_err(backend_err)?;
        dev.load_ptx(ptx_f32, MODULE_F32, KERNEL_NAMES)
            .map_err(backend_err)?;
        let ptx_f64 = compile_ptx(KERNEL_SRC.replace("REAL", "double")).map_err(backend_err)?;
        dev.load_ptx(ptx_f64, MODULE_F64, KERNEL_NAMES)
            .map_err(backend_err)?;

        Ok(Self { dev })
    }

    fn func<R: Real>(&self, name: &str) -> Option<CudaFunction> {
        let module = match R::KIND {
            ElemKind::F32 => MODULE_F32,
            ElemKind::F64 => MODULE_F64,
            ElemKind::U8 => return None,
        };
        self.dev.get_func(module, name)
    }

    // Launches a sweep kernel over the voxel grid; launch failures
    // are logged and surface through is_valid on the next run.
    fn launch_voxels<R: Real, Params>(&self, name: &str, dim: ArrayDim, params: Params)
    where
        Params: LaunchParams,
    {
        let func = match self.func::<R>(name) {
            Some(func) => func,
            None => {
                error!("cuda kernel {} missing", name);
                return;
            }
        };
        let block = (8u32, 8u32, 4u32);
        let cfg = LaunchConfig {
            grid_dim: (
                (dim.w as u32).div_ceil(block.0),
                (dim.h as u32).div_ceil(block.1),
                (dim.d as u32).div_ceil(block.2),
            ),
            block_dim: block,
            shared_mem_bytes: 0,
        };
        if let Err(err) = params.launch_with(func, cfg) {
            error!("cuda kernel {} failed: {}", name, err);
        }
    }
}

fn backend_err<E: std::fmt::Display>(err: E) -> Error {
    Error::Backend {
        detail: err.to_string(),
    }
}

// Adapter so launches of different arities share the logging path of
// launch_voxels.
trait LaunchParams {
    fn launch_with(
        self,
        func: CudaFunction,
        cfg: LaunchConfig,
    ) -> Result<(), cudarc::driver::DriverError>;
}

macro_rules! impl_launch_params {
    ($($name:ident),*) => {
        impl<$($name: DeviceRepr),*> LaunchParams for ($($name,)*) {
            fn launch_with(
                self,
                func: CudaFunction,
                cfg: LaunchConfig,
            ) -> Result<(), cudarc::driver::DriverError> {
                unsafe { func.launch(cfg, self) }
            }
        }
    };
}

impl_launch_params!(A, B, C);
impl_launch_params!(A, B, C, D);
impl_launch_params!(A, B, C, D, E, F, G);
impl_launch_params!(A, B, C, D, E, F, G, H);
impl_launch_params!(A, B, C, D, E, F, G, H, I);

// ======================================================================
// CudaEngine - IMPL Engine

impl<R> Engine<R> for CudaEngine
where
    R: Real + DeviceRepr + ValidAsZeroBits,
{
    type Array = DeviceVolume<R>;

    fn name(&self) -> String {
        format!("cuda (device {})", self.dev.ordinal())
    }

    fn is_valid(&self) -> bool {
        self.dev.synchronize().is_ok()
    }

    fn alloc(&mut self, dim: ArrayDim) -> Result<DeviceVolume<R>, Error> {
        if dim.c > 3 * MAX_CHANNELS {
            return Err(Error::Backend {
                detail: format!("cuda engine supports at most {} channels", MAX_CHANNELS),
            });
        }
        let data = self
            .dev
            .alloc_zeros::<R>(dim.num_elem())
            .map_err(backend_err)?;
        Ok(DeviceVolume { data, dim })
    }

    fn set_zero(&self, a: &mut DeviceVolume<R>) {
        if let Err(err) = self.dev.memset_zeros(&mut a.data) {
            error!("cuda memset failed: {}", err);
        }
    }

    fn copy(&self, dst: &mut DeviceVolume<R>, src: &DeviceVolume<R>) {
        debug_assert_eq!(dst.dim, src.dim);
        if let Err(err) = self.dev.dtod_copy(&src.data, &mut dst.data) {
            error!("cuda copy failed: {}", err);
        }
    }

    fn load(&self, dst: &mut DeviceVolume<R>, src: AnyRef<'_>) -> Result<(), Error> {
        // Convert on the host into the device's layered layout, then
        // upload the dense buffer in one transfer.
        let mut staging = Volume::<R>::new(dst.dim, Layout::Layered);
        convert::copy_any(staging.as_any_mut(), src)?;
        self.dev
            .htod_sync_copy_into(staging.data(), &mut dst.data)
            .map_err(backend_err)
    }

    fn store(&self, src: &DeviceVolume<R>, dst: AnyMut<'_>) -> Result<(), Error> {
        let mut staging = Volume::<R>::new(src.dim, Layout::Layered);
        self.dev
            .dtoh_sync_copy_into(&src.data, staging.data_mut())
            .map_err(backend_err)?;
        convert::copy_any(dst, staging.as_any())
    }

    fn sum(&self, a: &DeviceVolume<R>) -> R {
        let mut host = vec![R::zero(); a.data.len()];
        if let Err(err) = self.dev.dtoh_sync_copy_into(&a.data, &mut host) {
            error!("cuda download failed: {}", err);
            return R::zero();
        }
        let mut summation = KahanSum::new();
        for &x in &host {
            summation.add(x);
        }
        summation.sum()
    }

    fn synchronize(&self) {
        if let Err(err) = self.dev.synchronize() {
            error!("cuda synchronize failed: {}", err);
        }
    }

    fn run_dual(
        &self,
        p: &mut DeviceVolume<R>,
        ubar: &DeviceVolume<R>,
        weight: Option<&DeviceVolume<R>>,
        regularizer: Regularizer<R>,
        dt: R,
    ) {
        let dim = ubar.dim;
        let has_weight = i32::from(weight.is_some());
        let weight = weight.unwrap_or(ubar);
        self.launch_voxels::<R, _>(
            "run_dual",
            dim,
            (
                &mut p.data,
                &ubar.data,
                &weight.data,
                has_weight,
                pars_of(regularizer, R::zero()),
                dt,
                dims_of(dim),
            ),
        );
    }

    fn run_primal(
        &self,
        u: &mut DeviceVolume<R>,
        ubar: &mut DeviceVolume<R>,
        p: &DeviceVolume<R>,
        f: &DeviceVolume<R>,
        prev_u: Option<&DeviceVolume<R>>,
        dataterm: DataTerm<R>,
        theta: R,
        dt: R,
    ) {
        let dim = u.dim;
        let temporal = if prev_u.is_some() {
            dataterm.temporal
        } else {
            R::zero()
        };
        let prev_u = prev_u.unwrap_or(f);
        let regularizer = Regularizer {
            lambda: R::zero(),
            alpha: R::zero(),
        };
        self.launch_voxels::<R, _>(
            "run_primal",
            dim,
            (
                &mut u.data,
                &mut ubar.data,
                &p.data,
                &f.data,
                &prev_u.data,
                pars_of(regularizer, temporal),
                theta,
                dt,
                dims_of(dim),
            ),
        );
    }

    fn energy_density(
        &self,
        u: &DeviceVolume<R>,
        f: &DeviceVolume<R>,
        prev_u: Option<&DeviceVolume<R>>,
        weight: Option<&DeviceVolume<R>>,
        dataterm: DataTerm<R>,
        regularizer: Regularizer<R>,
        aux: &mut DeviceVolume<R>,
    ) {
        let dim = u.dim;
        let temporal = if prev_u.is_some() {
            dataterm.temporal
        } else {
            R::zero()
        };
        let prev_u = prev_u.unwrap_or(f);
        let has_weight = i32::from(weight.is_some());
        let weight = weight.unwrap_or(u);
        self.launch_voxels::<R, _>(
            "energy_density",
            dim,
            (
                &u.data,
                &f.data,
                &prev_u.data,
                &weight.data,
                has_weight,
                pars_of(regularizer, temporal),
                &mut aux.data,
                dims_of(dim),
            ),
        );
    }

    fn add_edges(
        &self,
        out: &mut DeviceVolume<R>,
        u: &DeviceVolume<R>,
        weight: Option<&DeviceVolume<R>>,
        regularizer: Regularizer<R>,
    ) {
        let dim = u.dim;
        let has_weight = i32::from(weight.is_some());
        let weight = weight.unwrap_or(u);
        self.launch_voxels::<R, _>(
            "add_edges",
            dim,
            (
                &mut out.data,
                &u.data,
                &weight.data,
                has_weight,
                pars_of(regularizer, R::zero()),
                ops::max_range_norm::<R>(dim.c),
                dims_of(dim),
            ),
        );
    }

    fn weight_norm_grad(&self, w: &mut DeviceVolume<R>, f: &DeviceVolume<R>) {
        let dim = f.dim;
        self.launch_voxels::<R, _>(
            "weight_norm_grad",
            dim,
            (&mut w.data, &f.data, dims_of(dim)),
        );
    }

    fn weight_exp(&self, w: &mut DeviceVolume<R>, coeff: R) {
        let n = w.data.len();
        let func = match self.func::<R>("weight_exp") {
            Some(func) => func,
            None => {
                error!("cuda kernel weight_exp missing");
                return;
            }
        };
        let cfg = LaunchConfig::for_num_elems(n as u32);
        if let Err(err) = unsafe { func.launch(cfg, (&mut w.data, coeff, n as i64)) } {
            error!("cuda kernel weight_exp failed: {}", err);
        }
    }

    fn abs_diff(&self, a: &DeviceVolume<R>, b: &DeviceVolume<R>, aux: &mut DeviceVolume<R>) {
        let dim = a.dim;
        self.launch_voxels::<R, _>(
            "abs_diff",
            dim,
            (&a.data, &b.data, &mut aux.data, dims_of(dim)),
        );
    }
}
