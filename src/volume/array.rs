use std::mem;

use crate::{
    volume::{ArrayDim, ElemKind, Layout, SolverVolume},
    Error,
};

// ======================================================================
// Elem - PUBLIC

/// Element type of a volume buffer: one of `u8`, `f32`, `f64`.
///
/// This is a closed set; the trait is sealed by the [`ElemKind`]
/// enumeration it maps to.
pub trait Elem: bytemuck::Pod + PartialEq + Send + Sync + 'static {
    /// The runtime tag of this element type.
    const KIND: ElemKind;
}

impl Elem for u8 {
    const KIND: ElemKind = ElemKind::U8;
}

impl Elem for f32 {
    const KIND: ElemKind = ElemKind::F32;
}

impl Elem for f64 {
    const KIND: ElemKind = ElemKind::F64;
}

// ======================================================================
// FUNCTIONS - PRIVATE

// Element offset into pitched storage. The data height equals `dim.h`
// for every layout, so the full address is
// `x + pitch_elems * (y + dim.h * z)` of the data index.
#[inline]
fn elem_offset<T: Elem>(
    layout: Layout,
    dim: &ArrayDim,
    pitch: usize,
    x: usize,
    y: usize,
    z: usize,
    i: usize,
) -> usize {
    debug_assert!(x < dim.w && y < dim.h && z < dim.d && i < dim.c);
    let idx = layout.data_index(x, y, z, i, dim);
    let pitch_elems = pitch / mem::size_of::<T>();
    idx.x + pitch_elems * (idx.y + dim.h * idx.z)
}

fn expected_len<T: Elem>(dim: &ArrayDim, layout: Layout) -> usize {
    let data = layout.used_data_dim(dim, mem::size_of::<T>());
    data.num_bytes() / mem::size_of::<T>()
}

// ======================================================================
// Volume - PUBLIC

/// An owning, pitched, layout-tagged volume buffer on the host.
///
/// On the host the pitch always equals the used row width, so the
/// storage is dense. Dropping the volume frees the buffer;
/// [`Volume::into_vec`] releases the buffer to the caller instead.
#[derive(Clone, Debug, PartialEq)]
pub struct Volume<T: Elem> {
    data: Vec<T>,
    dim: ArrayDim,
    pitch: usize,
    layout: Layout,
}

impl<T: Elem> Volume<T> {
    /// Allocates a zero-filled volume.
    pub fn new(dim: ArrayDim, layout: Layout) -> Self {
        let data_dim = layout.used_data_dim(&dim, mem::size_of::<T>());
        Self {
            data: vec![T::zeroed(); expected_len::<T>(&dim, layout)],
            dim,
            pitch: data_dim.pitch,
            layout,
        }
    }

    /// Wraps an existing buffer. The buffer length must match the
    /// dense storage size of `dim` under `layout`.
    pub fn from_vec(data: Vec<T>, dim: ArrayDim, layout: Layout) -> Result<Self, Error> {
        let expected = expected_len::<T>(&dim, layout);
        if data.len() != expected {
            return Err(Error::DifferentLen {
                expected,
                got: data.len(),
            });
        }
        let data_dim = layout.used_data_dim(&dim, mem::size_of::<T>());
        Ok(Self {
            data,
            dim,
            pitch: data_dim.pitch,
            layout,
        })
    }

    /// Releases the storage to the caller, consuming the volume.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Shape of this volume.
    pub fn dim(&self) -> ArrayDim {
        self.dim
    }

    /// Data layout of this volume.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Byte stride of one storage row.
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// Total storage size in bytes.
    pub fn num_bytes(&self) -> usize {
        self.data.len() * mem::size_of::<T>()
    }

    /// The backing storage.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// The backing storage, mutably.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Reads element `(x, y, z, i)`.
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize, i: usize) -> T {
        self.data[elem_offset::<T>(self.layout, &self.dim, self.pitch, x, y, z, i)]
    }

    /// Writes element `(x, y, z, i)`.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, i: usize, value: T) {
        self.data[elem_offset::<T>(self.layout, &self.dim, self.pitch, x, y, z, i)] = value;
    }

    /// Borrowing read view.
    pub fn as_ref(&self) -> VolumeRef<'_, T> {
        VolumeRef {
            data: &self.data,
            dim: self.dim,
            pitch: self.pitch,
            layout: self.layout,
        }
    }

    /// Borrowing write view.
    pub fn as_mut(&mut self) -> VolumeMut<'_, T> {
        VolumeMut {
            data: &mut self.data,
            dim: self.dim,
            pitch: self.pitch,
            layout: self.layout,
        }
    }
}

impl<T: Elem> SolverVolume for Volume<T> {
    fn dim(&self) -> ArrayDim {
        self.dim
    }

    fn as_any(&self) -> AnyRef<'_> {
        self.as_ref().into_any()
    }

    fn as_any_mut(&mut self) -> AnyMut<'_> {
        self.as_mut().into_any()
    }

    fn new_same_shape(&self) -> Self {
        Self::new(self.dim, self.layout)
    }
}

// ======================================================================
// VolumeRef - PUBLIC

/// A non-owning read view over a pitched volume buffer.
#[derive(Clone, Copy, Debug)]
pub struct VolumeRef<'a, T: Elem> {
    data: &'a [T],
    dim: ArrayDim,
    pitch: usize,
    layout: Layout,
}

impl<'a, T: Elem> VolumeRef<'a, T> {
    /// Wraps a caller-provided buffer of dense storage size.
    pub fn new(data: &'a [T], dim: ArrayDim, layout: Layout) -> Result<Self, Error> {
        let expected = expected_len::<T>(&dim, layout);
        if data.len() != expected {
            return Err(Error::DifferentLen {
                expected,
                got: data.len(),
            });
        }
        let data_dim = layout.used_data_dim(&dim, mem::size_of::<T>());
        Ok(Self {
            data,
            dim,
            pitch: data_dim.pitch,
            layout,
        })
    }

    /// Shape of the viewed volume.
    pub fn dim(&self) -> ArrayDim {
        self.dim
    }

    /// Data layout of the viewed volume.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// The viewed storage.
    pub fn data(&self) -> &'a [T] {
        self.data
    }

    /// Reads element `(x, y, z, i)`.
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize, i: usize) -> T {
        self.data[elem_offset::<T>(self.layout, &self.dim, self.pitch, x, y, z, i)]
    }

    /// Erases the element type.
    pub fn into_any(self) -> AnyRef<'a> {
        // The closed element set makes this a three-way match on the
        // value level; `T::KIND` picks the variant.
        match T::KIND {
            ElemKind::U8 => AnyRef::U8(cast_ref(self)),
            ElemKind::F32 => AnyRef::F32(cast_ref(self)),
            ElemKind::F64 => AnyRef::F64(cast_ref(self)),
        }
    }
}

fn cast_ref<'a, T: Elem, U: Elem>(v: VolumeRef<'a, T>) -> VolumeRef<'a, U> {
    VolumeRef {
        data: bytemuck::cast_slice(v.data),
        dim: v.dim,
        pitch: v.pitch,
        layout: v.layout,
    }
}

// ======================================================================
// VolumeMut - PUBLIC

/// A non-owning write view over a pitched volume buffer.
#[derive(Debug)]
pub struct VolumeMut<'a, T: Elem> {
    data: &'a mut [T],
    dim: ArrayDim,
    pitch: usize,
    layout: Layout,
}

impl<'a, T: Elem> VolumeMut<'a, T> {
    /// Wraps a caller-provided buffer of dense storage size.
    pub fn new(data: &'a mut [T], dim: ArrayDim, layout: Layout) -> Result<Self, Error> {
        let expected = expected_len::<T>(&dim, layout);
        if data.len() != expected {
            return Err(Error::DifferentLen {
                expected,
                got: data.len(),
            });
        }
        let data_dim = layout.used_data_dim(&dim, mem::size_of::<T>());
        Ok(Self {
            data,
            dim,
            pitch: data_dim.pitch,
            layout,
        })
    }

    /// Shape of the viewed volume.
    pub fn dim(&self) -> ArrayDim {
        self.dim
    }

    /// Data layout of the viewed volume.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// The viewed storage, mutably.
    pub fn data_mut(&mut self) -> &mut [T] {
        self.data
    }

    /// Reads element `(x, y, z, i)`.
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize, i: usize) -> T {
        self.data[elem_offset::<T>(self.layout, &self.dim, self.pitch, x, y, z, i)]
    }

    /// Writes element `(x, y, z, i)`.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, i: usize, value: T) {
        self.data[elem_offset::<T>(self.layout, &self.dim, self.pitch, x, y, z, i)] = value;
    }

    /// Erases the element type.
    pub fn into_any(self) -> AnyMut<'a> {
        match T::KIND {
            ElemKind::U8 => AnyMut::U8(cast_mut(self)),
            ElemKind::F32 => AnyMut::F32(cast_mut(self)),
            ElemKind::F64 => AnyMut::F64(cast_mut(self)),
        }
    }
}

fn cast_mut<'a, T: Elem, U: Elem>(v: VolumeMut<'a, T>) -> VolumeMut<'a, U> {
    VolumeMut {
        data: bytemuck::cast_slice_mut(v.data),
        dim: v.dim,
        pitch: v.pitch,
        layout: v.layout,
    }
}

// ======================================================================
// AnyRef - PUBLIC

/// A read view with the element type erased to its [`ElemKind`].
#[derive(Clone, Copy, Debug)]
pub enum AnyRef<'a> {
    /// View of a `u8` buffer.
    U8(VolumeRef<'a, u8>),
    /// View of an `f32` buffer.
    F32(VolumeRef<'a, f32>),
    /// View of an `f64` buffer.
    F64(VolumeRef<'a, f64>),
}

impl<'a> AnyRef<'a> {
    /// Shape of the viewed volume.
    pub fn dim(&self) -> ArrayDim {
        match self {
            AnyRef::U8(v) => v.dim(),
            AnyRef::F32(v) => v.dim(),
            AnyRef::F64(v) => v.dim(),
        }
    }

    /// Data layout of the viewed volume.
    pub fn layout(&self) -> Layout {
        match self {
            AnyRef::U8(v) => v.layout(),
            AnyRef::F32(v) => v.layout(),
            AnyRef::F64(v) => v.layout(),
        }
    }

    /// Element kind of the viewed volume.
    pub fn elem_kind(&self) -> ElemKind {
        match self {
            AnyRef::U8(_) => ElemKind::U8,
            AnyRef::F32(_) => ElemKind::F32,
            AnyRef::F64(_) => ElemKind::F64,
        }
    }
}

// ======================================================================
// AnyMut - PUBLIC

/// A write view with the element type erased to its [`ElemKind`].
#[derive(Debug)]
pub enum AnyMut<'a> {
    /// View of a `u8` buffer.
    U8(VolumeMut<'a, u8>),
    /// View of an `f32` buffer.
    F32(VolumeMut<'a, f32>),
    /// View of an `f64` buffer.
    F64(VolumeMut<'a, f64>),
}

impl<'a> AnyMut<'a> {
    /// Shape of the viewed volume.
    pub fn dim(&self) -> ArrayDim {
        match self {
            AnyMut::U8(v) => v.dim(),
            AnyMut::F32(v) => v.dim(),
            AnyMut::F64(v) => v.dim(),
        }
    }

    /// Data layout of the viewed volume.
    pub fn layout(&self) -> Layout {
        match self {
            AnyMut::U8(v) => v.layout(),
            AnyMut::F32(v) => v.layout(),
            AnyMut::F64(v) => v.layout(),
        }
    }

    /// Element kind of the viewed volume.
    pub fn elem_kind(&self) -> ElemKind {
        match self {
            AnyMut::U8(_) => ElemKind::U8,
            AnyMut::F32(_) => ElemKind::F32,
            AnyMut::F64(_) => ElemKind::F64,
        }
    }
}

// ======================================================================
// TESTS
