//! Shapes, data layouts and pitched typed arrays for volume data.
//!
//! A volume is a 4D tensor of shape `(w, h, d, c)` with three spatial
//! axes and a channel axis. Every buffer carries a [`Layout`] which
//! maps the logical index `(x, y, z, i)` to a position in pitched
//! storage, and an element kind out of the closed set
//! `{u8, f32, f64}` ([`ElemKind`]).
//!
//! - [`Volume`] owns its storage; [`VolumeRef`] / [`VolumeMut`] are
//!   the borrowing variants for caller-provided buffers.
//! - [`AnyRef`] / [`AnyMut`] erase the element type for conversions
//!   between kinds and layouts ([`convert::copy_any`]).

pub use self::array::{AnyMut, AnyRef, Elem, Volume, VolumeMut, VolumeRef};

mod array;
pub mod convert;

// ======================================================================
// ArrayDim - PUBLIC

/// Shape of a volume: three spatial extents and a channel count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArrayDim {
    /// Width, along the fastest-varying spatial axis.
    pub w: usize,
    /// Height.
    pub h: usize,
    /// Depth. 2D images are represented with `d == 1`.
    pub d: usize,
    /// Number of channels per voxel.
    pub c: usize,
}

impl ArrayDim {
    /// Creates a new shape.
    pub fn new(w: usize, h: usize, d: usize, c: usize) -> Self {
        Self { w, h, d, c }
    }

    /// The spatial part of this shape.
    pub fn dim3(&self) -> Dim3 {
        Dim3 {
            w: self.w,
            h: self.h,
            d: self.d,
        }
    }

    /// Total number of elements, `w * h * d * c`.
    pub fn num_elem(&self) -> usize {
        self.w * self.h * self.d * self.c
    }

    /// Returns `true` if any extent is zero.
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0 || self.d == 0 || self.c == 0
    }

    /// Same shape with a different channel count.
    pub fn with_channels(&self, c: usize) -> Self {
        Self { c, ..*self }
    }
}

impl std::fmt::Display for ArrayDim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} x {} x {} x {}", self.w, self.h, self.d, self.c)
    }
}

// ======================================================================
// Dim3 - PUBLIC

/// Spatial shape of a volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dim3 {
    /// Width.
    pub w: usize,
    /// Height.
    pub h: usize,
    /// Depth.
    pub d: usize,
}

impl Dim3 {
    /// Number of voxels, `w * h * d`.
    pub fn num_voxels(&self) -> usize {
        self.w * self.h * self.d
    }
}

// ======================================================================
// DataDim - PUBLIC

/// Extents of the pitched storage backing a volume.
///
/// Rows of `pitch` bytes (at least the used width), `height` rows per
/// slab and `depth` slabs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataDim {
    /// Byte stride of one row.
    pub pitch: usize,
    /// Number of rows per slab.
    pub height: usize,
    /// Number of slabs.
    pub depth: usize,
}

impl DataDim {
    /// Total storage size in bytes.
    pub fn num_bytes(&self) -> usize {
        self.pitch * self.height * self.depth
    }
}

// ======================================================================
// DataIndex - PUBLIC

/// Storage position of one element: `x` in elements along the fast
/// axis, `y` the row, `z` the slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataIndex {
    /// Element index along the fast axis.
    pub x: usize,
    /// Row index.
    pub y: usize,
    /// Slab index.
    pub z: usize,
}

// ======================================================================
// Layout - PUBLIC

/// Mapping from the logical index `(x, y, z, i)` to pitched storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    /// Channels stacked along the depth axis; storage `(w, h, d * c)`.
    Layered,
    /// As [`Layout::Layered`] with `x` and `z` swapped; storage
    /// `(d, h, w * c)`.
    LayeredTransposed,
    /// Channels interleaved at each voxel; storage `(c * w, h, d)`.
    Interlaced,
    /// As [`Layout::Interlaced`] with the channel order reversed.
    InterlacedReversed,
}

impl Layout {
    /// Storage position of element `(x, y, z, i)`.
    #[inline]
    pub fn data_index(self, x: usize, y: usize, z: usize, i: usize, dim: &ArrayDim) -> DataIndex {
        match self {
            Layout::Layered => DataIndex {
                x,
                y,
                z: z + dim.d * i,
            },
            Layout::LayeredTransposed => DataIndex {
                x: z,
                y,
                z: x + dim.w * i,
            },
            Layout::Interlaced => DataIndex {
                x: i + dim.c * x,
                y,
                z,
            },
            Layout::InterlacedReversed => DataIndex {
                x: (dim.c - 1 - i) + dim.c * x,
                y,
                z,
            },
        }
    }

    /// Storage extents for a volume of shape `dim` with elements of
    /// `elem_size` bytes. The returned pitch is the used row width;
    /// an allocator may pad it.
    pub fn used_data_dim(self, dim: &ArrayDim, elem_size: usize) -> DataDim {
        match self {
            Layout::Layered => DataDim {
                pitch: dim.w * elem_size,
                height: dim.h,
                depth: dim.d * dim.c,
            },
            Layout::LayeredTransposed => DataDim {
                pitch: dim.d * elem_size,
                height: dim.h,
                depth: dim.w * dim.c,
            },
            Layout::Interlaced | Layout::InterlacedReversed => DataDim {
                pitch: dim.c * dim.w * elem_size,
                height: dim.h,
                depth: dim.d,
            },
        }
    }
}

// ======================================================================
// ElemKind - PUBLIC

/// Element kind of a type-erased volume buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElemKind {
    /// Unsigned byte, mapped to `[0, 1]` when converted to a real kind.
    U8,
    /// Single precision.
    F32,
    /// Double precision.
    F64,
}

impl ElemKind {
    /// Element size in bytes.
    pub fn size(self) -> usize {
        match self {
            ElemKind::U8 => 1,
            ElemKind::F32 => 4,
            ElemKind::F64 => 8,
        }
    }
}

// ======================================================================
// SolverVolume - PUBLIC

/// An input/output volume the solver can consume and produce.
///
/// Implemented by [`Volume`] for all supported element kinds and
/// layouts; external storage can participate by exposing its buffer
/// through the untyped views.
pub trait SolverVolume {
    /// Shape of this volume.
    fn dim(&self) -> ArrayDim;

    /// Untyped read view of the storage.
    fn as_any(&self) -> AnyRef<'_>;

    /// Untyped write view of the storage.
    fn as_any_mut(&mut self) -> AnyMut<'_>;

    /// Creates an empty volume of the same shape, kind and layout,
    /// used to hold the solver output.
    fn new_same_shape(&self) -> Self
    where
        Self: Sized;
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Layout

    #[test]
    fn layered_stacks_channels_along_depth() {
        let dim = ArrayDim::new(4, 3, 2, 5);
        assert_eq!(
            Layout::Layered.data_index(1, 2, 1, 3, &dim),
            DataIndex { x: 1, y: 2, z: 7 }
        );
        assert_eq!(
            Layout::Layered.used_data_dim(&dim, 4),
            DataDim {
                pitch: 16,
                height: 3,
                depth: 10
            }
        );
    }

    #[test]
    fn layered_transposed_swaps_x_and_z() {
        let dim = ArrayDim::new(4, 3, 2, 5);
        assert_eq!(
            Layout::LayeredTransposed.data_index(1, 2, 1, 3, &dim),
            DataIndex { x: 1, y: 2, z: 13 }
        );
        assert_eq!(
            Layout::LayeredTransposed.used_data_dim(&dim, 4),
            DataDim {
                pitch: 8,
                height: 3,
                depth: 20
            }
        );
    }

    #[test]
    fn interlaced_interleaves_channels() {
        let dim = ArrayDim::new(4, 3, 2, 5);
        assert_eq!(
            Layout::Interlaced.data_index(1, 2, 1, 3, &dim),
            DataIndex { x: 8, y: 2, z: 1 }
        );
        assert_eq!(
            Layout::InterlacedReversed.data_index(1, 2, 1, 3, &dim),
            DataIndex { x: 6, y: 2, z: 1 }
        );
        assert_eq!(
            Layout::Interlaced.used_data_dim(&dim, 1),
            DataDim {
                pitch: 20,
                height: 3,
                depth: 2
            }
        );
    }

    // ============================================================
    // ArrayDim

    #[test]
    fn dim_helpers() {
        let dim = ArrayDim::new(4, 3, 2, 5);
        assert_eq!(dim.num_elem(), 120);
        assert_eq!(dim.dim3().num_voxels(), 24);
        assert_eq!(dim.with_channels(1), ArrayDim::new(4, 3, 2, 1));
        assert!(!dim.is_empty());
        assert!(ArrayDim::new(4, 0, 2, 5).is_empty());
        assert_eq!(dim.to_string(), "4 x 3 x 2 x 5");
    }
}
