//! Copying volumes across element kinds and data layouts.
//!
//! [`copy_any`] is the single entry point: matching kind and layout
//! turns into a block copy of the dense storage, everything else goes
//! through element-wise conversion with per-index address lookup.
//! `u8` data is mapped to the real range `[0, 1]` and back.

use crate::{
    volume::{AnyMut, AnyRef, Elem, VolumeMut, VolumeRef},
    Error,
};

// ======================================================================
// FromElem - PUBLIC

/// Value conversion between the supported element kinds.
///
/// Bytes map to reals as `v / 255`; reals map to bytes by rounding
/// `v * 255` and clamping to `[0, 255]`.
pub trait FromElem<S> {
    /// Converts one element.
    fn from_elem(s: S) -> Self;
}

impl FromElem<u8> for u8 {
    fn from_elem(s: u8) -> u8 {
        s
    }
}

impl FromElem<u8> for f32 {
    fn from_elem(s: u8) -> f32 {
        f32::from(s) / 255.0
    }
}

impl FromElem<u8> for f64 {
    fn from_elem(s: u8) -> f64 {
        f64::from(s) / 255.0
    }
}

impl FromElem<f32> for u8 {
    fn from_elem(s: f32) -> u8 {
        real_to_byte(f64::from(s))
    }
}

impl FromElem<f32> for f32 {
    fn from_elem(s: f32) -> f32 {
        s
    }
}

impl FromElem<f32> for f64 {
    fn from_elem(s: f32) -> f64 {
        f64::from(s)
    }
}

impl FromElem<f64> for u8 {
    fn from_elem(s: f64) -> u8 {
        real_to_byte(s)
    }
}

impl FromElem<f64> for f32 {
    fn from_elem(s: f64) -> f32 {
        s as f32
    }
}

impl FromElem<f64> for f64 {
    fn from_elem(s: f64) -> f64 {
        s
    }
}

fn real_to_byte(v: f64) -> u8 {
    let scaled = v * 255.0 + 0.5;
    if scaled <= 0.0 {
        0
    } else if scaled >= 255.0 {
        255
    } else {
        scaled as u8
    }
}

// ======================================================================
// FUNCTIONS - PUBLIC

/// Copies `src` into `dst`, converting element kind and layout as
/// needed. The shapes must be identical.
pub fn copy_any(dst: AnyMut<'_>, src: AnyRef<'_>) -> Result<(), Error> {
    if dst.dim() != src.dim() {
        return Err(Error::DifferentDim {
            expected: dst.dim(),
            got: src.dim(),
        });
    }

    match (dst, src) {
        // Matching kinds keep the block-copy fast path when the
        // layout matches too.
        (AnyMut::U8(out), AnyRef::U8(inp)) => copy_samekind(out, inp),
        (AnyMut::F32(out), AnyRef::F32(inp)) => copy_samekind(out, inp),
        (AnyMut::F64(out), AnyRef::F64(inp)) => copy_samekind(out, inp),

        (AnyMut::U8(out), AnyRef::F32(inp)) => copy_convert(out, inp),
        (AnyMut::U8(out), AnyRef::F64(inp)) => copy_convert(out, inp),
        (AnyMut::F32(out), AnyRef::U8(inp)) => copy_convert(out, inp),
        (AnyMut::F32(out), AnyRef::F64(inp)) => copy_convert(out, inp),
        (AnyMut::F64(out), AnyRef::U8(inp)) => copy_convert(out, inp),
        (AnyMut::F64(out), AnyRef::F32(inp)) => copy_convert(out, inp),
    }

    Ok(())
}

// ======================================================================
// FUNCTIONS - PRIVATE

fn copy_samekind<T: Elem + FromElem<T>>(mut out: VolumeMut<'_, T>, inp: VolumeRef<'_, T>) {
    if out.layout() == inp.layout() {
        // Host storage is dense, so matching layouts mean matching
        // lengths and a single block copy.
        out.data_mut().copy_from_slice(inp.data());
    } else {
        copy_convert(out, inp);
    }
}

// Element-wise copy, iterating in an order friendly to the layered
// output case: slabs outermost, fast axis innermost.
fn copy_convert<TO, TI>(mut out: VolumeMut<'_, TO>, inp: VolumeRef<'_, TI>)
where
    TO: Elem + FromElem<TI>,
    TI: Elem,
{
    let dim = out.dim();
    for z in 0..dim.d {
        for i in 0..dim.c {
            for y in 0..dim.h {
                for x in 0..dim.w {
                    out.set(x, y, z, i, TO::from_elem(inp.get(x, y, z, i)));
                }
            }
        }
    }
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{ArrayDim, Layout, SolverVolume, Volume};

    fn counting_volume(dim: ArrayDim, layout: Layout) -> Volume<u8> {
        let mut v = Volume::new(dim, layout);
        let mut value = 0u8;
        for z in 0..dim.d {
            for y in 0..dim.h {
                for x in 0..dim.w {
                    for i in 0..dim.c {
                        v.set(x, y, z, i, value);
                        value = value.wrapping_add(7);
                    }
                }
            }
        }
        v
    }

    // ============================================================
    // ROUNDTRIP

    #[test]
    fn layered_interlaced_roundtrip_is_identity() {
        let dim = ArrayDim::new(5, 4, 3, 3);
        let original = counting_volume(dim, Layout::Layered);

        let mut interlaced = Volume::<u8>::new(dim, Layout::Interlaced);
        copy_any(interlaced.as_any_mut(), original.as_any()).unwrap();

        let mut back = Volume::<u8>::new(dim, Layout::Layered);
        copy_any(back.as_any_mut(), interlaced.as_any()).unwrap();

        assert_eq!(back, original);
    }

    #[test]
    fn real_roundtrip_through_all_layouts() {
        let dim = ArrayDim::new(4, 3, 2, 2);
        let mut original = Volume::<f64>::new(dim, Layout::Layered);
        for (n, x) in original.data_mut().iter_mut().enumerate() {
            *x = n as f64 * 0.125;
        }

        let mut step = original.clone();
        for layout in [
            Layout::LayeredTransposed,
            Layout::InterlacedReversed,
            Layout::Interlaced,
            Layout::Layered,
        ] {
            let mut next = Volume::<f64>::new(dim, layout);
            copy_any(next.as_any_mut(), step.as_any()).unwrap();
            step = next;
        }
        assert_eq!(step, original);
    }

    // ============================================================
    // KIND CONVERSION

    #[test]
    fn byte_to_real_and_back() {
        let dim = ArrayDim::new(2, 1, 1, 1);
        let bytes = Volume::from_vec(vec![0u8, 255], dim, Layout::Interlaced).unwrap();

        let mut reals = Volume::<f32>::new(dim, Layout::Layered);
        copy_any(reals.as_any_mut(), bytes.as_any()).unwrap();
        assert_eq!(reals.get(0, 0, 0, 0), 0.0);
        assert_eq!(reals.get(1, 0, 0, 0), 1.0);

        let mut back = Volume::<u8>::new(dim, Layout::Interlaced);
        copy_any(back.as_any_mut(), reals.as_any()).unwrap();
        assert_eq!(back, bytes);
    }

    #[test]
    fn every_byte_value_survives_f32_roundtrip() {
        let dim = ArrayDim::new(256, 1, 1, 1);
        let bytes: Vec<u8> = (0..=255).collect();
        let original = Volume::from_vec(bytes, dim, Layout::Layered).unwrap();

        let mut reals = Volume::<f32>::new(dim, Layout::Layered);
        copy_any(reals.as_any_mut(), original.as_any()).unwrap();
        let mut back = Volume::<u8>::new(dim, Layout::Layered);
        copy_any(back.as_any_mut(), reals.as_any()).unwrap();

        assert_eq!(back, original);
    }

    #[test]
    fn real_to_byte_clamps() {
        assert_eq!(real_to_byte(-0.5), 0);
        assert_eq!(real_to_byte(0.0), 0);
        assert_eq!(real_to_byte(1.0), 255);
        assert_eq!(real_to_byte(2.0), 255);
        assert_eq!(real_to_byte(0.5), 128);
    }

    // ============================================================
    // ERRORS

    #[test]
    fn different_dim_is_rejected() {
        let a = Volume::<u8>::new(ArrayDim::new(2, 2, 1, 1), Layout::Layered);
        let mut b = Volume::<u8>::new(ArrayDim::new(2, 3, 1, 1), Layout::Layered);
        assert_eq!(
            copy_any(b.as_any_mut(), a.as_any()),
            Err(Error::DifferentDim {
                expected: ArrayDim::new(2, 3, 1, 1),
                got: ArrayDim::new(2, 2, 1, 1),
            })
        );
    }
}
