#![doc = include_str!(concat!(env!("OUT_DIR"), "/README-rustdocified.md"))]
#![deny(missing_docs)]

use std::fmt;

pub use crate::{
    par::{EngineKind, Par},
    solver::Solver,
};

use crate::volume::{ArrayDim, SolverVolume};

#[cfg(test)]
mod test_util;

mod par;
mod util;

pub mod dat;
pub mod engine;
pub mod solver;
pub mod volume;

// ======================================================================
// Error - PUBLIC

/// Represents all possible errors that can occur in this library.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A volume shape has a zero extent.
    EmptyDim {
        /// The offending shape.
        dim: ArrayDim,
    },

    /// Two volumes that must have identical shapes do not.
    DifferentDim {
        /// Required shape.
        expected: ArrayDim,
        /// Shape of the given volume.
        got: ArrayDim,
    },

    /// A buffer length does not match the storage size of its shape
    /// and layout.
    DifferentLen {
        /// Required number of elements.
        expected: usize,
        /// Length of the given buffer.
        got: usize,
    },

    /// An execution backend failed to initialize or execute.
    Backend {
        /// Backend-specific description.
        detail: String,
    },
}

// ======================================================================
// Error - IMPL DISPLAY

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EmptyDim { dim } => {
                write!(f, "empty volume shape: {}", dim)
            }

            Error::DifferentDim { expected, got } => {
                write!(f, "different volume shape: expected {}, got {}", expected, got)
            }

            Error::DifferentLen { expected, got } => {
                write!(
                    f,
                    "different buffer length: expected {} elements, got {}",
                    expected, got
                )
            }

            Error::Backend { detail } => {
                write!(f, "backend error: {}", detail)
            }
        }
    }
}

// ======================================================================
// Error - IMPL ERROR

impl std::error::Error for Error {}

// ======================================================================
// FUNCTIONS - PUBLIC

/// Solves in one go using a transient [`Solver`], returning an output
/// volume of the same shape, element kind and layout as the input.
///
/// When solving several volumes, or a temporally coupled sequence,
/// keep a [`Solver`] instead so its working arrays are re-used.
///
/// See [simple usage](crate#simple-usage) for an example.
pub fn solve<V: SolverVolume>(input: &V, par: &Par) -> Result<V, Error> {
    Solver::new().run(input, par)
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{ArrayDim, Layout, Volume};

    #[test]
    fn solve_preserves_shape() {
        let dim = ArrayDim::new(6, 5, 4, 3);
        let input = Volume::<f32>::new(dim, Layout::Layered);

        let mut par = Par::default();
        par.iterations = 5;

        let output = solve(&input, &par).unwrap();
        assert_eq!(output.dim(), dim);
    }

    #[test]
    fn error_messages_are_informative() {
        let message = Error::DifferentDim {
            expected: ArrayDim::new(1, 2, 3, 4),
            got: ArrayDim::new(4, 3, 2, 1),
        }
        .to_string();
        assert_eq!(
            message,
            "different volume shape: expected 1 x 2 x 3 x 4, got 4 x 3 x 2 x 1"
        );

        let message = Error::DifferentLen {
            expected: 64,
            got: 63,
        }
        .to_string();
        assert_eq!(message, "different buffer length: expected 64 elements, got 63");
    }
}
