//! The `tally_core` crate is the numeric engine of the Tally programmable
//! calculator: a root solver, a definite integrator, and the dimensional
//! unit algebra both consume.
//!
//! Key components:
//! - **Units**: unit-expression parsing, base-unit reduction with metric
//!   prefixes and user units, magnitude conversion (`units`).
//! - **Solve**: resumable secant/Ridders root finder (`solve`).
//! - **Integrate**: resumable open-sampling Romberg integrator
//!   (`integrate`).
//! - **Protocol**: the sentinel-frame continuation convention connecting
//!   both engines to the external interpreter (`protocol`).
//! - **Traits**: the `Scalar` numeric bound under the iteration kernels.
//!
//! The engines never call interpreted code; they suspend by returning an
//! evaluation request and are re-entered one result at a time, so a single
//! interpreter thread interleaves them with ordinary program execution.

pub mod error;
pub mod integrate;
pub mod protocol;
pub mod solve;
pub mod traits;
pub mod units;
pub mod value;
