//! Jobreport math utilities.
//!
//! GPU sensors report "no reading" through reserved blank values rather than
//! through an out-of-band flag. The reductions here treat those values as
//! unknown: they are skipped when summing and averaging, and a reduction with
//! nothing valid to work on yields the blank value again instead of zero.

pub mod measure;
pub mod stat;

pub use measure::{max, mean, min, sum, Measure};
pub use stat::Stat;
