//! Min/max/average triples.

use crate::measure::{self, Measure};
use serde::{Deserialize, Serialize};

/// Summary of one metric over a window: minimum, maximum and average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stat<T> {
    pub min: T,
    pub max: T,
    pub avg: T,
}

impl<T: Measure> Stat<T> {
    pub fn new(min: T, max: T, avg: T) -> Self {
        Self { min, max, avg }
    }

    /// A metric for which no reading was available.
    pub fn unknown() -> Self {
        Self {
            min: T::SENTINEL,
            max: T::SENTINEL,
            avg: T::SENTINEL,
        }
    }

    /// Summarize raw samples. Sentinel samples are ignored.
    pub fn from_samples(samples: &[T]) -> Self {
        Self {
            min: measure::min(samples).unwrap_or(T::SENTINEL),
            max: measure::max(samples).unwrap_or(T::SENTINEL),
            avg: measure::mean(samples),
        }
    }

    /// Whether every field is known.
    pub fn is_complete(&self) -> bool {
        !(self.min.is_sentinel() || self.max.is_sentinel() || self.avg.is_sentinel())
    }
}
