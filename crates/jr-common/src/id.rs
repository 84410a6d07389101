//! Job, step and process identifiers.
//!
//! Slurm hands these out as decimal strings; inside jobreport they are plain
//! unsigned integers wrapped so they cannot be swapped by accident.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduler job ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u32);

/// Job step ID. Each `srun` inside an allocation gets its own step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub u32);

/// Global rank of a process within a job step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcId(pub u32);

macro_rules! id_impls {
    ($($ty:ident),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<u32> for $ty {
                fn from(v: u32) -> Self {
                    $ty(v)
                }
            }
        )*
    };
}

id_impls!(JobId, StepId, ProcId);

impl ProcId {
    /// The job-level root process.
    pub fn is_root(self) -> bool {
        self.0 == 0
    }
}

/// Telemetry session name for a process: `<job>_<proc>_<step>`.
///
/// The telemetry service accepts at most 63 bytes, so longer names are cut.
/// The boolean is true when truncation happened.
pub fn session_name(job: JobId, proc: ProcId, step: StepId) -> (String, bool) {
    const MAX_SESSION_NAME: usize = 63;
    let mut name = format!("{}_{}_{}", job, proc, step);
    let truncated = name.len() > MAX_SESSION_NAME;
    name.truncate(MAX_SESSION_NAME);
    (name, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(JobId(1234).to_string(), "1234");
        assert_eq!(StepId(0).to_string(), "0");
    }

    #[test]
    fn test_root() {
        assert!(ProcId(0).is_root());
        assert!(!ProcId(4).is_root());
    }

    #[test]
    fn test_session_name() {
        let (name, truncated) = session_name(JobId(42), ProcId(3), StepId(1));
        assert_eq!(name, "42_3_1");
        assert!(!truncated);
    }

    #[test]
    fn test_serde_transparent() {
        assert_eq!(serde_json::to_string(&JobId(7)).unwrap(), "7");
        let s: StepId = serde_json::from_str("3").unwrap();
        assert_eq!(s, StepId(3));
    }
}
