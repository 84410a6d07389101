//! Jobreport core library.
//!
//! Per-process recording (role resolution, output layout, telemetry session,
//! fragment write), its two-phase start/stop form, and the post-job merge
//! and report.

pub mod exit_codes;
pub mod layout;
pub mod lock;
pub mod merge;
pub mod recorder;
pub mod report;
pub mod session;
pub mod source;
pub mod topology;
pub mod writer;

pub use exit_codes::ExitCode;
pub use layout::{LayoutOptions, OutputMode, OutputPlan, ROOT_MARKER};
pub use merge::{merge_job, merge_path, merge_step, MergeStats, StepMerge};
pub use recorder::{Recorder, RecorderOptions, RunOutcome, WorkloadStatus};
pub use report::{build_reports, render_json, render_text, StepReport};
pub use session::{SessionState, StopOutcome};
pub use source::{GpuSummary, SmiTelemetrySource, StaticTelemetrySource, TelemetrySource};
pub use topology::{resolve_roles, Roles};
pub use writer::write_fragment;
