//! Per-process job topology.
//!
//! A `JobTopology` is read once when the process starts and never changes
//! afterwards. Everything that needs to know where this process sits in the
//! job (role resolution, output layout, table identity columns) receives it
//! explicitly instead of consulting the environment.

use crate::id::{JobId, ProcId, StepId};
use serde::{Deserialize, Serialize};

/// Everything a process knows about the job it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTopology {
    pub job_id: JobId,
    pub step_id: StepId,
    pub proc_id: ProcId,
    pub user: String,
    pub account: String,
    /// Host this process runs on.
    pub host: String,
    /// GPUs explicitly bound to this process (GPU-per-task binding).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpu_ids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_per_node: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_nodes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_procs: Option<u32>,
    /// Job time limit in seconds, if the scheduler exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_secs: Option<u64>,
}

impl JobTopology {
    /// Minimal topology for a process; counts and bindings left unset.
    pub fn new(job_id: u32, step_id: u32, proc_id: u32) -> Self {
        Self {
            job_id: JobId(job_id),
            step_id: StepId(step_id),
            proc_id: ProcId(proc_id),
            user: String::new(),
            account: String::new(),
            host: String::new(),
            gpu_ids: Vec::new(),
            tasks_per_node: None,
            num_nodes: None,
            num_procs: None,
            time_limit_secs: None,
        }
    }

    pub fn with_identity(
        mut self,
        user: impl Into<String>,
        account: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        self.user = user.into();
        self.account = account.into();
        self.host = host.into();
        self
    }

    pub fn with_tasks_per_node(mut self, tasks_per_node: u32) -> Self {
        self.tasks_per_node = Some(tasks_per_node);
        self
    }

    pub fn with_counts(mut self, num_nodes: u32, num_procs: u32) -> Self {
        self.num_nodes = Some(num_nodes);
        self.num_procs = Some(num_procs);
        self
    }

    pub fn with_gpu_ids(mut self, gpu_ids: Vec<u32>) -> Self {
        self.gpu_ids = gpu_ids;
        self
    }

    pub fn with_time_limit(mut self, secs: u64) -> Self {
        self.time_limit_secs = Some(secs);
        self
    }
}
