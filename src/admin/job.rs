use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::TaskSpec;

/// Static description of a job and how the scheduler may deploy it.
///
/// Jobs are immutable once in the pool; edits replace the whole record.
/// Running instances operate on a deep copy taken at launch, so pool edits
/// never affect a live run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique id: 128 random bits as lowercase hex.
    pub id: String,
    /// Human-readable name; uniqueness is not enforced.
    pub name: String,
    /// Run in order; the job stops at the first failure.
    pub tasks: Vec<TaskSpec>,
    /// Cap on concurrently auto-scheduled instances. 0 means no cap.
    /// Limits the scheduler only; the operator may launch more by hand.
    pub max_instances: u32,
    /// Weight for the automated scheduler. 0 means never auto-scheduled.
    pub priority: u32,
    /// CPUs this job demands on a slave. The scheduler never pushes a
    /// slave's total demand past its `max_procs`. May be 0.
    pub num_cpu: u32,
}

impl Job {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        Self {
            id: fresh_id(),
            name: name.into(),
            tasks,
            max_instances: 0,
            priority: 0,
            num_cpu: 0,
        }
    }

    /// True for jobs the scheduler would otherwise start forever: positive
    /// priority with neither an instance cap nor a CPU demand.
    pub fn unbounded(&self) -> bool {
        self.priority > 0 && self.max_instances == 0 && self.num_cpu == 0
    }
}

pub fn fresh_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{FileTransfer, Terminate};

    #[test]
    fn json_round_trip_preserves_task_identity() {
        let job = Job {
            id: fresh_id(),
            name: "deploy".into(),
            tasks: vec![
                TaskSpec::FileTransfer(FileTransfer {
                    to_slave: true,
                    master_path: "/srv/build".into(),
                    slave_path: "build".into(),
                }),
                TaskSpec::Terminate(Terminate {}),
            ],
            max_instances: 3,
            priority: 2,
            num_cpu: 1,
        };
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn fresh_ids_are_128_bit_hex() {
        let id = fresh_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, fresh_id());
    }

    #[test]
    fn unbounded_needs_all_three_conditions() {
        let mut job = Job::new("spin", vec![]);
        assert!(!job.unbounded());
        job.priority = 1;
        assert!(job.unbounded());
        job.num_cpu = 1;
        assert!(!job.unbounded());
        job.num_cpu = 0;
        job.max_instances = 5;
        assert!(!job.unbounded());
    }
}
