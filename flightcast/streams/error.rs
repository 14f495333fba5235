use std::time::Duration;

use thiserror::Error;

/// Runtime-level failures. Row-level problems never surface here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// A worker task panicked or returned an error; it is not restarted.
    #[error("{role} task {worker} failed: {cause}")]
    WorkerFault {
        /// Worker index; 0 for the single `replicator` and `sink` tasks.
        worker: usize,
        /// Supervised task kind: `worker`, `replicator` or `sink`.
        role: &'static str,
        /// Panic message or error chain.
        cause: String,
    },
    /// Workers were still running when the grace period ran out.
    #[error("{pending} task(s) still running after {grace:?}; abandoned")]
    ShutdownTimeout {
        /// Grace period that elapsed.
        grace: Duration,
        /// Tasks aborted.
        pending: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_name_the_task_kind() {
        let fault = PipelineError::WorkerFault {
            worker: 1,
            role: "worker",
            cause: "poisoned row".into(),
        };
        assert_eq!(fault.to_string(), "worker task 1 failed: poisoned row");
        let sink = PipelineError::WorkerFault {
            worker: 0,
            role: "sink",
            cause: "disk full".into(),
        };
        assert_eq!(sink.to_string(), "sink task 0 failed: disk full");
    }
}
