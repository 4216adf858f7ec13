//! Top-level error taxonomy used by the sync loop to decide between
//! retrying a batch and shutting down.

use thiserror::Error;

use crate::db::DbError;
use crate::exporters::ExportError;
use crate::jobs::JobError;
use crate::rpc::RpcError;

#[derive(Debug, Error)]
pub enum HemeraError {
    #[error("Retriable error: {0}")]
    Retriable(String),

    #[error("RPC endpoint not reachable: {0}")]
    RpcNotReachable(String),

    #[error("Fast shutdown: {0}")]
    FastShutdown(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("Job '{job}' failed: {source}")]
    Job {
        job: String,
        #[source]
        source: JobError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Re-run the batch.
    Retriable,
    /// Stop the process.
    Crash,
    /// Re-run the batch, counting against the same retry bound.
    Unknown,
}

impl HemeraError {
    pub fn job(job: impl Into<String>, source: JobError) -> Self {
        HemeraError::Job {
            job: job.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            HemeraError::Retriable(_) => ErrorClass::Retriable,
            HemeraError::RpcNotReachable(_) | HemeraError::FastShutdown(_) | HemeraError::Config(_) => {
                ErrorClass::Crash
            }
            HemeraError::Rpc(e) => rpc_class(e),
            HemeraError::Db(e) if e.is_transient() => ErrorClass::Retriable,
            HemeraError::Export(e) if e.is_retryable() => ErrorClass::Retriable,
            HemeraError::Job { source, .. } => match source {
                JobError::Rpc(e) => rpc_class(e),
                JobError::UnresolvedDependency { .. }
                | JobError::NoProducer(_)
                | JobError::DependencyCycle(_) => ErrorClass::Crash,
                e if e.is_retryable() => ErrorClass::Retriable,
                _ => ErrorClass::Unknown,
            },
            _ => ErrorClass::Unknown,
        }
    }
}

fn rpc_class(e: &RpcError) -> ErrorClass {
    if e.is_unreachable() {
        ErrorClass::Crash
    } else if e.is_retryable() {
        ErrorClass::Retriable
    } else {
        ErrorClass::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(HemeraError::Retriable("x".into()).class(), ErrorClass::Retriable);
        assert_eq!(HemeraError::FastShutdown("x".into()).class(), ErrorClass::Crash);
        assert_eq!(HemeraError::Config("x".into()).class(), ErrorClass::Crash);
        assert_eq!(
            HemeraError::Rpc(RpcError::InvalidUrl("bad".into())).class(),
            ErrorClass::Crash
        );
        assert_eq!(
            HemeraError::Rpc(RpcError::RateLimitExceeded).class(),
            ErrorClass::Retriable
        );
        assert_eq!(
            HemeraError::Rpc(RpcError::Decode("bad".into())).class(),
            ErrorClass::Unknown
        );
    }

    #[test]
    fn test_job_errors_follow_their_cause() {
        let missing = HemeraError::job("export_transactions_and_logs", JobError::MissingData("receipt".into()));
        assert_eq!(missing.class(), ErrorClass::Retriable);

        let refused = HemeraError::job(
            "export_blocks",
            JobError::Rpc(RpcError::Transport("Connection refused (os error 111)".into())),
        );
        assert_eq!(refused.class(), ErrorClass::Crash);

        let failed = HemeraError::job("export_traces", JobError::failed("export_traces", "tracer failed"));
        assert_eq!(failed.class(), ErrorClass::Unknown);
        assert!(failed.to_string().contains("export_traces"));
    }
}
