use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("bad authentication credentials")]
    AuthRejected,

    #[error("link dead: {0}")]
    LinkDead(String),

    #[error("sub-link closed")]
    SubLinkClosed,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("task failed: {0}")]
    TaskLocalFailure(String),

    #[error("remote task failed: {0}")]
    TaskRemoteFailure(String),

    #[error("scheduler is shut down")]
    SchedulerShutdown,

    #[error("master is not accepting new jobs")]
    NotAccepting,

    #[error("job copy failed: {0}")]
    JobCopyFailure(String),

    #[error("job has priority but no instance or CPU bound")]
    UnboundedJob,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the clean end-of-stream case, as opposed to a dead link.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::SubLinkClosed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
