use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("probe preempted: {0}")]
    Preempted(String),

    #[error("invalid operation: {0}")]
    InvalidState(String),
}

impl Error {
    /// True for socket errors the state machine absorbs; the pending
    /// retransmit timer covers the lost send.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.raw_os_error(),
                Some(libc::EAGAIN) | Some(libc::ENETDOWN) | Some(libc::ENOBUFS)
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
