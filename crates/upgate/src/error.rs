use std::path::PathBuf;

use thiserror::Error;
use upgate_core::{CheckError, DownloadError, FailureKind, TransportError, WorkerError};

use crate::policy::PolicyError;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Check(#[from] CheckError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("failed to prepare download directory {}: {source}", path.display())]
    DownloadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ManagerError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Check(error) => error.kind(),
            Self::Download(error) => error.kind(),
            Self::Worker(_) => FailureKind::ShutDown,
            Self::Policy(_) | Self::Transport(_) | Self::DownloadDir { .. } => FailureKind::Local,
        }
    }
}
