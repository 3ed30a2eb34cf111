use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhenoplierError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("missing column: {0}")]
    MissingColumn(String),

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Input,
    Numerical,
    Environment,
    Other,
}

impl PhenoplierError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PhenoplierError::InvalidInput(_) | PhenoplierError::MissingColumn(_) => {
                FailureKind::Input
            }
            PhenoplierError::Numerical(_) => FailureKind::Numerical,
            PhenoplierError::Resource(_) | PhenoplierError::Io(_) => FailureKind::Environment,
        }
    }
}

impl FailureKind {
    pub fn exit_code(self) -> i32 {
        match self {
            FailureKind::Input => 2,
            FailureKind::Numerical => 3,
            FailureKind::Environment => 4,
            FailureKind::Other => 1,
        }
    }
}

/// Classifies an error by the first typed cause found in its chain.
pub fn failure_kind(err: &anyhow::Error) -> FailureKind {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<PhenoplierError>() {
            return e.kind();
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return FailureKind::Environment;
        }
    }
    FailureKind::Other
}

pub fn exit_code(err: &anyhow::Error) -> i32 {
    failure_kind(err).exit_code()
}

pub type Result<T> = std::result::Result<T, PhenoplierError>;
