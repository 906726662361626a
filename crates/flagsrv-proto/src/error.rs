use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlagError {
    #[error("wrong line length: {0}")]
    WrongLength(usize),
    #[error("envelope mismatch")]
    BadEnvelope,
    #[error("undecodable payload")]
    BadPayload,
}
