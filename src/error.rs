use crate::forms::FieldErrors;
use actix_web::error;
use log::error;
use sled::transaction::TransactionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("record encoding error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("password hashing error: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("corrupt {0} key")]
    Corrupt(&'static str),
    #[error("invalid input: {0}")]
    Validation(FieldErrors),
    #[error("invalid credentials")]
    Auth,
    #[error("{0} not found")]
    NotFound(&'static str),
}

impl Error {
    pub fn taken(field: &'static str) -> Self {
        Error::Validation(FieldErrors::single(field, "Already in use."))
    }
}

impl From<FieldErrors> for Error {
    fn from(errors: FieldErrors) -> Self {
        Error::Validation(errors)
    }
}

impl From<TransactionError<Error>> for Error {
    fn from(err: TransactionError<Error>) -> Self {
        match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => Error::Storage(err),
        }
    }
}

/// Logs the real cause for operators and answers with a generic 500.
pub fn log_error<E: std::fmt::Debug>(err: E, message: &'static str) -> error::Error {
    error!("{}: {:?}", message, err);
    error::ErrorInternalServerError(message)
}
