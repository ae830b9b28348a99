use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use log::error;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level error codes returned to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiCode {
    BadRequest = 0,
    InternalError = 1,
    VspClosed = 2,
    FeeAlreadyReceived = 3,
    InvalidFeeTx = 4,
    FeeTooSmall = 5,
    UnknownTicket = 6,
    TicketCannotVote = 7,
    FeeExpired = 8,
    InvalidVoteChoices = 9,
    BadSignature = 10,
    InvalidPrivKey = 11,
    FeeNotReceived = 12,
    InvalidTicket = 13,
    CannotBroadcastTicket = 14,
    CannotBroadcastFee = 15,
    CannotBroadcastFeeUnknownOutputs = 16,
    InvalidTimestamp = 17,
}

impl ApiCode {
    pub fn http_status(self) -> StatusCode {
        match self {
            ApiCode::InternalError
            | ApiCode::CannotBroadcastTicket
            | ApiCode::CannotBroadcastFee => StatusCode::INTERNAL_SERVER_ERROR,
            ApiCode::CannotBroadcastFeeUnknownOutputs => StatusCode::PRECONDITION_REQUIRED,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ApiCode::BadRequest => "bad request",
            ApiCode::InternalError => "internal error",
            ApiCode::VspClosed => "vsp is closed",
            ApiCode::FeeAlreadyReceived => "fee tx already received for ticket",
            ApiCode::InvalidFeeTx => "invalid fee tx",
            ApiCode::FeeTooSmall => "fee too small",
            ApiCode::UnknownTicket => "unknown ticket",
            ApiCode::TicketCannotVote => "ticket not eligible to vote",
            ApiCode::FeeExpired => "fee has expired",
            ApiCode::InvalidVoteChoices => "invalid vote choices",
            ApiCode::BadSignature => "bad request signature",
            ApiCode::InvalidPrivKey => "invalid private key",
            ApiCode::FeeNotReceived => "no fee tx received for ticket",
            ApiCode::InvalidTicket => "not a valid ticket tx",
            ApiCode::CannotBroadcastTicket => "ticket transaction could not be broadcast",
            ApiCode::CannotBroadcastFee => "fee transaction could not be broadcast",
            ApiCode::CannotBroadcastFeeUnknownOutputs => {
                "fee transaction could not be broadcast due to unknown outputs"
            }
            ApiCode::InvalidTimestamp => "old or reused timestamp",
        }
    }
}

/// JSON error envelope sent to clients. The client SDK decodes this and
/// exposes the code for programmatic handling.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ErrorResponse {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{message}")]
    Api { code: ApiCode, message: String },

    #[error("database error: {0}")]
    Db(String),

    #[error("node RPC error: {0}")]
    NodeRpc(String),

    #[error("wallet RPC error: {0}")]
    WalletRpc(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn api(code: ApiCode, message: impl Into<String>) -> Self {
        Error::Api {
            code,
            message: message.into(),
        }
    }

    pub fn code(code: ApiCode) -> Self {
        Error::Api {
            code,
            message: code.default_message().to_owned(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// The wire code this error collapses to. Anything that is not an
    /// explicit API error is reported as an internal failure so database
    /// and RPC details never leak to clients.
    pub fn api_code(&self) -> ApiCode {
        match self {
            Error::Api { code, .. } => *code,
            _ => ApiCode::InternalError,
        }
    }

    pub fn envelope(&self) -> ErrorResponse {
        let code = self.api_code();
        let message = match self {
            Error::Api { message, .. } => message.clone(),
            _ => code.default_message().to_owned(),
        };
        ErrorResponse {
            code: code as i32,
            message,
        }
    }
}

impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Error::Db(e.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Db(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Db(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Db(e.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Db(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Db(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("io error: {}", e))
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        self.api_code().http_status()
    }

    fn error_response(&self) -> HttpResponse {
        error!("{}", self);
        HttpResponse::build(self.status_code()).json(self.envelope())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_codes_map_to_http_status() {
        assert_eq!(ApiCode::BadRequest.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiCode::InternalError.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiCode::CannotBroadcastFeeUnknownOutputs.http_status(),
            StatusCode::PRECONDITION_REQUIRED
        );
        assert_eq!(
            ApiCode::CannotBroadcastTicket.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ApiCode::FeeExpired.http_status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn internal_details_do_not_leak() {
        let err = Error::Db("table corrupted".to_owned());
        let env = err.envelope();
        assert_eq!(env.code, ApiCode::InternalError as i32);
        assert_eq!(env.message, "internal error");

        let err = Error::code(ApiCode::FeeExpired);
        let env = err.envelope();
        assert_eq!(env.code, 8);
        assert_eq!(env.message, "fee has expired");
    }
}
