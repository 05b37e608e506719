//! The flat error taxonomy shared by every layer.
//!
//! Every failure a caller can observe is a [`HandleError`]: an [`ErrorKind`]
//! code from a closed set plus a human readable message. Lower level errors
//! (decode, crypto, transport, session, replication) convert into it through
//! `From` implementations defined next to those error types.

use std::fmt;

use thiserror::Error;

use crate::encoding::DecodeError;

/// Closed set of error codes visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorKind {
    /// A value failed validation.
    InvalidValue = 0,
    /// Unexpected internal condition.
    InternalError = 1,
    /// No service is known for the requested handle.
    ServiceNotFound = 2,
    /// No server interface accepts the request.
    NoAcceptableInterfaces = 3,
    /// Unknown transport protocol.
    UnknownProtocol = 4,
    /// Handle already exists.
    HandleAlreadyExists = 5,
    /// Malformed or oversized message.
    MessageFormatError = 6,
    /// Could not reach any server.
    CannotConnectToServer = 7,
    /// Authentication could not be completed.
    UnableToAuthenticate = 8,
    /// Handle does not exist.
    HandleDoesNotExist = 9,
    /// Integrity or signature violation.
    SecurityAlert = 10,
    /// Bad configuration.
    ConfigurationError = 11,
    /// Replication failure.
    ReplicationError = 12,
    /// A signature was missing or did not verify.
    MissingOrInvalidSignature = 13,
    /// A required cryptographic algorithm is unavailable.
    MissingCryptoProvider = 14,
    /// The server reported an error.
    ServerError = 15,
    /// Unknown algorithm identifier.
    UnknownAlgorithmId = 16,
    /// Message expiration has passed.
    GotExpiredMessage = 17,
    /// Storage is read only.
    StorageReadOnly = 18,
    /// The request could not be signed.
    UnableToSignRequest = 19,
    /// Session setup did not complete.
    IncompleteSessionSetup = 20,
    /// The server cannot process session requests.
    ServerCannotProcessSession = 21,
    /// Encryption or decryption failed.
    EncryptionError = 22,
    /// A session counter was seen twice.
    DuplicateSessionCounter = 23,
    /// A service referral could not be followed.
    ServiceReferralError = 24,
    /// A bounded recursion hit its depth limit.
    DepthLimitExceeded = 25,
}

impl ErrorKind {
    /// Returns the numeric code for this kind.
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Returns the kind for a numeric code.
    pub fn from_code(code: u16) -> Option<Self> {
        use ErrorKind::*;
        const ALL: [ErrorKind; 26] = [
            InvalidValue,
            InternalError,
            ServiceNotFound,
            NoAcceptableInterfaces,
            UnknownProtocol,
            HandleAlreadyExists,
            MessageFormatError,
            CannotConnectToServer,
            UnableToAuthenticate,
            HandleDoesNotExist,
            SecurityAlert,
            ConfigurationError,
            ReplicationError,
            MissingOrInvalidSignature,
            MissingCryptoProvider,
            ServerError,
            UnknownAlgorithmId,
            GotExpiredMessage,
            StorageReadOnly,
            UnableToSignRequest,
            IncompleteSessionSetup,
            ServerCannotProcessSession,
            EncryptionError,
            DuplicateSessionCounter,
            ServiceReferralError,
            DepthLimitExceeded,
        ];
        ALL.get(code as usize).copied()
    }

    /// Short upper-case name of the kind.
    pub const fn name(self) -> &'static str {
        match self {
            Self::InvalidValue => "INVALID_VALUE",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ServiceNotFound => "SERVICE_NOT_FOUND",
            Self::NoAcceptableInterfaces => "NO_ACCEPTABLE_INTERFACES",
            Self::UnknownProtocol => "UNKNOWN_PROTOCOL",
            Self::HandleAlreadyExists => "HANDLE_ALREADY_EXISTS",
            Self::MessageFormatError => "MESSAGE_FORMAT_ERROR",
            Self::CannotConnectToServer => "CANNOT_CONNECT_TO_SERVER",
            Self::UnableToAuthenticate => "UNABLE_TO_AUTHENTICATE",
            Self::HandleDoesNotExist => "HANDLE_DOES_NOT_EXIST",
            Self::SecurityAlert => "SECURITY_ALERT",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::ReplicationError => "REPLICATION_ERROR",
            Self::MissingOrInvalidSignature => "MISSING_OR_INVALID_SIGNATURE",
            Self::MissingCryptoProvider => "MISSING_CRYPTO_PROVIDER",
            Self::ServerError => "SERVER_ERROR",
            Self::UnknownAlgorithmId => "UNKNOWN_ALGORITHM_ID",
            Self::GotExpiredMessage => "GOT_EXPIRED_MESSAGE",
            Self::StorageReadOnly => "STORAGE_RDONLY",
            Self::UnableToSignRequest => "UNABLE_TO_SIGN_REQUEST",
            Self::IncompleteSessionSetup => "INCOMPLETE_SESSION_SETUP",
            Self::ServerCannotProcessSession => "SERVER_CANNOT_PROCESS_SESSION",
            Self::EncryptionError => "ENCRYPTION_ERROR",
            Self::DuplicateSessionCounter => "DUPLICATE_SESSION_COUNTER",
            Self::ServiceReferralError => "SERVICE_REFERRAL_ERROR",
            Self::DepthLimitExceeded => "DEPTH_LIMIT_EXCEEDED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned by every public operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct HandleError {
    /// Taxonomy code.
    pub kind: ErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl HandleError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for [`ErrorKind::InternalError`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    /// Shorthand for [`ErrorKind::InvalidValue`].
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidValue, message)
    }

    /// Shorthand for [`ErrorKind::SecurityAlert`].
    pub fn security_alert(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SecurityAlert, message)
    }

    /// Shorthand for [`ErrorKind::DepthLimitExceeded`].
    pub fn depth_limit(limit: usize) -> Self {
        Self::new(
            ErrorKind::DepthLimitExceeded,
            format!("recursion depth limit {limit} exceeded"),
        )
    }

    /// Returns the taxonomy code.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<DecodeError> for HandleError {
    fn from(err: DecodeError) -> Self {
        Self::new(ErrorKind::MessageFormatError, err.to_string())
    }
}

/// Result alias for operations that fail with a [`HandleError`].
pub type HandleResult<T> = Result<T, HandleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in 0..26u16 {
            let kind = ErrorKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(ErrorKind::from_code(26), None);
    }

    #[test]
    fn test_decode_error_is_format_error() {
        let err: HandleError = DecodeError::HandleTooLong(4096).into();
        assert_eq!(err.kind, ErrorKind::MessageFormatError);
        assert!(err.to_string().starts_with("MESSAGE_FORMAT_ERROR"));
    }

    #[test]
    fn test_depth_limit_message() {
        let err = HandleError::depth_limit(5);
        assert_eq!(err.kind(), ErrorKind::DepthLimitExceeded);
        assert!(err.message.contains('5'));
    }
}
