//! Response codes and their mapping to the error taxonomy.

use std::fmt;

use hs_core::{DecodeError, ErrorKind, HandleError};

macro_rules! response_codes {
    ($($(#[$meta:meta])* $name:ident = $value:literal,)*) => {
        /// Outcome carried in a message header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum ResponseCode {
            $($(#[$meta])* $name = $value,)*
        }

        impl ResponseCode {
            /// Creates from a tag value.
            pub fn from_tag(tag: u32) -> Result<Self, DecodeError> {
                match tag {
                    $($value => Ok(Self::$name),)*
                    _ => Err(DecodeError::InvalidEnumTag(tag)),
                }
            }
        }
    };
}

response_codes! {
    /// Requests carry this code.
    Reserved = 0,
    /// Success.
    Success = 1,
    /// Unspecified error.
    Error = 2,
    /// Server overloaded.
    ServerTooBusy = 3,
    /// Malformed message.
    ProtocolError = 4,
    /// Operation not supported.
    OperationNotSupported = 5,
    /// Recursion count exceeded.
    RecursionCountTooHigh = 6,
    /// Server is backing up.
    ServerBackup = 7,
    /// Handle not found.
    HandleNotFound = 100,
    /// Handle already exists.
    HandleAlreadyExists = 101,
    /// Invalid handle.
    InvalidHandle = 102,
    /// Requested values not found.
    ValuesNotFound = 200,
    /// Value index already used.
    ValueAlreadyExists = 201,
    /// Invalid value.
    InvalidValue = 202,
    /// Client site info is stale.
    OutOfDateSiteInfo = 300,
    /// Server not responsible.
    ServerNotResp = 301,
    /// Follow the service in the body.
    ServiceReferral = 302,
    /// Follow the prefix service in the body.
    PrefixReferral = 303,
    /// Invalid administrator.
    InvalidAdmin = 400,
    /// Administrator lacks permission.
    InsufficientPermissions = 401,
    /// Challenge follows; answer it.
    AuthenticationNeeded = 402,
    /// Challenge answer rejected.
    AuthenticationFailed = 403,
    /// Credential invalid.
    InvalidCredential = 404,
    /// Challenge expired.
    AuthenTimeout = 405,
    /// Authentication could not be performed.
    AuthenError = 406,
    /// Session expired.
    SessionTimeout = 500,
    /// Session setup failed.
    SessionFailed = 501,
    /// Session key invalid.
    InvalidSessionKey = 502,
    /// Server needs an RSA key for the exchange.
    NeedRsaKeyForSessionExchange = 503,
    /// Session setup request invalid.
    InvalidSessionSetupRequest = 504,
    /// Message rejected by the session (e.g. replayed counter).
    SessionMessageRejected = 505,
}

impl ResponseCode {
    /// Returns the tag value.
    pub fn tag(&self) -> u32 {
        *self as u32
    }

    /// True for [`ResponseCode::Success`].
    pub fn is_success(&self) -> bool {
        *self == Self::Success
    }

    /// True for service and prefix referrals.
    pub fn is_referral(&self) -> bool {
        matches!(self, Self::ServiceReferral | Self::PrefixReferral)
    }

    /// Error kind a caller sees for a non-success code.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::HandleNotFound => ErrorKind::HandleDoesNotExist,
            Self::HandleAlreadyExists => ErrorKind::HandleAlreadyExists,
            Self::InvalidHandle
            | Self::ValuesNotFound
            | Self::ValueAlreadyExists
            | Self::InvalidValue => ErrorKind::InvalidValue,
            Self::ServiceReferral | Self::PrefixReferral => ErrorKind::ServiceReferralError,
            Self::InvalidAdmin
            | Self::InsufficientPermissions
            | Self::AuthenticationNeeded
            | Self::AuthenticationFailed
            | Self::InvalidCredential
            | Self::AuthenTimeout
            | Self::AuthenError => ErrorKind::UnableToAuthenticate,
            Self::SessionTimeout
            | Self::SessionFailed
            | Self::InvalidSessionKey
            | Self::InvalidSessionSetupRequest
            | Self::SessionMessageRejected => ErrorKind::ServerCannotProcessSession,
            Self::NeedRsaKeyForSessionExchange => ErrorKind::IncompleteSessionSetup,
            Self::ProtocolError => ErrorKind::MessageFormatError,
            Self::RecursionCountTooHigh => ErrorKind::DepthLimitExceeded,
            Self::Reserved
            | Self::Success
            | Self::Error
            | Self::ServerTooBusy
            | Self::OperationNotSupported
            | Self::ServerBackup
            | Self::OutOfDateSiteInfo
            | Self::ServerNotResp => ErrorKind::ServerError,
        }
    }

    /// Best-effort response code for a server-side error.
    pub fn for_error(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ServiceNotFound | ErrorKind::HandleDoesNotExist => Self::HandleNotFound,
            ErrorKind::HandleAlreadyExists => Self::HandleAlreadyExists,
            ErrorKind::InvalidValue => Self::InvalidValue,
            ErrorKind::MessageFormatError | ErrorKind::GotExpiredMessage => Self::ProtocolError,
            ErrorKind::UnableToAuthenticate
            | ErrorKind::SecurityAlert
            | ErrorKind::MissingOrInvalidSignature => Self::AuthenticationFailed,
            ErrorKind::DuplicateSessionCounter => Self::SessionMessageRejected,
            ErrorKind::ServerCannotProcessSession => Self::SessionFailed,
            ErrorKind::IncompleteSessionSetup => Self::InvalidSessionSetupRequest,
            ErrorKind::StorageReadOnly => Self::OperationNotSupported,
            ErrorKind::DepthLimitExceeded => Self::RecursionCountTooHigh,
            _ => Self::Error,
        }
    }

    /// Converts a non-success code and server message into a caller error.
    pub fn into_error(self, message: impl Into<String>) -> HandleError {
        HandleError::new(self.error_kind(), message)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        assert_eq!(ResponseCode::from_tag(402).unwrap(), ResponseCode::AuthenticationNeeded);
        assert_eq!(ResponseCode::SessionMessageRejected.tag(), 505);
        assert!(ResponseCode::from_tag(999).is_err());
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            ResponseCode::for_error(ErrorKind::ServiceNotFound),
            ResponseCode::HandleNotFound
        );
        assert_eq!(
            ResponseCode::for_error(ErrorKind::ConfigurationError),
            ResponseCode::Error
        );
        assert_eq!(
            ResponseCode::HandleNotFound.error_kind(),
            ErrorKind::HandleDoesNotExist
        );
        assert_eq!(
            ResponseCode::for_error(ErrorKind::DuplicateSessionCounter),
            ResponseCode::SessionMessageRejected
        );
    }
}
