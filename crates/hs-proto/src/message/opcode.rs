//! Operation codes.

use std::fmt;

use hs_core::DecodeError;

/// Operation requested by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    /// Reserved; never sent.
    Reserved = 0,
    /// Resolve a handle.
    Resolution = 1,
    /// Fetch the server's site info.
    GetSiteInfo = 2,

    /// Create a handle.
    CreateHandle = 100,
    /// Delete a handle.
    DeleteHandle = 101,
    /// Add values.
    AddValue = 102,
    /// Remove values.
    RemoveValue = 103,
    /// Modify values.
    ModifyValue = 104,
    /// List handles under a prefix.
    ListHandles = 105,
    /// List derived naming authorities.
    ListNas = 106,

    /// Server challenge to the client.
    ChallengeResponse = 200,
    /// Ask a server to verify a secret-key answer.
    VerifyChallenge = 201,

    /// Home a naming authority.
    HomeNa = 300,
    /// Unhome a naming authority.
    UnhomeNa = 301,
    /// List homed naming authorities.
    ListHomedNas = 302,

    /// Set up a session.
    SessionSetup = 400,
    /// Terminate a session.
    SessionTerminate = 401,
    /// Exchange a session key.
    SessionExchangeKey = 402,
    /// Authenticate a session identity without an operation.
    LoginIdSystem = 403,

    /// Next transaction id on the primary.
    GetNextTxnId = 1000,
    /// Stream transactions since a point.
    RetrieveTxnLog = 1001,
    /// Stream a full dump.
    DumpHandles = 1002,
}

impl Opcode {
    /// Returns the tag value.
    pub fn tag(&self) -> u32 {
        *self as u32
    }

    /// Creates from a tag value.
    pub fn from_tag(tag: u32) -> Result<Self, DecodeError> {
        Ok(match tag {
            0 => Self::Reserved,
            1 => Self::Resolution,
            2 => Self::GetSiteInfo,
            100 => Self::CreateHandle,
            101 => Self::DeleteHandle,
            102 => Self::AddValue,
            103 => Self::RemoveValue,
            104 => Self::ModifyValue,
            105 => Self::ListHandles,
            106 => Self::ListNas,
            200 => Self::ChallengeResponse,
            201 => Self::VerifyChallenge,
            300 => Self::HomeNa,
            301 => Self::UnhomeNa,
            302 => Self::ListHomedNas,
            400 => Self::SessionSetup,
            401 => Self::SessionTerminate,
            402 => Self::SessionExchangeKey,
            403 => Self::LoginIdSystem,
            1000 => Self::GetNextTxnId,
            1001 => Self::RetrieveTxnLog,
            1002 => Self::DumpHandles,
            _ => return Err(DecodeError::InvalidEnumTag(tag)),
        })
    }

    /// True for operations that go to primary sites and need authentication.
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            Self::CreateHandle
                | Self::DeleteHandle
                | Self::AddValue
                | Self::RemoveValue
                | Self::ModifyValue
                | Self::ListHandles
                | Self::ListNas
                | Self::HomeNa
                | Self::UnhomeNa
                | Self::ListHomedNas
                | Self::GetNextTxnId
                | Self::RetrieveTxnLog
                | Self::DumpHandles
        )
    }

    /// True for operations whose success changes stored data.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::CreateHandle
                | Self::DeleteHandle
                | Self::AddValue
                | Self::RemoveValue
                | Self::ModifyValue
                | Self::HomeNa
                | Self::UnhomeNa
        )
    }

    /// True for operations answered with a streamed response over TCP.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::RetrieveTxnLog | Self::DumpHandles)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_roundtrip() {
        for tag in [1, 2, 100, 104, 200, 201, 300, 302, 400, 403, 1000, 1002] {
            assert_eq!(Opcode::from_tag(tag).unwrap().tag(), tag);
        }
        assert!(Opcode::from_tag(7).is_err());
    }

    #[test]
    fn test_classification() {
        assert!(!Opcode::Resolution.is_admin());
        assert!(Opcode::CreateHandle.is_admin());
        assert!(Opcode::HomeNa.is_mutation());
        assert!(!Opcode::ListHandles.is_mutation());
        assert!(Opcode::DumpHandles.is_streaming());
    }
}
