//! Engine status mapping.
//!
//! The management API reports HRESULT-style statuses; the closed set below
//! is what the control plane distinguishes. Unrecognized statuses are
//! preserved verbatim so nothing is lost on the way to the audit log.

use thiserror::Error;

use flowgate_common::Error;

/// Raw status codes recognized from the platform.
pub mod codes {
    pub const E_ACCESS_DENIED: u32 = 0x8007_0005;
    pub const FWP_E_FILTER_NOT_FOUND: u32 = 0x8032_0003;
    pub const FWP_E_PROVIDER_NOT_FOUND: u32 = 0x8032_0005;
    pub const FWP_E_SUBLAYER_NOT_FOUND: u32 = 0x8032_0007;
    pub const FWP_E_NOT_FOUND: u32 = 0x8032_0008;
    pub const FWP_E_ALREADY_EXISTS: u32 = 0x8032_0009;
    pub const FWP_E_IN_USE: u32 = 0x8032_000A;
    pub const FWP_E_NO_TXN_IN_PROGRESS: u32 = 0x8032_000D;
    pub const FWP_E_TXN_IN_PROGRESS: u32 = 0x8032_000E;
    pub const FWP_E_TXN_ABORTED: u32 = 0x8032_000F;
    pub const FWP_E_SESSION_ABORTED: u32 = 0x8032_0010;
    pub const FWP_E_INVALID_PARAMETER: u32 = 0x8032_0035;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WfpError {
    #[error("access denied by the filtering engine")]
    AccessDenied,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
    #[error("object is in use")]
    InUse,
    #[error("filter not found")]
    FilterNotFound,
    #[error("provider not found")]
    ProviderNotFound,
    #[error("sublayer not found")]
    SublayerNotFound,
    #[error("session aborted")]
    SessionAborted,
    #[error("filtering engine status {0:#010x}")]
    Status(u32),
}

impl WfpError {
    pub fn from_status(status: u32) -> Self {
        match status {
            codes::E_ACCESS_DENIED => Self::AccessDenied,
            codes::FWP_E_INVALID_PARAMETER => Self::InvalidParameter,
            codes::FWP_E_NOT_FOUND => Self::NotFound,
            codes::FWP_E_ALREADY_EXISTS => Self::AlreadyExists,
            codes::FWP_E_IN_USE => Self::InUse,
            codes::FWP_E_FILTER_NOT_FOUND => Self::FilterNotFound,
            codes::FWP_E_PROVIDER_NOT_FOUND => Self::ProviderNotFound,
            codes::FWP_E_SUBLAYER_NOT_FOUND => Self::SublayerNotFound,
            codes::FWP_E_SESSION_ABORTED | codes::FWP_E_TXN_ABORTED => Self::SessionAborted,
            other => Self::Status(other),
        }
    }

    /// The underlying numeric status, preserved for the audit trail.
    pub fn status(&self) -> u32 {
        match self {
            Self::AccessDenied => codes::E_ACCESS_DENIED,
            Self::InvalidParameter => codes::FWP_E_INVALID_PARAMETER,
            Self::NotFound => codes::FWP_E_NOT_FOUND,
            Self::AlreadyExists => codes::FWP_E_ALREADY_EXISTS,
            Self::InUse => codes::FWP_E_IN_USE,
            Self::FilterNotFound => codes::FWP_E_FILTER_NOT_FOUND,
            Self::ProviderNotFound => codes::FWP_E_PROVIDER_NOT_FOUND,
            Self::SublayerNotFound => codes::FWP_E_SUBLAYER_NOT_FOUND,
            Self::SessionAborted => codes::FWP_E_SESSION_ABORTED,
            Self::Status(code) => *code,
        }
    }

    /// Deletions racing an external removal are not failures.
    pub fn is_benign_on_delete(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::FilterNotFound | Self::ProviderNotFound | Self::SublayerNotFound
        )
    }
}

impl From<WfpError> for Error {
    fn from(err: WfpError) -> Self {
        match err {
            WfpError::AccessDenied => Error::AccessDenied(
                "the filtering engine refused the session; run as the service principal".into(),
            ),
            other => Error::Wfp {
                code: other.status(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_common::ErrorKind;

    #[test]
    fn status_roundtrip() {
        for status in [
            codes::E_ACCESS_DENIED,
            codes::FWP_E_ALREADY_EXISTS,
            codes::FWP_E_FILTER_NOT_FOUND,
            codes::FWP_E_IN_USE,
            0xDEAD_BEEF,
        ] {
            assert_eq!(WfpError::from_status(status).status(), status);
        }
    }

    #[test]
    fn access_denied_maps_to_its_own_kind() {
        let err: Error = WfpError::AccessDenied.into();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        let err: Error = WfpError::InUse.into();
        assert_eq!(err.kind(), ErrorKind::WfpError);
    }

    #[test]
    fn benign_delete_outcomes() {
        assert!(WfpError::FilterNotFound.is_benign_on_delete());
        assert!(WfpError::NotFound.is_benign_on_delete());
        assert!(!WfpError::InUse.is_benign_on_delete());
    }
}
