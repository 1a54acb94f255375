use std::io::Error as IoError;
use thiserror::Error;
use tokio::task::JoinError;

pub type BridgeResult<T, E = BridgeError> = Result<T, E>;

/// Driver errors.
///
/// The first group mirrors the error tokens the supervisor protocol knows
/// about; [`BridgeError::wire_token`] yields the exact wire spelling. The
/// second group covers ambient failures (I/O, JSON, task join) that never
/// travel on the wire verbatim.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("device id not found")]
    DeviceIdNotFound,
    #[error("tag not found: {0}")]
    TagNotFound(String),
    #[error("tag not writeable: {0}")]
    TagNotWriteable(String),
    #[error("configuration error: {0}")]
    ConfigError(String),
    #[error("no session for device")]
    EmptySession,
    #[error("write failed: {0}")]
    WriteFail(String),
    #[error("opc connect rejected: {0}")]
    OpcReject(String),
    #[error("transport closed by host")]
    HostClose,
    #[error("subscription terminated")]
    SubscriptionTerminated,
    #[error("connection restarted after parameter change")]
    RestartOnChangeParams,

    #[error("{0}")]
    Io(#[from] IoError),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Join(#[from] JoinError),
    #[error("{0}")]
    Msg(String),
}

impl BridgeError {
    /// Single string token carried in `errorTxt` frames. No hierarchy is
    /// encoded on the wire; ambient errors collapse to `ConfigError`.
    pub fn wire_token(&self) -> &'static str {
        match self {
            BridgeError::DeviceIdNotFound => "DeviceIdNotFound",
            BridgeError::TagNotFound(_) => "TagNotFound",
            BridgeError::TagNotWriteable(_) => "TagNotWriteable",
            BridgeError::ConfigError(_) => "ConfigError",
            BridgeError::EmptySession => "EmptySession",
            BridgeError::WriteFail(_) => "WriteFail",
            BridgeError::OpcReject(_) => "OpcReject",
            BridgeError::HostClose => "HostClose",
            BridgeError::SubscriptionTerminated => "SubscriptionTerminated",
            BridgeError::RestartOnChangeParams => "RestartOnChangeParams",
            BridgeError::Io(_)
            | BridgeError::Json(_)
            | BridgeError::Join(_)
            | BridgeError::Msg(_) => "ConfigError",
        }
    }
}

impl From<String> for BridgeError {
    #[inline]
    fn from(e: String) -> Self {
        BridgeError::Msg(e)
    }
}

impl From<&str> for BridgeError {
    #[inline]
    fn from(e: &str) -> Self {
        BridgeError::Msg(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tokens_match_protocol_spelling() {
        assert_eq!(BridgeError::DeviceIdNotFound.wire_token(), "DeviceIdNotFound");
        assert_eq!(
            BridgeError::TagNotFound("t1".into()).wire_token(),
            "TagNotFound"
        );
        assert_eq!(
            BridgeError::TagNotWriteable("ro".into()).wire_token(),
            "TagNotWriteable"
        );
        assert_eq!(BridgeError::EmptySession.wire_token(), "EmptySession");
        assert_eq!(BridgeError::HostClose.wire_token(), "HostClose");
        assert_eq!(
            BridgeError::SubscriptionTerminated.wire_token(),
            "SubscriptionTerminated"
        );
        assert_eq!(
            BridgeError::RestartOnChangeParams.wire_token(),
            "RestartOnChangeParams"
        );
    }

    #[test]
    fn ambient_errors_collapse_to_config_error() {
        assert_eq!(BridgeError::Msg("boom".into()).wire_token(), "ConfigError");
    }
}
