// Fatal relay errors and their process exit codes

use crate::downstream::DownstreamError;
use crate::handles::HandleError;
use crate::pipeline::PipelineConfigError;
use crate::topology::{PeerAddress, ProfileError};
use crate::upstream::UpstreamError;
use std::time::Duration;
use thiserror::Error;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_PROFILE: i32 = 3;
pub const EXIT_ADAPTER_UNAVAILABLE: i32 = 4;
pub const EXIT_CONNECT_TIMEOUT: i32 = 5;
pub const EXIT_CONNECT_REFUSED: i32 = 6;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("Connection to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: PeerAddress, timeout: Duration },
    #[error("Connection to {address} refused: {reason}")]
    ConnectRefused { address: PeerAddress, reason: String },
    #[error("Service discovery failed: {0}")]
    ServiceDiscovery(String),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error("Startup order violated: {0}")]
    StartupOrder(String),
    #[error("Upstream link lost")]
    UpstreamLost,
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineConfigError),
    #[error("Upstream link error: {0}")]
    Upstream(UpstreamError),
    #[error("Downstream server error: {0}")]
    Downstream(DownstreamError),
}

impl RelayError {
    /// Process exit code; 2 is left to argument parsing
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::Profile(_) => EXIT_PROFILE,
            RelayError::AdapterUnavailable(_) => EXIT_ADAPTER_UNAVAILABLE,
            RelayError::ConnectTimeout { .. } => EXIT_CONNECT_TIMEOUT,
            RelayError::ConnectRefused { .. } => EXIT_CONNECT_REFUSED,
            RelayError::ServiceDiscovery(_)
            | RelayError::Handle(_)
            | RelayError::StartupOrder(_)
            | RelayError::UpstreamLost
            | RelayError::Config(_)
            | RelayError::Pipeline(_)
            | RelayError::Upstream(_)
            | RelayError::Downstream(_) => EXIT_FATAL,
        }
    }
}

impl From<UpstreamError> for RelayError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::ConnectTimeout { address, timeout } => {
                RelayError::ConnectTimeout { address, timeout }
            }
            UpstreamError::ConnectRefused { address, reason } => {
                RelayError::ConnectRefused { address, reason }
            }
            UpstreamError::ServiceDiscovery(reason) => RelayError::ServiceDiscovery(reason),
            UpstreamError::AdapterUnavailable(reason) => RelayError::AdapterUnavailable(reason),
            other => RelayError::Upstream(other),
        }
    }
}

impl From<DownstreamError> for RelayError {
    fn from(e: DownstreamError) -> Self {
        match e {
            DownstreamError::AdapterUnavailable(reason) => RelayError::AdapterUnavailable(reason),
            other => RelayError::Downstream(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::HandleSpace;

    #[test]
    fn test_exit_codes_are_distinct() {
        let address: PeerAddress = "C0:11:22:33:44:55".parse().expect("address");
        let cases = [
            (RelayError::Profile(ProfileError::Malformed("x".into())), 3),
            (RelayError::AdapterUnavailable("hci0".into()), 4),
            (
                RelayError::ConnectTimeout {
                    address,
                    timeout: Duration::from_secs(10),
                },
                5,
            ),
            (
                RelayError::ConnectRefused {
                    address,
                    reason: "busy".into(),
                },
                6,
            ),
            (RelayError::ServiceDiscovery("empty".into()), 1),
            (
                RelayError::Handle(HandleError::UnknownHandle {
                    space: HandleSpace::Victim,
                    handle: 1,
                }),
                1,
            ),
            (RelayError::UpstreamLost, 1),
        ];
        for (error, code) in cases {
            assert_eq!(error.exit_code(), code, "{}", error);
        }
    }

    #[test]
    fn test_upstream_errors_keep_their_category() {
        let address: PeerAddress = "C0:11:22:33:44:55".parse().expect("address");
        let timeout = RelayError::from(UpstreamError::ConnectTimeout {
            address,
            timeout: Duration::from_secs(1),
        });
        assert_eq!(timeout.exit_code(), EXIT_CONNECT_TIMEOUT);

        let adapter = RelayError::from(DownstreamError::AdapterUnavailable("down".into()));
        assert_eq!(adapter.exit_code(), EXIT_ADAPTER_UNAVAILABLE);
    }
}
