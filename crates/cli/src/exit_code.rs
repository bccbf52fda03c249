// Process exit codes for the workshop-sync CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/config error
//   11 = authentication error
//   13 = network error

use std::process;

use workshop_sync_client::api::ApiError;
use workshop_sync_client::auth::CredentialError;
use workshop_sync_client::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Auth = 11,
    Network = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(api_err) = cause.downcast_ref::<ApiError>() {
                return Self::from_api_error(api_err);
            }
            if cause.downcast_ref::<CredentialError>().is_some() {
                return Self::Auth;
            }
            if cause.downcast_ref::<ConfigError>().is_some() {
                return Self::Usage;
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut => {
                        Self::Network
                    }
                    _ => Self::Error,
                };
            }
        }

        let msg = format!("{err:#}");
        if msg.contains("no stored session") {
            return Self::Auth;
        }
        Self::Error
    }

    fn from_api_error(err: &ApiError) -> Self {
        match err {
            ApiError::Unauthorized | ApiError::Token(_) => Self::Auth,
            ApiError::Request(_) => Self::Network,
            ApiError::Endpoint(_) | ApiError::Config(_) => Self::Usage,
            ApiError::Status { .. } => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}
