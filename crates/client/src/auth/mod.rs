pub mod credential;
pub mod refresh;

pub use credential::{Credential, CredentialError};
pub use refresh::{
    refresh_plan, start_refresh_scheduler, AuthState, RefreshClient, RefreshConfig,
    RefreshController, RefreshError, RefreshHandle, RefreshPlan,
};
