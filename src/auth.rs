use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};
use tracing::warn;

use crate::identity::IdentityProvider;
use crate::observability::AUTH_FAILURES_TOTAL;

/// Shared-password login where the user name is an email that must exist in
/// the user directory.
pub struct DirectoryAuthSource {
    password: String,
    identity: Arc<dyn IdentityProvider>,
}

impl DirectoryAuthSource {
    pub fn new(password: String, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { password, identity }
    }
}

impl fmt::Debug for DirectoryAuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryAuthSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthSource for DirectoryAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let email = login.user().unwrap_or_default();
        let known = match self.identity.resolve_user_by_email(email).await {
            Ok(user) => user.is_some(),
            Err(e) => {
                warn!(user = email, "directory lookup failed during login: {e}");
                false
            }
        };
        if !known {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            warn!(user = email, "login rejected: not in user directory");
            return Err(PgWireError::InvalidPassword(email.to_string()));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
