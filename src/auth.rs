use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Every login shares one server password. The login name only selects the
/// acting user (see `Actor::from_login`).
#[derive(Debug)]
pub struct FleetAuthSource {
    password: String,
}

impl FleetAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for FleetAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(user = ?login.user(), "password check");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
