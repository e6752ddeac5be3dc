use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use ulid::Ulid;

use crate::model::Actor;

/// Shared-password authentication. Every user name is accepted; the name
/// decides the actor the connection acts as.
#[derive(Debug)]
pub struct SharedPasswordAuth {
    password: String,
}

impl SharedPasswordAuth {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPasswordAuth {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// A ULID user name acts as that coach; any other name is a tenant admin.
pub fn actor_for_user(user: Option<&str>) -> Actor {
    match user.and_then(|u| Ulid::from_string(u.trim()).ok()) {
        Some(coach_id) => Actor::Coach(coach_id),
        None => Actor::Admin,
    }
}
