use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::model::Actor;
use crate::observability::AUTH_FAILURES_TOTAL;

pub const UNIT_PREFIX: &str = "unit_";

/// Who a login name speaks for: the configured administrator, or a unit
/// given as `unit_<ULID>` or a bare ULID.
pub fn actor_for_user(user: &str, admin_user: &str) -> Option<Actor> {
    if user == admin_user {
        return Some(Actor::Admin);
    }
    let id = user.strip_prefix(UNIT_PREFIX).unwrap_or(user);
    Ulid::from_string(id).ok().map(Actor::Resident)
}

pub fn unknown_user(user: &str) -> PgWireError {
    metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
    tracing::warn!(user, "login refused: user maps to no unit");
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "FATAL".into(),
        "28000".into(),
        format!("user {user} is neither the administrator nor a unit"),
    )))
}

/// Shared password for every login; the user name picks the identity.
#[derive(Debug)]
pub struct CondoAuthSource {
    password: String,
    admin_user: String,
}

impl CondoAuthSource {
    pub fn new(password: String, admin_user: String) -> Self {
        Self {
            password,
            admin_user,
        }
    }
}

#[async_trait]
impl AuthSource for CondoAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if actor_for_user(user, &self.admin_user).is_none() {
            return Err(unknown_user(user));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn admin_user_is_admin() {
        assert_eq!(actor_for_user("admin", "admin"), Some(Actor::Admin));
        assert_eq!(actor_for_user("sindico", "sindico"), Some(Actor::Admin));
    }

    #[test]
    fn unit_logins_are_residents() {
        let unit = Ulid::from_string(UNIT).unwrap();
        assert_eq!(
            actor_for_user(&format!("unit_{UNIT}"), "admin"),
            Some(Actor::Resident(unit))
        );
        assert_eq!(actor_for_user(UNIT, "admin"), Some(Actor::Resident(unit)));
    }

    #[test]
    fn other_logins_map_to_nobody() {
        assert_eq!(actor_for_user("postgres", "admin"), None);
        assert_eq!(actor_for_user("unit_42", "admin"), None);
        assert_eq!(actor_for_user("", "admin"), None);
    }
}
