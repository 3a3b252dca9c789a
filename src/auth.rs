use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};
use tracing::warn;

/// Login name and cleartext password for one role.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Two logins: the public booking role and the business admin role.
#[derive(Debug)]
pub struct SlotwardAuthSource {
    public: Credentials,
    admin: Credentials,
}

impl SlotwardAuthSource {
    pub fn new(public: Credentials, admin: Credentials) -> Self {
        Self { public, admin }
    }

    fn password_for(&self, user: &str) -> Option<&str> {
        [&self.admin, &self.public]
            .into_iter()
            .find(|c| c.user == user)
            .map(|c| c.password.as_str())
    }
}

#[async_trait]
impl AuthSource for SlotwardAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        let Some(password) = self.password_for(user) else {
            warn!("login attempt for unknown user '{user}'");
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::InvalidPassword(user.to_string()));
        };
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SlotwardAuthSource {
        SlotwardAuthSource::new(
            Credentials {
                user: "booking".into(),
                password: "public-pw".into(),
            },
            Credentials {
                user: "owner".into(),
                password: "admin-pw".into(),
            },
        )
    }

    #[test]
    fn each_role_has_its_own_password() {
        let auth = source();
        assert_eq!(auth.password_for("booking"), Some("public-pw"));
        assert_eq!(auth.password_for("owner"), Some("admin-pw"));
        assert_eq!(auth.password_for("mallory"), None);
    }
}
