//! Database credentials

use k8s_openapi::api::core::v1::Secret;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Key holding the superuser password in the auth secret
pub const PASSWORD_KEY: &str = "POSTGRES_PASSWORD";

/// Optional key overriding the user name
pub const USER_KEY: &str = "POSTGRES_USER";

/// Who to connect as, and to which database
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub database: String,
    pub user: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(database: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            user: user.into(),
            password: None,
        }
    }

    /// Configured database and user, no password
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(&config.database, &config.user)
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Configured database, with user and password read from an auth secret
    ///
    /// The secret must carry `POSTGRES_PASSWORD`; `POSTGRES_USER` is optional
    /// and falls back to the configured user.
    pub fn from_secret(secret: &Secret, config: &DatabaseConfig) -> Result<Self> {
        let name = secret.metadata.name.as_deref().unwrap_or("<unnamed>");
        let data = secret
            .data
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig(format!("secret {} has no data", name)))?;

        let decode = |key: &str| -> Result<Option<String>> {
            data.get(key)
                .map(|bytes| {
                    String::from_utf8(bytes.0.clone()).map_err(|_| {
                        Error::InvalidConfig(format!("secret {} key {} is not UTF-8", name, key))
                    })
                })
                .transpose()
        };

        let password = decode(PASSWORD_KEY)?.ok_or_else(|| {
            Error::InvalidConfig(format!("secret {} is missing {}", name, PASSWORD_KEY))
        })?;
        let user = decode(USER_KEY)?.unwrap_or_else(|| config.user.clone());

        Ok(Self::new(&config.database, user).with_password(password))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
