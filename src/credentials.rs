use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use crate::error::ObisError;

pub const URL_KEY: &str = "OPENBIS_URL";
pub const USERNAME_KEY: &str = "OPENBIS_USERNAME";
pub const PASSWORD_KEY: &str = "OPENBIS_PASSWORD";

#[derive(Clone)]
pub struct Credentials {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    /// Environment variables win over the credentials file. `url_fallback`
    /// (usually the configured `openbis_url`) is used when neither sets a URL.
    pub fn load(path: &Path, url_fallback: Option<&str>) -> Result<Self, ObisError> {
        let file_values = if path.exists() {
            read_credentials(path)?
        } else {
            HashMap::new()
        };
        Self::resolve(&file_values, |key| std::env::var(key).ok(), url_fallback)
    }

    fn resolve(
        file_values: &HashMap<String, String>,
        env: impl Fn(&str) -> Option<String>,
        url_fallback: Option<&str>,
    ) -> Result<Self, ObisError> {
        let lookup = |key: &str| {
            env(key)
                .filter(|value| !value.trim().is_empty())
                .or_else(|| file_values.get(key).cloned())
        };

        let url = lookup(URL_KEY)
            .or_else(|| url_fallback.map(|url| url.to_string()))
            .ok_or_else(|| ObisError::MissingCredentials(URL_KEY.to_string()))?;
        let username =
            lookup(USERNAME_KEY).ok_or_else(|| ObisError::MissingCredentials(USERNAME_KEY.to_string()))?;
        let password =
            lookup(PASSWORD_KEY).ok_or_else(|| ObisError::MissingCredentials(PASSWORD_KEY.to_string()))?;

        Ok(Self {
            url,
            username,
            password,
        })
    }
}

/// Reads a dotenv-style credentials file without touching the process
/// environment.
pub fn read_credentials(path: &Path) -> Result<HashMap<String, String>, ObisError> {
    let iter = dotenvy::from_path_iter(path)
        .map_err(|_| ObisError::CredentialsRead(path.to_path_buf()))?;
    Ok(collect_pairs(iter))
}

fn collect_pairs<R: Read>(iter: dotenvy::Iter<R>) -> HashMap<String, String> {
    iter.filter_map(|pair| {
        pair.inspect_err(|err| tracing::warn!(%err, "skipping malformed credentials line"))
            .ok()
    })
    .collect()
}
