use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_API_HOST: &str = "https://developer-api.nest.com";
pub const DEFAULT_AUTH_URL: &str = "https://home.nest.com/login/oauth2";
pub const DEFAULT_TOKEN_URL: &str = "https://api.home.nest.com/oauth2/access_token";
pub const DEFAULT_CALLBACK_PORT: u16 = 9180;
pub const DEFAULT_CALLBACK_PATH: &str = "/authorize";

const APP_DIR: &str = "nest-remote";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the data API.
    pub api_host: String,
    /// Browser-facing authorization endpoint (overridden by the client secret file).
    pub auth_url: String,
    /// Token exchange endpoint (overridden by the client secret file).
    pub token_url: String,
    pub callback_port: u16,
    pub callback_path: String,
    /// Upper bound for any single network call, including redirect hops.
    pub http_timeout: Duration,
    /// Age after which passive reads re-sync the cache.
    pub cache_max_age: Duration,
    /// Holds config.json and client_secret.json.
    pub data_dir: PathBuf,
    /// Holds cache.json and sync.lock.
    pub cache_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let data_dir = match env::var_os("NEST_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::config_dir()
                .ok_or_else(|| Error::InvalidInput("Could not determine config directory".into()))?
                .join(APP_DIR),
        };
        let cache_dir = match env::var_os("NEST_CACHE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::cache_dir()
                .ok_or_else(|| Error::InvalidInput("Could not determine cache directory".into()))?
                .join(APP_DIR),
        };

        Ok(Self {
            api_host: env_or("NEST_API_HOST", DEFAULT_API_HOST),
            auth_url: env_or("NEST_AUTH_URL", DEFAULT_AUTH_URL),
            token_url: env_or("NEST_TOKEN_URL", DEFAULT_TOKEN_URL),
            callback_port: env_parse("NEST_CALLBACK_PORT", DEFAULT_CALLBACK_PORT)?,
            callback_path: env_or("NEST_CALLBACK_PATH", DEFAULT_CALLBACK_PATH),
            http_timeout: Duration::from_secs(env_parse("NEST_HTTP_TIMEOUT_SECS", 30)?),
            cache_max_age: Duration::from_secs(env_parse("NEST_CACHE_MAX_AGE_SECS", 300)?),
            data_dir,
            cache_dir,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn client_secret_file(&self) -> PathBuf {
        self.data_dir.join("client_secret.json")
    }

    pub fn cache_file(&self) -> PathBuf {
        self.cache_dir.join("cache.json")
    }

    pub fn sync_lock_file(&self) -> PathBuf {
        self.cache_dir.join("sync.lock")
    }

    /// Redirect URI registered with the provider for the local callback.
    /// Names the IPv4 loopback the listener binds, not `localhost`, which may
    /// resolve to `::1` first.
    pub fn redirect_uri(&self) -> String {
        format!(
            "http://127.0.0.1:{}{}",
            self.callback_port, self.callback_path
        )
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .map(|v| v.trim().to_string())
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| Error::InvalidInput(format!("Invalid value for {key}: {raw}"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
impl Settings {
    /// Settings rooted in a scratch directory, pointing at a local mock host.
    pub fn for_tests(root: &std::path::Path, api_host: &str) -> Self {
        Self {
            api_host: api_host.to_string(),
            auth_url: format!("{api_host}/login/oauth2"),
            token_url: format!("{api_host}/oauth2/access_token"),
            callback_port: 0,
            callback_path: DEFAULT_CALLBACK_PATH.to_string(),
            http_timeout: Duration::from_secs(5),
            cache_max_age: Duration::from_secs(300),
            data_dir: root.join("data"),
            cache_dir: root.join("cache"),
        }
    }
}
