use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::client::NestSession;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::store::Store;

pub struct TokenStore {
    store: Arc<dyn Store>,
    config: Config,
}

impl TokenStore {
    pub fn load(store: Arc<dyn Store>) -> Result<Self> {
        let config = Config::load_or_init(store.as_ref())?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_authorized(&self) -> bool {
        self.is_authorized_at(Utc::now())
    }

    pub fn is_authorized_at(&self, now: DateTime<Utc>) -> bool {
        self.config.is_authorized_at(now)
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.config.access_expiry
    }

    /// The token, if it is still valid at `now`.
    pub fn access_token_at(&self, now: DateTime<Utc>) -> Result<&str> {
        if self.is_authorized_at(now) {
            Ok(&self.config.access_token)
        } else {
            Err(Error::NotAuthorized)
        }
    }

    /// Open an API session, or fail with [`Error::NotAuthorized`].
    pub fn session(&self, http: HttpClient, api_host: &str) -> Result<NestSession> {
        let token = self.access_token_at(Utc::now())?;
        Ok(NestSession::new(http, api_host, token))
    }

    pub fn pending_state(&self) -> Option<&str> {
        self.config.pending_state.as_deref()
    }

    /// Remember the `state` of an authorization attempt until its callback
    /// arrives.
    pub fn begin_authorization(&mut self, state: &str) -> Result<()> {
        self.config = Config::update(self.store.as_ref(), |config| {
            config.pending_state = Some(state.to_string());
            true
        })?;
        Ok(())
    }

    /// Persist a newly granted token. Failures are returned, never retried.
    pub fn save(&mut self, token: &str, expiry: DateTime<Utc>) -> Result<()> {
        self.config = Config::update(self.store.as_ref(), |config| {
            config.access_token = token.to_string();
            config.access_expiry = Some(expiry);
            config.pending_state = None;
            true
        })?;
        info!(%expiry, "Saved access token");
        Ok(())
    }

    /// Forget the token. Device and scale choices are kept.
    pub fn clear(&mut self) -> Result<()> {
        self.config = Config::update(self.store.as_ref(), |config| {
            let had_token = !config.access_token.is_empty() || config.access_expiry.is_some();
            config.access_token.clear();
            config.access_expiry = None;
            had_token
        })?;
        Ok(())
    }
}
