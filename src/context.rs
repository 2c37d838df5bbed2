use std::sync::Arc;

use crate::cache::CacheManager;
use crate::client::NestSession;
use crate::error::Result;
use crate::http::HttpClient;
use crate::settings::Settings;
use crate::store::{FileStore, Store};
use crate::token::TokenStore;

/// Everything a command needs, built once per invocation.
pub struct Context {
    pub settings: Settings,
    pub store: Arc<dyn Store>,
    pub http: HttpClient,
}

impl Context {
    pub fn new(settings: Settings) -> Self {
        let store: Arc<dyn Store> = Arc::new(FileStore::new(
            settings.config_file(),
            settings.cache_file(),
            settings.sync_lock_file(),
        ));
        let http = HttpClient::new(settings.http_timeout);
        Self {
            settings,
            store,
            http,
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(Settings::from_env()?))
    }

    pub fn tokens(&self) -> Result<TokenStore> {
        TokenStore::load(Arc::clone(&self.store))
    }

    pub fn cache(&self) -> Result<CacheManager> {
        CacheManager::load(Arc::clone(&self.store))
    }

    /// Session for the stored token, or [`Error::NotAuthorized`](crate::error::Error::NotAuthorized).
    pub fn session(&self) -> Result<NestSession> {
        self.tokens()?
            .session(self.http.clone(), &self.settings.api_host)
    }
}
