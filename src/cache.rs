use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::model::AccountData;
use crate::store::Store;

/// The persisted `cache.json` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Cache {
    /// `None` forces the next freshness check to sync.
    #[serde(alias = "Time")]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(alias = "AllData")]
    pub account_snapshot: AccountData,
}

impl Cache {
    pub fn is_stale_at(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        let Some(synced) = self.last_sync_time else {
            return true;
        };
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(synced) > max_age
    }
}

/// Anything that can produce a full account snapshot.
pub trait AccountSource {
    async fn get_all_account_data(&self) -> Result<AccountData>;
}

pub struct CacheManager {
    store: Arc<dyn Store>,
    cache: Cache,
}

impl CacheManager {
    pub fn load(store: Arc<dyn Store>) -> Result<Self> {
        let cache = store.load_cache()?.unwrap_or_default();
        Ok(Self { store, cache })
    }

    pub fn snapshot(&self) -> &AccountData {
        &self.cache.account_snapshot
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.cache.last_sync_time
    }

    /// Sync if the snapshot is older than `max_age`. Returns whether a sync ran.
    pub async fn ensure_fresh<S: AccountSource>(&mut self, source: &S, max_age: Duration) -> Result<bool> {
        self.ensure_fresh_at(source, max_age, Utc::now()).await
    }

    pub async fn ensure_fresh_at<S: AccountSource>(
        &mut self,
        source: &S,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !self.cache.is_stale_at(max_age, now) {
            debug!(last_sync = ?self.cache.last_sync_time, "Cache is fresh");
            return Ok(false);
        }
        self.refresh_at(source, now).await?;
        Ok(true)
    }

    pub async fn refresh<S: AccountSource>(&mut self, source: &S) -> Result<()> {
        self.refresh_at(source, Utc::now()).await
    }

    /// Fetch the whole account and replace the snapshot.
    ///
    /// On any failure the previous snapshot and sync time are left exactly
    /// as they were. Only one process may sync at a time.
    pub async fn refresh_at<S: AccountSource>(&mut self, source: &S, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.store.try_lock_sync()?;

        info!("Refreshing account data");
        let data = source.get_all_account_data().await.inspect_err(|e| {
            warn!(error = %e, "Refresh failed; keeping previous snapshot");
        })?;

        let fresh = Cache {
            last_sync_time: Some(now),
            account_snapshot: data,
        };
        self.store.save_cache(&fresh)?;
        self.cache = fresh;
        info!(
            thermostats = self.cache.account_snapshot.devices.thermostats.len(),
            structures = self.cache.account_snapshot.structures.len(),
            "Account data refreshed"
        );

        self.seed_defaults()?;
        Ok(())
    }

    /// Force the next [`ensure_fresh`](Self::ensure_fresh) to sync,
    /// whatever its threshold.
    ///
    /// Waits for a sync running in another process, so that sync cannot
    /// save a pre-write snapshot over the reset.
    pub fn invalidate(&mut self) -> Result<()> {
        let _guard = self.store.lock_sync()?;
        let mut cache = self
            .store
            .load_cache()?
            .unwrap_or_else(|| self.cache.clone());
        cache.last_sync_time = None;
        self.store.save_cache(&cache)?;
        self.cache = cache;
        debug!("Cache invalidated");
        Ok(())
    }

    /// Pick a default thermostat and scale if the user has not chosen any.
    fn seed_defaults(&self) -> Result<()> {
        let snapshot = &self.cache.account_snapshot;
        Config::update(self.store.as_ref(), |config| {
            let mut changed = false;
            if config.selected_device().is_none() {
                if let Some(first) = snapshot.first_thermostat() {
                    info!(device = %first.device_id, name = %first.name, "Selected default thermostat");
                    config.selected_device_id = first.device_id.clone();
                    changed = true;
                }
            }
            if config.preferred_scale.is_none() {
                if let Some(thermostat) = snapshot.thermostat(&config.selected_device_id) {
                    config.preferred_scale = Some(thermostat.temperature_scale);
                    changed = true;
                }
            }
            changed
        })?;
        Ok(())
    }
}
