use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;
use crate::store::Store;
use crate::temperature::Scale;

/// Per-user settings and credentials. Created with defaults on first run and
/// never deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Empty until a default thermostat is chosen.
    #[serde(alias = "NestId")]
    pub selected_device_id: String,
    /// Empty means unauthorized.
    #[serde(alias = "AccessToken")]
    pub access_token: String,
    /// The token is invalid at and after this instant.
    #[serde(alias = "AccessExpiry")]
    pub access_expiry: Option<DateTime<Utc>>,
    #[serde(
        alias = "Scale",
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub preferred_scale: Option<Scale>,
    /// `state` sent with the authorization request still awaiting its callback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_state: Option<String>,
}

impl Config {
    /// Load the config, writing a default document if none exists yet.
    pub fn load_or_init(store: &dyn Store) -> Result<Self> {
        match store.load_config()? {
            Some(config) => Ok(config),
            None => {
                let config = Config::default();
                store.save_config(&config)?;
                Ok(config)
            }
        }
    }

    /// Re-read the latest config, apply `change`, and save if it reports a
    /// modification.
    ///
    /// Other invocations may have written the file since this process
    /// started, so edits always start from what is on disk.
    pub fn update(store: &dyn Store, change: impl FnOnce(&mut Config) -> bool) -> Result<Self> {
        let mut config = Self::load_or_init(store)?;
        if change(&mut config) {
            store.save_config(&config)?;
        }
        Ok(config)
    }

    /// Display scale, Fahrenheit until a preference is recorded.
    pub fn scale(&self) -> Scale {
        self.preferred_scale.unwrap_or_default()
    }

    pub fn selected_device(&self) -> Option<&str> {
        Some(self.selected_device_id.as_str()).filter(|id| !id.is_empty())
    }

    /// The only authorization predicate: a token exists and `now` is before
    /// its expiry.
    pub fn is_authorized_at(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        match self.access_expiry {
            Some(expiry) => now < expiry,
            None => false,
        }
    }
}

/// Older config files store an unset scale as `""`.
fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<Scale>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn authorized(expiry: DateTime<Utc>) -> Config {
        Config {
            access_token: "c.token".to_string(),
            access_expiry: Some(expiry),
            ..Config::default()
        }
    }

    #[test]
    fn first_run_seeds_defaults() {
        let store = MemoryStore::default();
        let config = Config::load_or_init(&store).unwrap();

        assert_eq!(config.scale(), Scale::Fahrenheit);
        assert!(config.selected_device().is_none());
        assert!(!config.is_authorized_at(Utc::now()));
        assert_eq!(store.config(), Some(Config::default()));
    }

    #[test]
    fn authorization_predicate() {
        let expiry = Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap();

        assert!(!Config::default().is_authorized_at(expiry));

        let no_token = Config {
            access_expiry: Some(expiry),
            ..Config::default()
        };
        assert!(!no_token.is_authorized_at(expiry - Duration::days(1)));

        let config = authorized(expiry);
        assert!(config.is_authorized_at(expiry - Duration::seconds(1)));
        assert!(!config.is_authorized_at(expiry));
        assert!(!config.is_authorized_at(expiry + Duration::seconds(1)));

        let no_expiry = Config {
            access_token: "c.token".to_string(),
            ..Config::default()
        };
        assert!(!no_expiry.is_authorized_at(expiry));
    }

    #[test]
    fn update_saves_only_on_change() {
        let store = MemoryStore::with_config(Config {
            selected_device_id: "dev-a".to_string(),
            ..Config::default()
        });

        store.fail_writes(true);
        let unchanged = Config::update(&store, |_| false).unwrap();
        assert_eq!(unchanged.selected_device_id, "dev-a");

        assert!(Config::update(&store, |c| {
            c.preferred_scale = Some(Scale::Celsius);
            true
        })
        .is_err());

        store.fail_writes(false);
        Config::update(&store, |c| {
            c.preferred_scale = Some(Scale::Celsius);
            true
        })
        .unwrap();
        assert_eq!(store.config().unwrap().scale(), Scale::Celsius);
    }

    #[test]
    fn reads_legacy_field_names() {
        let legacy = r#"{
            "NestId": "dev-a",
            "AccessToken": "c.token",
            "AccessExpiry": "2030-01-01T00:00:00Z",
            "Scale": ""
        }"#;
        let config: Config = serde_json::from_str(legacy).unwrap();
        assert_eq!(config.selected_device_id, "dev-a");
        assert_eq!(config.access_token, "c.token");
        assert!(config.preferred_scale.is_none());

        let go_zero = r#"{"AccessToken": "c.token", "AccessExpiry": "0001-01-01T00:00:00Z", "Scale": "C"}"#;
        let config: Config = serde_json::from_str(go_zero).unwrap();
        assert!(!config.is_authorized_at(Utc::now()));
        assert_eq!(config.preferred_scale, Some(Scale::Celsius));
    }

    #[test]
    fn writes_stable_field_names() {
        let config = Config {
            selected_device_id: "dev-a".to_string(),
            preferred_scale: Some(Scale::Fahrenheit),
            ..Config::default()
        };
        let json: serde_json::Value = serde_json::to_value(&config).unwrap();
        assert_eq!(json["selectedDeviceId"], "dev-a");
        assert_eq!(json["accessToken"], "");
        assert!(json["accessExpiry"].is_null());
        assert_eq!(json["preferredScale"], "F");
        assert!(json.get("pendingState").is_none());
    }
}
