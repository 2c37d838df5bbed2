use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::temperature::{Scale, Temperature};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountData {
    pub metadata: Metadata,
    pub devices: Devices,
    pub structures: BTreeMap<String, Structure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub client_version: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Devices {
    pub thermostats: BTreeMap<String, Thermostat>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HvacMode {
    Heat,
    Cool,
    HeatCool,
    Eco,
    #[default]
    Off,
}

impl HvacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            HvacMode::Heat => "heat",
            HvacMode::Cool => "cool",
            HvacMode::HeatCool => "heat-cool",
            HvacMode::Eco => "eco",
            HvacMode::Off => "off",
        }
    }
}

impl fmt::Display for HvacMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HvacMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "heat" => Ok(HvacMode::Heat),
            "cool" => Ok(HvacMode::Cool),
            "heat-cool" | "heatcool" | "range" => Ok(HvacMode::HeatCool),
            "eco" => Ok(HvacMode::Eco),
            "off" => Ok(HvacMode::Off),
            other => Err(format!(
                "Unknown mode: {other}. Use heat, cool, heat-cool, eco, or off."
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Presence {
    #[default]
    Home,
    Away,
    AutoAway,
}

impl Presence {
    pub fn as_str(self) -> &'static str {
        match self {
            Presence::Home => "home",
            Presence::Away => "away",
            Presence::AutoAway => "auto-away",
        }
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Presence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "home" => Ok(Presence::Home),
            "away" => Ok(Presence::Away),
            "auto-away" | "autoaway" | "auto" => Ok(Presence::AutoAway),
            other => Err(format!(
                "Unknown presence: {other}. Use home, away, or auto-away."
            )),
        }
    }
}

/// One thermostat. Every temperature is reported on both scales.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thermostat {
    pub device_id: String,
    pub name: String,
    pub name_long: String,
    pub structure_id: String,
    pub locale: String,
    pub software_version: String,
    pub is_online: bool,
    pub last_connection: Option<DateTime<Utc>>,
    pub can_cool: bool,
    pub can_heat: bool,
    pub has_fan: bool,
    pub temperature_scale: Scale,
    pub hvac_mode: HvacMode,
    pub humidity: f64,
    pub target_temperature_f: f64,
    pub target_temperature_c: f64,
    pub target_temperature_high_f: f64,
    pub target_temperature_high_c: f64,
    pub target_temperature_low_f: f64,
    pub target_temperature_low_c: f64,
    pub away_temperature_high_f: f64,
    pub away_temperature_high_c: f64,
    pub away_temperature_low_f: f64,
    pub away_temperature_low_c: f64,
    pub ambient_temperature_f: f64,
    pub ambient_temperature_c: f64,
}

impl Thermostat {
    fn pick(scale: Scale, f: f64, c: f64) -> Temperature {
        match scale {
            Scale::Fahrenheit => Temperature::Fahrenheit(f),
            Scale::Celsius => Temperature::Celsius(c),
        }
    }

    pub fn ambient(&self, scale: Scale) -> Temperature {
        Self::pick(scale, self.ambient_temperature_f, self.ambient_temperature_c)
    }

    pub fn target(&self, scale: Scale) -> Temperature {
        Self::pick(scale, self.target_temperature_f, self.target_temperature_c)
    }

    pub fn target_high(&self, scale: Scale) -> Temperature {
        Self::pick(
            scale,
            self.target_temperature_high_f,
            self.target_temperature_high_c,
        )
    }

    pub fn target_low(&self, scale: Scale) -> Temperature {
        Self::pick(
            scale,
            self.target_temperature_low_f,
            self.target_temperature_low_c,
        )
    }

    pub fn away_high(&self, scale: Scale) -> Temperature {
        Self::pick(
            scale,
            self.away_temperature_high_f,
            self.away_temperature_high_c,
        )
    }

    pub fn away_low(&self, scale: Scale) -> Temperature {
        Self::pick(
            scale,
            self.away_temperature_low_f,
            self.away_temperature_low_c,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Structure {
    pub structure_id: String,
    pub name: String,
    pub thermostats: Vec<String>,
    pub away: Presence,
    pub time_zone: String,
    pub peak_period_start_time: Option<DateTime<Utc>>,
    pub peak_period_end_time: Option<DateTime<Utc>>,
    pub eta: Option<Eta>,
}

/// Expected arrival window reported by an ETA-capable client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eta {
    pub trip_id: String,
    pub estimated_arrival_window_begin: DateTime<Utc>,
    pub estimated_arrival_window_end: DateTime<Utc>,
}

impl AccountData {
    pub fn thermostat(&self, device_id: &str) -> Option<&Thermostat> {
        self.devices.thermostats.get(device_id)
    }

    /// Matches either the device ID or the display name.
    pub fn find_thermostat(&self, key: &str) -> Option<&Thermostat> {
        self.thermostat(key).or_else(|| {
            self.devices
                .thermostats
                .values()
                .find(|t| t.name.eq_ignore_ascii_case(key) || t.name_long.eq_ignore_ascii_case(key))
        })
    }

    /// First thermostat in device-ID order.
    pub fn first_thermostat(&self) -> Option<&Thermostat> {
        self.devices.thermostats.values().next()
    }

    pub fn structure_of(&self, thermostat: &Thermostat) -> Option<&Structure> {
        self.structures.get(&thermostat.structure_id)
    }
}
