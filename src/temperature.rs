use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scale {
    #[serde(rename = "C")]
    Celsius,
    #[default]
    #[serde(rename = "F")]
    Fahrenheit,
}

impl Scale {
    /// Suffix used by the API for scale-specific fields (`target_temperature_f`).
    pub fn api_suffix(self) -> &'static str {
        match self {
            Scale::Celsius => "c",
            Scale::Fahrenheit => "f",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Scale::Celsius => "Celsius",
            Scale::Fahrenheit => "Fahrenheit",
        }
    }
}

impl FromStr for Scale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "c" | "celsius" => Ok(Scale::Celsius),
            "f" | "fahrenheit" => Ok(Scale::Fahrenheit),
            other => Err(format!(
                "Invalid temperature scale '{other}'. Use celsius or fahrenheit."
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Temperature {
    Celsius(f64),
    Fahrenheit(f64),
}

impl Temperature {
    pub fn new(value: f64, scale: Scale) -> Self {
        match scale {
            Scale::Celsius => Temperature::Celsius(value),
            Scale::Fahrenheit => Temperature::Fahrenheit(value),
        }
    }

    pub fn value(self) -> f64 {
        match self {
            Temperature::Celsius(v) | Temperature::Fahrenheit(v) => v,
        }
    }

    pub fn scale(self) -> Scale {
        match self {
            Temperature::Celsius(_) => Scale::Celsius,
            Temperature::Fahrenheit(_) => Scale::Fahrenheit,
        }
    }

    /// Exact linear conversion; no rounding.
    pub fn to_scale(self, scale: Scale) -> Self {
        match (self, scale) {
            (Temperature::Celsius(c), Scale::Fahrenheit) => {
                Temperature::Fahrenheit(c * 9.0 / 5.0 + 32.0)
            }
            (Temperature::Fahrenheit(f), Scale::Celsius) => {
                Temperature::Celsius((f - 32.0) * 5.0 / 9.0)
            }
            (same, _) => same,
        }
    }
}

impl PartialOrd for Temperature {
    /// `None` across scales.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.scale() != other.scale() {
            return None;
        }
        self.value().partial_cmp(&other.value())
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rounded = (self.value() * 10.0).round() / 10.0;
        let unit = match self.scale() {
            Scale::Celsius => "°C",
            Scale::Fahrenheit => "°F",
        };
        write!(f, "{rounded}{unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_is_linear_and_unrounded() {
        let f = Temperature::Celsius(25.0).to_scale(Scale::Fahrenheit);
        assert_eq!(f, Temperature::Fahrenheit(77.0));

        let c = Temperature::Fahrenheit(71.0).to_scale(Scale::Celsius);
        assert!((c.value() - 21.666_666_666).abs() < 1e-6);
        assert_eq!(c.scale(), Scale::Celsius);

        assert_eq!(
            Temperature::Fahrenheit(68.0).to_scale(Scale::Fahrenheit),
            Temperature::Fahrenheit(68.0)
        );
    }

    #[test]
    fn no_comparison_across_scales() {
        let c = Temperature::Celsius(20.0);
        let f = Temperature::Fahrenheit(68.0);
        assert_ne!(c, f);
        assert_eq!(c.partial_cmp(&f), None);
        assert_eq!(
            c.to_scale(Scale::Fahrenheit).partial_cmp(&f),
            Some(Ordering::Equal)
        );
        assert!(Temperature::Celsius(19.0) < c);
    }

    #[test]
    fn display_rounds_to_one_decimal() {
        assert_eq!(Temperature::Celsius(21.666_666).to_string(), "21.7°C");
        assert_eq!(Temperature::Fahrenheit(70.0).to_string(), "70°F");
    }

    #[test]
    fn scale_parses_names_and_codes() {
        assert_eq!("F".parse::<Scale>(), Ok(Scale::Fahrenheit));
        assert_eq!("celsius".parse::<Scale>(), Ok(Scale::Celsius));
        assert!("kelvin".parse::<Scale>().is_err());
        assert_eq!(serde_json::to_string(&Scale::Celsius).unwrap(), "\"C\"");
    }
}
