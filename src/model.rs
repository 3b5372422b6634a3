use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use std::fmt;

use crate::fingerprint;

type KWh = f64;
type Watts = f64;

/// Account credential. The password only ever leaves this struct as an MD5 digest.
#[derive(Clone)]
pub struct Credential {
    pub email: String,
    password: String,
}

impl Credential {
    pub fn new(email: String, password: String) -> Self {
        Credential { email, password }
    }

    /// Hex MD5 digest of the password, as expected by the login endpoint.
    pub fn password_digest(&self) -> String {
        format!("{:x}", md5::compute(self.password.as_bytes()))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A single battery as reported by the devices endpoint.
///
/// Only the fields the exporter understands are typed; everything else the vendor sends is
/// kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(deserialize_with = "string_or_number")]
    pub devid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub soc: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub charge: Option<Watts>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub discharge: Option<Watts>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub load: Option<Watts>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub pv: Option<Watts>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub profit: Option<f64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub sn: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub report_time: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Device {
    /// `report_time` (unix seconds) as a UTC timestamp.
    pub fn reported_at(&self) -> Option<DateTime<Utc>> {
        self.report_time
            .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
    }

    /// Energy currently stored, derived from state of charge and the battery capacity.
    pub fn stored_energy(&self, capacity: KWh) -> Option<KWh> {
        self.soc.map(|soc| soc / 100.0 * capacity)
    }

    /// Charge minus discharge power; missing readings count as zero.
    pub fn net_power(&self) -> Watts {
        self.charge.unwrap_or(0.0) - self.discharge.unwrap_or(0.0)
    }
}

/// Sum of `Device::stored_energy` across `devices`, with capacity looked up per device.
pub fn total_stored_energy<F>(devices: &[Device], capacity_of: F) -> KWh
where
    F: Fn(&Device) -> KWh,
{
    devices
        .iter()
        .filter_map(|device| device.stored_energy(capacity_of(device)))
        .sum()
}

pub fn total_net_power(devices: &[Device]) -> Watts {
    devices.iter().map(Device::net_power).sum()
}

/// Device list as handed out by the API client, together with its fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub devices: Vec<Device>,
    pub fingerprint: String,
    /// Served from the response cache rather than a fresh upstream call.
    pub cached: bool,
}

impl Snapshot {
    pub fn new(devices: Vec<Device>) -> Self {
        let fingerprint = fingerprint::of(&devices);
        Snapshot {
            devices,
            fingerprint,
            cached: false,
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(v) => Some(v),
            Err(e) => {
                log::warn!("Ignoring non-numeric telemetry value {:?}: {}", s, e);
                None
            }
        },
        Value::Null => None,
        other => {
            log::warn!("Ignoring non-numeric telemetry value {}", other);
            None
        }
    })
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn device(value: Value) -> Device {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn password_is_md5_hex() {
        let credential = Credential::new("test@example.com".into(), "password123".into());
        assert_eq!(
            "482c811da5d5b4bc6d497ffa98491e38",
            credential.password_digest()
        );
    }

    #[test]
    fn debug_redacts_password() {
        let credential = Credential::new("test@example.com".into(), "hunter2".into());
        let printed = format!("{:?}", credential);
        assert!(printed.contains("test@example.com"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn numeric_strings_are_accepted() {
        let d = device(json!({
            "devid": 42,
            "soc": "85",
            "charge": 120.5,
            "discharge": "n/a",
            "version": 153,
            "report_time": "1700000000",
            "type": "VNSE3-0"
        }));
        assert_eq!("42", d.devid);
        assert_eq!(Some(85.0), d.soc);
        assert_eq!(Some(120.5), d.charge);
        assert_eq!(None, d.discharge);
        assert_eq!(Some("153".to_string()), d.version);
        assert_eq!(Some(json!("VNSE3-0")), d.extra.get("type").cloned());
        assert_eq!(
            Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            d.reported_at()
        );
    }

    #[test]
    fn derived_energy_and_power() {
        let a = device(json!({"devid": "a", "soc": 50, "charge": 300, "discharge": 0}));
        let b = device(json!({"devid": "b", "soc": 100, "discharge": 100}));
        let c = device(json!({"devid": "c"}));

        assert_eq!(Some(2.56), a.stored_energy(5.12));
        assert_eq!(None, c.stored_energy(5.12));
        assert_eq!(-100.0, b.net_power());

        let devices = vec![a, b, c];
        let total = total_stored_energy(&devices, |d| if d.devid == "b" { 2.0 } else { 5.12 });
        assert!((total - 4.56).abs() < 1e-9);
        assert_eq!(200.0, total_net_power(&devices));
    }
}
