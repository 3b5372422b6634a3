use marstek_cloud::model::{self, Device};
use marstek_cloud::Status;
use prometheus::{Encoder, Gauge, GaugeVec, TextEncoder};

use std::collections::HashMap;

lazy_static! {
    static ref DEVICE_SOC_GAUGE: GaugeVec = register_gauge_vec!(
        opts!("device_soc", "battery state of charge (in %)"),
        &["devid", "name"],
    )
    .unwrap();
    static ref DEVICE_CHARGE_GAUGE: GaugeVec = register_gauge_vec!(
        opts!("device_charge_power", "battery charge power (in W)"),
        &["devid", "name"],
    )
    .unwrap();
    static ref DEVICE_DISCHARGE_GAUGE: GaugeVec = register_gauge_vec!(
        opts!("device_discharge_power", "battery discharge power (in W)"),
        &["devid", "name"],
    )
    .unwrap();
    static ref DEVICE_LOAD_GAUGE: GaugeVec = register_gauge_vec!(
        opts!("device_load", "load reported by the battery (in W)"),
        &["devid", "name"],
    )
    .unwrap();
    static ref DEVICE_PROFIT_GAUGE: GaugeVec = register_gauge_vec!(
        opts!("device_profit", "profit reported by the battery"),
        &["devid", "name"],
    )
    .unwrap();
    static ref DEVICE_ENERGY_GAUGE: GaugeVec = register_gauge_vec!(
        opts!(
            "device_stored_energy",
            "energy stored in the battery (in kWh)"
        ),
        &["devid", "name"],
    )
    .unwrap();
    static ref TOTAL_ENERGY_GAUGE: Gauge = register_gauge!(opts!(
        "total_stored_energy",
        "energy stored across all batteries (in kWh)"
    ))
    .unwrap();
    static ref TOTAL_POWER_GAUGE: Gauge = register_gauge!(opts!(
        "total_net_power",
        "charge minus discharge power across all batteries (in W)"
    ))
    .unwrap();
    static ref API_LATENCY_GAUGE: Gauge = register_gauge!(opts!(
        "api_latency_ms",
        "duration of the last device poll (in ms)"
    ))
    .unwrap();
    static ref LAST_SUCCESS_GAUGE: Gauge = register_gauge!(opts!(
        "last_success_timestamp",
        "unix time of the last successful poll"
    ))
    .unwrap();
    static ref UP_GAUGE: Gauge = register_gauge!(opts!(
        "up",
        "whether the last poll succeeded (1) or failed (0)"
    ))
    .unwrap();
}

/// Battery capacities, per device with a fallback.
pub struct Capacities {
    default: f64,
    per_device: HashMap<String, f64>,
}

impl Capacities {
    /// `overrides` is a comma-separated list of `devid=kWh` pairs; malformed pairs are skipped.
    pub fn parse(default: f64, overrides: Option<&str>) -> Self {
        let per_device = overrides
            .unwrap_or("")
            .split(',')
            .filter(|pair| !pair.trim().is_empty())
            .filter_map(|pair| {
                let (devid, kwh) = pair.split_once('=')?;
                match kwh.trim().parse::<f64>() {
                    Ok(kwh) => Some((devid.trim().to_string(), kwh)),
                    Err(e) => {
                        log::warn!("Ignoring capacity override {:?}: {}", pair, e);
                        None
                    }
                }
            })
            .collect();
        Capacities {
            default,
            per_device,
        }
    }

    pub fn of(&self, device: &Device) -> f64 {
        self.per_device
            .get(&device.devid)
            .copied()
            .unwrap_or(self.default)
    }
}

fn set_device(gauge: &GaugeVec, labels: &[&str], value: Option<f64>) {
    if let Some(value) = value {
        gauge.with_label_values(labels).set(value);
    }
}

/// Feed the coordinator status into the Prometheus registry.
pub fn update(status: &Status, capacities: &Capacities) {
    for device in &status.devices {
        let name = device.name.as_deref().unwrap_or("");
        let labels = [device.devid.as_str(), name];

        set_device(&DEVICE_SOC_GAUGE, &labels, device.soc);
        set_device(&DEVICE_CHARGE_GAUGE, &labels, device.charge);
        set_device(&DEVICE_DISCHARGE_GAUGE, &labels, device.discharge);
        set_device(&DEVICE_LOAD_GAUGE, &labels, device.load);
        set_device(&DEVICE_PROFIT_GAUGE, &labels, device.profit);
        set_device(
            &DEVICE_ENERGY_GAUGE,
            &labels,
            device.stored_energy(capacities.of(device)),
        );
    }

    TOTAL_ENERGY_GAUGE.set(model::total_stored_energy(&status.devices, |d| {
        capacities.of(d)
    }));
    TOTAL_POWER_GAUGE.set(model::total_net_power(&status.devices));

    if let Some(latency) = status.last_latency_ms {
        API_LATENCY_GAUGE.set(latency);
    }
    if let Some(at) = status.last_success {
        LAST_SUCCESS_GAUGE.set(at.timestamp() as f64);
    }
    UP_GAUGE.set(if status.last_update_success { 1.0 } else { 0.0 });
}

/// Read metrics from Prometheus exporter registry.
pub fn read() -> Result<String, marstek_cloud::Error> {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| marstek_cloud::Error::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| marstek_cloud::Error::Internal(e.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn capacity_overrides() {
        let capacities = Capacities::parse(5.12, Some("d1=2.56, d2 = 10 ,broken,d3=x"));
        let device = |id: &str| -> Device { serde_json::from_value(json!({ "devid": id })).unwrap() };

        assert_eq!(2.56, capacities.of(&device("d1")));
        assert_eq!(10.0, capacities.of(&device("d2")));
        assert_eq!(5.12, capacities.of(&device("d3")));
        assert_eq!(5.12, capacities.of(&device("other")));
    }

    #[test]
    fn status_is_exported() {
        let status = Status {
            devices: serde_json::from_value(json!([
                {"devid": "m1", "name": "Shed", "soc": 50, "charge": 500, "discharge": 200}
            ]))
            .unwrap(),
            last_update_success: true,
            last_success: None,
            last_latency_ms: Some(12.5),
            last_error: None,
            interval: std::time::Duration::from_secs(60),
            no_change_count: 0,
        };
        update(&status, &Capacities::parse(10.0, None));

        let output = read().unwrap();
        assert!(output.contains("\ntotal_net_power 300\n"), "{}", output);
        assert!(output.contains("\ntotal_stored_energy 5\n"), "{}", output);
        assert!(output.contains("\nup 1\n"), "{}", output);
        assert!(output.contains("\napi_latency_ms 12.5\n"), "{}", output);
        assert!(output.contains(r#"device_soc{devid="m1",name="Shed"} 50"#), "{}", output);
    }

    #[test]
    fn no_overrides() {
        let capacities = Capacities::parse(5.12, None);
        assert!(capacities.per_device.is_empty());
    }
}
