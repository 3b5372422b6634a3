//! Change detection for device snapshots.
//!
//! Only the telemetry that matters for "has anything happened" is digested: identifier, state
//! of charge, charge/discharge power, load, profit and report time. Churn in any other field
//! (firmware strings, names, vendor extras) does not change the fingerprint.

use crate::model::Device;

const SEPARATOR: &str = "|";

fn tracked_fields(device: &Device) -> String {
    format!(
        "devid={:?};soc={:?};charge={:?};discharge={:?};load={:?};profit={:?};report_time={:?}",
        device.devid,
        device.soc,
        device.charge,
        device.discharge,
        device.load,
        device.profit,
        device.report_time,
    )
}

/// Hex MD5 digest over the tracked fields of all `devices`, independent of their order.
pub fn of(devices: &[Device]) -> String {
    let mut parts: Vec<String> = devices.iter().map(tracked_fields).collect();
    parts.sort_unstable();
    format!("{:x}", md5::compute(parts.join(SEPARATOR).as_bytes()))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn devices(value: serde_json::Value) -> Vec<Device> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn order_independent() {
        let a = devices(json!([
            {"devid": "d1", "soc": 50, "charge": 100},
            {"devid": "d2", "soc": 75, "discharge": 20}
        ]));
        let b = devices(json!([
            {"devid": "d2", "soc": 75, "discharge": 20},
            {"devid": "d1", "soc": 50, "charge": 100}
        ]));
        assert_eq!(of(&a), of(&b));
    }

    #[test]
    fn sensitive_to_tracked_fields() {
        let base = devices(json!([{
            "devid": "d1", "soc": 50, "charge": 100, "discharge": 0,
            "load": 250, "profit": 1.5, "report_time": 1700000000
        }]));
        let reference = of(&base);

        for (field, value) in [
            ("devid", json!("d9")),
            ("soc", json!(51)),
            ("charge", json!(101)),
            ("discharge", json!(1)),
            ("load", json!(249)),
            ("profit", json!(1.6)),
            ("report_time", json!(1700000060)),
        ] {
            let mut changed = serde_json::to_value(&base).unwrap();
            changed[0][field] = value;
            let changed: Vec<Device> = serde_json::from_value(changed).unwrap();
            assert_ne!(reference, of(&changed), "{} change went unnoticed", field);
        }
    }

    #[test]
    fn separators_inside_devid_do_not_collide() {
        let untouched = ";soc=None;charge=None;discharge=None;load=None;profit=None;report_time=None";
        let merged = devices(json!([{"devid": format!("a{}|devid=b", untouched)}]));
        let split = devices(json!([{"devid": "a"}, {"devid": "b"}]));
        assert_ne!(of(&merged), of(&split));
    }

    #[test]
    fn ignores_untracked_fields() {
        let a = devices(json!([{"devid": "d1", "soc": 50, "version": "1.0", "name": "Garage"}]));
        let b = devices(json!([{"devid": "d1", "soc": 50, "version": "2.0", "name": "Shed"}]));
        assert_eq!(of(&a), of(&b));
    }

    #[test]
    fn empty_list_is_a_constant_digest() {
        assert_eq!(of(&[]), of(&[]));
        /* MD5 of the empty string */
        assert_eq!("d41d8cd98f00b204e9800998ecf8427e", of(&[]));
    }
}
