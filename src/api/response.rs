use num_derive::FromPrimitive;
use serde::Deserialize;
use serde_json::Value;

use std::fmt;

use super::Error;
use crate::model::Device;

/// Response codes the vendor is known to send.
///
/// The wire value is sometimes a string and sometimes an integer, so it travels as [`Code`]
/// and is only interpreted here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum VendorCode {
    TokenExpired = -1,
    Success = 1,
    LoginSuccess = 2,
    RateLimited = 5,
    NoAccess = 8,
    Unauthorized = 401,
    Forbidden = 403,
    ServerError = 500,
}

/// `code` field, normalised to its string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code(pub String);

impl Code {
    pub fn vendor_code(&self) -> Option<VendorCode> {
        self.0
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(num::FromPrimitive::from_i64)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Code {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        match Value::deserialize(d)? {
            Value::String(s) => Ok(Code(s)),
            Value::Number(n) => Ok(Code(n.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "unexpected response code {}",
                other
            ))),
        }
    }
}

#[derive(Deserialize)]
pub struct Login {
    #[serde(default, deserialize_with = "string_only")]
    pub token: Option<String>,
}

/// Anything but a JSON string decodes to `None`.
fn string_only<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

#[derive(Deserialize)]
pub struct GetDeviceList {
    pub data: Option<Vec<Device>>,
}

fn message(code: Option<&Code>, value: &Value) -> String {
    let code = code
        .map(Code::to_string)
        .unwrap_or_else(|| "(none)".to_string());
    let msg = value
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or("(no error message received)");
    format!("code {}: {}", code, msg)
}

/// Inspect the vendor `code` of a decoded body and turn known failure codes into errors. Any
/// other code (including none at all) carries the `value` forward.
pub fn check_code(value: Value) -> Result<Value, Error> {
    let code = value
        .get("code")
        .cloned()
        .and_then(|c| serde_json::from_value::<Code>(c).ok());

    match code.as_ref().and_then(Code::vendor_code) {
        Some(VendorCode::TokenExpired)
        | Some(VendorCode::Unauthorized)
        | Some(VendorCode::Forbidden) => Err(Error::Authentication(message(code.as_ref(), &value))),
        Some(VendorCode::NoAccess) => Err(Error::Permission(message(code.as_ref(), &value))),
        /* {"code":"5","msg":"Too many requests"} */
        Some(VendorCode::RateLimited) => Err(Error::RateLimited(message(code.as_ref(), &value))),
        Some(VendorCode::ServerError) => Err(Error::Server(message(code.as_ref(), &value))),
        _ => Ok(value),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::path::PathBuf;

    fn read_resource(filename: &str) -> String {
        let mut d = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        d.push(format!("resources/test/{}", filename));
        fs::read_to_string(d.as_path()).unwrap()
    }

    #[test]
    fn login() {
        let input: Value = serde_json::from_str(&read_resource("login.json")).unwrap();
        let output: Login = serde_json::from_value(check_code(input).unwrap()).unwrap();
        assert_eq!(Some("abc123".to_string()), output.token);
    }

    #[test]
    fn login_with_non_string_token() {
        for token in [json!(123), json!(null), json!({"value": "abc"})] {
            let output: Login =
                serde_json::from_value(json!({ "token": token, "code": "2" })).unwrap();
            assert_eq!(None, output.token);
        }
        let output: Login = serde_json::from_value(json!({"code": "2"})).unwrap();
        assert_eq!(None, output.token);
    }

    #[test]
    fn get_device_list() {
        let input: Value = serde_json::from_str(&read_resource("getDeviceList.json")).unwrap();
        let output: GetDeviceList = serde_json::from_value(check_code(input).unwrap()).unwrap();
        let devices = output.data.unwrap();
        assert_eq!(2, devices.len());
        assert_eq!("d1", devices[0].devid);
        assert_eq!(Some(85.0), devices[0].soc);
        assert_eq!(Some("Garage".to_string()), devices[0].name);
        assert_eq!(Some(1200.0), devices[1].discharge);
    }

    #[test]
    fn get_device_list_without_data() {
        let input: Value = serde_json::from_str(&read_resource("missing_data.json")).unwrap();
        let output: GetDeviceList = serde_json::from_value(check_code(input).unwrap()).unwrap();
        assert!(output.data.is_none());
    }

    #[test]
    fn codes_compare_as_strings() {
        let s: Code = serde_json::from_value(json!("8")).unwrap();
        let n: Code = serde_json::from_value(json!(8)).unwrap();
        assert_eq!(s, n);
        assert_eq!(Some(VendorCode::NoAccess), n.vendor_code());
        assert_eq!(
            Some(VendorCode::TokenExpired),
            Code("-1".into()).vendor_code()
        );
        assert_eq!(None, Code("abc".into()).vendor_code());
    }

    #[test]
    fn failure_codes() {
        for code in [json!("-1"), json!("401"), json!(403)] {
            assert!(matches!(
                check_code(json!({ "code": code })),
                Err(Error::Authentication(_))
            ));
        }
        assert!(matches!(
            check_code(json!({"code": "8"})),
            Err(Error::Permission(_))
        ));
        assert!(matches!(
            check_code(json!({"code": "5", "msg": "busy"})),
            Err(Error::RateLimited(m)) if m.contains("busy")
        ));
        assert!(matches!(
            check_code(json!({"code": 500})),
            Err(Error::Server(_))
        ));
        assert!(check_code(json!({"code": 1, "data": []})).is_ok());
        assert!(check_code(json!({"data": []})).is_ok());
    }
}
