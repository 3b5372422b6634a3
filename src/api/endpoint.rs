pub type Endpoint = str;

pub const API_URL: &str = "https://eu.hamedata.com";

pub const LOGIN: &Endpoint = "/app/Solar/get_token.php";
pub const DEVICES: &Endpoint = "/ems/api/v1/getDeviceList";
