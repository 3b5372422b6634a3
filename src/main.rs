#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate prometheus;
#[macro_use]
extern crate rocket;

use config::Config;
use marstek_cloud::api::{self, endpoint};
use marstek_cloud::coordinator::{self, Coordinator};
use marstek_cloud::{ClientConfig, Credential, MarstekApi};
use rocket::http::{ContentType, Status};
use rocket::State;
use std::sync::Arc;

mod metrics;

const DEFAULT_CAPACITY_KWH: f64 = 5.12;

#[derive(Clone, serde::Deserialize)]
pub struct MarstekConfig {
    api_url: String,
    email: String,
    password: String,
    scan_interval: u64,
    capacity_kwh: f64,
    capacities: Option<String>,
}

/// Structure containing state for route handlers.
pub struct StateData {
    coordinator: Arc<Coordinator<MarstekApi>>,
    capacities: metrics::Capacities,
}

pub fn read_settings() -> Result<MarstekConfig, config::ConfigError> {
    let mut settings = Config::default();
    settings
        .set_default("api_url", endpoint::API_URL)?
        .set_default("scan_interval", coordinator::DEFAULT_SCAN_INTERVAL as i64)?
        .set_default("capacity_kwh", DEFAULT_CAPACITY_KWH)?
        .merge(config::Environment::with_prefix("MARSTEK"))?;

    settings.try_into()
}

#[get("/metrics")]
fn metrics_route(state: &State<StateData>) -> Result<String, api::Error> {
    metrics::update(&state.coordinator.status(), &state.capacities);
    metrics::read()
}

#[get("/devices")]
fn devices_route(state: &State<StateData>) -> Result<(ContentType, String), api::Error> {
    let status = state.coordinator.status();
    if status.last_success.is_none() {
        if let Some(error) = status.last_error {
            return Err(error);
        }
    }

    serde_json::to_string_pretty(&status.devices)
        .map(|body| (ContentType::JSON, body))
        .map_err(|e| api::Error::Internal(e.to_string()))
}

#[put("/scan-interval/<seconds>")]
async fn scan_interval_route(state: &State<StateData>, seconds: u64) -> Status {
    if state.coordinator.update_scan_interval(seconds).await {
        Status::NoContent
    } else {
        Status::UnprocessableEntity
    }
}

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let settings = read_settings()?;
    let credential = Credential::new(settings.email, settings.password);
    let api = MarstekApi::new(
        credential,
        ClientConfig {
            api_url: settings.api_url,
            ..ClientConfig::default()
        },
    );
    let coordinator = Arc::new(Coordinator::new(api, settings.scan_interval));

    let poller = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.run().await })
    };

    let state = StateData {
        coordinator: Arc::clone(&coordinator),
        capacities: metrics::Capacities::parse(
            settings.capacity_kwh,
            settings.capacities.as_deref(),
        ),
    };

    let result = rocket::build()
        .manage(state)
        .mount(
            "/",
            routes![metrics_route, devices_route, scan_interval_route],
        )
        .launch()
        .await;

    poller.abort();
    coordinator.source().close().await;

    result?;
    Ok(())
}
