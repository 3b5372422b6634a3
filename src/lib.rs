pub mod api;
pub mod coordinator;
pub mod fingerprint;
pub mod model;

pub use api::{ClientConfig, Error, MarstekApi};
pub use coordinator::{Coordinator, DeviceSource, Status};
pub use model::{Credential, Device, Snapshot};
