//! Wire constants for the device provisioning service.

pub const USER_AGENT: &str = "azure-iot-provisioning-devicesdk/0.0.1";

pub const API_VERSION: &str = "2018-11-01";

/// Polling interval to fall back to when the service does not dictate one.
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 2000;

/// Timeout for exchanges with the service.
pub const DEFAULT_TIMEOUT_MS: u64 = 30000;

pub const SUBSCRIBE_TOPIC_PROVISIONING: &str = "$dps/registrations/res/#";

/// The first part of the registration publish topic; the request id is
/// appended to it.
pub const PUBLISH_TOPIC_REGISTRATION: &str = "$dps/registrations/PUT/iotdps-register/?$rid=";

pub(crate) const RESPONSE_TOPIC_PREFIX: &str = "$dps/registrations/res/";
