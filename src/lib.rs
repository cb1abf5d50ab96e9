//! Device-side SDK core for Azure IoT Hub and the Device Provisioning
//! Service.
//!
//! A [`transport::MqttTransport`] owns one MQTT session and serializes every
//! operation against it: work submitted while offline is queued and a
//! connection is brought up on demand, acknowledgements are correlated back
//! to the submitting caller, and inbound publishes are routed into typed
//! [`inbox::Inbox`]es. The [`client`] module wraps that callback contract in
//! blocking and awaitable flavors; [`provisioning`] runs the same machinery
//! against the provisioning service to obtain a hub assignment.

pub mod auth;
pub mod client;
mod error;
pub mod inbox;
pub mod models;
pub mod provisioning;
pub mod transport;

pub use client::{AsyncDeviceClient, AsyncModuleClient, DeviceClient, ModuleClient};
pub use error::{AuthError, ProviderError, TopicError, TransportError};
pub use models::{Message, MethodCall, MethodResponse};

#[cfg(test)]
mod test {
    use super::*;

    fn check_if_send<T: Send>() {}
    fn check_if_sync<T: Sync>() {}

    #[test]
    fn clients_are_shareable() {
        check_if_send::<DeviceClient>();
        check_if_sync::<DeviceClient>();
        check_if_send::<ModuleClient>();
        check_if_sync::<AsyncDeviceClient>();
    }
}
