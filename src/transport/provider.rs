//! The seam between the transport and a concrete MQTT client library.

use crate::auth::{AuthProvider, SymmetricKeySecurityClient};
use crate::error::ProviderError;
use crate::provisioning::constants;

/// Wire-level message identifier handed back by publish/subscribe/
/// unsubscribe and echoed in the matching acknowledgement.
pub type Mid = u16;

/// Quality of service for publishes and subscriptions. The hub supports
/// nothing above QoS 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

/// Events a provider raises back at the transport.
///
/// Implementations must deliver events either from their own thread or
/// after the originating provider call has returned, never synchronously
/// from inside one of the [`MqttProvider`] methods on the calling thread.
#[derive(Debug)]
pub enum ProviderEvent {
    ConnectComplete,
    ConnectFailed(ProviderError),
    DisconnectComplete,
    /// The session dropped without a client-initiated disconnect.
    ConnectionLost(ProviderError),
    PublishComplete(Mid),
    SubscribeComplete(Mid),
    UnsubscribeComplete(Mid),
    MessageReceived { topic: String, payload: Vec<u8> },
}

pub type ProviderEventSink = Box<dyn Fn(ProviderEvent) + Send + Sync>;

/// The primitives the transport needs from an MQTT client library.
///
/// Calls are non-blocking: they hand the request to the client and return a
/// MID; completion arrives later as a [`ProviderEvent`].
pub trait MqttProvider: Send {
    /// Install the transport's event sink. Called once, before any other
    /// method.
    fn set_event_sink(&mut self, sink: ProviderEventSink);

    fn connect(&mut self, password: &str) -> Result<(), ProviderError>;

    /// Tear the session down and re-establish it with fresh credentials.
    fn reconnect(&mut self, password: &str) -> Result<(), ProviderError>;

    fn disconnect(&mut self) -> Result<(), ProviderError>;

    fn publish(&mut self, topic: &str, payload: &[u8], qos: Qos) -> Result<Mid, ProviderError>;

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<Mid, ProviderError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<Mid, ProviderError>;
}

const HUB_API_VERSION: &str = "2018-06-30";

/// Static connection parameters for one MQTT session: everything except the
/// password, which is read from the credential source on every connect.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub client_id: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub ca_cert: Option<Vec<u8>>,
}

impl ProviderConfig {
    /// Parameters for a hub session: `client_id` is `device` or
    /// `device/module`, and the gateway hostname (when configured) replaces
    /// the hub hostname as the broker address.
    pub fn for_hub(auth: &dyn AuthProvider) -> Self {
        let mut client_id = auth.device_id();
        if let Some(module_id) = auth.module_id() {
            client_id = format!("{client_id}/{module_id}");
        }

        let username = format!(
            "{}/{client_id}/?api-version={HUB_API_VERSION}",
            auth.hostname()
        );

        let hostname = auth
            .gateway_hostname()
            .filter(|gateway| !gateway.is_empty())
            .unwrap_or_else(|| auth.hostname());

        ProviderConfig {
            client_id,
            hostname,
            port: 8883,
            username,
            ca_cert: auth.ca_cert(),
        }
    }

    /// Parameters for a provisioning session against `provisioning_host`.
    pub fn for_provisioning(
        provisioning_host: &str,
        security: &SymmetricKeySecurityClient,
    ) -> Self {
        let username = format!(
            "{}/registrations/{}/api-version={}&ClientVersion={}",
            security.id_scope(),
            security.registration_id(),
            constants::API_VERSION,
            urlencoding::encode(constants::USER_AGENT),
        );

        ProviderConfig {
            client_id: security.registration_id().to_owned(),
            hostname: provisioning_host.to_owned(),
            port: 8883,
            username,
            ca_cert: None,
        }
    }
}
