//! Registration against the device provisioning service.
//!
//! Structurally the same coordinator as the hub transport, with
//! provisioning-specific topics, a `SendRegistrationRequest` action, and a
//! registration-complete handler in place of the inboxes: any publish
//! arriving under the provisioning response filter is handed to that
//! handler verbatim.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::auth::SymmetricKeySecurityClient;
use crate::error::TransportError;
use crate::transport::{
    Completion, ConnectionState, MqttProvider, ProviderConfig, ProviderEvent, Qos,
    RumqttcProvider,
};

use crate::transport::actions::{TransportAction, UnknownMidPolicy};
use crate::transport::core::Core;

pub mod constants;

/// Receives every provisioning response `(topic, payload)` verbatim.
pub type RegistrationHandler = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// The provisioning-facing transport. Cheap to clone; all clones drive the
/// same session.
#[derive(Clone)]
pub struct ProvisioningMqttTransport {
    inner: Arc<ProvisioningInner>,
}

struct ProvisioningInner {
    core: Mutex<Core>,
    registration_handler: Mutex<Option<RegistrationHandler>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ProvisioningMqttTransport {
    pub fn new(
        security: Arc<SymmetricKeySecurityClient>,
        provider: Box<dyn MqttProvider>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let token = Box::new(move || {
            security
                .current_sas_token()
                .map_err(TransportError::from)
        });

        let inner = Arc::new(ProvisioningInner {
            // Registration acknowledgements can overtake the call that
            // produced their MID, so unknown MIDs are stashed rather than
            // dropped.
            core: Mutex::new(Core::new(provider, token, UnknownMidPolicy::Stash, state_tx)),
            registration_handler: Mutex::new(None),
            state_rx,
        });

        let sink_target = Arc::downgrade(&inner);
        inner.with_core(|core| {
            core.set_event_sink(Box::new(move |event| {
                if let Some(inner) = sink_target.upgrade() {
                    inner.handle_provider_event(event);
                }
            }));
        });

        ProvisioningMqttTransport { inner }
    }

    pub fn set_registration_handler(&self, handler: RegistrationHandler) {
        let mut slot = self
            .inner
            .registration_handler
            .lock()
            .expect("registration handler lock poisoned");
        *slot = Some(handler);
    }

    pub fn connect(&self, completion: Completion) {
        self.inner.with_core(|core| core.connect_request(completion));
    }

    pub fn disconnect(&self, completion: Completion) {
        self.inner
            .with_core(|core| core.disconnect_request(completion));
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Submit the registration exchange: a subscription to the response
    /// filter and the registration request itself. Both are queued as one
    /// unit, so both are in place before the connection they trigger comes
    /// up; the connect happens on demand.
    pub fn send_registration_request(&self, subscribed: Completion, request_sent: Completion) {
        let request_id = Uuid::new_v4();
        let topic = format!("{}{request_id}", constants::PUBLISH_TOPIC_REGISTRATION);

        self.inner.with_core(|core| {
            core.submit_batch(vec![
                TransportAction::Subscribe {
                    topic: constants::SUBSCRIBE_TOPIC_PROVISIONING.to_owned(),
                    qos: Qos::AtLeastOnce,
                    completion: subscribed,
                },
                TransportAction::SendRegistrationRequest {
                    topic,
                    payload: b" ".to_vec(),
                    completion: request_sent,
                },
            ]);
        });
    }
}

impl ProvisioningInner {
    fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        let (result, effects) = {
            let mut core = self.core.lock().expect("transport lock poisoned");
            let result = f(&mut core);
            (result, core.take_effects())
        };
        for (completion, outcome) in effects {
            completion(outcome);
        }
        result
    }

    fn handle_provider_event(&self, event: ProviderEvent) {
        match event {
            ProviderEvent::MessageReceived { topic, payload } => {
                if !topic.starts_with(constants::RESPONSE_TOPIC_PREFIX) {
                    log::warn!("dropping publish on unexpected topic {topic:?}");
                    return;
                }
                log::debug!("registration response received on {topic}");
                let handler = self
                    .registration_handler
                    .lock()
                    .expect("registration handler lock poisoned");
                match handler.as_ref() {
                    Some(handler) => handler(&topic, &payload),
                    None => log::warn!("registration response arrived with no handler installed"),
                }
            }
            other => self.with_core(|core| core.provider_event(other)),
        }
    }
}

/// Body of a provisioning response, for callers that want more than the raw
/// payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResult {
    pub operation_id: String,
    pub status: String,
}

impl RegistrationResult {
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Synchronous registration client: drives the provisioning transport and
/// blocks the caller until each step is acknowledged.
#[derive(Clone)]
pub struct RegistrationClient {
    transport: ProvisioningMqttTransport,
}

impl RegistrationClient {
    /// Build a registration client over the given transport implementation.
    /// Only `"mqtt"` is available.
    pub fn from_security_client(
        provisioning_host: &str,
        security: SymmetricKeySecurityClient,
        transport_name: &str,
    ) -> Result<Self, TransportError> {
        if transport_name != "mqtt" {
            return Err(TransportError::InvalidArgument(format!(
                "unsupported transport {transport_name:?}"
            )));
        }
        let config = ProviderConfig::for_provisioning(provisioning_host, &security);
        let provider = RumqttcProvider::new(config)?;
        Ok(Self::from_transport(ProvisioningMqttTransport::new(
            Arc::new(security),
            Box::new(provider),
        )))
    }

    pub fn from_transport(transport: ProvisioningMqttTransport) -> Self {
        RegistrationClient { transport }
    }

    /// Install the handler invoked with every provisioning response. Must be
    /// set before [`RegistrationClient::register`].
    pub fn on_registration_complete(
        &self,
        handler: impl Fn(&str, &[u8]) + Send + Sync + 'static,
    ) {
        self.transport.set_registration_handler(Box::new(handler));
    }

    /// Subscribe to the response filter and publish the registration
    /// request, connecting on demand. Returns once both the subscription
    /// and the request are acknowledged.
    pub fn register(&self) -> Result<(), TransportError> {
        log::info!("sending registration request");
        let (subscribed_tx, subscribed_rx) = mpsc::channel();
        let (request_tx, request_rx) = mpsc::channel();

        self.transport.send_registration_request(
            Box::new(move |result| {
                let _ = subscribed_tx.send(result);
            }),
            Box::new(move |result| {
                let _ = request_tx.send(result);
            }),
        );

        subscribed_rx
            .recv()
            .expect("completion sink dropped without being invoked")?;
        log::debug!("registration response subscription acknowledged");
        request_rx
            .recv()
            .expect("completion sink dropped without being invoked")?;
        log::debug!("registration request acknowledged");
        Ok(())
    }

    pub fn disconnect(&self) -> Result<(), TransportError> {
        let (tx, rx) = mpsc::channel();
        self.transport.disconnect(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        rx.recv()
            .expect("completion sink dropped without being invoked")
    }
}
