//! The MQTT transport: serializes every user-visible operation against the
//! liveness of one MQTT session, queues work submitted while offline,
//! auto-connects on demand, correlates acknowledgements back to callers and
//! routes inbound publishes into the typed inboxes.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::auth::AuthProvider;
use crate::error::TransportError;
use crate::inbox::{Inbox, InboxManager};
use crate::models::{Message, MethodCall, MethodResponse};

pub(crate) mod actions;
pub(crate) mod core;
mod provider;
mod query;
mod rumqttc_provider;
pub(crate) mod topics;

pub use provider::{Mid, MqttProvider, ProviderConfig, ProviderEvent, ProviderEventSink, Qos};
pub use rumqttc_provider::RumqttcProvider;

use self::core::Core;
use actions::{TransportAction, UnknownMidPolicy};
use topics::{Inbound, InboundTopics};

/// Invoked exactly once with the outcome of the operation that carried it.
pub type Completion = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Connection lifecycle of the transport's MQTT session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Receive capabilities that are turned on by subscribing on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    C2d,
    Input,
    Methods,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::C2d => "c2d",
            Feature::Input => "input",
            Feature::Methods => "methods",
        }
    }
}

impl FromStr for Feature {
    type Err = TransportError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "c2d" => Ok(Feature::C2d),
            "input" => Ok(Feature::Input),
            "methods" => Ok(Feature::Methods),
            other => Err(TransportError::InvalidArgument(format!(
                "unknown feature {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Default)]
struct FeatureFlags {
    c2d: AtomicBool,
    input: AtomicBool,
    methods: AtomicBool,
}

impl FeatureFlags {
    fn flag(&self, feature: Feature) -> &AtomicBool {
        match feature {
            Feature::C2d => &self.c2d,
            Feature::Input => &self.input,
            Feature::Methods => &self.methods,
        }
    }

    fn set(&self, feature: Feature, enabled: bool) {
        self.flag(feature).store(enabled, Ordering::SeqCst);
    }

    fn get(&self, feature: Feature) -> bool {
        self.flag(feature).load(Ordering::SeqCst)
    }
}

/// The hub-facing transport. Cheap to clone; all clones drive the same
/// session.
#[derive(Clone)]
pub struct MqttTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    core: Mutex<Core>,
    inboxes: InboxManager,
    inbound: InboundTopics,
    device_id: String,
    module_id: Option<String>,
    features: FeatureFlags,
    state_rx: watch::Receiver<ConnectionState>,
}

impl MqttTransport {
    /// Wire a transport over `provider`, authenticating with `auth`.
    ///
    /// Installs itself as the credential source's token-update callback, so
    /// a rotation while connected tears the session down and re-establishes
    /// it with the fresh token.
    pub fn new(auth: Arc<dyn AuthProvider>, provider: Box<dyn MqttProvider>) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let device_id = auth.device_id();
        let module_id = auth.module_id();

        let token_auth = Arc::clone(&auth);
        let token = Box::new(move || {
            token_auth
                .current_sas_token()
                .map_err(TransportError::from)
        });

        let inner = Arc::new(TransportInner {
            core: Mutex::new(Core::new(
                provider,
                token,
                UnknownMidPolicy::WarnAndDrop,
                state_tx,
            )),
            inboxes: InboxManager::new(),
            inbound: InboundTopics::new(&device_id, module_id.as_deref()),
            device_id,
            module_id,
            features: FeatureFlags::default(),
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

        let rotation_target = Arc::downgrade(&inner);
        auth.set_token_update_callback(Box::new(move || {
            if let Some(inner) = rotation_target.upgrade() {
                inner.with_core(|core| core.token_rotated());
            }
        }));

        MqttTransport { inner }
    }

    // Connection lifecycle
    // --------------------------------------------------------------------

    pub fn connect(&self, completion: Completion) {
        self.inner.with_core(|core| core.connect_request(completion));
    }

    pub fn disconnect(&self, completion: Completion) {
        self.inner
            .with_core(|core| core.disconnect_request(completion));
    }

    /// Observe connection-state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    // Outbound operations
    // --------------------------------------------------------------------

    /// Publish a telemetry message. Connects first if no session is up.
    pub fn send_event(&self, message: Message, completion: Completion) {
        let topic = topics::encode_telemetry_topic(
            &message,
            &self.inner.device_id,
            self.inner.module_id.as_deref(),
        );
        self.inner.with_core(|core| {
            core.submit(TransportAction::SendMessage {
                topic,
                payload: message.payload,
                completion,
            });
        });
    }

    /// Publish a telemetry message through a named module output.
    pub fn send_output_event(
        &self,
        mut message: Message,
        output_name: &str,
        completion: Completion,
    ) {
        message.output_name = Some(output_name.to_owned());
        self.send_event(message, completion);
    }

    pub fn send_method_response(&self, response: MethodResponse, completion: Completion) {
        let topic = topics::method_response_topic(response.status, &response.request_id);
        self.inner.with_core(|core| {
            core.submit(TransportAction::MethodResponse {
                topic,
                payload: response.payload,
                completion,
            });
        });
    }

    // Features
    // --------------------------------------------------------------------

    /// Subscribe to the topic backing `feature`. The feature is marked
    /// enabled once the subscription is acknowledged. Unknown feature names
    /// fail synchronously with `InvalidArgument`.
    pub fn enable_feature(&self, feature: &str, completion: Completion) {
        self.change_feature(feature, true, completion);
    }

    /// Unsubscribe from the topic backing `feature` and mark it disabled.
    pub fn disable_feature(&self, feature: &str, completion: Completion) {
        self.change_feature(feature, false, completion);
    }

    pub fn feature_enabled(&self, feature: Feature) -> bool {
        self.inner.features.get(feature)
    }

    fn change_feature(&self, feature: &str, enable: bool, completion: Completion) {
        let feature = match feature.parse::<Feature>() {
            Ok(feature) => feature,
            Err(e) => {
                completion(Err(e));
                return;
            }
        };

        let (topic, qos) = match self.feature_topic(feature) {
            Ok(pair) => pair,
            Err(e) => {
                completion(Err(e));
                return;
            }
        };

        let flags_target = Arc::downgrade(&self.inner);
        let wrapped: Completion = Box::new(move |result| {
            if result.is_ok() {
                if let Some(inner) = flags_target.upgrade() {
                    inner.features.set(feature, enable);
                }
            }
            completion(result);
        });

        self.inner.with_core(|core| {
            if enable {
                core.submit(TransportAction::Subscribe {
                    topic,
                    qos,
                    completion: wrapped,
                });
            } else {
                core.submit(TransportAction::Unsubscribe {
                    topic,
                    completion: wrapped,
                });
            }
        });
    }

    fn feature_topic(&self, feature: Feature) -> Result<(String, Qos), TransportError> {
        match feature {
            Feature::C2d => Ok((
                topics::c2d_subscribe_filter(&self.inner.device_id),
                Qos::AtLeastOnce,
            )),
            Feature::Input => match &self.inner.module_id {
                Some(module_id) => Ok((
                    topics::input_subscribe_filter(&self.inner.device_id, module_id),
                    Qos::AtLeastOnce,
                )),
                None => Err(TransportError::InvalidArgument(
                    "input messages require a module identity".into(),
                )),
            },
            // Method requests are delivered at QoS 0.
            Feature::Methods => Ok((topics::METHOD_SUBSCRIBE_FILTER.to_owned(), Qos::AtMostOnce)),
        }
    }

    // Inboxes
    // --------------------------------------------------------------------

    pub fn c2d_inbox(&self) -> Inbox<Message> {
        self.inner.inboxes.get_c2d_inbox()
    }

    pub fn input_inbox(&self, input_name: &str) -> Inbox<Message> {
        self.inner.inboxes.get_input_inbox(input_name)
    }

    pub fn generic_method_inbox(&self) -> Inbox<MethodCall> {
        self.inner.inboxes.get_generic_method_inbox()
    }

    pub fn named_method_inbox(&self, method_name: &str) -> Inbox<MethodCall> {
        self.inner.inboxes.get_named_method_inbox(method_name)
    }
}

impl TransportInner {
    /// Run `f` under the transport lock, then fire the completions it
    /// produced with the lock released.
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
            ProviderEvent::MessageReceived { topic, payload } => self.route(&topic, &payload),
            other => self.with_core(|core| core.provider_event(other)),
        }
    }

    fn route(&self, topic: &str, payload: &[u8]) {
        match self.inbound.classify(topic, payload) {
            Ok(Inbound::C2d(message)) => {
                log::debug!("received cloud-to-device message on {topic}");
                self.inboxes.route_c2d_message(message);
            }
            Ok(Inbound::Input { name, message }) => {
                log::debug!("received input message for {name:?}");
                self.inboxes.route_input_message(&name, message);
            }
            Ok(Inbound::Method(call)) => {
                log::debug!("received direct method call {:?}", call.name);
                self.inboxes.route_method_call(call);
            }
            Err(e) => log::warn!("dropping inbound publish: {e}"),
        }
    }
}
