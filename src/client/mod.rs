//! User-facing clients over the transport.
//!
//! The synchronous flavor turns each callback-based transport call into a
//! blocking one with an internal latch; the asynchronous flavor resolves a
//! future from the same completion sink. Both are thin: the transport does
//! all the work.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthProvider, SymmetricKeyAuth};
use crate::error::TransportError;
use crate::inbox::Inbox;
use crate::models::{Message, MethodCall, MethodResponse};
use crate::transport::{
    Completion, ConnectionState, Feature, MqttTransport, ProviderConfig, RumqttcProvider,
};

mod r#async;

pub use r#async::{AsyncDeviceClient, AsyncModuleClient};

fn build_transport(
    auth: Arc<dyn AuthProvider>,
    transport_name: &str,
) -> Result<MqttTransport, TransportError> {
    if transport_name != "mqtt" {
        return Err(TransportError::InvalidArgument(format!(
            "unsupported transport {transport_name:?}"
        )));
    }
    let provider = RumqttcProvider::new(ProviderConfig::for_hub(auth.as_ref()))?;
    Ok(MqttTransport::new(auth, Box::new(provider)))
}

/// Block the caller until the transport fires the operation's completion.
fn wait_for_completion(start: impl FnOnce(Completion)) -> Result<(), TransportError> {
    let (tx, rx) = mpsc::channel();
    start(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.recv()
        .expect("completion sink dropped without being invoked")
}

/// A synchronous client for a device identity.
#[derive(Clone)]
pub struct DeviceClient {
    transport: MqttTransport,
}

impl DeviceClient {
    /// Build a client from a `HostName=…;DeviceId=…;SharedAccessKey=…`
    /// connection string.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, TransportError> {
        let auth = Arc::new(SymmetricKeyAuth::from_connection_string(connection_string)?);
        Self::from_authentication_provider(auth, "mqtt")
    }

    /// Build a client over the named transport. Only `"mqtt"` is available.
    pub fn from_authentication_provider(
        auth: Arc<dyn AuthProvider>,
        transport_name: &str,
    ) -> Result<Self, TransportError> {
        Ok(Self::from_transport(build_transport(auth, transport_name)?))
    }

    /// Wrap an existing transport, e.g. one built over a custom provider.
    pub fn from_transport(transport: MqttTransport) -> Self {
        DeviceClient { transport }
    }

    /// Connect to the hub. Returns once the session is established.
    pub fn connect(&self) -> Result<(), TransportError> {
        wait_for_completion(|done| self.transport.connect(done))
    }

    /// Disconnect from the hub. Returns once the session is closed.
    pub fn disconnect(&self) -> Result<(), TransportError> {
        wait_for_completion(|done| self.transport.disconnect(done))
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Send a telemetry message, connecting first if necessary. Returns once
    /// the hub acknowledges the publish.
    pub fn send_event(&self, message: impl Into<Message>) -> Result<(), TransportError> {
        let message = message.into();
        wait_for_completion(|done| self.transport.send_event(message, done))
    }

    /// Answer a direct method call.
    pub fn send_method_response(&self, response: MethodResponse) -> Result<(), TransportError> {
        wait_for_completion(|done| self.transport.send_method_response(response, done))
    }

    /// Turn on a receive capability (`"c2d"` or `"methods"` for devices).
    pub fn enable_feature(&self, feature: &str) -> Result<(), TransportError> {
        wait_for_completion(|done| self.transport.enable_feature(feature, done))
    }

    pub fn disable_feature(&self, feature: &str) -> Result<(), TransportError> {
        wait_for_completion(|done| self.transport.disable_feature(feature, done))
    }

    pub fn feature_enabled(&self, feature: Feature) -> bool {
        self.transport.feature_enabled(feature)
    }

    /// Next cloud-to-device message, or `None` once `timeout` elapses.
    /// Requires the `"c2d"` feature to be enabled.
    pub fn receive_c2d(&self, timeout: Option<Duration>) -> Option<Message> {
        self.transport.c2d_inbox().get(timeout)
    }

    /// Next method call that no named inbox claimed. Requires the
    /// `"methods"` feature to be enabled.
    pub fn receive_method_call(&self, timeout: Option<Duration>) -> Option<MethodCall> {
        self.transport.generic_method_inbox().get(timeout)
    }

    /// Next call to the method named `method_name`.
    pub fn receive_named_method_call(
        &self,
        method_name: &str,
        timeout: Option<Duration>,
    ) -> Option<MethodCall> {
        self.transport.named_method_inbox(method_name).get(timeout)
    }

    /// The inbox for calls to `method_name`; registering it routes those
    /// calls away from the generic inbox.
    pub fn method_inbox(&self, method_name: &str) -> Inbox<MethodCall> {
        self.transport.named_method_inbox(method_name)
    }
}

/// A synchronous client for a module identity, adding output sends and
/// input receives on top of the device surface.
#[derive(Clone)]
pub struct ModuleClient {
    transport: MqttTransport,
}

impl ModuleClient {
    /// Build a client from a connection string carrying a `ModuleId`.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, TransportError> {
        let auth = Arc::new(SymmetricKeyAuth::from_connection_string(connection_string)?);
        Self::from_authentication_provider(auth, "mqtt")
    }

    /// Build a client over the named transport. Only `"mqtt"` is available.
    pub fn from_authentication_provider(
        auth: Arc<dyn AuthProvider>,
        transport_name: &str,
    ) -> Result<Self, TransportError> {
        if auth.module_id().is_none() {
            return Err(TransportError::InvalidArgument(
                "a module client requires a ModuleId".into(),
            ));
        }
        Ok(Self::from_transport(build_transport(auth, transport_name)?))
    }

    pub fn from_transport(transport: MqttTransport) -> Self {
        ModuleClient { transport }
    }

    pub fn connect(&self) -> Result<(), TransportError> {
        wait_for_completion(|done| self.transport.connect(done))
    }

    pub fn disconnect(&self) -> Result<(), TransportError> {
        wait_for_completion(|done| self.transport.disconnect(done))
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn send_event(&self, message: impl Into<Message>) -> Result<(), TransportError> {
        let message = message.into();
        wait_for_completion(|done| self.transport.send_event(message, done))
    }

    /// Send a message through the module output named `output_name`.
    pub fn send_to_output(
        &self,
        message: impl Into<Message>,
        output_name: &str,
    ) -> Result<(), TransportError> {
        let message = message.into();
        wait_for_completion(|done| self.transport.send_output_event(message, output_name, done))
    }

    pub fn send_method_response(&self, response: MethodResponse) -> Result<(), TransportError> {
        wait_for_completion(|done| self.transport.send_method_response(response, done))
    }

    pub fn enable_feature(&self, feature: &str) -> Result<(), TransportError> {
        wait_for_completion(|done| self.transport.enable_feature(feature, done))
    }

    pub fn disable_feature(&self, feature: &str) -> Result<(), TransportError> {
        wait_for_completion(|done| self.transport.disable_feature(feature, done))
    }

    pub fn feature_enabled(&self, feature: Feature) -> bool {
        self.transport.feature_enabled(feature)
    }

    /// Register interest in the input named `input_name` and return its
    /// inbox. Messages for inputs nobody registered are dropped.
    pub fn input_inbox(&self, input_name: &str) -> Inbox<Message> {
        self.transport.input_inbox(input_name)
    }

    /// Next message on the input named `input_name`, or `None` once
    /// `timeout` elapses. Requires the `"input"` feature to be enabled.
    pub fn receive_input(&self, input_name: &str, timeout: Option<Duration>) -> Option<Message> {
        self.transport.input_inbox(input_name).get(timeout)
    }

    pub fn receive_method_call(&self, timeout: Option<Duration>) -> Option<MethodCall> {
        self.transport.generic_method_inbox().get(timeout)
    }
}
