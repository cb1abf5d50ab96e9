//! Awaitable flavor of the clients: the same transport calls, with the
//! completion sink resolving a oneshot instead of a latch.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::models::{Message, MethodCall, MethodResponse};
use crate::transport::{Completion, ConnectionState, Feature, MqttTransport};

async fn resolve(start: impl FnOnce(Completion)) -> Result<(), TransportError> {
    let (tx, rx) = oneshot::channel();
    start(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.await
        .expect("completion sink dropped without being invoked")
}

/// Awaitable client for a device identity. Shares its transport with any
/// synchronous [`DeviceClient`](crate::client::DeviceClient) built over the
/// same one.
#[derive(Clone)]
pub struct AsyncDeviceClient {
    transport: MqttTransport,
}

impl AsyncDeviceClient {
    pub fn from_transport(transport: MqttTransport) -> Self {
        AsyncDeviceClient { transport }
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        resolve(|done| self.transport.connect(done)).await
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        resolve(|done| self.transport.disconnect(done)).await
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub async fn send_event(&self, message: impl Into<Message>) -> Result<(), TransportError> {
        let message = message.into();
        resolve(|done| self.transport.send_event(message, done)).await
    }

    pub async fn send_method_response(
        &self,
        response: MethodResponse,
    ) -> Result<(), TransportError> {
        resolve(|done| self.transport.send_method_response(response, done)).await
    }

    pub async fn enable_feature(&self, feature: &str) -> Result<(), TransportError> {
        resolve(|done| self.transport.enable_feature(feature, done)).await
    }

    pub async fn disable_feature(&self, feature: &str) -> Result<(), TransportError> {
        resolve(|done| self.transport.disable_feature(feature, done)).await
    }

    pub fn feature_enabled(&self, feature: Feature) -> bool {
        self.transport.feature_enabled(feature)
    }

    /// Next cloud-to-device message. The wait runs on the blocking pool so
    /// the async runtime is never stalled.
    pub async fn receive_c2d(&self, timeout: Option<Duration>) -> Option<Message> {
        let inbox = self.transport.c2d_inbox();
        tokio::task::spawn_blocking(move || inbox.get(timeout))
            .await
            .expect("inbox wait panicked")
    }

    pub async fn receive_method_call(&self, timeout: Option<Duration>) -> Option<MethodCall> {
        let inbox = self.transport.generic_method_inbox();
        tokio::task::spawn_blocking(move || inbox.get(timeout))
            .await
            .expect("inbox wait panicked")
    }
}

/// Awaitable client for a module identity.
#[derive(Clone)]
pub struct AsyncModuleClient {
    transport: MqttTransport,
}

impl AsyncModuleClient {
    pub fn from_transport(transport: MqttTransport) -> Self {
        AsyncModuleClient { transport }
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        resolve(|done| self.transport.connect(done)).await
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        resolve(|done| self.transport.disconnect(done)).await
    }

    pub async fn send_event(&self, message: impl Into<Message>) -> Result<(), TransportError> {
        let message = message.into();
        resolve(|done| self.transport.send_event(message, done)).await
    }

    pub async fn send_to_output(
        &self,
        message: impl Into<Message>,
        output_name: &str,
    ) -> Result<(), TransportError> {
        let message = message.into();
        resolve(|done| self.transport.send_output_event(message, output_name, done)).await
    }

    pub async fn enable_feature(&self, feature: &str) -> Result<(), TransportError> {
        resolve(|done| self.transport.enable_feature(feature, done)).await
    }

    pub async fn disable_feature(&self, feature: &str) -> Result<(), TransportError> {
        resolve(|done| self.transport.disable_feature(feature, done)).await
    }

    pub async fn receive_input(
        &self,
        input_name: &str,
        timeout: Option<Duration>,
    ) -> Option<Message> {
        let inbox = self.transport.input_inbox(input_name);
        tokio::task::spawn_blocking(move || inbox.get(timeout))
            .await
            .expect("inbox wait panicked")
    }
}
