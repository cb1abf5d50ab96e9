//! A scripted MQTT provider: records every call the transport makes and
//! lets the test deliver provider events by hand.

// Each test binary exercises a different slice of these helpers.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use aziot_device_sdk::transport::{
    Completion, Mid, MqttProvider, ProviderEvent, ProviderEventSink, Qos,
};
use aziot_device_sdk::{ProviderError, TransportError};

#[derive(Debug, Clone)]
pub enum ProviderCall {
    Connect { password: String },
    Reconnect { password: String },
    Disconnect,
    Publish { topic: String, payload: Vec<u8>, mid: Mid },
    Subscribe { topic: String, qos: Qos, mid: Mid },
    Unsubscribe { topic: String, mid: Mid },
}

#[derive(Default)]
pub struct MockState {
    sink: Mutex<Option<Arc<ProviderEventSink>>>,
    calls: Mutex<Vec<ProviderCall>>,
    next_mid: AtomicU16,
    fail_next_connect: AtomicBool,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(MockState::default())
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ProviderCall::Connect { .. }))
            .count()
    }

    pub fn publishes(&self) -> Vec<(String, Vec<u8>, Mid)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::Publish { topic, payload, mid } => Some((topic, payload, mid)),
                _ => None,
            })
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<(String, Qos, Mid)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::Subscribe { topic, qos, mid } => Some((topic, qos, mid)),
                _ => None,
            })
            .collect()
    }

    pub fn last_connect_password(&self) -> Option<String> {
        self.calls()
            .into_iter()
            .rev()
            .find_map(|call| match call {
                ProviderCall::Connect { password } | ProviderCall::Reconnect { password } => {
                    Some(password)
                }
                _ => None,
            })
    }

    /// Make the next connect call fail at the provider instead of
    /// succeeding.
    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }

    /// Deliver a provider event to the transport, the way a client
    /// library's own thread would.
    pub fn emit(&self, event: ProviderEvent) {
        let sink = self
            .sink
            .lock()
            .unwrap()
            .clone()
            .expect("transport has not installed an event sink");
        sink(event);
    }

    pub fn complete_connect(&self) {
        self.emit(ProviderEvent::ConnectComplete);
    }

    pub fn fail_connect(&self) {
        self.emit(ProviderEvent::ConnectFailed(ProviderError::ConnectionRefused(
            "NotAuthorized".into(),
        )));
    }

    pub fn lose_connection(&self) {
        self.emit(ProviderEvent::ConnectionLost(ProviderError::Connection(
            "socket closed".into(),
        )));
    }

    pub fn complete_disconnect(&self) {
        self.emit(ProviderEvent::DisconnectComplete);
    }

    pub fn ack_publish(&self, mid: Mid) {
        self.emit(ProviderEvent::PublishComplete(mid));
    }

    pub fn ack_subscribe(&self, mid: Mid) {
        self.emit(ProviderEvent::SubscribeComplete(mid));
    }

    pub fn ack_unsubscribe(&self, mid: Mid) {
        self.emit(ProviderEvent::UnsubscribeComplete(mid));
    }

    pub fn receive(&self, topic: &str, payload: &[u8]) {
        self.emit(ProviderEvent::MessageReceived {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
        });
    }

    fn record(&self, call: ProviderCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn alloc_mid(&self) -> Mid {
        self.next_mid.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub struct MockProvider {
    state: Arc<MockState>,
}

impl MockProvider {
    pub fn new(state: Arc<MockState>) -> Self {
        MockProvider { state }
    }
}

impl MqttProvider for MockProvider {
    fn set_event_sink(&mut self, sink: ProviderEventSink) {
        *self.state.sink.lock().unwrap() = Some(Arc::new(sink));
    }

    fn connect(&mut self, password: &str) -> Result<(), ProviderError> {
        if self.state.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(ProviderError::Connection("dns lookup failed".into()));
        }
        self.state.record(ProviderCall::Connect {
            password: password.to_owned(),
        });
        Ok(())
    }

    fn reconnect(&mut self, password: &str) -> Result<(), ProviderError> {
        self.state.record(ProviderCall::Reconnect {
            password: password.to_owned(),
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ProviderError> {
        self.state.record(ProviderCall::Disconnect);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], _qos: Qos) -> Result<Mid, ProviderError> {
        let mid = self.state.alloc_mid();
        self.state.record(ProviderCall::Publish {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
            mid,
        });
        Ok(mid)
    }

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<Mid, ProviderError> {
        let mid = self.state.alloc_mid();
        self.state.record(ProviderCall::Subscribe {
            topic: topic.to_owned(),
            qos,
            mid,
        });
        Ok(mid)
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<Mid, ProviderError> {
        let mid = self.state.alloc_mid();
        self.state.record(ProviderCall::Unsubscribe {
            topic: topic.to_owned(),
            mid,
        });
        Ok(mid)
    }
}

/// Collects every invocation of a completion sink.
#[derive(Clone, Default)]
pub struct CompletionProbe {
    results: Arc<Mutex<Vec<Result<(), TransportError>>>>,
}

impl CompletionProbe {
    pub fn new() -> Self {
        CompletionProbe::default()
    }

    pub fn sink(&self) -> Completion {
        let results = Arc::clone(&self.results);
        Box::new(move |result| {
            results.lock().unwrap().push(result);
        })
    }

    pub fn results(&self) -> Vec<Result<(), TransportError>> {
        self.results.lock().unwrap().clone()
    }

    pub fn fired(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn assert_fired_ok_once(&self) {
        let results = self.results();
        assert_eq!(results.len(), 1, "completion must fire exactly once");
        assert!(results[0].is_ok(), "completion failed: {:?}", results[0]);
    }

    pub fn assert_not_fired(&self) {
        assert_eq!(self.fired(), 0, "completion fired too early");
    }
}
