//! The connection state machine that owns the MQTT session.
//!
//! All provider calls originate here, and every state transition, queue
//! mutation and callback-map mutation happens while the caller holds the
//! transport lock around this struct. Completion sinks are never invoked
//! under that lock; they are collected as effects and fired by the caller
//! after the lock is released.

use std::collections::VecDeque;

use tokio::sync::watch;

use super::actions::{ActionQueue, CallbackMap, TransportAction, UnknownMidPolicy};
use super::provider::{MqttProvider, ProviderEvent, ProviderEventSink, Qos};
use super::{Completion, ConnectionState};
use crate::error::{ProviderError, TransportError};

/// Produces the current credential for a connect or reconnect.
pub(crate) type TokenSource = Box<dyn Fn() -> Result<String, TransportError> + Send>;

/// A completion ready to fire once the transport lock is released.
pub(crate) type Effect = (Completion, Result<(), TransportError>);

enum Trigger {
    Connect,
    Disconnect,
    Submit(TransportAction),
    SubmitBatch(Vec<TransportAction>),
    TokenRotated,
    ProviderConnectComplete,
    ProviderConnectFailed(ProviderError),
    ProviderDisconnectComplete,
    ConnectionLost(ProviderError),
}

impl Trigger {
    fn name(&self) -> &'static str {
        match self {
            Trigger::Connect => "connect",
            Trigger::Disconnect => "disconnect",
            Trigger::Submit(_) => "submit",
            Trigger::SubmitBatch(_) => "submit batch",
            Trigger::TokenRotated => "token rotated",
            Trigger::ProviderConnectComplete => "provider connect complete",
            Trigger::ProviderConnectFailed(_) => "provider connect failed",
            Trigger::ProviderDisconnectComplete => "provider disconnect complete",
            Trigger::ConnectionLost(_) => "connection lost",
        }
    }
}

pub(crate) struct Core {
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    triggers: VecDeque<Trigger>,
    dispatching: bool,
    queue: ActionQueue,
    callbacks: CallbackMap,
    connect_callbacks: Vec<Completion>,
    disconnect_callbacks: Vec<Completion>,
    provider: Box<dyn MqttProvider>,
    token: TokenSource,
    effects: Vec<Effect>,
}

impl Core {
    pub(crate) fn new(
        provider: Box<dyn MqttProvider>,
        token: TokenSource,
        unknown_mid_policy: UnknownMidPolicy,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        Core {
            state: ConnectionState::Disconnected,
            state_tx,
            triggers: VecDeque::new(),
            dispatching: false,
            queue: ActionQueue::default(),
            callbacks: CallbackMap::new(unknown_mid_policy),
            connect_callbacks: Vec::new(),
            disconnect_callbacks: Vec::new(),
            provider,
            token,
            effects: Vec::new(),
        }
    }

    pub(crate) fn set_event_sink(&mut self, sink: ProviderEventSink) {
        self.provider.set_event_sink(sink);
    }

    /// Completions collected while handling the last call. The caller must
    /// fire these after releasing the transport lock.
    pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    // Entry points, one per external stimulus
    // --------------------------------------------------------------------

    pub(crate) fn connect_request(&mut self, completion: Completion) {
        match self.state {
            // Already connected, or no transition exists for connect while
            // disconnecting: nothing will ever drain the callback list, so
            // the no-op completes right away.
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                self.effects.push((completion, Ok(())));
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                self.connect_callbacks.push(completion);
                self.push_trigger(Trigger::Connect);
            }
        }
    }

    pub(crate) fn disconnect_request(&mut self, completion: Completion) {
        match self.state {
            // Already disconnected, or no transition exists for disconnect
            // while connecting: complete the no-op right away.
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                self.effects.push((completion, Ok(())));
            }
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                self.disconnect_callbacks.push(completion);
                self.push_trigger(Trigger::Disconnect);
            }
        }
    }

    pub(crate) fn submit(&mut self, action: TransportAction) {
        self.push_trigger(Trigger::Submit(action));
    }

    /// Submit several actions as one unit: all of them are queued before any
    /// connect they trigger can complete.
    pub(crate) fn submit_batch(&mut self, actions: Vec<TransportAction>) {
        self.push_trigger(Trigger::SubmitBatch(actions));
    }

    pub(crate) fn token_rotated(&mut self) {
        self.push_trigger(Trigger::TokenRotated);
    }

    pub(crate) fn provider_event(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::ConnectComplete => self.push_trigger(Trigger::ProviderConnectComplete),
            ProviderEvent::ConnectFailed(e) => {
                self.push_trigger(Trigger::ProviderConnectFailed(e));
            }
            ProviderEvent::DisconnectComplete => {
                self.push_trigger(Trigger::ProviderDisconnectComplete);
            }
            ProviderEvent::ConnectionLost(e) => self.push_trigger(Trigger::ConnectionLost(e)),
            ProviderEvent::PublishComplete(mid)
            | ProviderEvent::SubscribeComplete(mid)
            | ProviderEvent::UnsubscribeComplete(mid) => {
                if let Some(completion) = self.callbacks.complete(mid) {
                    self.effects.push((completion, Ok(())));
                }
            }
            ProviderEvent::MessageReceived { topic, .. } => {
                // Inbound publishes are routed by the owning transport
                // before the lock around this struct is taken.
                log::error!("unrouted inbound publish reached the state machine: {topic:?}");
            }
        }
    }

    // Trigger dispatch
    // --------------------------------------------------------------------

    /// Triggers are serialized: one fired while another's side effects are
    /// still running is queued and handled afterwards, so the state field is
    /// never mutated re-entrantly.
    fn push_trigger(&mut self, trigger: Trigger) {
        self.triggers.push_back(trigger);
        if self.dispatching {
            return;
        }
        self.dispatching = true;
        while let Some(trigger) = self.triggers.pop_front() {
            self.dispatch(trigger);
        }
        self.dispatching = false;
    }

    fn dispatch(&mut self, trigger: Trigger) {
        let from = self.state;
        let name = trigger.name();

        match trigger {
            Trigger::Connect => {
                if matches!(self.state, ConnectionState::Disconnected) {
                    self.set_state(ConnectionState::Connecting);
                    self.call_provider_connect(false);
                }
            }
            Trigger::Disconnect => {
                if matches!(self.state, ConnectionState::Connected) {
                    self.set_state(ConnectionState::Disconnecting);
                    if let Err(e) = self.provider.disconnect() {
                        // A disconnect is never surfaced as a failure; the
                        // session is gone either way.
                        log::warn!("provider disconnect failed: {e}");
                        self.finish_disconnect();
                    }
                }
            }
            Trigger::Submit(action) => {
                self.queue.push(action);
                self.after_submit();
            }
            Trigger::SubmitBatch(actions) => {
                for action in actions {
                    self.queue.push(action);
                }
                self.after_submit();
            }
            Trigger::TokenRotated => {
                if matches!(self.state, ConnectionState::Connected) {
                    log::info!("credentials rotated, re-establishing the session");
                    // The replacement session never acknowledges MIDs issued
                    // on the one being torn down; their completions must not
                    // be left waiting for an ack that cannot arrive. Queued
                    // actions stay put and drain after the reconnect.
                    let in_flight = self.callbacks.drain();
                    for completion in in_flight {
                        self.effects
                            .push((completion, Err(TransportError::NotConnected)));
                    }
                    self.set_state(ConnectionState::Connecting);
                    self.call_provider_connect(true);
                }
            }
            Trigger::ProviderConnectComplete => {
                if matches!(self.state, ConnectionState::Connecting) {
                    self.set_state(ConnectionState::Connected);
                    let callbacks: Vec<_> = self.connect_callbacks.drain(..).collect();
                    for completion in callbacks {
                        self.effects.push((completion, Ok(())));
                    }
                    self.drain_queue();
                }
            }
            Trigger::ProviderConnectFailed(e) => {
                if matches!(self.state, ConnectionState::Connecting) {
                    self.fail_connect(TransportError::Provider(e));
                }
            }
            Trigger::ProviderDisconnectComplete => {
                if matches!(self.state, ConnectionState::Disconnecting) {
                    self.finish_disconnect();
                }
            }
            Trigger::ConnectionLost(e) => match self.state {
                ConnectionState::Connected => {
                    log::warn!("connection lost: {e}");
                    self.set_state(ConnectionState::Disconnected);
                    self.fail_pending(TransportError::NotConnected);
                }
                ConnectionState::Connecting => {
                    self.fail_connect(TransportError::Provider(e));
                }
                _ => {}
            },
        }

        log::debug!("transition attempt: trigger={name}, {from:?} -> {:?}", self.state);
    }

    // Side effects
    // --------------------------------------------------------------------

    fn set_state(&mut self, next: ConnectionState) {
        self.state = next;
        let _ = self.state_tx.send(next);
    }

    fn call_provider_connect(&mut self, reconnect: bool) {
        let password = match (self.token)() {
            Ok(password) => password,
            Err(e) => {
                self.fail_connect(e);
                return;
            }
        };

        log::debug!("calling provider {}", if reconnect { "reconnect" } else { "connect" });
        let result = if reconnect {
            self.provider.reconnect(&password)
        } else {
            self.provider.connect(&password)
        };

        if let Err(e) = result {
            self.fail_connect(TransportError::Provider(e));
        }
    }

    fn fail_connect(&mut self, error: TransportError) {
        log::warn!("connect failed: {error}");
        self.set_state(ConnectionState::Disconnected);
        let callbacks: Vec<_> = self.connect_callbacks.drain(..).collect();
        for completion in callbacks {
            self.effects.push((completion, Err(error.clone())));
        }
        // Queued actions fail, and so do any in-flight ones left over from a
        // session this reconnect attempt was replacing.
        self.fail_pending(TransportError::NotConnected);
    }

    fn finish_disconnect(&mut self) {
        self.set_state(ConnectionState::Disconnected);
        let callbacks: Vec<_> = self.disconnect_callbacks.drain(..).collect();
        for completion in callbacks {
            self.effects.push((completion, Ok(())));
        }
    }

    /// Fail every queued action and every in-flight callback-map entry.
    fn fail_pending(&mut self, error: TransportError) {
        for completion in self.queue.fail_all() {
            self.effects.push((completion, Err(error.clone())));
        }
        for completion in self.callbacks.drain() {
            self.effects.push((completion, Err(error.clone())));
        }
    }

    fn after_submit(&mut self) {
        match self.state {
            ConnectionState::Connected => self.drain_queue(),
            ConnectionState::Connecting | ConnectionState::Disconnecting => {}
            ConnectionState::Disconnected => {
                self.set_state(ConnectionState::Connecting);
                self.call_provider_connect(false);
            }
        }
    }

    fn drain_queue(&mut self) {
        while matches!(self.state, ConnectionState::Connected) {
            let Some(action) = self.queue.pop() else {
                break;
            };
            self.run_action(action);
        }
    }

    fn run_action(&mut self, action: TransportAction) {
        let kind = action.kind();
        let (result, completion) = match action {
            TransportAction::SendMessage {
                topic,
                payload,
                completion,
            }
            | TransportAction::MethodResponse {
                topic,
                payload,
                completion,
            }
            | TransportAction::SendRegistrationRequest {
                topic,
                payload,
                completion,
            } => (
                self.provider.publish(&topic, &payload, Qos::AtLeastOnce),
                completion,
            ),
            TransportAction::Subscribe {
                topic,
                qos,
                completion,
            } => (self.provider.subscribe(&topic, qos), completion),
            TransportAction::Unsubscribe { topic, completion } => {
                (self.provider.unsubscribe(&topic), completion)
            }
        };

        match result {
            Ok(mid) => {
                log::trace!("{kind} action dispatched as MID {mid}");
                if let Some(ready) = self.callbacks.register(mid, completion) {
                    self.effects.push((ready, Ok(())));
                }
            }
            Err(e) => {
                log::warn!("{kind} action failed at the provider: {e}");
                self.effects.push((completion, Err(TransportError::Provider(e))));
            }
        }
    }
}
