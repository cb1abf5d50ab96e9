//! [`MqttProvider`] implementation over `rumqttc`.
//!
//! `rumqttc` assigns packet ids only when its event loop picks a request up,
//! so the MIDs handed out here are provider-local. Requests are processed in
//! submission order, which lets the poll task pair each `Outgoing` event
//! with the oldest unpaired MID of the same kind and translate the matching
//! acknowledgement back.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use tokio_util::sync::CancellationToken;

use super::provider::{Mid, MqttProvider, ProviderConfig, ProviderEvent, ProviderEventSink, Qos};
use crate::error::ProviderError;

const KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);
const REQUEST_CHANNEL_CAPACITY: usize = 64;

pub struct RumqttcProvider {
    config: ProviderConfig,
    runtime: Option<tokio::runtime::Runtime>,
    sink: Option<Arc<ProviderEventSink>>,
    correlation: Arc<Mutex<Correlation>>,
    session: Option<Session>,
}

struct Session {
    client: AsyncClient,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Correlation {
    next_mid: Mid,
    pending_publishes: VecDeque<(Mid, Qos)>,
    pending_subscribes: VecDeque<Mid>,
    pending_unsubscribes: VecDeque<Mid>,
    publishes_by_pkid: HashMap<u16, Mid>,
    subscribes_by_pkid: HashMap<u16, Mid>,
    unsubscribes_by_pkid: HashMap<u16, Mid>,
}

impl Correlation {
    fn alloc_mid(&mut self) -> Mid {
        self.next_mid = self.next_mid.wrapping_add(1).max(1);
        self.next_mid
    }

    /// Forget the in-flight bookkeeping of a dead session. MID allocation
    /// keeps counting so stale MIDs are not reissued right away.
    fn reset_in_flight(&mut self) {
        self.pending_publishes.clear();
        self.pending_subscribes.clear();
        self.pending_unsubscribes.clear();
        self.publishes_by_pkid.clear();
        self.subscribes_by_pkid.clear();
        self.unsubscribes_by_pkid.clear();
    }
}

impl RumqttcProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|e| ProviderError::Client(format!("cannot build tokio runtime: {e}")))?;

        Ok(RumqttcProvider {
            config,
            runtime: Some(runtime),
            sink: None,
            correlation: Arc::new(Mutex::new(Correlation::default())),
            session: None,
        })
    }

    fn start_session(&mut self, password: &str) -> Result<(), ProviderError> {
        let sink = self
            .sink
            .as_ref()
            .cloned()
            .ok_or_else(|| ProviderError::Client("event sink not installed".into()))?;

        self.teardown_session();
        self.correlation
            .lock()
            .expect("correlation lock poisoned")
            .reset_in_flight();

        let mut options = MqttOptions::new(
            self.config.client_id.as_str(),
            self.config.hostname.as_str(),
            self.config.port,
        );
        options.set_credentials(self.config.username.as_str(), password);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(false);
        options.set_transport(Transport::Tls(tls_configuration(
            self.config.ca_cert.as_deref(),
        )?));

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let cancel = CancellationToken::new();
        let runtime = self
            .runtime
            .as_ref()
            .expect("runtime lives as long as the provider");
        runtime.spawn(run_session(
            eventloop,
            sink,
            Arc::clone(&self.correlation),
            cancel.clone(),
        ));

        self.session = Some(Session { client, cancel });
        Ok(())
    }

    fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
        }
    }

    fn client(&self) -> Result<&AsyncClient, ProviderError> {
        self.session
            .as_ref()
            .map(|session| &session.client)
            .ok_or(ProviderError::NotConnected)
    }
}

impl MqttProvider for RumqttcProvider {
    fn set_event_sink(&mut self, sink: ProviderEventSink) {
        self.sink = Some(Arc::new(sink));
    }

    fn connect(&mut self, password: &str) -> Result<(), ProviderError> {
        log::debug!("opening mqtt session to {}:{}", self.config.hostname, self.config.port);
        self.start_session(password)
    }

    fn reconnect(&mut self, password: &str) -> Result<(), ProviderError> {
        log::debug!("re-opening mqtt session with fresh credentials");
        self.start_session(password)
    }

    fn disconnect(&mut self) -> Result<(), ProviderError> {
        let client = self.client()?;
        client
            .try_disconnect()
            .map_err(|e| ProviderError::Client(e.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: Qos) -> Result<Mid, ProviderError> {
        let client = self.client()?.clone();
        let mut correlation = self.correlation.lock().expect("correlation lock poisoned");
        let mid = correlation.alloc_mid();
        correlation.pending_publishes.push_back((mid, qos));

        if let Err(e) = client.try_publish(topic, to_rumqttc_qos(qos), false, payload.to_vec()) {
            correlation.pending_publishes.pop_back();
            return Err(ProviderError::Client(e.to_string()));
        }
        Ok(mid)
    }

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<Mid, ProviderError> {
        let client = self.client()?.clone();
        let mut correlation = self.correlation.lock().expect("correlation lock poisoned");
        let mid = correlation.alloc_mid();
        correlation.pending_subscribes.push_back(mid);

        if let Err(e) = client.try_subscribe(topic, to_rumqttc_qos(qos)) {
            correlation.pending_subscribes.pop_back();
            return Err(ProviderError::Client(e.to_string()));
        }
        Ok(mid)
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<Mid, ProviderError> {
        let client = self.client()?.clone();
        let mut correlation = self.correlation.lock().expect("correlation lock poisoned");
        let mid = correlation.alloc_mid();
        correlation.pending_unsubscribes.push_back(mid);

        if let Err(e) = client.try_unsubscribe(topic) {
            correlation.pending_unsubscribes.pop_back();
            return Err(ProviderError::Client(e.to_string()));
        }
        Ok(mid)
    }
}

impl Drop for RumqttcProvider {
    fn drop(&mut self) {
        self.teardown_session();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn run_session(
    mut eventloop: rumqttc::EventLoop,
    sink: Arc<ProviderEventSink>,
    correlation: Arc<Mutex<Correlation>>,
    cancel: CancellationToken,
) {
    log::debug!("mqtt poll task is starting");
    let mut connected = false;
    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("mqtt poll task cancelled");
                break;
            }
            notification = eventloop.poll() => notification,
        };

        let flow = match notification {
            Ok(Event::Incoming(packet)) => {
                process_incoming(packet, &mut connected, &correlation, &sink)
            }
            Ok(Event::Outgoing(outgoing)) => process_outgoing(outgoing, &correlation, &sink),
            Err(e) => {
                process_poll_error(&e, connected, &sink);
                Flow::Stop
            }
        };

        if matches!(flow, Flow::Stop) {
            break;
        }
    }
    log::debug!("mqtt poll task has ended");
}

enum Flow {
    Continue,
    Stop,
}

fn process_incoming(
    packet: Packet,
    connected: &mut bool,
    correlation: &Mutex<Correlation>,
    sink: &ProviderEventSink,
) -> Flow {
    log::trace!("received = {packet:?}");
    match packet {
        Packet::ConnAck(ack) => {
            if ack.code == ConnectReturnCode::Success {
                *connected = true;
                sink(ProviderEvent::ConnectComplete);
            } else {
                sink(ProviderEvent::ConnectFailed(ProviderError::ConnectionRefused(
                    format!("{:?}", ack.code),
                )));
                return Flow::Stop;
            }
        }
        Packet::Publish(publish) => {
            sink(ProviderEvent::MessageReceived {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            });
        }
        Packet::PubAck(ack) => {
            let mid = correlation
                .lock()
                .expect("correlation lock poisoned")
                .publishes_by_pkid
                .remove(&ack.pkid);
            match mid {
                Some(mid) => sink(ProviderEvent::PublishComplete(mid)),
                None => log::warn!("PUBACK for untracked packet id {}", ack.pkid),
            }
        }
        Packet::SubAck(ack) => {
            if ack
                .return_codes
                .iter()
                .any(|code| *code == SubscribeReasonCode::Failure)
            {
                log::warn!("broker rejected part of a subscription request");
            }
            let mid = correlation
                .lock()
                .expect("correlation lock poisoned")
                .subscribes_by_pkid
                .remove(&ack.pkid);
            match mid {
                Some(mid) => sink(ProviderEvent::SubscribeComplete(mid)),
                None => log::warn!("SUBACK for untracked packet id {}", ack.pkid),
            }
        }
        Packet::UnsubAck(ack) => {
            let mid = correlation
                .lock()
                .expect("correlation lock poisoned")
                .unsubscribes_by_pkid
                .remove(&ack.pkid);
            match mid {
                Some(mid) => sink(ProviderEvent::UnsubscribeComplete(mid)),
                None => log::warn!("UNSUBACK for untracked packet id {}", ack.pkid),
            }
        }
        Packet::PubRec(_) | Packet::PubRel(_) | Packet::PubComp(_) => {
            // QoS 2 is never negotiated.
            log::warn!("ignoring unexpected QoS 2 packet");
        }
        _ => {}
    }
    Flow::Continue
}

fn process_outgoing(
    outgoing: Outgoing,
    correlation: &Mutex<Correlation>,
    sink: &ProviderEventSink,
) -> Flow {
    log::trace!("sending = {outgoing:?}");
    match outgoing {
        Outgoing::Publish(pkid) => {
            let mut correlation = correlation.lock().expect("correlation lock poisoned");
            match correlation.pending_publishes.pop_front() {
                // QoS 0 publishes are done once they leave; nothing will
                // acknowledge them.
                Some((mid, Qos::AtMostOnce)) => {
                    drop(correlation);
                    sink(ProviderEvent::PublishComplete(mid));
                }
                Some((mid, Qos::AtLeastOnce)) => {
                    correlation.publishes_by_pkid.insert(pkid, mid);
                }
                None => log::warn!("outgoing publish without a pending request"),
            }
        }
        Outgoing::Subscribe(pkid) => {
            let mut correlation = correlation.lock().expect("correlation lock poisoned");
            match correlation.pending_subscribes.pop_front() {
                Some(mid) => {
                    correlation.subscribes_by_pkid.insert(pkid, mid);
                }
                None => log::warn!("outgoing subscribe without a pending request"),
            }
        }
        Outgoing::Unsubscribe(pkid) => {
            let mut correlation = correlation.lock().expect("correlation lock poisoned");
            match correlation.pending_unsubscribes.pop_front() {
                Some(mid) => {
                    correlation.unsubscribes_by_pkid.insert(pkid, mid);
                }
                None => log::warn!("outgoing unsubscribe without a pending request"),
            }
        }
        Outgoing::Disconnect => {
            sink(ProviderEvent::DisconnectComplete);
            return Flow::Stop;
        }
        _ => {}
    }
    Flow::Continue
}

fn process_poll_error(error: &ConnectionError, connected: bool, sink: &ProviderEventSink) {
    log::debug!("mqtt event loop error: {error:?}");
    let provider_error = match error {
        ConnectionError::ConnectionRefused(code) => {
            ProviderError::ConnectionRefused(format!("{code:?}"))
        }
        other => ProviderError::Connection(other.to_string()),
    };
    if connected {
        sink(ProviderEvent::ConnectionLost(provider_error));
    } else {
        sink(ProviderEvent::ConnectFailed(provider_error));
    }
}

/// System trust roots by default; a configured CA (e.g. an edge gateway's
/// certificate) becomes an extra trust root.
fn tls_configuration(ca_cert: Option<&[u8]>) -> Result<TlsConfiguration, ProviderError> {
    match ca_cert {
        None => Ok(TlsConfiguration::Native),
        Some(ca) => {
            native_tls::Certificate::from_pem(ca)
                .map_err(|e| ProviderError::Client(format!("invalid ca certificate: {e}")))?;
            Ok(TlsConfiguration::SimpleNative {
                ca: ca.to_vec(),
                client_auth: None,
            })
        }
    }
}

fn to_rumqttc_qos(qos: Qos) -> rumqttc::QoS {
    match qos {
        Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
        Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::mqttbytes::v4 as packets;
    use std::sync::mpsc;

    fn collecting_sink() -> (ProviderEventSink, mpsc::Receiver<ProviderEvent>) {
        let (tx, rx) = mpsc::channel();
        let sink: ProviderEventSink = Box::new(move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    #[test]
    fn puback_resolves_to_allocated_mid() {
        let correlation = Mutex::new(Correlation::default());
        let (sink, events) = collecting_sink();

        let mid = {
            let mut c = correlation.lock().unwrap();
            let mid = c.alloc_mid();
            c.pending_publishes.push_back((mid, Qos::AtLeastOnce));
            mid
        };

        let mut connected = true;
        process_outgoing(Outgoing::Publish(17), &correlation, &sink);
        process_incoming(
            Packet::PubAck(packets::PubAck { pkid: 17 }),
            &mut connected,
            &correlation,
            &sink,
        );

        match events.try_recv().unwrap() {
            ProviderEvent::PublishComplete(done) => assert_eq!(done, mid),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn qos0_publish_completes_on_send() {
        let correlation = Mutex::new(Correlation::default());
        let (sink, events) = collecting_sink();

        let mid = {
            let mut c = correlation.lock().unwrap();
            let mid = c.alloc_mid();
            c.pending_publishes.push_back((mid, Qos::AtMostOnce));
            mid
        };

        process_outgoing(Outgoing::Publish(0), &correlation, &sink);
        match events.try_recv().unwrap() {
            ProviderEvent::PublishComplete(done) => assert_eq!(done, mid),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn suback_resolves_in_submission_order() {
        let correlation = Mutex::new(Correlation::default());
        let (sink, events) = collecting_sink();

        let (first, second) = {
            let mut c = correlation.lock().unwrap();
            let first = c.alloc_mid();
            c.pending_subscribes.push_back(first);
            let second = c.alloc_mid();
            c.pending_subscribes.push_back(second);
            (first, second)
        };

        let mut connected = true;
        process_outgoing(Outgoing::Subscribe(3), &correlation, &sink);
        process_outgoing(Outgoing::Subscribe(4), &correlation, &sink);
        // Acknowledgements may come back out of order.
        process_incoming(
            Packet::SubAck(packets::SubAck {
                pkid: 4,
                return_codes: vec![SubscribeReasonCode::Success(rumqttc::QoS::AtLeastOnce)],
            }),
            &mut connected,
            &correlation,
            &sink,
        );
        process_incoming(
            Packet::SubAck(packets::SubAck {
                pkid: 3,
                return_codes: vec![SubscribeReasonCode::Success(rumqttc::QoS::AtLeastOnce)],
            }),
            &mut connected,
            &correlation,
            &sink,
        );

        match events.try_recv().unwrap() {
            ProviderEvent::SubscribeComplete(done) => assert_eq!(done, second),
            other => panic!("unexpected event {other:?}"),
        }
        match events.try_recv().unwrap() {
            ProviderEvent::SubscribeComplete(done) => assert_eq!(done, first),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn connack_success_reports_connected() {
        let correlation = Mutex::new(Correlation::default());
        let (sink, events) = collecting_sink();
        let mut connected = false;

        process_incoming(
            Packet::ConnAck(packets::ConnAck {
                session_present: false,
                code: ConnectReturnCode::Success,
            }),
            &mut connected,
            &correlation,
            &sink,
        );

        assert!(connected);
        assert!(matches!(
            events.try_recv().unwrap(),
            ProviderEvent::ConnectComplete
        ));
    }

    #[test]
    fn inbound_publish_is_forwarded_verbatim() {
        let correlation = Mutex::new(Correlation::default());
        let (sink, events) = collecting_sink();
        let mut connected = true;

        let publish = packets::Publish::new(
            "devices/d1/messages/devicebound/",
            rumqttc::QoS::AtLeastOnce,
            vec![1u8, 2],
        );
        process_incoming(Packet::Publish(publish), &mut connected, &correlation, &sink);

        match events.try_recv().unwrap() {
            ProviderEvent::MessageReceived { topic, payload } => {
                assert_eq!(topic, "devices/d1/messages/devicebound/");
                assert_eq!(payload, vec![1, 2]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn poll_error_before_connack_is_a_connect_failure() {
        let (sink, events) = collecting_sink();
        process_poll_error(
            &ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized),
            false,
            &sink,
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            ProviderEvent::ConnectFailed(ProviderError::ConnectionRefused(_))
        ));
    }
}
