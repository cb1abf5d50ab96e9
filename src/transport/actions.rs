//! The pending-action queue and the MID-to-completion correlation map.

use std::collections::{HashMap, HashSet, VecDeque};

use super::provider::{Mid, Qos};
use super::Completion;

/// A user request waiting for (or in flight on) the MQTT session.
///
/// Every action carries exactly one completion sink, and that sink fires
/// exactly once: on acknowledgement, on failure, or when the connection is
/// torn down underneath it.
pub(crate) enum TransportAction {
    SendMessage {
        topic: String,
        payload: Vec<u8>,
        completion: Completion,
    },
    Subscribe {
        topic: String,
        qos: Qos,
        completion: Completion,
    },
    Unsubscribe {
        topic: String,
        completion: Completion,
    },
    MethodResponse {
        topic: String,
        payload: Vec<u8>,
        completion: Completion,
    },
    SendRegistrationRequest {
        topic: String,
        payload: Vec<u8>,
        completion: Completion,
    },
}

impl TransportAction {
    pub(crate) fn into_completion(self) -> Completion {
        match self {
            TransportAction::SendMessage { completion, .. }
            | TransportAction::Subscribe { completion, .. }
            | TransportAction::Unsubscribe { completion, .. }
            | TransportAction::MethodResponse { completion, .. }
            | TransportAction::SendRegistrationRequest { completion, .. } => completion,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            TransportAction::SendMessage { .. } => "send message",
            TransportAction::Subscribe { .. } => "subscribe",
            TransportAction::Unsubscribe { .. } => "unsubscribe",
            TransportAction::MethodResponse { .. } => "method response",
            TransportAction::SendRegistrationRequest { .. } => "registration request",
        }
    }
}

/// FIFO of actions waiting for a connected session. Actions are never
/// reordered.
#[derive(Default)]
pub(crate) struct ActionQueue {
    actions: VecDeque<TransportAction>,
}

impl ActionQueue {
    pub(crate) fn push(&mut self, action: TransportAction) {
        log::debug!("queueing {} action", action.kind());
        self.actions.push_back(action);
    }

    pub(crate) fn pop(&mut self) -> Option<TransportAction> {
        self.actions.pop_front()
    }

    /// Empty the queue, handing back every completion so the caller can fail
    /// them.
    pub(crate) fn fail_all(&mut self) -> Vec<Completion> {
        self.actions
            .drain(..)
            .map(TransportAction::into_completion)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.actions.len()
    }
}

/// What to do with an acknowledgement whose MID has no registered
/// completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnknownMidPolicy {
    /// Log and drop. Acknowledgements can legitimately arrive for
    /// operations nobody tracks.
    WarnAndDrop,
    /// Remember the MID so a registration arriving after the fact completes
    /// immediately. Needed when the provider can deliver an acknowledgement
    /// on another thread before the originating call has returned its MID.
    Stash,
}

/// Correlates wire MIDs with the completion of the action that produced
/// them.
pub(crate) struct CallbackMap {
    callbacks: HashMap<Mid, Completion>,
    unknown: HashSet<Mid>,
    policy: UnknownMidPolicy,
}

impl CallbackMap {
    pub(crate) fn new(policy: UnknownMidPolicy) -> Self {
        CallbackMap {
            callbacks: HashMap::new(),
            unknown: HashSet::new(),
            policy,
        }
    }

    /// Track `completion` under `mid`. If that MID's acknowledgement was
    /// already stashed, the completion is returned and must be fired by the
    /// caller right away.
    pub(crate) fn register(&mut self, mid: Mid, completion: Completion) -> Option<Completion> {
        if self.unknown.remove(&mid) {
            log::debug!("MID {mid} was acknowledged before registration, completing immediately");
            return Some(completion);
        }
        if self.callbacks.insert(mid, completion).is_some() {
            log::error!("MID {mid} was registered twice; the older completion is lost");
        }
        None
    }

    /// Resolve an acknowledgement. Returns the completion to fire, if one
    /// was registered.
    pub(crate) fn complete(&mut self, mid: Mid) -> Option<Completion> {
        match self.callbacks.remove(&mid) {
            Some(completion) => Some(completion),
            None => {
                match self.policy {
                    UnknownMidPolicy::WarnAndDrop => {
                        log::warn!("acknowledgement received for unknown MID {mid}");
                    }
                    UnknownMidPolicy::Stash => {
                        log::debug!("stashing acknowledgement for unknown MID {mid}");
                        self.unknown.insert(mid);
                    }
                }
                None
            }
        }
    }

    /// Remove every pending entry, handing the completions back to the
    /// caller. Used on connection loss.
    pub(crate) fn drain(&mut self) -> Vec<Completion> {
        self.unknown.clear();
        self.callbacks.drain().map(|(_, completion)| completion).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_completion(counter: &Arc<AtomicUsize>) -> Completion {
        let counter = Arc::clone(counter);
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn queue_preserves_submission_order() {
        let mut queue = ActionQueue::default();
        queue.push(TransportAction::Subscribe {
            topic: "first".into(),
            qos: Qos::AtLeastOnce,
            completion: Box::new(|_| {}),
        });
        queue.push(TransportAction::SendMessage {
            topic: "second".into(),
            payload: Vec::new(),
            completion: Box::new(|_| {}),
        });

        let first = queue.pop().unwrap();
        assert!(matches!(first, TransportAction::Subscribe { ref topic, .. } if topic == "first"));
        let second = queue.pop().unwrap();
        assert!(matches!(second, TransportAction::SendMessage { ref topic, .. } if topic == "second"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn fail_all_returns_every_completion() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut queue = ActionQueue::default();
        for _ in 0..3 {
            queue.push(TransportAction::Unsubscribe {
                topic: "t".into(),
                completion: counting_completion(&fired),
            });
        }

        for completion in queue.fail_all() {
            completion(Err(crate::error::TransportError::NotConnected));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn ack_resolves_registered_mid_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut map = CallbackMap::new(UnknownMidPolicy::WarnAndDrop);
        assert!(map.register(7, counting_completion(&fired)).is_none());

        map.complete(7).expect("completion registered")(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(map.complete(7).is_none(), "second ack finds nothing");
    }

    #[test]
    fn unknown_mid_is_dropped_by_default() {
        let mut map = CallbackMap::new(UnknownMidPolicy::WarnAndDrop);
        assert!(map.complete(3).is_none());

        // The dropped acknowledgement must not complete a later registration.
        let fired = Arc::new(AtomicUsize::new(0));
        assert!(map.register(3, counting_completion(&fired)).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stashed_ack_completes_late_registration() {
        let mut map = CallbackMap::new(UnknownMidPolicy::Stash);
        assert!(map.complete(5).is_none());

        let fired = Arc::new(AtomicUsize::new(0));
        let ready = map
            .register(5, counting_completion(&fired))
            .expect("stashed MID completes on registration");
        ready(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // The stash entry is consumed; the MID can be reused afterwards.
        assert!(map.register(5, counting_completion(&fired)).is_none());
        map.complete(5).expect("normal path")(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drain_hands_back_all_pending_completions() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut map = CallbackMap::new(UnknownMidPolicy::Stash);
        map.register(1, counting_completion(&fired));
        map.register(2, counting_completion(&fired));
        map.complete(9); // stashed

        let pending = map.drain();
        assert_eq!(pending.len(), 2);
        for completion in pending {
            completion(Err(crate::error::TransportError::NotConnected));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // The stash was cleared too.
        assert!(map.register(9, counting_completion(&fired)).is_none());
    }
}
