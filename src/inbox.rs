//! In-process queues that deliver inbound items to user code, and the
//! registry that routes each kind of inbound item to the right queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::models::{Message, MethodCall};

/// An unbounded FIFO queue of received items.
///
/// The transport puts, user code gets. Cloning an `Inbox` yields another
/// handle to the same queue.
#[derive(Debug)]
pub struct Inbox<T> {
    shared: Arc<Shared<T>>,
}

#[derive(Debug)]
struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Inbox<T> {
    pub fn new() -> Self {
        Inbox {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn put(&self, item: T) {
        let mut queue = self.shared.queue.lock().expect("inbox lock poisoned");
        queue.push_back(item);
        self.shared.ready.notify_one();
    }

    /// Take the next item, blocking until one arrives. With a timeout,
    /// returns `None` once the timeout elapses with nothing delivered.
    pub fn get(&self, timeout: Option<Duration>) -> Option<T> {
        let mut queue = self.shared.queue.lock().expect("inbox lock poisoned");
        match timeout {
            None => loop {
                if let Some(item) = queue.pop_front() {
                    return Some(item);
                }
                queue = self
                    .shared
                    .ready
                    .wait(queue)
                    .expect("inbox lock poisoned");
            },
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(item) = queue.pop_front() {
                        return Some(item);
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    queue = self
                        .shared
                        .ready
                        .wait_timeout(queue, remaining)
                        .expect("inbox lock poisoned")
                        .0;
                }
            }
        }
    }

    pub fn try_get(&self) -> Option<T> {
        self.shared
            .queue
            .lock()
            .expect("inbox lock poisoned")
            .pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.shared
            .queue
            .lock()
            .expect("inbox lock poisoned")
            .is_empty()
    }
}

impl<T> Clone for Inbox<T> {
    fn clone(&self) -> Self {
        Inbox {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Inbox<T> {
    fn default() -> Self {
        Inbox::new()
    }
}

/// Registry of the inboxes a client drains.
///
/// There is one inbox for cloud-to-device messages and one fallback inbox
/// for method calls; input inboxes and per-method inboxes are created on
/// first request and stay bound to their name for the life of the manager.
#[derive(Debug, Default)]
pub struct InboxManager {
    c2d: Inbox<Message>,
    generic_methods: Inbox<MethodCall>,
    inputs: Mutex<HashMap<String, Inbox<Message>>>,
    named_methods: Mutex<HashMap<String, Inbox<MethodCall>>>,
}

impl InboxManager {
    pub fn new() -> Self {
        InboxManager::default()
    }

    pub fn get_c2d_inbox(&self) -> Inbox<Message> {
        self.c2d.clone()
    }

    pub fn get_input_inbox(&self, input_name: &str) -> Inbox<Message> {
        let mut inputs = self.inputs.lock().expect("input registry lock poisoned");
        inputs
            .entry(input_name.to_owned())
            .or_default()
            .clone()
    }

    pub fn get_generic_method_inbox(&self) -> Inbox<MethodCall> {
        self.generic_methods.clone()
    }

    pub fn get_named_method_inbox(&self, method_name: &str) -> Inbox<MethodCall> {
        let mut methods = self
            .named_methods
            .lock()
            .expect("method registry lock poisoned");
        methods
            .entry(method_name.to_owned())
            .or_default()
            .clone()
    }

    /// Deliver an input message. An input nobody registered for is dropped;
    /// receiving it at all means the routing rules upstream are out of sync
    /// with this module.
    pub fn route_input_message(&self, input_name: &str, message: Message) -> bool {
        let inputs = self.inputs.lock().expect("input registry lock poisoned");
        match inputs.get(input_name) {
            Some(inbox) => {
                inbox.put(message);
                true
            }
            None => {
                log::warn!("no inbox registered for input {input_name:?}, dropping message");
                false
            }
        }
    }

    pub fn route_c2d_message(&self, message: Message) -> bool {
        self.c2d.put(message);
        true
    }

    /// Deliver a method call, preferring the inbox registered for its name.
    /// Method calls are never dropped; unknown names land in the generic
    /// inbox.
    pub fn route_method_call(&self, call: MethodCall) -> bool {
        let methods = self
            .named_methods
            .lock()
            .expect("method registry lock poisoned");
        match methods.get(&call.name) {
            Some(inbox) => inbox.put(call),
            None => self.generic_methods.put(call),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn get_is_fifo() {
        let inbox = Inbox::new();
        inbox.put(1);
        inbox.put(2);
        inbox.put(3);
        assert_eq!(inbox.get(Some(Duration::ZERO)), Some(1));
        assert_eq!(inbox.get(Some(Duration::ZERO)), Some(2));
        assert_eq!(inbox.get(Some(Duration::ZERO)), Some(3));
    }

    #[test]
    fn get_times_out_when_empty() {
        let inbox: Inbox<u32> = Inbox::new();
        assert_eq!(inbox.get(Some(Duration::from_millis(20))), None);
    }

    #[test]
    fn get_wakes_on_put_from_other_thread() {
        let inbox = Inbox::new();
        let producer = inbox.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.put("wake");
        });
        assert_eq!(inbox.get(Some(Duration::from_secs(5))), Some("wake"));
        handle.join().unwrap();
    }

    #[test]
    fn input_inbox_is_referentially_stable() {
        let manager = InboxManager::new();
        let first = manager.get_input_inbox("temperature");
        let second = manager.get_input_inbox("temperature");
        first.put(Message::from("reading"));
        assert_eq!(second.get(Some(Duration::ZERO)), Some(Message::from("reading")));
    }

    #[test]
    fn input_routing_misses_are_dropped() {
        let manager = InboxManager::new();
        assert!(!manager.route_input_message("unknown", Message::from("x")));
        // The miss must not create the inbox as a side effect.
        assert!(manager.get_input_inbox("unknown").is_empty());
    }

    #[test]
    fn method_calls_fall_back_to_generic_inbox() {
        let manager = InboxManager::new();
        let generic = manager.get_generic_method_inbox();
        assert!(manager.route_method_call(MethodCall::new("foo", "1", Vec::new())));
        let call = generic.get(Some(Duration::ZERO)).unwrap();
        assert_eq!(call.name, "foo");
    }

    #[test]
    fn named_method_inbox_wins_over_generic() {
        let manager = InboxManager::new();
        let named = manager.get_named_method_inbox("reboot");
        let generic = manager.get_generic_method_inbox();
        manager.route_method_call(MethodCall::new("reboot", "7", Vec::new()));
        assert_eq!(named.get(Some(Duration::ZERO)).unwrap().request_id, "7");
        assert!(generic.is_empty());
    }
}
