//! Callback dispatch registry
//!
//! Maps control message kinds to registered handlers (with optional
//! guard predicates) and stream ids to listener objects. Dispatch
//! always iterates over a snapshot, so a callback may deregister
//! itself, and every invocation is isolated: a panicking handler is
//! logged and the rest of the registrations still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use super::{Message, ProtocolError, STREAM_COUNT};

/// Handler invoked with a decoded control packet's words.
pub type ControlHandler = Arc<dyn Fn(&[u32]) + Send + Sync>;

/// Predicate deciding whether a registration's handler runs for a
/// given packet.
pub type ControlGuard = Arc<dyn Fn(&[u32]) -> bool + Send + Sync>;

/// One control-handler registration.
#[derive(Clone)]
pub struct Registration {
    /// Registration id, unique for the life of the registry
    pub id: u64,
    /// Optional guard predicate
    pub guard: Option<ControlGuard>,
    /// The handler itself
    pub handler: ControlHandler,
}

/// Receiver for decoded stream samples. The stream id is implicit in
/// the registration.
pub trait StreamListener: Send + Sync {
    /// Called on the reader thread with each decoded sample batch.
    /// Must not block; a slow listener delays all frame processing.
    fn on_samples(&self, samples: &[u32]);
}

/// Handler and listener tables for one link session.
pub struct Registry {
    next_id: u64,
    control: HashMap<Message, Vec<Registration>>,
    listeners: [Vec<Arc<dyn StreamListener>>; STREAM_COUNT],
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            next_id: 0,
            control: HashMap::new(),
            listeners: std::array::from_fn(|_| Vec::new()),
        }
    }
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` (and optional `guard`) for a control
    /// message kind. Returns the registration id; ids are monotonic
    /// and never reused.
    pub fn register(
        &mut self,
        message: Message,
        handler: ControlHandler,
        guard: Option<ControlGuard>,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.control
            .entry(message)
            .or_default()
            .push(Registration { id, guard, handler });
        id
    }

    /// Remove a registration, returning its handler.
    pub fn deregister(
        &mut self,
        message: Message,
        id: u64,
    ) -> Result<ControlHandler, ProtocolError> {
        let regs = self
            .control
            .get_mut(&message)
            .ok_or(ProtocolError::RegistrationNotFound { message, id })?;
        let pos = regs
            .iter()
            .position(|r| r.id == id)
            .ok_or(ProtocolError::RegistrationNotFound { message, id })?;
        Ok(regs.remove(pos).handler)
    }

    /// Remove and return every registration for a message kind.
    /// Used by port discovery to park handlers during the sweep.
    pub fn take_control(&mut self, message: Message) -> Vec<Registration> {
        self.control.remove(&message).unwrap_or_default()
    }

    /// Put parked registrations back.
    pub fn restore_control(&mut self, message: Message, regs: Vec<Registration>) {
        if !regs.is_empty() {
            self.control.entry(message).or_default().extend(regs);
        }
    }

    /// Snapshot of the registrations for a message kind.
    pub fn control_snapshot(&self, message: Message) -> Vec<Registration> {
        self.control.get(&message).cloned().unwrap_or_default()
    }

    /// Attach a listener to a stream.
    pub fn add_listener(
        &mut self,
        stream_id: u8,
        listener: Arc<dyn StreamListener>,
    ) -> Result<(), ProtocolError> {
        let set = self
            .listeners
            .get_mut(stream_id as usize)
            .ok_or(ProtocolError::BadStreamId(stream_id))?;
        set.push(listener);
        Ok(())
    }

    /// Detach a listener from a stream, matched by object identity.
    pub fn remove_listener(
        &mut self,
        stream_id: u8,
        listener: &Arc<dyn StreamListener>,
    ) -> Result<(), ProtocolError> {
        let set = self
            .listeners
            .get_mut(stream_id as usize)
            .ok_or(ProtocolError::BadStreamId(stream_id))?;
        let pos = set
            .iter()
            .position(|l| Arc::ptr_eq(l, listener))
            .ok_or(ProtocolError::ListenerNotFound(stream_id))?;
        set.remove(pos);
        Ok(())
    }

    /// Snapshot of the listeners on a stream.
    pub fn stream_snapshot(&self, stream_id: u8) -> Vec<Arc<dyn StreamListener>> {
        self.listeners
            .get(stream_id as usize)
            .cloned()
            .unwrap_or_default()
    }
}

/// Run a snapshot of control registrations against a packet's words.
///
/// Guards return a plain boolean; a guard or handler that panics is
/// logged and skipped without affecting the remaining registrations.
pub fn dispatch_control(regs: &[Registration], message: Message, words: &[u32]) {
    for reg in regs {
        let pass = match &reg.guard {
            None => true,
            Some(guard) => match catch_unwind(AssertUnwindSafe(|| guard(words))) {
                Ok(pass) => pass,
                Err(_) => {
                    warn!(
                        id = reg.id,
                        "guard panicked: {}",
                        ProtocolError::HandlerFailure(message)
                    );
                    false
                }
            },
        };
        if pass && catch_unwind(AssertUnwindSafe(|| (reg.handler)(words))).is_err() {
            warn!(
                id = reg.id,
                "{}",
                ProtocolError::HandlerFailure(message)
            );
        }
    }
}

/// Run a snapshot of stream listeners against a decoded sample batch.
pub fn dispatch_stream(
    listeners: &[Arc<dyn StreamListener>],
    stream_id: u8,
    samples: &[u32],
) {
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener.on_samples(samples))).is_err() {
            warn!(stream_id, "stream listener panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn counting_handler(hits: Arc<AtomicUsize>) -> ControlHandler {
        Arc::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_ids_monotonic_never_reused() {
        let mut reg = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let a = reg.register(Message::Start, counting_handler(hits.clone()), None);
        let b = reg.register(Message::Start, counting_handler(hits.clone()), None);
        assert!(b > a);
        reg.deregister(Message::Start, a).unwrap();
        let c = reg.register(Message::Start, counting_handler(hits), None);
        assert!(c > b);
    }

    #[test]
    fn test_deregister_not_found() {
        let mut reg = Registry::new();
        let err = reg.deregister(Message::Start, 99).err().unwrap();
        assert!(matches!(
            err,
            ProtocolError::RegistrationNotFound { id: 99, .. }
        ));
    }

    #[test]
    fn test_guard_filters() {
        let mut reg = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        reg.register(
            Message::Set,
            counting_handler(hits.clone()),
            Some(Arc::new(|words: &[u32]| words.first() == Some(&7))),
        );
        let snap = reg.control_snapshot(Message::Set);
        dispatch_control(&snap, Message::Set, &[1]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        dispatch_control(&snap, Message::Set, &[7]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_dispatch() {
        let mut reg = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        reg.register(
            Message::Info,
            Arc::new(|_| panic!("handler blew up")),
            None,
        );
        reg.register(Message::Info, counting_handler(hits.clone()), None);
        let snap = reg.control_snapshot(Message::Info);
        dispatch_control(&snap, Message::Info, &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_guard_skips_only_its_handler() {
        let mut reg = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        reg.register(
            Message::Info,
            counting_handler(hits.clone()),
            Some(Arc::new(|_: &[u32]| panic!("guard blew up"))),
        );
        reg.register(Message::Info, counting_handler(hits.clone()), None);
        let snap = reg.control_snapshot(Message::Info);
        dispatch_control(&snap, Message::Info, &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    struct Recorder {
        seen: Mutex<Vec<Vec<u32>>>,
    }

    impl StreamListener for Recorder {
        fn on_samples(&self, samples: &[u32]) {
            self.seen.lock().unwrap().push(samples.to_vec());
        }
    }

    #[test]
    fn test_listener_identity_removal() {
        let mut reg = Registry::new();
        let a: Arc<dyn StreamListener> = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let b: Arc<dyn StreamListener> = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        reg.add_listener(3, a.clone()).unwrap();
        reg.add_listener(3, b.clone()).unwrap();
        reg.remove_listener(3, &a).unwrap();
        assert_eq!(reg.stream_snapshot(3).len(), 1);
        let err = reg.remove_listener(3, &a).unwrap_err();
        assert!(matches!(err, ProtocolError::ListenerNotFound(3)));
    }

    #[test]
    fn test_bad_stream_id() {
        let mut reg = Registry::new();
        let l: Arc<dyn StreamListener> = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let err = reg.add_listener(8, l).unwrap_err();
        assert!(matches!(err, ProtocolError::BadStreamId(8)));
    }

    #[test]
    fn test_snapshot_unaffected_by_later_mutation() {
        let mut reg = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = reg.register(Message::Query, counting_handler(hits.clone()), None);
        let snap = reg.control_snapshot(Message::Query);
        // deregistering after the snapshot does not corrupt dispatch
        reg.deregister(Message::Query, id).unwrap();
        dispatch_control(&snap, Message::Query, &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
