//! Signaling callback slots.
//!
//! One slot per [`EventKind`], each behind its own lock. Invocation copies the
//! callback out and releases the lock before calling it, so a callback may
//! re-register any slot (its own included) without deadlocking.

use std::fmt;
use std::sync::{Arc, Mutex};

use tandem_common::SdpType;

use crate::native::NativeError;
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    LocalSdpReady,
    IceCandidateReady,
    RenegotiationNeeded,
    NegotiationFailed,
    DataChannelAdded,
}

impl EventKind {
    pub const COUNT: usize = 6;

    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::Connected,
        EventKind::LocalSdpReady,
        EventKind::IceCandidateReady,
        EventKind::RenegotiationNeeded,
        EventKind::NegotiationFailed,
        EventKind::DataChannelAdded,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

/// Asynchronous negotiation step that can fail after its request was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    CreateDescription,
    SetLocalDescription,
    SetRemoteDescription,
}

/// Payload delivered to a registered callback.
#[derive(Debug, Clone, Copy)]
pub enum SignalingEvent<'a> {
    Connected,
    LocalSdpReady {
        sdp_type: SdpType,
        sdp: &'a str,
    },
    IceCandidateReady {
        sdp_mid: &'a str,
        sdp_mline_index: u16,
        candidate: &'a str,
    },
    RenegotiationNeeded,
    NegotiationFailed {
        stage: NegotiationStage,
        error: &'a NativeError,
    },
    DataChannelAdded {
        id: u16,
        label: &'a str,
    },
}

impl SignalingEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            SignalingEvent::Connected => EventKind::Connected,
            SignalingEvent::LocalSdpReady { .. } => EventKind::LocalSdpReady,
            SignalingEvent::IceCandidateReady { .. } => EventKind::IceCandidateReady,
            SignalingEvent::RenegotiationNeeded => EventKind::RenegotiationNeeded,
            SignalingEvent::NegotiationFailed { .. } => EventKind::NegotiationFailed,
            SignalingEvent::DataChannelAdded { .. } => EventKind::DataChannelAdded,
        }
    }
}

pub type Callback = Arc<dyn Fn(&SignalingEvent<'_>) + Send + Sync>;

/// Wraps a closure as a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&SignalingEvent<'_>) + Send + Sync + 'static,
{
    Arc::new(f)
}

pub struct CallbackRegistry {
    slots: [Mutex<Option<Callback>>; EventKind::COUNT],
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(None)),
        }
    }

    /// Replaces whatever callback the slot held.
    pub fn register(&self, kind: EventKind, callback: Callback) {
        *lock(&self.slots[kind.index()]) = Some(callback);
    }

    /// Empties the slot, returning whether it held a callback.
    pub fn unregister(&self, kind: EventKind) -> bool {
        lock(&self.slots[kind.index()]).take().is_some()
    }

    pub fn is_registered(&self, kind: EventKind) -> bool {
        lock(&self.slots[kind.index()]).is_some()
    }

    /// Runs the callback registered for the event's kind. Returns `false` when
    /// the slot is empty.
    pub fn invoke(&self, event: &SignalingEvent<'_>) -> bool {
        let callback = lock(&self.slots[event.kind().index()]).clone();
        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        for kind in EventKind::ALL {
            self.unregister(kind);
        }
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<EventKind> = EventKind::ALL
            .into_iter()
            .filter(|kind| self.is_registered(*kind))
            .collect();
        f.debug_struct("CallbackRegistry")
            .field("registered", &registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(hits: &Arc<AtomicUsize>) -> Callback {
        let hits = Arc::clone(hits);
        callback(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_invoke_empty_slot_is_noop() {
        let registry = CallbackRegistry::new();
        assert!(!registry.invoke(&SignalingEvent::Connected));
    }

    #[test]
    fn test_second_registration_replaces_first() {
        let registry = CallbackRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry.register(EventKind::Connected, counter(&first));
        registry.register(EventKind::Connected, counter(&second));
        assert!(registry.invoke(&SignalingEvent::Connected));

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_slots_are_independent() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(EventKind::RenegotiationNeeded, counter(&hits));

        assert!(!registry.invoke(&SignalingEvent::Connected));
        assert!(registry.invoke(&SignalingEvent::RenegotiationNeeded));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.is_registered(EventKind::RenegotiationNeeded));
        assert!(!registry.is_registered(EventKind::Connected));
    }

    #[test]
    fn test_callback_can_reregister_its_own_slot() {
        let registry = Arc::new(CallbackRegistry::new());
        let replaced = Arc::new(AtomicUsize::new(0));

        let inner_registry = Arc::clone(&registry);
        let inner_replaced = Arc::clone(&replaced);
        registry.register(
            EventKind::Connected,
            callback(move |_| {
                inner_registry.register(EventKind::Connected, counter(&inner_replaced));
            }),
        );

        assert!(registry.invoke(&SignalingEvent::Connected));
        assert_eq!(replaced.load(Ordering::SeqCst), 0);
        assert!(registry.invoke(&SignalingEvent::Connected));
        assert_eq!(replaced.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_and_clear() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(EventKind::Connected, counter(&hits));
        registry.register(EventKind::DataChannelAdded, counter(&hits));

        assert!(registry.unregister(EventKind::Connected));
        assert!(!registry.unregister(EventKind::Connected));
        registry.clear();
        assert!(!registry.is_registered(EventKind::DataChannelAdded));
    }
}
