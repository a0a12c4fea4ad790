//! Data channel observers and the dual-indexed registry that owns them.
//!
//! An observer is indexed by id when it has one (pre-negotiated or remotely
//! opened channels) and by label when the label is non-empty. Ids are unique,
//! labels are not. Locally created channels without an id wait in a pending
//! list until the native channel reports the id it was assigned.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tandem_common::SessionConfig;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::native::{
    DataBuffer, DataChannelEvents, DataChannelInit, DataChannelState, NativeDataChannel,
    NativeSession,
};
use crate::sync::lock;

pub type MessageCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Receives `(previous, current, limit)` buffered byte counts.
pub type BufferingCallback = Arc<dyn Fn(u64, u64, u64) + Send + Sync>;
/// Receives the new state and the channel id, if assigned.
pub type StateCallback = Arc<dyn Fn(DataChannelState, Option<u16>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct DataChannelCallbacks {
    pub message: Option<MessageCallback>,
    pub buffering: Option<BufferingCallback>,
    pub state: Option<StateCallback>,
}

impl DataChannelCallbacks {
    pub fn with_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.message = Some(Arc::new(f));
        self
    }

    pub fn with_buffering<F>(mut self, f: F) -> Self
    where
        F: Fn(u64, u64, u64) + Send + Sync + 'static,
    {
        self.buffering = Some(Arc::new(f));
        self
    }

    pub fn with_state<F>(mut self, f: F) -> Self
    where
        F: Fn(DataChannelState, Option<u16>) + Send + Sync + 'static,
    {
        self.state = Some(Arc::new(f));
        self
    }
}

/// Wraps one native data channel and relays its events to caller callbacks.
pub struct DataChannelObserver {
    channel: Arc<dyn NativeDataChannel>,
    label: String,
    max_buffered_amount: u64,
    callbacks: Mutex<DataChannelCallbacks>,
}

impl DataChannelObserver {
    fn attach(
        channel: Arc<dyn NativeDataChannel>,
        callbacks: DataChannelCallbacks,
        max_buffered_amount: u64,
    ) -> Arc<Self> {
        let observer = Arc::new(Self {
            label: channel.label(),
            channel,
            max_buffered_amount,
            callbacks: Mutex::new(callbacks),
        });
        let weak = Arc::downgrade(&observer);
        let events: Weak<dyn DataChannelEvents> = weak;
        observer.channel.register_observer(events);
        observer
    }

    pub fn id(&self) -> Option<u16> {
        self.channel.id()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ordered(&self) -> bool {
        self.channel.ordered()
    }

    pub fn reliable(&self) -> bool {
        self.channel.reliable()
    }

    pub fn state(&self) -> DataChannelState {
        self.channel.state()
    }

    pub fn buffered_amount(&self) -> u64 {
        self.channel.buffered_amount()
    }

    pub fn set_message_callback(&self, callback: Option<MessageCallback>) {
        lock(&self.callbacks).message = callback;
    }

    pub fn set_buffering_callback(&self, callback: Option<BufferingCallback>) {
        lock(&self.callbacks).buffering = callback;
    }

    pub fn set_state_callback(&self, callback: Option<StateCallback>) {
        lock(&self.callbacks).state = callback;
    }

    pub fn set_callbacks(&self, callbacks: DataChannelCallbacks) {
        *lock(&self.callbacks) = callbacks;
    }

    /// Hands `data` to the native channel as one binary message.
    pub fn send(&self, data: &[u8]) -> SessionResult<()> {
        let state = self.channel.state();
        if state != DataChannelState::Open {
            return Err(SessionError::ChannelNotOpen(state));
        }
        self.channel
            .send(DataBuffer::binary(Bytes::copy_from_slice(data)))?;
        Ok(())
    }

    fn close(&self) {
        self.channel.unregister_observer();
        self.channel.close();
    }

    fn detach(&self) {
        self.channel.unregister_observer();
    }
}

impl DataChannelEvents for DataChannelObserver {
    fn on_state_change(&self) {
        let callback = lock(&self.callbacks).state.clone();
        if let Some(callback) = callback {
            callback(self.channel.state(), self.channel.id());
        }
    }

    fn on_message(&self, buffer: &DataBuffer) {
        let callback = lock(&self.callbacks).message.clone();
        if let Some(callback) = callback {
            callback(&buffer.data);
        }
    }

    fn on_buffered_amount_change(&self, previous_amount: u64) {
        let callback = lock(&self.callbacks).buffering.clone();
        if let Some(callback) = callback {
            callback(
                previous_amount,
                self.channel.buffered_amount(),
                self.max_buffered_amount,
            );
        }
    }
}

impl fmt::Debug for DataChannelObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelObserver")
            .field("id", &self.id())
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Default)]
struct ChannelMaps {
    by_id: HashMap<u16, Arc<DataChannelObserver>>,
    by_label: HashMap<String, Vec<Arc<DataChannelObserver>>>,
    pending: Vec<Arc<DataChannelObserver>>,
}

impl ChannelMaps {
    /// Moves pending channels whose native id has since been assigned into the id-map.
    fn promote_assigned(&mut self) {
        let ChannelMaps { by_id, pending, .. } = self;
        pending.retain(|observer| match observer.id() {
            Some(id) if !by_id.contains_key(&id) => {
                debug!(id, label = observer.label(), "data channel id assigned");
                by_id.insert(id, Arc::clone(observer));
                false
            }
            Some(id) => {
                warn!(id, "assigned data channel id collides with a registered channel");
                true
            }
            None => true,
        });
    }

    fn index(&mut self, id: Option<u16>, observer: &Arc<DataChannelObserver>) {
        match id {
            Some(id) => {
                self.by_id.insert(id, Arc::clone(observer));
            }
            None => self.pending.push(Arc::clone(observer)),
        }
        if !observer.label().is_empty() {
            self.by_label
                .entry(observer.label().to_string())
                .or_default()
                .push(Arc::clone(observer));
        }
    }

    fn unindex_label(&mut self, observer: &Arc<DataChannelObserver>) {
        if observer.label().is_empty() {
            return;
        }
        if let Some(entries) = self.by_label.get_mut(observer.label()) {
            entries.retain(|other| !Arc::ptr_eq(other, observer));
            if entries.is_empty() {
                self.by_label.remove(observer.label());
            }
        }
    }

    fn unindex_id(&mut self, observer: &Arc<DataChannelObserver>) {
        self.by_id.retain(|_, other| !Arc::ptr_eq(other, observer));
        self.pending.retain(|other| !Arc::ptr_eq(other, observer));
    }

    fn distinct(&self) -> Vec<Arc<DataChannelObserver>> {
        let mut seen = HashSet::new();
        self.by_id
            .values()
            .chain(self.pending.iter())
            .chain(self.by_label.values().flatten())
            .filter(|observer| seen.insert(Arc::as_ptr(*observer)))
            .cloned()
            .collect()
    }
}

pub struct DataChannelRegistry {
    maps: Mutex<ChannelMaps>,
    max_buffered_amount: u64,
    unreliable_max_retransmits: u16,
}

impl DataChannelRegistry {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            maps: Mutex::new(ChannelMaps::default()),
            max_buffered_amount: config.max_buffered_amount,
            unreliable_max_retransmits: config.unreliable_max_retransmits,
        }
    }

    /// Creates a channel on the native session and registers its observer.
    ///
    /// With an id the channel is pre-negotiated; the add fails if the id is
    /// already registered. The registry lock is not held across native calls.
    pub fn add(
        &self,
        native: &dyn NativeSession,
        id: Option<u16>,
        label: &str,
        ordered: bool,
        reliable: bool,
        callbacks: DataChannelCallbacks,
    ) -> SessionResult<Arc<DataChannelObserver>> {
        if let Some(id) = id {
            if self.contains_id(id) {
                return Err(SessionError::DuplicateChannelId(id));
            }
        }

        let init = DataChannelInit {
            ordered,
            max_retransmits: (!reliable).then_some(self.unreliable_max_retransmits),
            negotiated_id: id,
        };
        let channel = native.create_data_channel(label, &init)?;
        let observer = DataChannelObserver::attach(channel, callbacks, self.max_buffered_amount);
        self.insert(id, observer)
    }

    /// Registers a channel the remote peer opened. Callbacks start empty.
    ///
    /// A channel whose id is already registered is closed and rejected.
    pub fn adopt(
        &self,
        channel: Arc<dyn NativeDataChannel>,
    ) -> SessionResult<Arc<DataChannelObserver>> {
        let id = channel.id();
        if let Some(id) = id {
            if self.contains_id(id) {
                channel.close();
                return Err(SessionError::DuplicateChannelId(id));
            }
        }

        let observer =
            DataChannelObserver::attach(channel, DataChannelCallbacks::default(), self.max_buffered_amount);
        self.insert(id, observer)
    }

    /// Indexes an attached observer. If another channel took `id` while the
    /// lock was released, the new one is closed instead.
    fn insert(
        &self,
        id: Option<u16>,
        observer: Arc<DataChannelObserver>,
    ) -> SessionResult<Arc<DataChannelObserver>> {
        let taken = {
            let mut maps = lock(&self.maps);
            maps.promote_assigned();
            match id {
                Some(id) if maps.by_id.contains_key(&id) => Some(id),
                _ => {
                    maps.index(id, &observer);
                    maps.promote_assigned();
                    None
                }
            }
        };

        match taken {
            Some(id) => {
                warn!(id, label = observer.label(), "data channel id registered concurrently, closing new channel");
                observer.close();
                Err(SessionError::DuplicateChannelId(id))
            }
            None => Ok(observer),
        }
    }

    pub fn remove_by_id(&self, id: u16) -> SessionResult<()> {
        let observer = {
            let mut maps = lock(&self.maps);
            maps.promote_assigned();
            let observer = maps
                .by_id
                .remove(&id)
                .ok_or(SessionError::UnknownChannelId(id))?;
            maps.unindex_label(&observer);
            observer
        };
        observer.close();
        Ok(())
    }

    /// Removes every channel carrying `label`, returning how many were removed.
    pub fn remove_by_label(&self, label: &str) -> SessionResult<usize> {
        let removed = {
            let mut maps = lock(&self.maps);
            maps.promote_assigned();
            let removed = maps
                .by_label
                .remove(label)
                .filter(|entries| !entries.is_empty())
                .ok_or_else(|| SessionError::UnknownChannelLabel(label.to_string()))?;
            for observer in &removed {
                maps.unindex_id(observer);
            }
            removed
        };
        for observer in &removed {
            observer.close();
        }
        Ok(removed.len())
    }

    pub fn get(&self, id: u16) -> Option<Arc<DataChannelObserver>> {
        let mut maps = lock(&self.maps);
        maps.promote_assigned();
        maps.by_id.get(&id).cloned()
    }

    pub fn by_label(&self, label: &str) -> Vec<Arc<DataChannelObserver>> {
        lock(&self.maps)
            .by_label
            .get(label)
            .cloned()
            .unwrap_or_default()
    }

    pub fn send(&self, id: u16, data: &[u8]) -> SessionResult<()> {
        let observer = self.get(id).ok_or(SessionError::UnknownChannelId(id))?;
        observer.send(data)
    }

    /// Number of distinct registered channels.
    pub fn len(&self) -> usize {
        lock(&self.maps).distinct().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in the id-map.
    pub fn id_count(&self) -> usize {
        let mut maps = lock(&self.maps);
        maps.promote_assigned();
        maps.by_id.len()
    }

    /// Entries in the label multimap, counting every channel under every label.
    pub fn label_count(&self) -> usize {
        lock(&self.maps).by_label.values().map(Vec::len).sum()
    }

    pub fn contains_id(&self, id: u16) -> bool {
        self.get(id).is_some()
    }

    /// Drops every observer, detaching it from its native channel.
    pub fn clear(&self) {
        let all = {
            let mut maps = lock(&self.maps);
            let all = maps.distinct();
            *maps = ChannelMaps::default();
            all
        };
        for observer in all {
            observer.detach();
        }
    }

    /// Closes every registered channel on its native session and empties the
    /// registry. Returns how many channels were closed.
    pub fn close_all(&self) -> usize {
        let all = {
            let mut maps = lock(&self.maps);
            let all = maps.distinct();
            *maps = ChannelMaps::default();
            all
        };
        for observer in &all {
            observer.close();
        }
        all.len()
    }
}

impl fmt::Debug for DataChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelRegistry")
            .field("channels", &self.len())
            .field("ids", &self.id_count())
            .field("labels", &self.label_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DummySession;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn registry() -> DataChannelRegistry {
        DataChannelRegistry::new(&SessionConfig::default())
    }

    fn add(
        registry: &DataChannelRegistry,
        native: &DummySession,
        id: Option<u16>,
        label: &str,
    ) -> SessionResult<Arc<DataChannelObserver>> {
        registry.add(native, id, label, true, true, DataChannelCallbacks::default())
    }

    #[test]
    fn test_duplicate_id_leaves_registry_unchanged() {
        let native = DummySession::new();
        let registry = registry();

        add(&registry, &native, Some(1), "chat").unwrap();
        let err = add(&registry, &native, Some(1), "other").unwrap_err();

        assert!(matches!(err, SessionError::DuplicateChannelId(1)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.id_count(), 1);
        assert_eq!(registry.label_count(), 1);
        assert_eq!(registry.get(1).unwrap().label(), "chat");
        assert!(registry.by_label("other").is_empty());
        assert_eq!(native.channels().len(), 1);
    }

    #[test]
    fn test_remove_by_label_removes_every_match() {
        let native = DummySession::new();
        let registry = registry();
        add(&registry, &native, Some(2), "chat").unwrap();
        add(&registry, &native, Some(3), "chat").unwrap();
        add(&registry, &native, Some(4), "files").unwrap();

        assert_eq!(registry.remove_by_label("chat").unwrap(), 2);

        assert!(!registry.contains_id(2));
        assert!(!registry.contains_id(3));
        assert!(registry.contains_id(4));
        assert_eq!(registry.len(), 1);
        assert!(native.channel(2).unwrap().state() == DataChannelState::Closed);
    }

    #[test]
    fn test_remove_missing_label_fails_without_change() {
        let native = DummySession::new();
        let registry = registry();
        add(&registry, &native, Some(5), "chat").unwrap();

        assert!(matches!(
            registry.remove_by_label("nope"),
            Err(SessionError::UnknownChannelLabel(_))
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.label_count(), 1);
    }

    #[test]
    fn test_remove_by_id_clears_label_entry() {
        let native = DummySession::new();
        let registry = registry();
        add(&registry, &native, Some(7), "chat").unwrap();
        add(&registry, &native, Some(8), "chat").unwrap();

        registry.remove_by_id(7).unwrap();
        assert!(matches!(registry.remove_by_id(7), Err(SessionError::UnknownChannelId(7))));

        let remaining = registry.by_label("chat");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), Some(8));
        assert!(!native.channel(7).unwrap().has_observer());
    }

    #[test]
    fn test_channel_without_id_is_promoted_once_assigned() {
        let native = DummySession::new();
        let registry = registry();
        let observer = add(&registry, &native, None, "late").unwrap();
        assert_eq!(observer.id(), None);
        assert_eq!(registry.id_count(), 0);
        assert_eq!(registry.len(), 1);

        native.channels()[0].assign_id(12);

        assert!(registry.contains_id(12));
        assert!(matches!(
            add(&registry, &native, Some(12), "dup"),
            Err(SessionError::DuplicateChannelId(12))
        ));
        registry.remove_by_id(12).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unlabelled_channel_without_id_is_still_tracked() {
        let native = DummySession::new();
        let registry = registry();
        add(&registry, &native, None, "").unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.id_count(), 0);
        assert_eq!(registry.label_count(), 0);
        registry.clear();
        assert!(registry.is_empty());
        assert!(!native.channels()[0].has_observer());
    }

    #[test]
    fn test_send_requires_open_channel() {
        let native = DummySession::new();
        let registry = registry();
        add(&registry, &native, Some(1), "chat").unwrap();

        assert!(matches!(
            registry.send(1, b"hi"),
            Err(SessionError::ChannelNotOpen(DataChannelState::Connecting))
        ));
        assert!(matches!(registry.send(9, b"hi"), Err(SessionError::UnknownChannelId(9))));

        let channel = native.channel(1).unwrap();
        channel.set_state(DataChannelState::Open);
        registry.send(1, b"hi").unwrap();
        assert_eq!(channel.sent().len(), 1);
        assert_eq!(&channel.sent()[0].data[..], b"hi");

        channel.set_state(DataChannelState::Closed);
        assert!(registry.send(1, b"again").is_err());
        assert_eq!(channel.sent().len(), 1);
    }

    #[test]
    fn test_unreliable_channel_uses_configured_retransmits() {
        let native = DummySession::new();
        let registry = registry();
        let observer = registry
            .add(&*native, Some(3), "telemetry", false, false, DataChannelCallbacks::default())
            .unwrap();

        assert!(!observer.reliable());
        assert!(!observer.ordered());
    }

    #[test]
    fn test_callbacks_receive_channel_events() {
        let native = DummySession::new();
        let registry = registry();
        let received = Arc::new(Mutex::new(Vec::new()));
        let limit = Arc::new(AtomicU64::new(0));
        let states = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&received);
        let seen_limit = Arc::clone(&limit);
        let seen_states = Arc::clone(&states);
        let callbacks = DataChannelCallbacks::default()
            .with_message(move |data| sink.lock().unwrap().push(data.to_vec()))
            .with_buffering(move |_, current, max| {
                assert_eq!(current, 64);
                seen_limit.store(max, Ordering::SeqCst);
            })
            .with_state(move |state, id| seen_states.lock().unwrap().push((state, id)));
        registry
            .add(&*native, Some(6), "chat", true, true, callbacks)
            .unwrap();

        let channel = native.channel(6).unwrap();
        channel.set_state(DataChannelState::Open);
        channel.deliver(&b"ping"[..]);
        channel.set_buffered_amount(64);

        assert_eq!(*received.lock().unwrap(), vec![b"ping".to_vec()]);
        assert_eq!(limit.load(Ordering::SeqCst), SessionConfig::default().max_buffered_amount);
        assert_eq!(*states.lock().unwrap(), vec![(DataChannelState::Open, Some(6))]);
    }

    #[test]
    fn test_adopting_a_taken_id_closes_the_remote_channel() {
        let native = DummySession::new();
        let registry = registry();
        add(&registry, &native, Some(9), "chat").unwrap();

        let remote = Arc::new(crate::dummy::DummyDataChannel::new(Some(9), "remote", true, true));
        remote.set_state(DataChannelState::Open);
        let err = registry.adopt(remote.clone()).unwrap_err();

        assert!(matches!(err, SessionError::DuplicateChannelId(9)));
        assert_eq!(remote.state(), DataChannelState::Closed);
        assert!(!remote.has_observer());
        assert_eq!(registry.get(9).unwrap().label(), "chat");
        assert!(registry.by_label("remote").is_empty());
    }

    #[test]
    fn test_close_all_closes_native_channels() {
        let native = DummySession::new();
        let registry = registry();
        add(&registry, &native, Some(1), "chat").unwrap();
        add(&registry, &native, None, "chat").unwrap();
        add(&registry, &native, Some(2), "").unwrap();

        assert_eq!(registry.close_all(), 3);

        assert!(registry.is_empty());
        for channel in native.channels() {
            assert_eq!(channel.state(), DataChannelState::Closed);
            assert!(!channel.has_observer());
        }
    }
}
