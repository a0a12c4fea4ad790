//! Data channel registry behaviour seen through the session coordinator.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tandem_session::dummy::DummySession;
use tandem_session::{
    DataChannelCallbacks, DataChannelState, NativeDataChannel, PeerSession, SessionConfig,
    SessionError,
};

fn session() -> (Arc<PeerSession>, Arc<DummySession>) {
    let native = DummySession::new();
    let session = PeerSession::with_native(SessionConfig::default(), native.clone()).unwrap();
    (session, native)
}

#[test]
fn test_duplicate_id_leaves_registry_unchanged() -> Result<()> {
    let (session, native) = session();

    session.add_data_channel(Some(1), "chat", true, true, DataChannelCallbacks::default())?;
    let err = session
        .add_data_channel(Some(1), "other", true, true, DataChannelCallbacks::default())
        .unwrap_err();

    assert!(matches!(err, SessionError::DuplicateChannelId(1)));
    assert_eq!(session.data_channel(1).context("chat channel")?.label(), "chat");
    assert!(session.data_channels_by_label("other").is_empty());
    assert_eq!(session.data_channels().len(), 1);
    assert_eq!(native.channels().len(), 1);
    Ok(())
}

#[test]
fn test_remove_by_label_drops_every_channel_with_that_label() -> Result<()> {
    let (session, native) = session();
    session.add_data_channel(Some(2), "chat", true, true, DataChannelCallbacks::default())?;
    session.add_data_channel(Some(3), "chat", false, false, DataChannelCallbacks::default())?;
    session.add_data_channel(Some(4), "files", true, true, DataChannelCallbacks::default())?;

    assert_eq!(session.data_channels_by_label("chat").len(), 2);
    assert_eq!(session.remove_data_channels_by_label("chat")?, 2);

    assert!(session.data_channel(2).is_none());
    assert!(session.data_channel(3).is_none());
    assert!(session.data_channels_by_label("chat").is_empty());
    assert!(session.data_channel(4).is_some());
    assert_eq!(
        native.channel(2).context("native channel 2")?.state(),
        DataChannelState::Closed
    );
    assert!(matches!(
        session.remove_data_channels_by_label("chat"),
        Err(SessionError::UnknownChannelLabel(_))
    ));
    Ok(())
}

#[test]
fn test_remove_by_id_keeps_label_siblings() -> Result<()> {
    let (session, _native) = session();
    session.add_data_channel(Some(5), "game", true, true, DataChannelCallbacks::default())?;
    session.add_data_channel(Some(6), "game", true, true, DataChannelCallbacks::default())?;

    session.remove_data_channel(5)?;

    let remaining = session.data_channels_by_label("game");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id(), Some(6));
    assert!(matches!(
        session.remove_data_channel(5),
        Err(SessionError::UnknownChannelId(5))
    ));
    Ok(())
}

#[test]
fn test_send_requires_open_channel() -> Result<()> {
    let (session, native) = session();
    session.add_data_channel(Some(7), "ctl", true, true, DataChannelCallbacks::default())?;

    assert!(matches!(
        session.send_data_channel_message(7, b"early"),
        Err(SessionError::ChannelNotOpen(DataChannelState::Connecting))
    ));
    assert!(matches!(
        session.send_data_channel_message(99, b"nobody"),
        Err(SessionError::UnknownChannelId(99))
    ));

    let channel = native.channel(7).context("native channel 7")?;
    channel.set_state(DataChannelState::Open);
    session.send_data_channel_message(7, b"hello")?;

    let sent = channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(&sent[0].data[..], b"hello");
    assert!(sent[0].binary);
    Ok(())
}

#[test]
fn test_channel_callbacks_receive_native_events() -> Result<()> {
    let (session, native) = session();
    let messages = Arc::new(Mutex::new(Vec::new()));
    let buffering = Arc::new(Mutex::new(Vec::new()));
    let states = Arc::new(Mutex::new(Vec::new()));
    let (m, b, s) = (messages.clone(), buffering.clone(), states.clone());
    let callbacks = DataChannelCallbacks::default()
        .with_message(move |data| m.lock().unwrap().push(data.to_vec()))
        .with_buffering(move |prev, cur, limit| b.lock().unwrap().push((prev, cur, limit)))
        .with_state(move |state, id| s.lock().unwrap().push((state, id)));

    session.add_data_channel(Some(8), "telemetry", false, false, callbacks)?;
    let channel = native.channel(8).context("native channel 8")?;
    assert!(!channel.reliable());
    assert!(!channel.ordered());

    channel.set_state(DataChannelState::Open);
    channel.deliver(&b"ping"[..]);
    channel.set_buffered_amount(512);

    assert_eq!(*messages.lock().unwrap(), vec![b"ping".to_vec()]);
    assert_eq!(
        *buffering.lock().unwrap(),
        vec![(0, 512, SessionConfig::default().max_buffered_amount)]
    );
    assert_eq!(*states.lock().unwrap(), vec![(DataChannelState::Open, Some(8))]);
    Ok(())
}

#[test]
fn test_channel_without_id_becomes_addressable_once_assigned() -> Result<()> {
    let (session, native) = session();
    let observer =
        session.add_data_channel(None, "bulk", true, true, DataChannelCallbacks::default())?;
    assert_eq!(observer.id(), None);
    assert_eq!(session.data_channels_by_label("bulk").len(), 1);

    let channel = native.channels().pop().context("native bulk channel")?;
    channel.assign_id(12);

    assert!(session.data_channel(12).is_some());
    assert!(matches!(
        session.add_data_channel(Some(12), "dup", true, true, DataChannelCallbacks::default()),
        Err(SessionError::DuplicateChannelId(12))
    ));
    Ok(())
}

#[test]
fn test_remote_channel_is_adopted_and_announced() -> Result<()> {
    let (session, native) = session();
    let announced = Arc::new(Mutex::new(Vec::new()));
    let sink = announced.clone();
    session.on_data_channel_added(move |id, label| {
        sink.lock().unwrap().push((id, label.to_string()));
    });

    let channel = native.open_remote_channel(21, "remote-chat");
    assert_eq!(*announced.lock().unwrap(), vec![(21, "remote-chat".to_string())]);

    let observer = session.data_channel(21).context("adopted channel")?;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    observer.set_callbacks(
        DataChannelCallbacks::default().with_message(move |data| sink.lock().unwrap().push(data.len())),
    );
    channel.deliver(vec![1u8, 2, 3]);
    assert_eq!(*received.lock().unwrap(), vec![3]);

    session.send_data_channel_message(21, b"pong")?;
    assert_eq!(channel.sent().len(), 1);
    Ok(())
}

#[test]
fn test_session_drop_detaches_channel_observers() -> Result<()> {
    let (session, native) = session();
    session.add_data_channel(Some(30), "chat", true, true, DataChannelCallbacks::default())?;
    let channel = native.channel(30).context("native channel 30")?;
    assert!(channel.has_observer());

    drop(session);

    assert!(!channel.has_observer());
    Ok(())
}

#[test]
fn test_add_data_channel_without_native_session() {
    let session = PeerSession::new(SessionConfig::default());
    assert!(matches!(
        session.add_data_channel(Some(1), "chat", true, true, DataChannelCallbacks::default()),
        Err(SessionError::NoNativeSession)
    ));
    assert!(session.data_channels().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_messages_from_native_threads_reach_callbacks() -> Result<()> {
    let (session, native) = session();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    session.add_data_channel(
        Some(40),
        "stream",
        true,
        true,
        DataChannelCallbacks::default().with_message(move |data| sink.lock().unwrap().push(data[0])),
    )?;
    let channel = native.channel(40).context("native channel 40")?;

    let mut workers = Vec::new();
    for n in 0..8u8 {
        let channel = channel.clone();
        workers.push(tokio::task::spawn_blocking(move || channel.deliver(vec![n])));
    }
    for worker in workers {
        worker.await?;
    }

    let mut received = received.lock().unwrap().clone();
    received.sort_unstable();
    assert_eq!(received, (0..8).collect::<Vec<u8>>());
    Ok(())
}
