use thiserror::Error;

use crate::media::TrackKind;
use crate::native::{DataChannelState, NativeError};

/// Synchronous failure of a coordinator operation. Nothing is mutated when
/// one of these is returned.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no native session attached")]
    NoNativeSession,
    #[error("session is shutting down")]
    Closed,
    #[error("a local {0} track is already attached")]
    TrackAlreadyAttached(TrackKind),
    #[error("data channel id {0} is already registered")]
    DuplicateChannelId(u16),
    #[error("no data channel with id {0}")]
    UnknownChannelId(u16),
    #[error("no data channel with label '{0}'")]
    UnknownChannelLabel(String),
    #[error("data channel is not open (state {0:?})")]
    ChannelNotOpen(DataChannelState),
    #[error("invalid session description: {0}")]
    InvalidDescription(#[source] tandem_common::Error),
    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(#[source] tandem_common::Error),
    #[error(transparent)]
    Native(#[from] NativeError),
}

pub type SessionResult<T> = Result<T, SessionError>;
