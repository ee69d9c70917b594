use std::io;

use crate::{board::work::WorkState, net::ParticipantId, wire::tag::Tag};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // protocol misuse
    #[error("could not decode {what}: buffer ended or held invalid data")]
    Decode { what: &'static str },
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("expected a reply to {request:?}, got {got:?}")]
    UnexpectedReply { request: Tag, got: Tag },
    #[error("participant {from} sent {tag:?}, which only the master may send")]
    UnexpectedRequest { from: ParticipantId, tag: Tag },
    #[error("no work item with id {0}")]
    UnknownWork(u64),
    #[error("work item {id} is {state:?}, expected {expected:?}")]
    InvalidState {
        id: u64,
        state: WorkState,
        expected: WorkState,
    },
    #[error("only the master may {0}")]
    NotMaster(&'static str),
    #[error("the board can make no further progress: {0}")]
    Stalled(&'static str),

    // transport failure
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("participant {0} is not connected")]
    UnknownPeer(ParticipantId),
    #[error("transport disconnected")]
    Disconnected,
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(u64),
    #[cfg(feature = "quic")]
    #[error(transparent)]
    Connect(#[from] quinn::ConnectError),
    #[cfg(feature = "quic")]
    #[error(transparent)]
    Connection(#[from] quinn::ConnectionError),
    #[cfg(feature = "quic")]
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[cfg(feature = "quic")]
    #[error(transparent)]
    Certificate(#[from] rcgen::RcgenError),
    #[cfg(feature = "quic")]
    #[error("handshake with the master failed: {0}")]
    Handshake(&'static str),

    /// The master broadcast `QUIT` while this participant was mid-request.
    #[error("the master has shut the board down")]
    Quit,
}
