//! Point-to-point and broadcast delivery between participants.
//!
//! Participants are addressed by a small integer id and every message
//! carries a [`Tag`]. The board only ever needs a star: workers talk to the
//! master and the master talks to everyone, so a backend is free to refuse
//! any other route.

pub mod mesh;
#[cfg(feature = "quic")]
pub mod quic;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::{
    error::{Error, Result},
    wire::{frame::Envelope, tag::Tag, Buffer},
};

pub type ParticipantId = u32;

/// The participant that owns the board.
pub const MASTER: ParticipantId = 0;

pub const DEFAULT_PORT: u16 = 4710;

/// What a pending message looks like, without consuming it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Probe {
    pub size: usize,
    pub tag: Tag,
    pub source: ParticipantId,
}

#[async_trait]
pub trait Transport: Send {
    /// This participant's id.
    fn id(&self) -> ParticipantId;

    /// Every other participant currently reachable.
    fn peers(&self) -> Vec<ParticipantId>;

    async fn send(
        &mut self,
        dest: ParticipantId,
        tag: Tag,
        buf: Buffer,
    ) -> Result<()>;

    /// Receives the next message. With a timeout, `Ok(None)` means nothing
    /// arrived in time; a zero timeout only looks at what is already queued.
    async fn recv(&mut self, timeout: Option<Duration>)
        -> Result<Option<Envelope>>;

    /// Reports the next message without consuming it. A non-blocking probe
    /// returns `Ok(None)` when nothing is queued.
    async fn probe(&mut self, blocking: bool) -> Result<Option<Probe>>;

    /// Sends to every peer.
    async fn broadcast(&mut self, tag: Tag, buf: Buffer) -> Result<()> {
        for peer in self.peers() {
            self.send(peer, tag, buf.clone()).await?;
        }
        Ok(())
    }

    /// Flushes everything already sent, then closes. Nothing can be sent
    /// afterwards.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The receiving half shared by every backend: inbound envelopes arrive on a
/// channel, and a probed envelope is parked until the next receive.
pub(crate) struct Inbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
    stash: Option<Envelope>,
}

impl Inbox {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { rx, stash: None }
    }

    pub(crate) async fn recv(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>> {
        if let Some(env) = self.stash.take() {
            return Ok(Some(env));
        }
        match timeout {
            None => self.rx.recv().await.map(Some).ok_or(Error::Disconnected),
            Some(t) if t.is_zero() => self.try_recv(),
            Some(t) => match tokio::time::timeout(t, self.rx.recv()).await {
                Ok(Some(env)) => Ok(Some(env)),
                Ok(None) => Err(Error::Disconnected),
                Err(_) => Ok(None),
            },
        }
    }

    pub(crate) async fn probe(&mut self, blocking: bool) -> Result<Option<Probe>> {
        if self.stash.is_none() {
            self.stash = if blocking {
                self.recv(None).await?
            } else {
                self.try_recv()?
            };
        }
        Ok(self.stash.as_ref().map(|env| Probe {
            size: env.buf.len(),
            tag: env.tag,
            source: env.source,
        }))
    }

    fn try_recv(&mut self) -> Result<Option<Envelope>> {
        match self.rx.try_recv() {
            Ok(env) => Ok(Some(env)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Disconnected),
        }
    }
}
