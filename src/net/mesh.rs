//! An in-process mesh of participants joined by channels.
//!
//! `mesh(1)` is the embedded board: a master that is also its only worker.
//! Larger meshes run a real master and workers as separate tokio tasks, which
//! is how the board is exercised without a network.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::{Inbox, ParticipantId, Probe, Transport};
use crate::{
    error::{Error, Result},
    wire::{frame::Envelope, tag::Tag, Buffer},
};

pub struct MeshTransport {
    id: ParticipantId,
    inbox: Inbox,
    // indexed by participant id; our own slot is empty so that our inbox
    // closes once every other participant has gone
    outbound: Box<[Option<mpsc::UnboundedSender<Envelope>>]>,
}

/// Builds `n` connected transports with ids `0..n`. Id 0 is the master.
pub fn mesh(n: usize) -> Vec<MeshTransport> {
    let (txs, rxs): (Vec<_>, Vec<_>) =
        (0..n).map(|_| mpsc::unbounded_channel()).unzip();
    rxs.into_iter()
        .enumerate()
        .map(|(id, rx)| MeshTransport {
            id: id as ParticipantId,
            inbox: Inbox::new(rx),
            outbound: txs
                .iter()
                .enumerate()
                .map(|(peer, tx)| (peer != id).then(|| tx.clone()))
                .collect(),
        })
        .collect()
}

impl MeshTransport {
    /// A mesh of one: the master with nobody to talk to.
    pub fn solo() -> Self {
        let (_, rx) = mpsc::unbounded_channel();
        Self {
            id: 0,
            inbox: Inbox::new(rx),
            outbound: Box::new([None]),
        }
    }
}

#[async_trait]
impl Transport for MeshTransport {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn peers(&self) -> Vec<ParticipantId> {
        self.outbound
            .iter()
            .enumerate()
            .filter(|(_, tx)| tx.as_ref().is_some_and(|tx| !tx.is_closed()))
            .map(|(peer, _)| peer as ParticipantId)
            .collect()
    }

    async fn send(
        &mut self,
        dest: ParticipantId,
        tag: Tag,
        buf: Buffer,
    ) -> Result<()> {
        trace!(from = self.id, to = dest, ?tag, len = buf.len(), "mesh send");
        let tx = self
            .outbound
            .get(dest as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::UnknownPeer(dest))?;
        tx.send(Envelope::new(tag, self.id, buf))
            .map_err(|_| Error::Disconnected)
    }

    async fn recv(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>> {
        self.inbox.recv(timeout).await
    }

    async fn probe(&mut self, blocking: bool) -> Result<Option<Probe>> {
        self.inbox.probe(blocking).await
    }
}
