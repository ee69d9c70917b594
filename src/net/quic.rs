//! The networked backend: a star of QUIC connections around the master.
//!
//! Each worker opens a single bidirectional stream to the master and
//! introduces itself with a `Hello` frame; the master answers with the
//! participant id it assigned. After that both directions carry plain
//! length-prefixed frames. Writes go through a per-peer writer task fed by a
//! channel, and every reader task funnels into one inbound channel, so the
//! participant itself only ever deals with the [`Transport`] surface.

use std::{
    fs::File,
    io::BufReader,
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use futures::future;
use hashbrown::HashMap;
use quinn::{RecvStream, SendStream};
use rustls::{Certificate, PrivateKey};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{Inbox, ParticipantId, Probe, Transport, MASTER};
use crate::{
    config::NetConfig,
    error::{Error, Result},
    wire::{
        frame::{read_frame, write_frame, Envelope},
        tag::Tag,
        Buffer, Packer, Unpacker,
    },
};

type Peers = Arc<Mutex<HashMap<ParticipantId, mpsc::UnboundedSender<Envelope>>>>;
type Writers = Arc<Mutex<Vec<JoinHandle<()>>>>;

pub struct QuicTransport {
    id: ParticipantId,
    inbox: Inbox,
    peers: Peers,
    writers: Writers,
    close_timeout: Duration,
    endpoint: quinn::Endpoint,
    // a worker's only connection; the master's live in their peer tasks
    conn: Option<quinn::Connection>,
}

impl QuicTransport {
    /// Binds the master's endpoint and starts accepting workers.
    pub async fn listen(config: &NetConfig) -> Result<Self> {
        let (cert_chain, key) = master_identity(config)?;
        let mut server_config =
            quinn::ServerConfig::with_single_cert(cert_chain, key)?;
        server_config.transport_config(transport_config(config.keep_alive));
        let endpoint = quinn::Endpoint::server(server_config, config.addr)?;
        debug!(addr = %endpoint.local_addr()?, "master listening");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peers = Peers::default();
        let writers = Writers::default();
        tokio::spawn(Self::start_acceptor(
            endpoint.clone(),
            peers.clone(),
            writers.clone(),
            inbound_tx,
        ));
        Ok(Self {
            id: MASTER,
            inbox: Inbox::new(inbound_rx),
            peers,
            writers,
            close_timeout: config.close_timeout,
            endpoint,
            conn: None,
        })
    }

    /// Connects a worker to the master and performs the join handshake.
    pub async fn connect(config: &NetConfig) -> Result<Self> {
        let crypto = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();
        let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(transport_config(config.keep_alive));

        let bind = if config.addr.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        let mut endpoint = quinn::Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_config);

        let span = debug_span!("connect", master = %config.addr);
        async move {
            let conn =
                endpoint.connect(config.addr, &config.server_name)?.await?;
            debug!("connected via QUIC");
            let (mut send, mut recv) = conn.open_bi().await?;
            write_frame(
                &mut send,
                &Envelope::new(Tag::Hello, MASTER, Buffer::empty()),
            )
            .await?;
            let id = match read_frame(&mut recv).await? {
                Some(env) if env.tag == Tag::Hello => {
                    Unpacker::begin(&env.buf).int()? as ParticipantId
                }
                _ => return Err(Error::Handshake("master did not say hello")),
            };
            debug!(id, "joined");

            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let writer = tokio::spawn(Self::start_writer(send, outbound_rx));
            tokio::spawn(async move {
                if let Err(e) = Self::read_until_closed(recv, MASTER, &inbound_tx).await {
                    warn!("lost the master: {e}");
                }
            });
            let peers = Peers::default();
            lock(&peers).insert(MASTER, outbound_tx);
            Ok(Self {
                id,
                inbox: Inbox::new(inbound_rx),
                peers,
                writers: Arc::new(Mutex::new(vec![writer])),
                close_timeout: config.close_timeout,
                endpoint,
                conn: Some(conn),
            })
        }
        .instrument(span)
        .await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accepts incoming workers, handing each its own task. This runs until
    /// the endpoint is closed.
    async fn start_acceptor(
        endpoint: quinn::Endpoint,
        peers: Peers,
        writers: Writers,
        inbound: mpsc::UnboundedSender<Envelope>,
    ) {
        let mut next_id: ParticipantId = MASTER + 1;
        while let Some(connecting) = endpoint.accept().await {
            let id = next_id;
            next_id += 1;
            let peers = peers.clone();
            let writers = writers.clone();
            let inbound = inbound.clone();
            let span =
                debug_span!("peer", id, remote = %connecting.remote_address());
            tokio::spawn(
                async move {
                    if let Err(e) =
                        Self::serve_peer(connecting, id, &peers, &writers, &inbound)
                            .await
                    {
                        warn!("peer dropped: {e}");
                    }
                    lock(&peers).remove(&id);
                }
                .instrument(span),
            );
        }
    }

    async fn serve_peer(
        connecting: quinn::Connecting,
        id: ParticipantId,
        peers: &Peers,
        writers: &Writers,
        inbound: &mpsc::UnboundedSender<Envelope>,
    ) -> Result<()> {
        let conn = connecting.await?;
        debug!("connected via QUIC");
        let (mut send, mut recv) = conn.accept_bi().await?;
        match read_frame(&mut recv).await? {
            Some(env) if env.tag == Tag::Hello => {}
            _ => return Err(Error::Handshake("peer did not say hello")),
        }
        let mut hello = Packer::begin();
        hello.int(i64::from(id));
        write_frame(&mut send, &Envelope::new(Tag::Hello, MASTER, hello.finish()))
            .await?;
        debug!("peer joined");

        let (tx, rx) = mpsc::unbounded_channel();
        lock(peers).insert(id, tx);
        lock(writers).push(tokio::spawn(Self::start_writer(send, rx)));
        let result = Self::read_until_closed(recv, id, inbound).await;
        debug!("peer left");
        drop(conn);
        result
    }

    /// Drains queued envelopes onto the stream until the sending half of the
    /// channel is dropped, then waits for the peer to acknowledge them.
    async fn start_writer(
        mut send: SendStream,
        mut outbound: mpsc::UnboundedReceiver<Envelope>,
    ) {
        while let Some(env) = outbound.recv().await {
            if let Err(e) = write_frame(&mut send, &env).await {
                warn!("write failed: {e}");
                return;
            }
        }
        let _ = send.finish().await;
    }

    /// Forwards frames into the inbound channel. The source is stamped from
    /// the connection, never taken from the peer.
    async fn read_until_closed(
        mut recv: RecvStream,
        source: ParticipantId,
        inbound: &mpsc::UnboundedSender<Envelope>,
    ) -> Result<()> {
        while let Some(env) = read_frame(&mut recv).await? {
            trace!(source, tag = ?env.tag, len = env.buf.len(), "frame in");
            if inbound.send(Envelope { source, ..env }).is_err() {
                // our participant is gone
                break;
            }
        }
        Ok(())
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        if let Some(conn) = &self.conn {
            conn.close(0u32.into(), b"bye");
        }
        self.endpoint.close(0u32.into(), b"bye");
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn peers(&self) -> Vec<ParticipantId> {
        let mut peers: Vec<_> = lock(&self.peers).keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    async fn send(
        &mut self,
        dest: ParticipantId,
        tag: Tag,
        buf: Buffer,
    ) -> Result<()> {
        let tx = lock(&self.peers)
            .get(&dest)
            .cloned()
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

    /// Drops every writer's channel so that each writer finishes its stream
    /// once its queue is empty, waits up to `close_timeout` for them all, and
    /// closes the endpoint.
    async fn close(&mut self) -> Result<()> {
        lock(&self.peers).clear();
        let writers: Vec<_> = lock(&self.writers).drain(..).collect();
        debug!(writers = writers.len(), "flushing before close");
        let flushed =
            tokio::time::timeout(self.close_timeout, future::join_all(writers)).await;
        if flushed.is_err() {
            warn!("peers did not acknowledge everything before close");
        }
        if let Some(conn) = &self.conn {
            conn.close(0u32.into(), b"bye");
        }
        self.endpoint.close(0u32.into(), b"bye");
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn transport_config(keep_alive: Duration) -> Arc<quinn::TransportConfig> {
    let mut transport_config = quinn::TransportConfig::default();
    transport_config.keep_alive_interval(Some(keep_alive));
    Arc::new(transport_config)
}

/// The master's certificate chain and key: loaded from PEM files when both
/// are configured, otherwise a fresh self-signed certificate.
fn master_identity(
    config: &NetConfig,
) -> Result<(Vec<Certificate>, PrivateKey)> {
    match (&config.cert_chain, &config.private_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = rustls_pemfile::certs(&mut open(cert_path)?)?
                .into_iter()
                .map(Certificate)
                .collect();
            let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open(key_path)?)?;
            if keys.len() != 1 {
                return Err(rustls::Error::General(
                    "expected exactly one private key".into(),
                )
                .into());
            }
            Ok((certs, PrivateKey(keys.remove(0))))
        }
        _ => {
            let cert = rcgen::generate_simple_self_signed(vec![
                config.server_name.clone(),
            ])?;
            Ok((
                vec![Certificate(cert.serialize_der()?)],
                PrivateKey(cert.serialize_private_key_der()),
            ))
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

/// Workers accept whatever certificate the master presents: the board runs
/// inside a trusted cluster and the link only needs QUIC's transport
/// encryption.
struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
