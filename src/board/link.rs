//! How a client reaches the board.
//!
//! The master holds the [`Server`] and calls it directly, answering everyone
//! else's requests whenever it reaches a safe point in its own work. A
//! worker sends each request to the master and waits for the answer.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use super::{
    server::{pack_task, unpack_task, Delivery, ResultPoll, Server, Take, Todo},
    work::WorkId,
};
use crate::{
    config::BoardConfig,
    error::{Error, Result},
    net::{ParticipantId, Transport, MASTER},
    wire::{frame::Envelope, tag::Tag, Buffer, Packer, Unpacker},
};

pub(crate) enum Link {
    Direct(Direct),
    Remote(Remote),
}

impl Link {
    pub(crate) fn id(&self) -> ParticipantId {
        match self {
            Link::Direct(d) => d.transport.id(),
            Link::Remote(r) => r.transport.id(),
        }
    }

    pub(crate) async fn post(&mut self, key: &str, buf: Buffer) -> Result<()> {
        match self {
            Link::Direct(d) => d.post(key, buf).await,
            Link::Remote(r) => r.post(key, buf).await,
        }
    }

    pub(crate) async fn look(&mut self, key: &str) -> Result<Option<Buffer>> {
        match self {
            Link::Direct(d) => d.look(key).await,
            Link::Remote(r) => r.look(Tag::Look, key).await,
        }
    }

    pub(crate) async fn look_take(&mut self, key: &str) -> Result<Option<Buffer>> {
        match self {
            Link::Direct(d) => d.look_take(key).await,
            Link::Remote(r) => r.look(Tag::LookTake, key).await,
        }
    }

    pub(crate) async fn take(&mut self, key: &str) -> Result<Buffer> {
        match self {
            Link::Direct(d) => d.take(key).await,
            Link::Remote(r) => r.take(key).await,
        }
    }

    pub(crate) async fn post_todo(
        &mut self,
        parent: WorkId,
        payload: Buffer,
    ) -> Result<WorkId> {
        match self {
            Link::Direct(d) => d.post_todo(parent, payload).await,
            Link::Remote(r) => r.post_todo(parent, payload).await,
        }
    }

    pub(crate) async fn post_result(
        &mut self,
        id: WorkId,
        payload: Buffer,
    ) -> Result<()> {
        match self {
            Link::Direct(d) => d.post_result(id, payload).await,
            Link::Remote(r) => r.post_result(id, payload).await,
        }
    }

    pub(crate) async fn look_take_todo(&mut self) -> Result<Todo> {
        match self {
            Link::Direct(d) => d.look_take_todo().await,
            Link::Remote(r) => r.todo(Tag::LookTakeTodo).await,
        }
    }

    /// Blocks for work. Only workers wait on the board for work; the master
    /// simply looks.
    pub(crate) async fn take_todo(&mut self) -> Result<Todo> {
        match self {
            Link::Direct(d) => d.look_take_todo().await,
            Link::Remote(r) => r.todo(Tag::TakeTodo).await,
        }
    }

    pub(crate) async fn look_take_result(
        &mut self,
        parent: WorkId,
    ) -> Result<ResultPoll> {
        match self {
            Link::Direct(d) => d.look_take_result(parent).await,
            Link::Remote(r) => r.look_take_result(parent).await,
        }
    }

    /// Blocks until something may have changed on the board.
    pub(crate) async fn wait(&mut self) -> Result<()> {
        match self {
            Link::Direct(d) => d.handle_blocking().await,
            Link::Remote(r) => {
                tokio::time::sleep(r.config.poll_interval).await;
                Ok(())
            }
        }
    }
}

/// The master's link: owns the board.
pub(crate) struct Direct {
    server: Server,
    transport: Box<dyn Transport>,
    // mailbox values handed to the master's own waiting take, by key
    parked: HashMap<String, Buffer>,
    config: BoardConfig,
    // cleared whenever a request arrives
    idle_since: Option<Instant>,
    // set once the transport can never deliver another request
    alone: bool,
}

impl Direct {
    pub(crate) fn new(transport: Box<dyn Transport>, config: BoardConfig) -> Self {
        Self {
            server: Server::new(),
            transport,
            parked: HashMap::new(),
            config,
            idle_since: None,
            alone: false,
        }
    }

    pub(crate) fn server(&self) -> &Server {
        &self.server
    }

    pub(crate) fn master_works(&self) -> bool {
        self.config.master_works
    }

    pub(crate) fn set_master_works(&mut self, enabled: bool) {
        self.config.master_works = enabled;
    }

    /// Sends a mailbox value to the taker it was posted for, parking it if
    /// that taker is the master.
    async fn hand_over(&mut self, key: &str, delivery: Option<Delivery>) -> Result<()> {
        match delivery {
            Some(delivery) if delivery.to == MASTER => {
                self.parked.insert(key.to_owned(), delivery.buf);
                Ok(())
            }
            Some(delivery) => self.deliver(delivery).await,
            None => Ok(()),
        }
    }

    async fn deliver(&mut self, delivery: Delivery) -> Result<()> {
        trace!(to = delivery.to, tag = ?delivery.tag, "deliver");
        self.transport
            .send(delivery.to, delivery.tag, delivery.buf)
            .await
    }

    async fn reply(
        &mut self,
        to: ParticipantId,
        tag: Tag,
        buf: Buffer,
    ) -> Result<()> {
        self.deliver(Delivery { to, tag, buf }).await
    }

    async fn next_request(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Envelope>> {
        if self.alone {
            return Ok(None);
        }
        match self.transport.recv(Some(timeout)).await {
            Err(Error::Disconnected) => {
                debug!("no participant left to hear from");
                self.alone = true;
                Ok(None)
            }
            other => other,
        }
    }

    /// Answers every request that has already arrived.
    pub(crate) async fn handle(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Some(env) = self.next_request(Duration::ZERO).await? {
            self.serve(env).await?;
            handled += 1;
        }
        if handled > 0 {
            self.idle_since = None;
        }
        Ok(handled)
    }

    /// Waits up to one handle timeout for a request, then answers everything
    /// that has arrived.
    pub(crate) async fn handle_blocking(&mut self) -> Result<()> {
        if self.alone {
            return Err(Error::Stalled(
                "waiting on the board with no other participant",
            ));
        }
        match self.next_request(self.config.handle_timeout).await? {
            Some(env) => {
                self.serve(env).await?;
                self.handle().await?;
                self.idle_since = None;
            }
            None => {
                let idle_since = *self.idle_since.get_or_insert_with(Instant::now);
                if let Some(limit) = self.config.stall_after {
                    if idle_since.elapsed() >= limit {
                        return Err(Error::Stalled("no participant responded in time"));
                    }
                }
            }
        }
        Ok(())
    }

    async fn serve(&mut self, env: Envelope) -> Result<()> {
        let from = env.source;
        trace!(from, tag = ?env.tag, len = env.buf.len(), "request");
        match env.tag {
            Tag::Hello => {
                self.server.register_worker(from);
                let mut p = Packer::begin();
                p.int(i64::from(from));
                self.reply(from, Tag::Hello, p.finish()).await
            }
            Tag::Post => {
                let (key, buf) = unpack_keyed(&env.buf)?;
                let delivery = self.server.post(&key, buf);
                self.hand_over(&key, delivery).await
            }
            Tag::Look | Tag::LookTake => {
                let key = Unpacker::begin(&env.buf).string()?;
                let found = if env.tag == Tag::Look {
                    self.server.look(&key)
                } else {
                    self.server.look_take(&key)
                };
                match found {
                    Some(buf) => self.reply(from, Tag::Found, buf).await,
                    None => self.reply(from, Tag::Empty, Buffer::empty()).await,
                }
            }
            Tag::Take => {
                let key = Unpacker::begin(&env.buf).string()?;
                match self.server.take(&key, from) {
                    Take::Taken(buf) => self.reply(from, Tag::Found, buf).await,
                    Take::Waiting => Ok(()),
                }
            }
            Tag::PostTodo => {
                let mut u = Unpacker::begin(&env.buf);
                let parent = u.int()? as WorkId;
                let payload = Buffer::from(u.blob()?);
                let (id, dispatch) = self.server.post_todo(parent, from, payload);
                let mut p = Packer::begin();
                p.int(id as i64);
                self.reply(from, Tag::Ack, p.finish()).await?;
                match dispatch {
                    Some(delivery) => self.deliver(delivery).await,
                    None => Ok(()),
                }
            }
            Tag::PostResult => {
                let (id, payload) = unpack_task(&env.buf)?;
                self.server.post_result(id, payload)
            }
            Tag::LookTakeTodo | Tag::TakeTodo => {
                let todo = if env.tag == Tag::TakeTodo {
                    self.server.take_todo(from)
                } else {
                    self.server.look_take_todo(from)
                };
                match todo {
                    Todo::Work { id, payload } => {
                        self.reply(from, Tag::Task, pack_task(id, &payload)).await
                    }
                    Todo::Context(buf) => self.reply(from, Tag::Context, buf).await,
                    Todo::Nothing => {
                        self.reply(from, Tag::Empty, Buffer::empty()).await
                    }
                    Todo::Waiting => Ok(()),
                }
            }
            Tag::LookTakeResult => {
                let parent = Unpacker::begin(&env.buf).int()? as WorkId;
                match self.server.look_take_result(parent)? {
                    ResultPoll::Ready { id, payload } => {
                        self.reply(from, Tag::Found, pack_task(id, &payload)).await
                    }
                    ResultPoll::Pending => {
                        self.reply(from, Tag::Pending, Buffer::empty()).await
                    }
                    ResultPoll::Idle => {
                        self.reply(from, Tag::Idle, Buffer::empty()).await
                    }
                }
            }
            tag => Err(Error::UnexpectedRequest { from, tag }),
        }
    }

    async fn post(&mut self, key: &str, buf: Buffer) -> Result<()> {
        self.handle().await?;
        let delivery = self.server.post(key, buf);
        self.hand_over(key, delivery).await
    }

    async fn look(&mut self, key: &str) -> Result<Option<Buffer>> {
        self.handle().await?;
        Ok(self.server.look(key))
    }

    async fn look_take(&mut self, key: &str) -> Result<Option<Buffer>> {
        self.handle().await?;
        Ok(self.server.look_take(key))
    }

    async fn take(&mut self, key: &str) -> Result<Buffer> {
        self.handle().await?;
        if let Take::Taken(buf) = self.server.take(key, MASTER) {
            return Ok(buf);
        }
        loop {
            if let Some(buf) = self.parked.remove(key) {
                return Ok(buf);
            }
            if let Err(e) = self.handle_blocking().await {
                // the take is abandoned; a value posted for it stays on the board
                match self.parked.remove(key) {
                    Some(buf) => {
                        let delivery = self.server.restore(key, buf);
                        self.hand_over(key, delivery).await?;
                    }
                    None => {
                        self.server.cancel_take(key, MASTER);
                    }
                }
                return Err(e);
            }
        }
    }

    async fn post_todo(&mut self, parent: WorkId, payload: Buffer) -> Result<WorkId> {
        self.handle().await?;
        let (id, dispatch) = self.server.post_todo(parent, MASTER, payload);
        if let Some(delivery) = dispatch {
            self.deliver(delivery).await?;
        }
        Ok(id)
    }

    async fn post_result(&mut self, id: WorkId, payload: Buffer) -> Result<()> {
        self.server.post_result(id, payload)?;
        self.handle().await.map(drop)
    }

    async fn look_take_todo(&mut self) -> Result<Todo> {
        self.handle().await?;
        Ok(self.server.look_take_todo(MASTER))
    }

    async fn look_take_result(&mut self, parent: WorkId) -> Result<ResultPoll> {
        self.handle().await?;
        self.server.look_take_result(parent)
    }

    pub(crate) async fn context(&mut self, buf: Buffer) -> Result<()> {
        self.handle().await?;
        for delivery in self.server.context(buf) {
            self.deliver(delivery).await?;
        }
        Ok(())
    }

    /// Discards queued work, tells every connected participant to quit and
    /// waits for the transport to flush before closing it.
    pub(crate) async fn done(&mut self) -> Result<()> {
        let workers = self.server.shutdown();
        let peers = self.transport.peers();
        debug!(workers = workers.len(), peers = peers.len(), "sending quit");
        for peer in peers {
            if let Err(e) = self.transport.send(peer, Tag::Quit, Buffer::empty()).await {
                warn!(peer, "could not deliver quit: {e}");
            }
        }
        self.transport.close().await
    }
}

/// A worker's link: every operation is a message to the master.
pub(crate) struct Remote {
    transport: Box<dyn Transport>,
    config: BoardConfig,
    quit: bool,
}

impl Remote {
    /// Introduces this participant to the master.
    pub(crate) async fn hello(
        transport: Box<dyn Transport>,
        config: BoardConfig,
    ) -> Result<Self> {
        let mut remote = Self {
            transport,
            config,
            quit: false,
        };
        let env = remote.call(Tag::Hello, Buffer::empty()).await?;
        let assigned = expect(Tag::Hello, &env, Tag::Hello)
            .and_then(|_| Unpacker::begin(&env.buf).int())?;
        debug!(id = remote.transport.id(), assigned, "said hello");
        Ok(remote)
    }

    pub(crate) fn has_quit(&self) -> bool {
        self.quit
    }

    async fn request(&mut self, tag: Tag, buf: Buffer) -> Result<()> {
        if self.quit {
            return Err(Error::Quit);
        }
        self.transport.send(MASTER, tag, buf).await
    }

    /// The master's next message. A `Quit` can arrive at any point and wins
    /// over whatever reply was expected.
    async fn answer(&mut self) -> Result<Envelope> {
        let env = self.transport.recv(None).await?.ok_or(Error::Disconnected)?;
        if env.tag == Tag::Quit {
            debug!("quit received");
            self.quit = true;
            return Err(Error::Quit);
        }
        Ok(env)
    }

    async fn call(&mut self, tag: Tag, buf: Buffer) -> Result<Envelope> {
        self.request(tag, buf).await?;
        self.answer().await
    }

    async fn post(&mut self, key: &str, buf: Buffer) -> Result<()> {
        self.request(Tag::Post, pack_keyed(key, &buf)).await
    }

    async fn look(&mut self, tag: Tag, key: &str) -> Result<Option<Buffer>> {
        let env = self.call(tag, pack_key(key)).await?;
        match env.tag {
            Tag::Found => Ok(Some(env.buf)),
            Tag::Empty => Ok(None),
            got => Err(Error::UnexpectedReply { request: tag, got }),
        }
    }

    async fn take(&mut self, key: &str) -> Result<Buffer> {
        let env = self.call(Tag::Take, pack_key(key)).await?;
        expect(Tag::Take, &env, Tag::Found)?;
        Ok(env.buf)
    }

    async fn post_todo(&mut self, parent: WorkId, payload: Buffer) -> Result<WorkId> {
        let mut p = Packer::begin();
        p.int(parent as i64).blob(&payload);
        let env = self.call(Tag::PostTodo, p.finish()).await?;
        expect(Tag::PostTodo, &env, Tag::Ack)?;
        Ok(Unpacker::begin(&env.buf).int()? as WorkId)
    }

    async fn post_result(&mut self, id: WorkId, payload: Buffer) -> Result<()> {
        self.request(Tag::PostResult, pack_task(id, &payload)).await
    }

    /// Asks for work with `LookTakeTodo` or `TakeTodo`. The latter only
    /// returns once there is work or a context.
    pub(crate) async fn todo(&mut self, tag: Tag) -> Result<Todo> {
        let env = self.call(tag, Buffer::empty()).await?;
        match env.tag {
            Tag::Task => {
                let (id, payload) = unpack_task(&env.buf)?;
                Ok(Todo::Work { id, payload })
            }
            Tag::Context => Ok(Todo::Context(env.buf)),
            Tag::Empty if tag == Tag::LookTakeTodo => Ok(Todo::Nothing),
            got => Err(Error::UnexpectedReply { request: tag, got }),
        }
    }

    async fn look_take_result(&mut self, parent: WorkId) -> Result<ResultPoll> {
        let mut p = Packer::begin();
        p.int(parent as i64);
        let env = self.call(Tag::LookTakeResult, p.finish()).await?;
        match env.tag {
            Tag::Found => {
                let (id, payload) = unpack_task(&env.buf)?;
                Ok(ResultPoll::Ready { id, payload })
            }
            Tag::Pending => Ok(ResultPoll::Pending),
            Tag::Idle => Ok(ResultPoll::Idle),
            got => Err(Error::UnexpectedReply {
                request: Tag::LookTakeResult,
                got,
            }),
        }
    }
}

fn expect(request: Tag, env: &Envelope, want: Tag) -> Result<()> {
    if env.tag == want {
        Ok(())
    } else {
        Err(Error::UnexpectedReply {
            request,
            got: env.tag,
        })
    }
}

fn pack_key(key: &str) -> Buffer {
    let mut p = Packer::begin();
    p.string(key);
    p.finish()
}

/// key | value
fn pack_keyed(key: &str, buf: &[u8]) -> Buffer {
    let mut p = Packer::begin();
    p.string(key).blob(buf);
    p.finish()
}

fn unpack_keyed(buf: &[u8]) -> Result<(String, Buffer)> {
    let mut u = Unpacker::begin(buf);
    let key = u.string()?;
    Ok((key, Buffer::from(u.blob()?)))
}
