use std::{
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::FutureExt;
use hashbrown::HashMap;
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    link::{Direct, Link, Remote},
    server::{ResultPoll, Server, Todo},
    work::{WorkId, TOP_LEVEL},
};
use crate::{
    config::BoardConfig,
    error::{Error, Result},
    exec::{
        pack_outcome, unpack_outcome, Call, Executor, TaskFailure, TaskOutcome, TaskValue,
    },
    net::{mesh::MeshTransport, ParticipantId, Transport, MASTER},
    wire::{Buffer, Packer, Unpacker},
};

/// A finished task, handed back to whoever submitted it.
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub id: WorkId,
    /// The token given at submission.
    pub requester: i32,
    pub outcome: TaskOutcome,
    /// The submitted call, replayed for tasks submitted with a negative
    /// requester id.
    pub args: Option<Call>,
}

impl Completion {
    /// The scalar result, if the task returned one.
    pub fn scalar(&self) -> Option<f64> {
        match &self.outcome {
            Ok(TaskValue::Scalar(x)) => Some(*x),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Working {
    Completed(Completion),
    /// Everything submitted from here has been claimed.
    Idle,
}

impl Working {
    pub fn found(&self) -> bool {
        matches!(self, Working::Completed(_))
    }

    pub fn completion(self) -> Option<Completion> {
        match self {
            Working::Completed(completion) => Some(completion),
            Working::Idle => None,
        }
    }
}

/// Where [`Client::working`] currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Checking whether one of our own submissions has finished.
    AwaitingOwnResult,
    /// Nothing of ours is done; running someone else's work meanwhile.
    StealingWork,
}

#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub submitted: u64,
    pub executed: u64,
    pub claimed: u64,
    pub contexts: u64,
    /// Time spent inside the executor, nested executions included.
    pub exec_time: Duration,
    /// Time spent waiting on the board with nothing to do.
    pub wait_time: Duration,
}

/// A participant's handle on the board.
pub struct Client {
    link: Link,
    executor: Arc<dyn Executor>,
    // the work item this participant is executing, TOP_LEVEL when none
    working_id: WorkId,
    phase: Phase,
    kept_args: HashMap<i32, Buffer>,
    last_auto_id: i32,
    done: bool,
    stats: Stats,
}

impl Client {
    /// A master with no workers, executing everything it submits itself.
    pub fn solo(executor: Arc<dyn Executor>) -> Self {
        let direct = Direct::new(Box::new(MeshTransport::solo()), BoardConfig::default());
        Self::new(Link::Direct(direct), executor)
    }

    /// The master: owns the board and serves everyone reachable over
    /// `transport`.
    pub fn master<T>(
        transport: T,
        executor: Arc<dyn Executor>,
        config: BoardConfig,
    ) -> Result<Self>
    where
        T: Transport + 'static,
    {
        if transport.id() != MASTER {
            return Err(Error::NotMaster("own the board"));
        }
        let link = Link::Direct(Direct::new(Box::new(transport), config));
        Ok(Self::new(link, executor))
    }

    /// A worker: says hello to the master over `transport`.
    pub async fn join<T>(
        transport: T,
        executor: Arc<dyn Executor>,
        config: BoardConfig,
    ) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let remote = Remote::hello(Box::new(transport), config).await?;
        Ok(Self::new(Link::Remote(remote), executor))
    }

    fn new(link: Link, executor: Arc<dyn Executor>) -> Self {
        Self {
            link,
            executor,
            working_id: TOP_LEVEL,
            phase: Phase::AwaitingOwnResult,
            kept_args: HashMap::new(),
            last_auto_id: 0,
            done: false,
            stats: Stats::default(),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.link.id()
    }

    pub fn is_master(&self) -> bool {
        matches!(self.link, Link::Direct(_))
    }

    /// The work item being executed right now, or 0 outside of any task.
    pub fn working_id(&self) -> WorkId {
        self.working_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// The board itself, on the master.
    pub fn server(&self) -> Option<&Server> {
        match &self.link {
            Link::Direct(d) => Some(d.server()),
            Link::Remote(_) => None,
        }
    }

    /// Whether the master executes ready work itself. While no worker has
    /// joined it always does. Workers always execute.
    pub fn master_works(&mut self, enabled: bool) {
        match &mut self.link {
            Link::Direct(d) => d.set_master_works(enabled),
            Link::Remote(_) => warn!("master_works only applies to the master"),
        }
    }

    fn may_execute(&self) -> bool {
        match &self.link {
            Link::Direct(d) => d.master_works() || !d.server().has_workers(),
            Link::Remote(_) => true,
        }
    }

    // MAILBOX

    pub async fn post(&mut self, key: &str, buf: Buffer) -> Result<()> {
        self.link.post(key, buf).await
    }

    /// The oldest value posted under `key`, left in place.
    pub async fn look(&mut self, key: &str) -> Result<Option<Buffer>> {
        self.link.look(key).await
    }

    /// Removes the oldest value posted under `key`, if there is one.
    pub async fn look_take(&mut self, key: &str) -> Result<Option<Buffer>> {
        self.link.look_take(key).await
    }

    /// Removes the oldest value posted under `key`, waiting for the next
    /// post if there is none.
    pub async fn take(&mut self, key: &str) -> Result<Buffer> {
        let start = Instant::now();
        let buf = self.link.take(key).await;
        self.stats.wait_time += start.elapsed();
        buf
    }

    // TASKS

    /// Submits `call` as a subtask of whatever this participant is executing.
    ///
    /// `requester` comes back with the result. When it is negative the call
    /// is also kept here and replayed in the [`Completion`].
    pub async fn submit(&mut self, requester: i32, call: Call) -> Result<WorkId> {
        let mut p = Packer::begin();
        p.int(i64::from(requester));
        call.pack(&mut p);
        let payload = p.finish();
        // kept before posting: the result may be ready by the next poll
        if requester < 0 {
            self.kept_args.insert(requester, payload.clone());
        }
        let id = self.link.post_todo(self.working_id, payload).await?;
        self.stats.submitted += 1;
        trace!(id, requester, parent = self.working_id, "submitted");
        Ok(id)
    }

    /// Submits `call` under the next automatic requester id (-1, -2, ...).
    pub async fn submit_auto(&mut self, call: Call) -> Result<(i32, WorkId)> {
        self.last_auto_id -= 1;
        let requester = self.last_auto_id;
        let id = self.submit(requester, call).await?;
        Ok((requester, id))
    }

    /// Returns the next finished task submitted from the current context,
    /// running other ready work while waiting for one. [`Working::Idle`]
    /// means nothing submitted from here is outstanding.
    pub async fn working(&mut self) -> Result<Working> {
        let span = self.span();
        self.poll_working().instrument(span).await
    }

    async fn poll_working(&mut self) -> Result<Working> {
        let mut phase = Phase::AwaitingOwnResult;
        loop {
            self.phase = phase;
            phase = match phase {
                Phase::AwaitingOwnResult => {
                    match self.link.look_take_result(self.working_id).await? {
                        ResultPoll::Ready { id, payload } => {
                            return self.complete(id, &payload).map(Working::Completed)
                        }
                        ResultPoll::Idle => return Ok(Working::Idle),
                        ResultPoll::Pending => Phase::StealingWork,
                    }
                }
                Phase::StealingWork => {
                    self.steal().await?;
                    Phase::AwaitingOwnResult
                }
            };
        }
    }

    async fn steal(&mut self) -> Result<()> {
        let todo = if self.may_execute() {
            self.link.look_take_todo().await?
        } else {
            Todo::Nothing
        };
        match todo {
            Todo::Work { id, payload } => self.execute(id, payload).await,
            Todo::Context(buf) => self.run_context(&buf).await,
            Todo::Nothing | Todo::Waiting => {
                let start = Instant::now();
                let waited = self.link.wait().await;
                self.stats.wait_time += start.elapsed();
                waited
            }
        }
    }

    fn complete(&mut self, id: WorkId, payload: &[u8]) -> Result<Completion> {
        let mut u = Unpacker::begin(payload);
        let requester = u.int()? as i32;
        let outcome = unpack_outcome(&mut u)?;
        let args = match self.kept_args.remove(&requester) {
            Some(kept) => {
                let mut u = Unpacker::begin(&kept);
                u.int()?;
                Some(Call::unpack(&mut u)?)
            }
            None => None,
        };
        self.stats.claimed += 1;
        trace!(id, requester, "claimed");
        Ok(Completion {
            id,
            requester,
            outcome,
            args,
        })
    }

    /// Runs work item `id` and posts its result.
    async fn execute(&mut self, id: WorkId, payload: Buffer) -> Result<()> {
        let mut u = Unpacker::begin(&payload);
        let requester = u.int()? as i32;
        let call = Call::unpack(&mut u)?;

        let outer = std::mem::replace(&mut self.working_id, id);
        let start = Instant::now();
        let outcome = self.invoke(call).await;
        self.stats.exec_time += start.elapsed();
        self.stats.executed += 1;
        self.working_id = outer;

        if let Err(failure) = &outcome {
            debug!(id, "{failure}");
        }
        let mut p = Packer::begin();
        p.int(i64::from(requester));
        pack_outcome(&mut p, &outcome);
        self.link.post_result(id, p.finish()).await
    }

    async fn run_context(&mut self, buf: &[u8]) -> Result<()> {
        let call = Call::unpack(&mut Unpacker::begin(buf))?;
        self.stats.contexts += 1;
        if let Err(failure) = self.invoke(call).await {
            warn!("context call failed: {failure}");
        }
        Ok(())
    }

    /// Hands `call` to the executor. A panic is reported like any other
    /// failure so that it reaches the submitter instead of taking this
    /// participant down.
    async fn invoke(&mut self, call: Call) -> TaskOutcome {
        let executor = Arc::clone(&self.executor);
        match AssertUnwindSafe(executor.execute(self, call))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "task panicked".into());
                Err(TaskFailure(msg))
            }
        }
    }

    /// Runs tasks until the master says quit. Returns immediately on the
    /// master, which does its share of the work from [`working`].
    ///
    /// [`working`]: Self::working
    pub async fn worker(&mut self) -> Result<()> {
        if self.is_master() {
            return Ok(());
        }
        let span = self.span();
        async move {
            debug!("waiting for work");
            loop {
                let handled = match self.link.take_todo().await {
                    Ok(Todo::Work { id, payload }) => self.execute(id, payload).await,
                    Ok(Todo::Context(buf)) => self.run_context(&buf).await,
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                };
                match handled {
                    Err(Error::Quit) => break,
                    Err(e) => return Err(e),
                    Ok(()) if self.has_quit() => break,
                    Ok(()) => {}
                }
            }
            debug!(executed = self.stats.executed, "worker done");
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn span(&self) -> tracing::Span {
        match self.is_master() {
            true => debug_span!("master"),
            false => debug_span!("worker", id = self.id()),
        }
    }

    fn has_quit(&self) -> bool {
        match &self.link {
            Link::Remote(r) => r.has_quit(),
            Link::Direct(_) => self.done,
        }
    }

    /// Has every worker execute `call` once. Workers waiting for work run it
    /// straight away, the others before their next task.
    pub async fn context(&mut self, call: Call) -> Result<()> {
        let mut p = Packer::begin();
        call.pack(&mut p);
        match &mut self.link {
            Link::Direct(d) => d.context(p.finish()).await,
            Link::Remote(_) => Err(Error::NotMaster("broadcast a context")),
        }
    }

    /// Shuts the board down: queued work is dropped and every worker is told
    /// to quit. Calling it again does nothing.
    pub async fn done(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        match &mut self.link {
            Link::Direct(d) => d.done().await,
            Link::Remote(_) => {
                warn!("only the master can shut the board down");
                Ok(())
            }
        }
    }
}
