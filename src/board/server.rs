use std::collections::{BTreeMap, BTreeSet, VecDeque};

use hashbrown::HashMap;
use tracing::{debug, trace};

use super::work::{Lineage, WorkId, WorkItem, WorkState};
use crate::{
    error::{Error, Result},
    net::ParticipantId,
    wire::{tag::Tag, Buffer, Packer, Unpacker},
};

/// A message the server wants delivered once a handler returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub to: ParticipantId,
    pub tag: Tag,
    pub buf: Buffer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Take {
    Taken(Buffer),
    /// Nothing was posted yet; the value will be delivered by the next post.
    Waiting,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Todo {
    Work { id: WorkId, payload: Buffer },
    Context(Buffer),
    Nothing,
    /// Nothing was ready; work will be delivered as soon as some is posted.
    Waiting,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResultPoll {
    Ready { id: WorkId, payload: Buffer },
    /// Work for this parent is still queued or running.
    Pending,
    /// Nothing was submitted for this parent that hasn't been claimed.
    Idle,
}

/// All of the master's scheduling state.
///
/// Handlers are plain synchronous calls that never perform IO themselves;
/// anything that has to reach another participant comes back as a
/// [`Delivery`] for the caller to send.
#[derive(Default)]
pub struct Server {
    mailbox: HashMap<String, VecDeque<Buffer>>,
    // participants blocked in `take`, per key, oldest first
    waiting: HashMap<String, VecDeque<ParticipantId>>,
    work: HashMap<WorkId, WorkItem>,
    ready: BTreeMap<Lineage, WorkId>,
    // completed items, filed under their parent
    results: HashMap<WorkId, VecDeque<WorkId>>,
    // submitted but unclaimed items, per parent
    outstanding: HashMap<WorkId, usize>,
    // workers blocked in `take_todo`, oldest first
    looking: VecDeque<ParticipantId>,
    workers: BTreeSet<ParticipantId>,
    context: Option<Buffer>,
    owed_context: BTreeSet<ParticipantId>,
    last_id: WorkId,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a worker that said hello. A worker joining after a context
    /// was broadcast is owed that context.
    pub fn register_worker(&mut self, id: ParticipantId) -> bool {
        let new = self.workers.insert(id);
        if new && self.context.is_some() {
            self.owed_context.insert(id);
        }
        debug!(worker = id, new, "worker registered");
        new
    }

    pub fn workers(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.workers.iter().copied()
    }

    pub fn has_workers(&self) -> bool {
        !self.workers.is_empty()
    }

    // MAILBOX

    /// Posts `buf` under `key`. The oldest participant waiting on `key`, if
    /// any, gets it directly and nothing is stored.
    pub fn post(&mut self, key: &str, buf: Buffer) -> Option<Delivery> {
        if let Some(waiter) = self.waiting.get_mut(key).and_then(VecDeque::pop_front) {
            if self.waiting.get(key).is_some_and(VecDeque::is_empty) {
                self.waiting.remove(key);
            }
            trace!(key, waiter, "post satisfies waiting take");
            return Some(Delivery {
                to: waiter,
                tag: Tag::Found,
                buf,
            });
        }
        self.mailbox.entry_ref(key).or_default().push_back(buf);
        None
    }

    /// The oldest value under `key`, left in place.
    pub fn look(&self, key: &str) -> Option<Buffer> {
        self.mailbox.get(key).and_then(|q| q.front()).cloned()
    }

    /// Removes and returns the oldest value under `key`.
    pub fn look_take(&mut self, key: &str) -> Option<Buffer> {
        let queue = self.mailbox.get_mut(key)?;
        let buf = queue.pop_front();
        if queue.is_empty() {
            self.mailbox.remove(key);
        }
        buf
    }

    /// Like [`look_take`](Self::look_take), but when nothing is there the
    /// caller is queued behind anyone already waiting on `key`.
    pub fn take(&mut self, key: &str, waiter: ParticipantId) -> Take {
        match self.look_take(key) {
            Some(buf) => Take::Taken(buf),
            None => {
                self.waiting.entry_ref(key).or_default().push_back(waiter);
                Take::Waiting
            }
        }
    }

    /// Withdraws `waiter` from the takers waiting on `key`. Returns whether
    /// it was waiting.
    pub fn cancel_take(&mut self, key: &str, waiter: ParticipantId) -> bool {
        let Some(queue) = self.waiting.get_mut(key) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|w| *w != waiter);
        let cancelled = queue.len() != before;
        if queue.is_empty() {
            self.waiting.remove(key);
        }
        cancelled
    }

    /// Puts back a value that was handed to a taker who never received it.
    /// It goes ahead of everything posted since, or straight to the next
    /// waiter.
    pub fn restore(&mut self, key: &str, buf: Buffer) -> Option<Delivery> {
        if self.waiting.contains_key(key) {
            return self.post(key, buf);
        }
        self.mailbox.entry_ref(key).or_default().push_front(buf);
        None
    }

    pub fn mailbox_len(&self, key: &str) -> usize {
        self.mailbox.get(key).map_or(0, VecDeque::len)
    }

    /// How many participants are blocked in `take` on `key`.
    pub fn waiters(&self, key: &str) -> usize {
        self.waiting.get(key).map_or(0, VecDeque::len)
    }

    // WORK

    /// Submits a task on behalf of `origin` from within work item
    /// `parent_id` (0 outside of any task).
    ///
    /// A worker already blocked waiting for work gets the task straight
    /// away; otherwise it is queued by lineage.
    pub fn post_todo(
        &mut self,
        parent_id: WorkId,
        origin: ParticipantId,
        payload: Buffer,
    ) -> (WorkId, Option<Delivery>) {
        self.last_id += 1;
        let id = self.last_id;
        let (parent, lineage) = match self.work.get(&parent_id) {
            Some(parent) => (Some(parent_id), parent.lineage.child(id)),
            None => (None, Lineage::root(id)),
        };
        let mut item = WorkItem {
            id,
            parent,
            lineage,
            origin,
            payload,
            state: WorkState::Queued,
        };
        *self.outstanding.entry(item.result_key()).or_default() += 1;

        let delivery = self.looking.pop_front().map(|worker| {
            item.state = WorkState::Dispatched;
            debug!(id, worker, "dispatched on submit");
            Delivery {
                to: worker,
                tag: Tag::Task,
                buf: pack_task(id, &item.payload),
            }
        });
        if delivery.is_none() {
            trace!(id, ?parent, "queued");
            self.ready.insert(item.lineage.clone(), id);
        }
        self.work.insert(id, item);
        (id, delivery)
    }

    /// Files the result of dispatched item `id` under its parent.
    pub fn post_result(&mut self, id: WorkId, buf: Buffer) -> Result<()> {
        let item = self.work.get_mut(&id).ok_or(Error::UnknownWork(id))?;
        if item.state != WorkState::Dispatched {
            return Err(Error::InvalidState {
                id,
                state: item.state,
                expected: WorkState::Dispatched,
            });
        }
        item.payload = buf;
        item.state = WorkState::Completed;
        let key = item.result_key();
        self.results.entry(key).or_default().push_back(id);
        trace!(id, parent = key, "result posted");
        Ok(())
    }

    /// Hands `caller` an owed context if there is one, else the
    /// highest-priority ready item.
    pub fn look_take_todo(&mut self, caller: ParticipantId) -> Todo {
        if self.owed_context.remove(&caller) {
            if let Some(context) = &self.context {
                return Todo::Context(context.clone());
            }
        }
        let Some((_, id)) = self.ready.pop_first() else {
            return Todo::Nothing;
        };
        match self.work.get_mut(&id) {
            Some(item) => {
                item.state = WorkState::Dispatched;
                trace!(id, to = caller, "dispatched");
                Todo::Work {
                    id,
                    payload: item.payload.clone(),
                }
            }
            None => Todo::Nothing,
        }
    }

    /// Like [`look_take_todo`](Self::look_take_todo), but when nothing is
    /// ready the caller joins the workers waiting for work.
    pub fn take_todo(&mut self, caller: ParticipantId) -> Todo {
        match self.look_take_todo(caller) {
            Todo::Nothing => {
                if !self.looking.contains(&caller) {
                    self.looking.push_back(caller);
                }
                Todo::Waiting
            }
            todo => todo,
        }
    }

    /// Claims the oldest completed item submitted from within `parent_id`.
    pub fn look_take_result(&mut self, parent_id: WorkId) -> Result<ResultPoll> {
        let claimed = self
            .results
            .get_mut(&parent_id)
            .and_then(VecDeque::pop_front);
        if self.results.get(&parent_id).is_some_and(VecDeque::is_empty) {
            self.results.remove(&parent_id);
        }
        let Some(id) = claimed else {
            return Ok(match self.outstanding.get(&parent_id) {
                Some(n) if *n > 0 => ResultPoll::Pending,
                _ => ResultPoll::Idle,
            });
        };

        let item = self.work.remove(&id).ok_or(Error::UnknownWork(id))?;
        self.release(parent_id);
        Ok(ResultPoll::Ready {
            id,
            payload: item.payload,
        })
    }

    fn release(&mut self, parent_id: WorkId) {
        if let Some(n) = self.outstanding.get_mut(&parent_id) {
            *n -= 1;
            if *n == 0 {
                self.outstanding.remove(&parent_id);
            }
        }
    }

    /// Broadcasts `buf` to every worker: those waiting for work get it now,
    /// the rest on their next poll. It replaces any context still owed.
    pub fn context(&mut self, buf: Buffer) -> Vec<Delivery> {
        self.owed_context = self.workers.clone();
        let mut deliveries = Vec::new();
        let mut still_looking = VecDeque::with_capacity(self.looking.len());
        for worker in std::mem::take(&mut self.looking) {
            if self.owed_context.remove(&worker) {
                deliveries.push(Delivery {
                    to: worker,
                    tag: Tag::Context,
                    buf: buf.clone(),
                });
            } else {
                still_looking.push_back(worker);
            }
        }
        self.looking = still_looking;
        debug!(
            now = deliveries.len(),
            later = self.owed_context.len(),
            "context broadcast"
        );
        self.context = Some(buf);
        deliveries
    }

    /// Drops every queued item and forgets who is waiting for what. Returns
    /// the workers that need to be told to quit.
    pub fn shutdown(&mut self) -> Vec<ParticipantId> {
        for (_, id) in std::mem::take(&mut self.ready) {
            if let Some(item) = self.work.remove(&id) {
                self.release(item.result_key());
            }
        }
        self.looking.clear();
        self.waiting.clear();
        self.owed_context.clear();
        debug!(in_flight = self.work.len(), "board shut down");
        self.workers.iter().copied().collect()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Items submitted and not yet claimed, in any state.
    pub fn work_len(&self) -> usize {
        self.work.len()
    }

    pub fn is_looking(&self, worker: ParticipantId) -> bool {
        self.looking.contains(&worker)
    }

    pub fn state(&self, id: WorkId) -> Option<WorkState> {
        self.work.get(&id).map(|item| item.state)
    }

    pub fn parent(&self, id: WorkId) -> Option<WorkId> {
        self.work.get(&id).and_then(|item| item.parent)
    }
}

/// work id | payload
pub(crate) fn pack_task(id: WorkId, payload: &[u8]) -> Buffer {
    let mut p = Packer::begin();
    p.int(id as i64).blob(payload);
    p.finish()
}

pub(crate) fn unpack_task(buf: &[u8]) -> Result<(WorkId, Buffer)> {
    let mut u = Unpacker::begin(buf);
    let id = u.int()? as WorkId;
    Ok((id, Buffer::from(u.blob()?)))
}
