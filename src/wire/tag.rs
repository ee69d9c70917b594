/// Small integer tags naming every message exchanged with the master.
///
/// Requests are sent by a participant to the master. Replies come back from
/// the master, either immediately or, for the blocking requests (`Take` and
/// `TakeTodo`), whenever the board can satisfy them.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    // REQUESTS
    /// Post a value to the mailbox
    Post = 1,
    /// Peek at a mailbox value without removing it
    Look,
    /// Take a mailbox value if one is there
    LookTake,
    /// Take a mailbox value, waiting for one if necessary
    Take,
    /// Submit a task
    PostTodo,
    /// Post the result of an executed task
    PostResult,
    /// Take a ready task if one is there
    LookTakeTodo,
    /// Claim a completed result for a parent task
    LookTakeResult,
    /// Take a ready task, waiting for one if necessary
    TakeTodo,
    /// A call every worker executes once. Sent by the master only.
    Context,
    /// Join handshake
    Hello,
    /// Shut down. Sent by the master only.
    Quit,

    // REPLIES
    /// A mailbox value
    Found,
    /// Nothing there
    Empty,
    /// A task to execute: work id, then payload
    Task,
    /// Results for this parent are still outstanding
    Pending,
    /// Nothing is outstanding for this parent
    Idle,
    /// A newly assigned work id
    Ack,
}

impl Tag {
    const ALL: [Tag; 18] = [
        Tag::Post,
        Tag::Look,
        Tag::LookTake,
        Tag::Take,
        Tag::PostTodo,
        Tag::PostResult,
        Tag::LookTakeTodo,
        Tag::LookTakeResult,
        Tag::TakeTodo,
        Tag::Context,
        Tag::Hello,
        Tag::Quit,
        Tag::Found,
        Tag::Empty,
        Tag::Task,
        Tag::Pending,
        Tag::Idle,
        Tag::Ack,
    ];

    pub fn byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Tag {
    type Error = crate::error::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Tag::ALL
            .iter()
            .copied()
            .find(|tag| tag.byte() == value)
            .ok_or(crate::error::Error::UnknownTag(value))
    }
}

impl From<Tag> for u8 {
    fn from(tag: Tag) -> Self {
        tag.byte()
    }
}
