//! The boundary between the board and whatever actually runs a task.
//!
//! A task is a [`Call`]: an interpreter statement, a named function, or a
//! serialized callable, with positional arguments. The board never looks
//! inside one. It packs calls into payloads, hands them to an [`Executor`]
//! on whichever participant picks the task up, and ships the outcome back.

use async_trait::async_trait;
use hashbrown::HashMap;

use crate::{
    board::client::Client,
    error::{Error, Result},
    wire::{Packer, Unpacker},
};

#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Scalar(f64),
    Str(String),
    Vector(Vec<f64>),
    Blob(Vec<u8>),
}

impl Arg {
    const SCALAR: i64 = 0;
    const STR: i64 = 1;
    const VECTOR: i64 = 2;
    const BLOB: i64 = 3;

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Arg::Scalar(x) => Some(*x),
            _ => None,
        }
    }

    fn pack(&self, p: &mut Packer) {
        match self {
            Arg::Scalar(x) => p.int(Self::SCALAR).double(*x),
            Arg::Str(s) => p.int(Self::STR).string(s),
            Arg::Vector(v) => p.int(Self::VECTOR).doubles(v),
            Arg::Blob(b) => p.int(Self::BLOB).blob(b),
        };
    }

    fn unpack(u: &mut Unpacker<'_>) -> Result<Self> {
        Ok(match u.int()? {
            Self::SCALAR => Arg::Scalar(u.double()?),
            Self::STR => Arg::Str(u.string()?),
            Self::VECTOR => Arg::Vector(u.doubles()?),
            Self::BLOB => Arg::Blob(u.blob()?),
            _ => return Err(Error::Decode { what: "argument type" }),
        })
    }
}

/// One unit of work, as submitted.
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    /// Source text for an interpreter.
    Statement(String),
    /// A function looked up by name on the executing participant.
    Function { name: String, args: Vec<Arg> },
    /// A callable serialized by the submitter.
    Serialized { callable: Vec<u8>, args: Vec<Arg> },
}

impl Call {
    const STATEMENT: i64 = 1;
    const FUNCTION: i64 = 2;
    const SERIALIZED: i64 = 3;

    pub fn statement(source: impl Into<String>) -> Self {
        Call::Statement(source.into())
    }

    pub fn function(name: impl Into<String>, args: Vec<Arg>) -> Self {
        Call::Function {
            name: name.into(),
            args,
        }
    }

    pub fn pack(&self, p: &mut Packer) {
        let args = match self {
            Call::Statement(source) => {
                p.int(Self::STATEMENT).string(source);
                return;
            }
            Call::Function { name, args } => {
                p.int(Self::FUNCTION).string(name);
                args
            }
            Call::Serialized { callable, args } => {
                p.int(Self::SERIALIZED).blob(callable);
                args
            }
        };
        p.int(args.len() as i64);
        for arg in args {
            arg.pack(p);
        }
    }

    pub fn unpack(u: &mut Unpacker<'_>) -> Result<Self> {
        match u.int()? {
            Self::STATEMENT => Ok(Call::Statement(u.string()?)),
            Self::FUNCTION => {
                let name = u.string()?;
                let args = Self::unpack_args(u)?;
                Ok(Call::Function { name, args })
            }
            Self::SERIALIZED => {
                let callable = u.blob()?;
                let args = Self::unpack_args(u)?;
                Ok(Call::Serialized { callable, args })
            }
            _ => Err(Error::Decode { what: "call style" }),
        }
    }

    fn unpack_args(u: &mut Unpacker<'_>) -> Result<Vec<Arg>> {
        let argc = usize::try_from(u.int()?)
            .map_err(|_| Error::Decode { what: "argument count" })?;
        (0..argc).map(|_| Arg::unpack(u)).collect()
    }
}

/// What a successful task hands back.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskValue {
    Scalar(f64),
    /// An opaque serialized value.
    Blob(Vec<u8>),
}

/// A task that raised instead of returning. It travels back to the
/// submitter as the task's result.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("task failed: {0}")]
pub struct TaskFailure(pub String);

impl From<Error> for TaskFailure {
    fn from(e: Error) -> Self {
        TaskFailure(e.to_string())
    }
}

pub type TaskOutcome = std::result::Result<TaskValue, TaskFailure>;

const OUTCOME_SCALAR: i64 = 0;
const OUTCOME_BLOB: i64 = 1;
const OUTCOME_FAILED: i64 = 2;

pub(crate) fn pack_outcome(p: &mut Packer, outcome: &TaskOutcome) {
    match outcome {
        Ok(TaskValue::Scalar(x)) => p.int(OUTCOME_SCALAR).double(*x),
        Ok(TaskValue::Blob(b)) => p.int(OUTCOME_BLOB).blob(b),
        Err(TaskFailure(msg)) => p.int(OUTCOME_FAILED).string(msg),
    };
}

pub(crate) fn unpack_outcome(u: &mut Unpacker<'_>) -> Result<TaskOutcome> {
    Ok(match u.int()? {
        OUTCOME_SCALAR => Ok(TaskValue::Scalar(u.double()?)),
        OUTCOME_BLOB => Ok(TaskValue::Blob(u.blob()?)),
        OUTCOME_FAILED => Err(TaskFailure(u.string()?)),
        _ => return Err(Error::Decode { what: "result kind" }),
    })
}

/// Runs calls on behalf of the board.
///
/// The client is handed in so that a task can submit subtasks and wait on
/// them with [`Client::working`].
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        client: &mut Client,
        call: Call,
    ) -> Result<TaskValue, TaskFailure>;
}

type Function =
    Box<dyn Fn(&[Arg]) -> Result<TaskValue, TaskFailure> + Send + Sync>;

/// An executor backed by named, synchronous functions.
#[derive(Default)]
pub struct FunctionTable {
    functions: HashMap<String, Function>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Arg]) -> Result<TaskValue, TaskFailure> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Box::new(f));
        self
    }

    /// Runs `call` without a client. Used by executors that wrap a table and
    /// only handle some calls themselves.
    pub fn call(&self, call: &Call) -> Result<TaskValue, TaskFailure> {
        match call {
            Call::Function { name, args } => match self.functions.get(name) {
                Some(f) => f(args),
                None => Err(TaskFailure(format!("no function named `{name}`"))),
            },
            Call::Statement(source) => Err(TaskFailure(format!(
                "no interpreter for statement `{source}`"
            ))),
            Call::Serialized { .. } => Err(TaskFailure(
                "serialized callables are not supported".into(),
            )),
        }
    }
}

#[async_trait]
impl Executor for FunctionTable {
    async fn execute(
        &self,
        _client: &mut Client,
        call: Call,
    ) -> Result<TaskValue, TaskFailure> {
        self.call(&call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repack(call: &Call) -> Call {
        let mut p = Packer::begin();
        call.pack(&mut p);
        let buf = p.finish();
        let mut u = Unpacker::begin(&buf);
        let back = Call::unpack(&mut u).unwrap();
        assert_eq!(u.remaining(), 0);
        back
    }

    #[test]
    fn calls_keep_their_arguments() {
        let call = Call::Serialized {
            callable: vec![0x80, 0x04],
            args: vec![
                Arg::Scalar(1.5),
                Arg::Str("dend".into()),
                Arg::Vector(vec![0.1, 0.2]),
                Arg::Blob(vec![]),
            ],
        };
        assert_eq!(repack(&call), call);
        assert_eq!(repack(&Call::statement("x = 1")), Call::statement("x = 1"));
    }

    #[test]
    fn unknown_argument_type_is_a_decode_error() {
        let mut p = Packer::begin();
        p.int(Call::FUNCTION).string("f").int(1).int(9);
        let buf = p.finish();
        assert!(Call::unpack(&mut Unpacker::begin(&buf)).is_err());
    }

    #[test]
    fn failures_travel_as_outcomes() {
        let mut p = Packer::begin();
        pack_outcome(&mut p, &Err(TaskFailure("division by zero".into())));
        let buf = p.finish();
        assert_eq!(
            unpack_outcome(&mut Unpacker::begin(&buf)).unwrap(),
            Err(TaskFailure("division by zero".into()))
        );
    }

    #[test]
    fn table_reports_missing_functions() {
        let table = FunctionTable::new()
            .register("one", |_| Ok(TaskValue::Scalar(1.0)));
        assert_eq!(
            table.call(&Call::function("one", vec![])),
            Ok(TaskValue::Scalar(1.0))
        );
        assert!(table.call(&Call::function("two", vec![])).is_err());
        assert!(table.call(&Call::statement("print 1")).is_err());
    }
}
