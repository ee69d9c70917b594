//! A bulletin board for fanning work out across cooperating participants.
//!
//! One participant, the master, owns the board: a key/value mailbox plus the
//! scheduling state for submitted tasks. Every participant, the master
//! included, talks to it through a [`Client`]: tasks are submitted, executed
//! by whoever is free, and their results are handed back to the submitter.
//! Tasks may submit and await their own subtasks.

pub mod board;
pub mod config;
pub mod error;
pub mod exec;
pub mod net;
pub mod wire;

pub use board::client::{Client, Completion, Phase, Stats, Working};
pub use config::{BoardConfig, NetConfig};
pub use error::{Error, Result};
pub use exec::{Arg, Call, Executor, FunctionTable, TaskFailure, TaskValue};
pub use net::{ParticipantId, Transport, MASTER};
pub use wire::{Buffer, Packer, Unpacker};
