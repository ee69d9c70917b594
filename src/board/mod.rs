//! The bulletin board itself.
//!
//! All scheduling state lives in one [`Server`](server::Server) owned by the
//! master's task, and nothing else ever touches it, so none of it is behind a
//! lock. Workers reach it by message and the master by direct call, through
//! the two [`link`] flavours. Application code only sees the
//! [`Client`](client::Client).

pub mod client;
pub(crate) mod link;
pub mod server;
pub mod work;
