//! JSON-RPC 2.0 protocol types and the line-delimited server.

pub mod protocol;
pub mod server;

pub use protocol::{Incoming, DecodeError};
pub use server::{HandlerError, RpcHandler, RpcNotifier, RpcServer, StopHandle};
