//! Local inter-process message dispatch over stream sockets.
//!
//! A client [`open`]s a connection to a service endpoint and sends one or more typed
//! messages; a server [`listen`]s on an endpoint, accepts connections concurrently,
//! reads a message type, dispatches that type to a registered handler, and closes the
//! connection when the handler returns.
//!
//! No authentication or encryption is provided. Peer identity, where available,
//! comes from the OS via [`peerinfo`]. There is no message multiplexing within a
//! connection: after the opening handshake the server reads exactly one message type
//! and hands the rest of the conversation to the handler.

#![deny(unsafe_op_in_unsafe_fn)]

mod addr;
mod codec;
mod config;
mod conn;
pub mod engine;
mod error;
mod flags;

pub use config::{config_init, init, Config};
pub use conn::{close, open, peerinfo, poison, Connection, PeerInfo};
pub use engine::{listen, Handler, HandlerResult, TYPE_PANIC, TYPE_PING, TYPE_RESERVED};
pub use error::{Error, Result};
pub use flags::{OpenFlags, LOCAL, NONBLOCK, NORETURN};

// Typed read/write entry points, re-exported at crate root so callers reach them as
// `dispatch::read_u8`, `dispatch::write_string`, etc., without a submodule path.
pub use codec::{
    read_buffer, read_buffer_length, read_fd, read_full as read, read_i32, read_i64, read_string,
    read_type, read_u16, read_u32, read_u64, read_u8, write_buffer, write_buffer_length, write_fd,
    write_full as write, write_i32, write_i64, write_string, write_type, write_u16, write_u32,
    write_u64, write_u8,
};
