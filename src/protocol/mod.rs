//! Gateway communication protocol.
//!
//! This module implements the line-oriented protocol spoken with the device bus
//! gateway: frame parsing, the binary sensor table carried by pushes, routing of
//! decoded messages to storage, and the supervisor that keeps the single gateway
//! connection alive.
//!
//! # Wire Format
//!
//! Every frame starts with an ASCII header line:
//!
//! ```text
//! header      := method SP command [ "?" params ] [ "&" recipient_id ] CRLF
//! method      := "PUSH" | "POST" | "GET"
//! ```
//!
//! `PUSH` and `POST` frames carry a body announced by a `Length=<n>` line, followed
//! by exactly `n` raw bytes and a closing CRLF. `GET` frames end after the header.
//!
//! ```text
//! PUSH res_table\r\nLength=12\r\n<12 bytes>\r\n
//! GET history?103&client42\r\n
//! ```
//!
//! # Key Components
//!
//! - [`Message`]: One parsed frame.
//! - [`FrameReader`]: Extracts messages from a buffered byte stream.
//! - [`ConnectionWriter`]: Write guard shared by everything that sends on the connection.
//! - [`table`]: Decoder for the binary sensor table.
//! - [`Dispatcher`]: Stores pushed readings and answers history requests.
//! - [`Supervisor`]: Connects, subscribes, serves, and reconnects.
//!
//! # Failure Handling
//!
//! Framing and I/O failures ([`ProtocolError`]) end the session, since frame
//! boundaries can no longer be trusted; the supervisor closes the socket and
//! reconnects after a fixed delay. Anything that goes wrong while handling a
//! well-formed frame is logged by the dispatcher and the frame is dropped.
//!
//! # See Also
//!
//! - [`storage`](crate::storage): The store pushed readings end up in.
mod dispatcher;
mod message;
mod supervisor;
pub mod table;
mod transport;

pub use dispatcher::{DispatchError, Dispatcher, Outcome, history_since};
pub use message::{HISTORY, Message, Method, RES_TABLE, Subscription};
pub use supervisor::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_RECONNECT_DELAY, SessionState, Supervisor, SupervisorConfig,
    SupervisorHandle, serve,
};
pub use table::{SensorId, TableError, Value};
pub use transport::{ConnectionWriter, DEFAULT_MAX_CONTENT_LENGTH, FrameReader, ProtocolError};
