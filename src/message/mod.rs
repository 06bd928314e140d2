//! The hub's JSON-over-GATT protocol.
//!
//! Every write to the command characteristic is exactly one UTF-8 JSON object, with no
//! length prefix or checksum. Responses are not returned by the write: they arrive later
//! as pushes on the notify characteristic, and those pushes are not tied to a request.

pub(crate) mod command;
pub(crate) mod notification;

pub use command::{register_reply, CloudToken, CommandEnvelope, DEFAULT_TIMEZONE, DEFAULT_TOKEN};
pub use notification::{decode, decode_all, NotificationEvent, Pack, Properties};
