//! The `protocol` module defines the JSON envelope exchanged with dashboard
//! clients: the message types, typed constructors, a fluent builder and the
//! codec. Nothing in here performs I/O.

pub mod builder;
pub mod codec;
pub mod message;
pub mod messages;


pub use builder::MessageBuilder;
pub use codec::{Validation, decode, deserialize, serialize, validate};
pub use message::{Channel, Message, MessageType, PROTOCOL_VERSION, Priority, generate_id};
pub use messages::ErrorCode;
