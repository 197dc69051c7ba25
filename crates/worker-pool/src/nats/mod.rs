//! NATS transport for the worker side of the dispatch protocol.

mod reporter;
mod subscriber;

pub use reporter::{NatsReporter, Reporter};
pub use subscriber::{command_filter, decode_command, listen_for_cancels, CommandSource};
