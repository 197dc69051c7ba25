//! Worker dispatch: wire messages and the command publisher seam.

pub mod dispatcher;
pub mod protocol;

pub use dispatcher::{ChannelPublisher, CommandPublisher, Dispatcher};
pub use protocol::{
    command_subject, AckMessage, CancelMessage, CommandMessage, ResultMessage, ResultStatus,
    TriggerMessage, WireError,
};
