//! Concurrency core: counter, channel, scheduler tree, and gate.

pub mod channel;
pub mod counter;
pub mod gate;
pub mod scheduler;

pub use channel::{Channel, ChannelAborted};
pub use counter::Counter;
pub use gate::{Acquired, Gate, GateError, QueueHandle, QueuedToken, Token, TokenStatus};
pub use scheduler::{AbortReason, Aborted, Scheduler, TaskError};
