pub mod message;
pub mod service;
pub mod watchdog;

pub use message::{ActionContext, CommandMessage, Direction, WireMessage};
pub use service::{CommandMessageService, WatchdogHandle};
pub use watchdog::{MessageProgressWatchdog, WatchdogRegistry};
