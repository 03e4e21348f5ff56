//! Cross-cutting services: scheduling, event fan-out, clock injection.

mod clock;
mod events;
mod scheduler;

pub use clock::{system_clock, Clock, ManualClock};
pub use events::EventBus;
pub use scheduler::Scheduler;
