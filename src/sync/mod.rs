//! Cross-thread handoff between the simulator exchange loop and its helpers.
//!
//! - `mailbox`: single-slot connection prefetch (producer connects ahead, the
//!   exchange loop only ever takes ready connections)
//! - `gate`: binary semaphore pacing the control loop to simulator ticks

pub mod gate;
pub mod mailbox;

pub use gate::SimGate;
pub use mailbox::{MailboxConsumer, MailboxCounters, MailboxProducer, mailbox, spawn_prefetcher};
