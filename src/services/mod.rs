//! External collaborator services
//!
//! The engine consumes signing, broadcasting, wallet funding and time as
//! services held behind `Arc<dyn ..>`. In-memory implementations are
//! provided for tests and embedding.

pub mod broadcast;
pub mod clock;
pub mod funds;
pub mod signer;

pub use broadcast::{BroadcastHandle, Broadcaster, DepthNotification, MemoryBroadcaster};
pub use clock::{Clock, ManualClock, SystemClock};
pub use funds::{Funds, MemoryFunds};
pub use signer::{InMemorySigner, Signer};
