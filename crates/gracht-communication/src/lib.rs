pub mod arena;
pub mod error;
pub mod hashtable;
pub mod jobqueue;

pub use arena::{Allocation, Arena};
pub use error::{ArenaError, QueueError};
pub use hashtable::RobinHoodMap;
pub use jobqueue::JobQueue;
