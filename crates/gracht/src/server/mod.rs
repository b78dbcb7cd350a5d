pub mod clientrec;
pub mod dispatch;
pub mod runtime;

pub use clientrec::{ALL_PROTOCOLS, ClientRecord, SubscriptionMask};
pub use dispatch::{DeferredMessage, Dispatcher, MessageBuffer};
pub use runtime::Server;
