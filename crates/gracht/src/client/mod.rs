pub mod awaiter;
pub mod inflight;
pub mod runtime;

pub use awaiter::AwaitMode;
pub use inflight::MessageStatus;
pub use runtime::Client;
