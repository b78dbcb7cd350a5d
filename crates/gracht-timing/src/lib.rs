mod duration;
mod global_clock;
mod instant;
mod nanos;
mod repeater;

pub use duration::Duration;
pub use global_clock::{Clock, OurClockForNanos, global_clock, global_clock_not_mocked, init_global_with_mock};
pub use instant::Instant;
pub use nanos::Nanos;
pub use repeater::Repeater;
