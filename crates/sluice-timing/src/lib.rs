mod clock;
mod nanos;

pub use clock::{CachedNanoClock, Clock, init_global_with_mock};
pub use nanos::Nanos;
