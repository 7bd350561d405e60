pub mod logging;
pub mod timer;
pub mod util;

pub use logging::{init_tracing, LogGuard};
pub use timer::CancellableTimer;
pub use util::defer::Defer;
pub use util::timeout::{duration_ms, with_timeout};
