// crates/kino-core/src/helpers/time.rs
//
// One monotonic time origin for the whole pipeline. Clock anchors, frame
// timers and callback timestamps must subtract against the same origin, so
// everything routes through now().

use std::sync::OnceLock;
use std::time::Instant;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Monotonic seconds since the first call in this process.
pub fn now() -> f64 {
    ORIGIN.get_or_init(Instant::now).elapsed().as_secs_f64()
}
