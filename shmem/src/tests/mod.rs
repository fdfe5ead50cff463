use std::process;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::core::remove_segment;
use crate::semaphore::remove_semaphore;

mod torn_read_tests;

/// Sends library events to the test output. `RUST_LOG` picks the level,
/// `trace` by default so every event is formatted at least once.
pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A key no other test (or earlier run with the same pid) is using.
pub(crate) fn unique_key() -> u32 {
    init_tracing();
    static COUNTER: AtomicU32 = AtomicU32::new(1);
    let key = 0x4000_0000 | ((process::id() & 0x3fff) << 16) | (COUNTER.fetch_add(1, Ordering::SeqCst) & 0xffff);
    let _ = remove_segment(key);
    let _ = remove_semaphore(key);
    key
}

/// Removes the segment at the key when the test ends, pass or fail.
pub(crate) struct SegmentGuard(pub u32);

impl Drop for SegmentGuard {
    fn drop(&mut self) {
        let _ = remove_segment(self.0);
        let _ = remove_semaphore(self.0);
    }
}

#[test]
fn library_events_reach_the_test_subscriber() {
    init_tracing();
    init_tracing();
    // with no subscriber installed nothing is enabled
    assert!(tracing::enabled!(tracing::Level::ERROR));
}
