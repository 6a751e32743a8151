//! Epoch clock pinned to the tokio timer.
//!
//! Engines compare schedule anchors against epoch seconds. Reading
//! [`std::time::SystemTime`] directly would detach those comparisons from
//! tokio's virtual clock, so the wall clock is anchored once and advanced by
//! timer elapsed time. Under a paused test runtime the epoch then follows
//! `tokio::time::advance`.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

struct Anchor {
    unix_nanos: i64,
    at: Instant,
}

static ANCHOR: OnceLock<Anchor> = OnceLock::new();

fn anchor() -> &'static Anchor {
    ANCHOR.get_or_init(|| Anchor {
        unix_nanos: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0),
        at: Instant::now(),
    })
}

/// Current epoch time in whole seconds.
pub(crate) fn unix_now() -> i64 {
    unix_nanos() / 1_000_000_000
}

/// Current epoch time in nanoseconds.
pub(crate) fn unix_nanos() -> i64 {
    let a = anchor();
    a.unix_nanos + Instant::now().saturating_duration_since(a.at).as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn epoch_follows_virtual_time() {
        let before = unix_now();
        tokio::time::advance(std::time::Duration::from_secs(42)).await;
        let after = unix_now();
        assert!(after - before >= 42, "before={before} after={after}");
    }

    #[tokio::test(start_paused = true)]
    async fn nanos_are_monotonic() {
        let a = unix_nanos();
        let b = unix_nanos();
        assert!(b >= a);
    }
}
