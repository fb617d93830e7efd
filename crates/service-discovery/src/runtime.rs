//! Runtime-selected timer
//!
//! The crate never spawns tasks itself; background loops are handed back as
//! futures. The reconnect grace period is the only place a timer is needed,
//! and the implementation is picked by the enabled runtime feature.

use std::time::Duration;

/// Sleep for `duration` on the enabled runtime
pub(crate) async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }

    #[cfg(feature = "smol")]
    {
        smol::Timer::after(duration).await;
    }

    #[cfg(all(feature = "tokio", not(feature = "smol")))]
    {
        tokio::time::sleep(duration).await;
    }

    #[cfg(not(any(feature = "smol", feature = "tokio")))]
    {
        compile_error!("One of the runtime features must be enabled: smol or tokio");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn test_sleep_waits() {
        let start = std::time::Instant::now();
        sleep(Duration::from_millis(30)).await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
