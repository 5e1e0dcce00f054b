#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::{
        algorithms::{fixed_window, FixedWindow, RateLimitAlgorithm},
        clock::ManualClock,
        config::FixedWindowConfig,
        keys::KeyCodec,
        storage::{MemoryStorage, StorageBackend},
        test_utils::{create_test_storage, TEST_EPOCH_MS},
    };

    fn create_fixed_window(
        max_requests: u64,
        window_ms: u64,
    ) -> (FixedWindow<MemoryStorage>, MemoryStorage, ManualClock) {
        let (storage, clock) = create_test_storage();
        let config = FixedWindowConfig {
            window_size: Duration::from_millis(window_ms),
            max_requests,
        };
        let algorithm =
            FixedWindow::new(storage.clone(), config).with_clock(Arc::new(clock.clone()));
        (algorithm, storage, clock)
    }

    /// Test basic window counting and the denial once the window is full
    #[tokio::test]
    async fn test_fixed_window_basic_functionality() {
        let (algorithm, _, _) = create_fixed_window(5, 1_000);

        for i in 0..5 {
            let result = algorithm.check("basic_user").await.unwrap();
            assert!(result.allowed, "Request {} should be allowed", i);
            assert_eq!(result.remaining, 5 - i - 1);
            assert_eq!(result.limit, 5);
            assert_eq!(result.retry_after_ms, 0);
        }

        let result = algorithm.check("basic_user").await.unwrap();
        assert!(!result.allowed, "6th request should be denied");
        assert_eq!(result.remaining, 0);
        // TEST_EPOCH_MS sits on a window boundary
        assert_eq!(result.retry_after_ms, 1_000);
    }

    /// Retry-after is the time left in the current window
    #[tokio::test]
    async fn test_retry_after_counts_down_within_window() {
        let (algorithm, _, clock) = create_fixed_window(1, 1_000);

        assert!(algorithm.check("countdown").await.unwrap().allowed);

        clock.advance(Duration::from_millis(250));
        let result = algorithm.check("countdown").await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.retry_after_ms, 750);

        clock.advance(Duration::from_millis(749));
        let result = algorithm.check("countdown").await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.retry_after_ms, 1);

        // First millisecond of the next window
        clock.advance(Duration::from_millis(1));
        assert!(algorithm.check("countdown").await.unwrap().allowed);
    }

    /// The documented boundary burst: up to 2x max across a boundary, never more
    #[tokio::test]
    async fn test_boundary_burst_is_bounded_by_twice_max() {
        let (algorithm, _, clock) = create_fixed_window(3, 1_000);

        // Last millisecond of a window
        clock.set(TEST_EPOCH_MS + 999);
        let mut allowed = 0;
        for _ in 0..5 {
            if algorithm.check("burst").await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);

        // First milliseconds of the next window
        clock.advance(Duration::from_millis(2));
        for _ in 0..5 {
            if algorithm.check("burst").await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 6, "At most 2 * max across the boundary");
    }

    /// A denied check leaves the stored counter untouched
    #[tokio::test]
    async fn test_denial_does_not_mutate_state() {
        let (algorithm, storage, _) = create_fixed_window(2, 1_000);
        let key = KeyCodec::default().windowed_key(
            fixed_window::NAME,
            "idempotent",
            TEST_EPOCH_MS / 1_000,
        );

        algorithm.check("idempotent").await.unwrap();
        algorithm.check("idempotent").await.unwrap();
        assert_eq!(storage.get(&key).await.unwrap().as_deref(), Some("2"));

        for _ in 0..3 {
            let result = algorithm.check("idempotent").await.unwrap();
            assert!(!result.allowed);
            assert_eq!(result.retry_after_ms, 1_000);
        }
        assert_eq!(storage.get(&key).await.unwrap().as_deref(), Some("2"));
    }

    /// Each window's counter expires with the window
    #[tokio::test]
    async fn test_counter_expires_with_window() {
        let (algorithm, storage, clock) = create_fixed_window(5, 1_000);
        let key = KeyCodec::default().windowed_key(
            fixed_window::NAME,
            "expiring",
            TEST_EPOCH_MS / 1_000,
        );

        algorithm.check("expiring").await.unwrap();
        assert!(storage.exists(&key).await.unwrap());

        clock.advance(Duration::from_millis(1_000));
        assert!(!storage.exists(&key).await.unwrap());
    }

    /// Test separate limits for different identifiers and reset
    #[tokio::test]
    async fn test_key_isolation_and_reset() {
        let (algorithm, _, _) = create_fixed_window(2, 60_000);

        assert!(algorithm.check("user1").await.unwrap().allowed);
        assert!(algorithm.check("user1").await.unwrap().allowed);
        assert!(!algorithm.check("user1").await.unwrap().allowed);

        let other = algorithm.check("user2").await.unwrap();
        assert!(other.allowed, "Different user should be allowed");
        assert_eq!(other.remaining, 1);

        algorithm.reset("user1").await.unwrap();
        let result = algorithm.check("user1").await.unwrap();
        assert!(result.allowed, "Request after reset should be allowed");
        assert_eq!(result.remaining, 1);
    }

    #[tokio::test]
    async fn test_invalid_identifier_is_rejected() {
        let (algorithm, storage, _) = create_fixed_window(2, 1_000);

        assert!(algorithm.check("").await.is_err());
        assert!(algorithm.reset("  ").await.is_err());
        assert_eq!(storage.entry_count(), 0);
    }
}
