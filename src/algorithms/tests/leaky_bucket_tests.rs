#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::{
        algorithms::{leaky_bucket, LeakyBucket, RateLimitAlgorithm},
        clock::ManualClock,
        config::LeakyBucketConfig,
        keys::KeyCodec,
        storage::{MemoryStorage, StorageBackend},
        test_utils::create_test_storage,
    };

    fn create_leaky_bucket(
        capacity: u64,
        leak_interval_ms: u64,
    ) -> (LeakyBucket<MemoryStorage>, MemoryStorage, ManualClock) {
        let (storage, clock) = create_test_storage();
        let config = LeakyBucketConfig {
            leak_interval: Duration::from_millis(leak_interval_ms),
            capacity,
        };
        let algorithm =
            LeakyBucket::new(storage.clone(), config).with_clock(Arc::new(clock.clone()));
        (algorithm, storage, clock)
    }

    #[tokio::test]
    async fn test_leaky_bucket_fills_to_capacity() {
        let (algorithm, _, _) = create_leaky_bucket(3, 1_000);

        for i in 0..3 {
            let result = algorithm.check("fill").await.unwrap();
            assert!(result.allowed, "Request {} should be allowed", i);
            assert_eq!(result.remaining, 3 - i - 1);
            assert_eq!(result.limit, 3);
        }

        let result = algorithm.check("fill").await.unwrap();
        assert!(!result.allowed);
        // One unit over capacity drains in one interval
        assert_eq!(result.retry_after_ms, 1_000);
    }

    /// Partial drain shortens the wait; a full interval makes room again
    #[tokio::test]
    async fn test_leaky_bucket_drains_over_time() {
        let (algorithm, _, clock) = create_leaky_bucket(3, 1_000);

        for _ in 0..3 {
            algorithm.check("drain").await.unwrap();
        }

        clock.advance(Duration::from_millis(500));
        let result = algorithm.check("drain").await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.retry_after_ms, 500);
        assert!((algorithm.level("drain").await.unwrap() - 2.5).abs() < 1e-9);

        clock.advance(Duration::from_millis(500));
        let result = algorithm.check("drain").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    /// Level stays within [0, capacity] whatever the traffic
    #[tokio::test]
    async fn test_level_never_exceeds_capacity() {
        let (algorithm, _, clock) = create_leaky_bucket(4, 250);

        for step in 0..200u64 {
            algorithm.check("bounded").await.unwrap();
            let level = algorithm.level("bounded").await.unwrap();
            assert!(level <= 4.0, "level {} exceeded capacity", level);
            assert!(level >= 0.0);
            clock.advance(Duration::from_millis(step % 7 * 20));
        }
    }

    /// Without new requests the level falls monotonically to zero
    #[tokio::test]
    async fn test_level_decreases_toward_zero() {
        let (algorithm, _, clock) = create_leaky_bucket(5, 100);

        for _ in 0..5 {
            algorithm.check("idle").await.unwrap();
        }

        let mut previous = algorithm.level("idle").await.unwrap();
        assert!((previous - 5.0).abs() < 1e-9);
        for _ in 0..10 {
            clock.advance(Duration::from_millis(75));
            let level = algorithm.level("idle").await.unwrap();
            assert!(level <= previous);
            previous = level;
        }
        assert_eq!(previous, 0.0);
    }

    /// Denial leaves the stored level and timestamp untouched
    /// Fractional drain levels: the reported wait is the first instant that admits
    #[tokio::test]
    async fn test_retry_after_is_exact_with_fractional_levels() {
        for interval in [3, 7, 13, 33] {
            let (algorithm, _, clock) = create_leaky_bucket(4, interval);
            let id = format!("fraction_{}", interval);

            // Uneven gaps leave the stored level at awkward fractions
            for gap in [0, 1, 2, 1, 5, 1, 2, 3] {
                clock.advance(Duration::from_millis(gap));
                let _ = algorithm.check(&id).await.unwrap();
            }

            for _ in 0..5 {
                let denied = loop {
                    let result = algorithm.check(&id).await.unwrap();
                    if !result.allowed {
                        break result;
                    }
                };

                clock.advance(Duration::from_millis(denied.retry_after_ms - 1));
                assert!(
                    !algorithm.check(&id).await.unwrap().allowed,
                    "interval {}: admitted before retry_after {}",
                    interval,
                    denied.retry_after_ms
                );

                clock.advance(Duration::from_millis(1));
                assert!(
                    algorithm.check(&id).await.unwrap().allowed,
                    "interval {}: still denied after retry_after {}",
                    interval,
                    denied.retry_after_ms
                );
                clock.advance(Duration::from_millis(1));
            }
        }
    }

    #[tokio::test]
    async fn test_denial_does_not_mutate_state() {
        let (algorithm, storage, clock) = create_leaky_bucket(1, 1_000);
        let key = KeyCodec::default().key(leaky_bucket::NAME, "readonly");

        assert!(algorithm.check("readonly").await.unwrap().allowed);
        let before = storage.hash_get_all(&key).await.unwrap();

        clock.advance(Duration::from_millis(100));
        for _ in 0..3 {
            let result = algorithm.check("readonly").await.unwrap();
            assert!(!result.allowed);
            assert_eq!(result.retry_after_ms, 900);
        }
        assert_eq!(storage.hash_get_all(&key).await.unwrap(), before);
    }

    /// The key lives exactly as long as the bucket takes to drain
    #[tokio::test]
    async fn test_state_expires_once_drained() {
        let (algorithm, storage, clock) = create_leaky_bucket(3, 1_000);
        let key = KeyCodec::default().key(leaky_bucket::NAME, "ttl");

        algorithm.check("ttl").await.unwrap();
        algorithm.check("ttl").await.unwrap();

        clock.advance(Duration::from_millis(1_999));
        assert!(storage.exists(&key).await.unwrap());
        clock.advance(Duration::from_millis(1));
        assert!(!storage.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_empties_bucket() {
        let (algorithm, _, _) = create_leaky_bucket(1, 60_000);

        assert!(algorithm.check("reset_me").await.unwrap().allowed);
        assert!(!algorithm.check("reset_me").await.unwrap().allowed);

        algorithm.reset("reset_me").await.unwrap();
        assert_eq!(algorithm.level("reset_me").await.unwrap(), 0.0);
        assert!(algorithm.check("reset_me").await.unwrap().allowed);
    }
}
