// src/storage/tests/mod.rs


// Common utilities for storage tests
pub(crate) mod common {
    use std::future::Future;
    use std::time::Duration;

    use crate::error::Result;
    use crate::storage::{Pipeline, PipelineValue, ReadOp, ScoreBound, Snapshot, StorageBackend};

    // Test basic storage operations that should work on any backend
    pub async fn test_basic_operations<S: StorageBackend>(storage: &S, prefix: &str) -> Result<()> {
        let key = format!("{}:basic", prefix);
        let counter_key = format!("{}:counter", prefix);

        storage.set(&key, "test_value", None).await?;
        assert_eq!(storage.get(&key).await?.as_deref(), Some("test_value"));

        // Initial increment creates the counter
        assert_eq!(storage.increment(&counter_key, 1).await?, 1);
        assert_eq!(storage.increment(&counter_key, 3).await?, 4);

        assert!(storage.exists(&key).await?);
        assert!(storage.exists(&counter_key).await?);
        assert!(!storage.exists(&format!("{}:missing", prefix)).await?);

        assert!(storage.delete(&key).await?);
        assert!(!storage.exists(&key).await?);
        assert!(!storage.delete(&key).await?);

        storage.delete(&counter_key).await?;
        Ok(())
    }

    // Replies come back one per operation, in order
    pub async fn test_pipeline_operations<S: StorageBackend>(
        storage: &S,
        prefix: &str,
    ) -> Result<()> {
        let first = format!("{}:pipe1", prefix);
        let counter = format!("{}:pipe_counter", prefix);

        let mut pipeline = Pipeline::new();
        pipeline
            .set(&first, "value1", None)
            .get(&first)
            .increment(&counter, 5)
            .expire(&first, Duration::from_secs(60))
            .exists(&counter);

        let replies = storage.execute_atomic(pipeline).await?;
        assert_eq!(replies.len(), 5);
        assert_eq!(replies[0], PipelineValue::Okay);
        assert_eq!(replies[1].clone().into_text().as_deref(), Some("value1"));
        assert_eq!(replies[2].as_int(), Some(5));
        assert_eq!(replies[3].as_int(), Some(1));
        assert_eq!(replies[4].as_int(), Some(1));

        assert_eq!(storage.get(&counter).await?.as_deref(), Some("5"));

        storage.delete(&first).await?;
        storage.delete(&counter).await?;
        Ok(())
    }

    pub async fn test_hash_operations<S: StorageBackend>(storage: &S, prefix: &str) -> Result<()> {
        let key = format!("{}:hash", prefix);

        storage.hash_set(&key, "level", "2.5", None).await?;
        storage
            .hash_set(&key, "updated_at", "1000", Some(Duration::from_secs(60)))
            .await?;
        assert_eq!(storage.hash_get(&key, "level").await?.as_deref(), Some("2.5"));
        assert_eq!(storage.hash_get(&key, "missing").await?, None);

        let mut pipeline = Pipeline::new();
        pipeline
            .hash_increment(&key, "hits", 2)
            .hash_increment(&key, "hits", 3)
            .hash_delete(&key, vec!["level".to_string(), "nope".to_string()]);
        let replies = storage.execute_atomic(pipeline).await?;
        assert_eq!(replies[1].as_int(), Some(5));
        assert_eq!(replies[2].as_int(), Some(1));

        let all = storage.hash_get_all(&key).await?;
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("hits").map(String::as_str), Some("5"));
        assert_eq!(all.get("updated_at").map(String::as_str), Some("1000"));

        storage.delete(&key).await?;
        assert!(storage.hash_get_all(&key).await?.is_empty());
        Ok(())
    }

    pub async fn test_sorted_set_operations<S: StorageBackend>(
        storage: &S,
        prefix: &str,
    ) -> Result<()> {
        let key = format!("{}:zset", prefix);

        for (member, score) in [("a", 100.0), ("b", 200.0), ("c", 300.0), ("d", 400.0)] {
            assert!(storage.sorted_set_add(&key, member, score, None).await?);
        }
        // Re-adding a member only moves it
        assert!(
            !storage
                .sorted_set_add(&key, "d", 450.0, Some(Duration::from_secs(60)))
                .await?
        );
        assert_eq!(storage.sorted_set_card(&key).await?, 4);

        let live = storage
            .snapshot(
                &key,
                ReadOp::SortedSetRange {
                    min: ScoreBound::Exclusive(200.0),
                },
            )
            .await?;
        assert_eq!(
            live,
            Snapshot::SortedSet(vec![("c".to_string(), 300.0), ("d".to_string(), 450.0)])
        );

        let removed = storage
            .sorted_set_remove_by_score(&key, ScoreBound::NegInfinity, ScoreBound::Inclusive(200.0))
            .await?;
        assert_eq!(removed, 2);
        assert_eq!(storage.sorted_set_card(&key).await?, 2);

        storage.delete(&key).await?;
        Ok(())
    }

    // The counter and its TTL land together; `elapse` moves the backend's time forward
    pub async fn test_increment_and_expire<S, E, Fut>(
        storage: &S,
        prefix: &str,
        elapse: E,
    ) -> Result<()>
    where
        S: StorageBackend,
        E: Fn(Duration) -> Fut,
        Fut: Future<Output = ()>,
    {
        let key = format!("{}:incr_expire", prefix);
        let ttl = Duration::from_millis(200);

        assert_eq!(storage.increment_and_expire(&key, 1, ttl).await?, 1);
        assert_eq!(storage.increment_and_expire(&key, 2, ttl).await?, 3);
        assert_eq!(storage.get(&key).await?.as_deref(), Some("3"));

        elapse(Duration::from_millis(100)).await;
        assert!(storage.exists(&key).await?, "key expired before its TTL");

        elapse(Duration::from_millis(250)).await;
        assert!(!storage.exists(&key).await?, "key outlived its TTL");

        // An expired counter starts over
        assert_eq!(storage.increment_and_expire(&key, 5, ttl).await?, 5);

        storage.delete(&key).await?;
        Ok(())
    }

    // A transaction commits its writes, and an empty write set commits nothing
    pub async fn test_transaction<S: StorageBackend>(storage: &S, prefix: &str) -> Result<()> {
        let key = format!("{}:txn", prefix);

        let seen = storage
            .transaction(&key, ReadOp::Counter, |snapshot| {
                let current = snapshot.into_counter()?;
                let mut writes = Pipeline::new();
                writes.set(&key, "7", Some(Duration::from_secs(60)));
                Ok((current, writes))
            })
            .await?;
        assert_eq!(seen, None);
        assert_eq!(storage.get(&key).await?.as_deref(), Some("7"));

        let seen = storage
            .transaction(&key, ReadOp::Counter, |snapshot| {
                Ok((snapshot.into_counter()?, Pipeline::new()))
            })
            .await?;
        assert_eq!(seen, Some(7));
        assert_eq!(storage.get(&key).await?.as_deref(), Some("7"));

        // A failing decision leaves the store untouched
        let result: Result<()> = storage
            .transaction(&key, ReadOp::Counter, |_| {
                Err(crate::error::RateLimiterError::Internal("boom".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(storage.get(&key).await?.as_deref(), Some("7"));

        storage.delete(&key).await?;
        Ok(())
    }
}
