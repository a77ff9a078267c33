// src/storage/tests/mod.rs


// Common utilities for storage tests
pub(crate) mod common {
    use std::time::Duration;

    use crate::error::Result;
    use crate::storage::{MemberAdmission, StorageBackend, TokenRequest};

    const LONG_TTL: Duration = Duration::from_secs(600);

    // Test basic storage operations that should work on any backend
    pub async fn test_basic_operations<S: StorageBackend>(storage: &S, ns: &str) -> Result<()> {
        let key = format!("{ns}:basic");
        let value: &[u8] = b"test_value";

        storage.set(&key, value, None).await?;
        assert_eq!(storage.get(&key).await?.as_deref(), Some(value));

        // Overwrite keeps a single key
        storage.set(&key, b"second", Some(LONG_TTL)).await?;
        assert_eq!(storage.get(&key).await?.as_deref(), Some(&b"second"[..]));

        assert!(storage.exists(&key).await?);
        assert!(!storage.exists(&format!("{ns}:missing")).await?);
        assert_eq!(storage.get(&format!("{ns}:missing")).await?, None);

        assert!(storage.delete(&key).await?);
        assert!(!storage.delete(&key).await?, "Second delete should report nothing removed");
        assert!(!storage.exists(&key).await?);

        let keys: Vec<String> = (0..3).map(|i| format!("{ns}:many:{i}")).collect();
        storage.set(&keys[0], b"a", None).await?;
        storage.set(&keys[2], b"c", None).await?;
        assert_eq!(storage.delete_many(&keys).await?, 2);
        assert_eq!(storage.delete_many(&keys).await?, 0);

        storage.ping().await?;
        Ok(())
    }

    // Conditional increments stop at the limit and report the count
    pub async fn test_counter_operations<S: StorageBackend>(storage: &S, ns: &str) -> Result<()> {
        let key = format!("{ns}:counter");
        for expected in 1..=3 {
            let outcome = storage.increment_below(&key, 3, LONG_TTL).await?;
            assert!(outcome.allowed);
            assert_eq!(outcome.count, expected);
        }
        let outcome = storage.increment_below(&key, 3, LONG_TTL).await?;
        assert!(!outcome.allowed, "Counter at its limit should refuse");
        assert_eq!(outcome.count, 3);

        // Counters read back as decimal text
        assert_eq!(storage.get(&key).await?.as_deref(), Some(&b"3"[..]));

        let window: Vec<String> = (0..3).map(|i| format!("{ns}:bucket:{i}")).collect();
        for _ in 0..2 {
            assert!(storage.increment_below(&window[0], 100, LONG_TTL).await?.allowed);
        }
        let outcome = storage.increment_window(&window, 4, LONG_TTL).await?;
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 3, "Sum should cover every bucket");
        let outcome = storage.increment_window(&window, 4, LONG_TTL).await?;
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 4);
        let outcome = storage.increment_window(&window, 4, LONG_TTL).await?;
        assert!(!outcome.allowed);
        assert_eq!(outcome.count, 4);

        // Only the newest bucket was incremented
        assert_eq!(storage.get(&window[2]).await?.as_deref(), Some(&b"2"[..]));
        assert!(!storage.exists(&window[1]).await?);

        storage.delete(&key).await?;
        storage.delete_many(&window).await?;
        Ok(())
    }

    // Token buckets start full, refill by elapsed time and never overflow
    pub async fn test_token_operations<S: StorageBackend>(storage: &S, ns: &str) -> Result<()> {
        let key = format!("{ns}:bucket");
        let start = 1_700_000_000_000;
        let request = |now_ms| TokenRequest {
            capacity: 2.0,
            refill_rate: 1.0,
            requested: 1.0,
            now_ms,
            ttl: LONG_TTL,
        };

        let first = storage.take_tokens(&key, &request(start)).await?;
        assert!(first.allowed);
        assert!((first.tokens - 1.0).abs() < 1e-9);

        let second = storage.take_tokens(&key, &request(start)).await?;
        assert!(second.allowed);
        assert!(second.tokens.abs() < 1e-9);

        let third = storage.take_tokens(&key, &request(start)).await?;
        assert!(!third.allowed);

        let refilled = storage.take_tokens(&key, &request(start + 1_500)).await?;
        assert!(refilled.allowed);
        assert!((refilled.tokens - 0.5).abs() < 1e-9);

        let capped = storage.take_tokens(&key, &request(start + 60_000)).await?;
        assert!(capped.allowed);
        assert!((capped.tokens - 1.0).abs() < 1e-9, "Refill must stop at capacity");

        storage.delete(&key).await?;
        Ok(())
    }

    // Ordered sets prune by score, admit below the limit and remove members
    pub async fn test_member_operations<S: StorageBackend>(storage: &S, ns: &str) -> Result<()> {
        let key = format!("{ns}:members");
        let admit = |member: &str, score_ms, min_score_ms| MemberAdmission {
            member: member.to_string(),
            score_ms,
            min_score_ms,
            limit: 2,
            ttl: LONG_TTL,
        };

        let outcome = storage.admit_member(&key, &admit("a", 100, 0)).await?;
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 1);
        let outcome = storage.admit_member(&key, &admit("b", 200, 0)).await?;
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 2);
        let outcome = storage.admit_member(&key, &admit("c", 300, 0)).await?;
        assert!(!outcome.allowed, "Set at its limit should refuse");
        assert_eq!(outcome.count, 2);

        // "a" scored 100 is below the cutoff; "b" at exactly 200 stays
        let outcome = storage.admit_member(&key, &admit("d", 400, 200)).await?;
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 2);

        assert!(storage.remove_member(&key, "b").await?);
        assert!(!storage.remove_member(&key, "b").await?);
        assert!(!storage.remove_member(&key, "a").await?, "Pruned member is gone");
        assert!(!storage.remove_member(&format!("{ns}:no_set"), "x").await?);

        storage.delete(&key).await?;
        Ok(())
    }
}
