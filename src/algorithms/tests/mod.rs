// src/algorithms/tests/mod.rs






/// Common tests for all algorithms
#[cfg(test)]
mod common_tests {
    use std::time::Duration;

    use crate::algorithms::{
        ConcurrencyLimiter, FixedWindow, RateLimitAlgorithm, SlidingWindow, SlidingWindowCounter,
        TokenBucket,
    };
    use crate::config::{
        ConcurrencyConfig, FixedWindowConfig, SlidingWindowConfig, SlidingWindowCounterConfig,
        StrategyKind, TokenBucketConfig,
    };
    use crate::storage::MemoryStorage;
    use crate::test_utils::{memory_storage, test_clock, TEST_EPOCH_MS};

    /// Test consistent behavior across all algorithm implementations
    #[tokio::test]
    async fn test_algorithm_trait_consistency() {
        let storage: MemoryStorage = memory_storage(test_clock());

        // Equivalent parameters: five requests, nothing restored for a minute
        let tb_config = TokenBucketConfig {
            capacity: 5,
            refill_rate: 0.001,
            tokens_requested: 1,
        };
        let fw_config = FixedWindowConfig {
            limit: 5,
            window_size: Duration::from_secs(60),
        };
        let sw_config = SlidingWindowConfig {
            limit: 5,
            window_size: Duration::from_secs(60),
        };
        let swc_config = SlidingWindowCounterConfig {
            limit: 5,
            window_size: Duration::from_secs(60),
            sub_windows: 6,
        };
        let cc_config = ConcurrencyConfig {
            max_concurrent: 5,
            timeout: Duration::from_secs(60),
        };

        let algorithms: Vec<Box<dyn RateLimitAlgorithm + '_>> = vec![
            Box::new(TokenBucket::new(&storage, &tb_config, "test")),
            Box::new(FixedWindow::new(&storage, &fw_config, "test")),
            Box::new(SlidingWindow::new(&storage, &sw_config, "test")),
            Box::new(SlidingWindowCounter::new(&storage, &swc_config, "test")),
            Box::new(ConcurrencyLimiter::new(&storage, &cc_config, "test")),
        ];

        let kinds: Vec<StrategyKind> = algorithms.iter().map(|a| a.kind()).collect();
        assert_eq!(kinds, StrategyKind::ALL.to_vec());

        let now = TEST_EPOCH_MS;
        for algorithm in &algorithms {
            let name = algorithm.kind();

            // All should allow exactly 5 requests
            for i in 0..5 {
                let result = algorithm.check_and_record("shared", now).await.unwrap();
                assert!(result.allowed, "{}: Request {} should be allowed", name, i);
                assert_eq!(result.limit, 5, "{}: limit should be reported", name);
            }

            // All should deny further requests
            let result = algorithm.check_and_record("shared", now).await.unwrap();
            assert!(!result.allowed, "{}: 6th request should be denied", name);
            assert_eq!(result.remaining, 0, "{}: nothing should remain", name);
            assert!(
                result.reset_time > now,
                "{}: reset time should be in the future",
                name
            );

            // All should respect key isolation
            let other = algorithm.check_and_record("shared_other", now).await.unwrap();
            assert!(other.allowed, "{}: Different key should be allowed", name);

            // All should support reset
            assert!(algorithm.reset("shared", now).await.unwrap());
            let reset_result = algorithm.check_and_record("shared", now).await.unwrap();
            assert!(
                reset_result.allowed,
                "{}: Request after reset should be allowed",
                name
            );
            assert_eq!(reset_result.remaining, 4, "{}: fresh capacity after reset", name);
        }
    }

    /// Strategies write disjoint keys, so the same identifier under two
    /// strategies is counted independently
    #[tokio::test]
    async fn test_strategies_do_not_share_state() {
        let storage = memory_storage(test_clock());
        let fw_config = FixedWindowConfig {
            limit: 1,
            window_size: Duration::from_secs(60),
        };
        let sw_config = SlidingWindowConfig {
            limit: 1,
            window_size: Duration::from_secs(60),
        };
        let fixed = FixedWindow::new(&storage, &fw_config, "test");
        let sliding = SlidingWindow::new(&storage, &sw_config, "test");

        assert!(fixed.check_and_record("user", TEST_EPOCH_MS).await.unwrap().allowed);
        assert!(sliding.check_and_record("user", TEST_EPOCH_MS).await.unwrap().allowed);
        assert!(!fixed.check_and_record("user", TEST_EPOCH_MS).await.unwrap().allowed);
        assert!(!sliding.check_and_record("user", TEST_EPOCH_MS).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_of_unknown_identifier_is_a_no_op() {
        let storage = memory_storage(test_clock());
        let config = TokenBucketConfig {
            capacity: 3,
            refill_rate: 1.0,
            tokens_requested: 1,
        };
        let bucket = TokenBucket::new(&storage, &config, "test");

        assert!(!bucket.reset("never_seen", TEST_EPOCH_MS).await.unwrap());
        assert!(!bucket.reset("never_seen", TEST_EPOCH_MS).await.unwrap());
    }
}
