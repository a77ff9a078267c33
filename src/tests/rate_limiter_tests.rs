// src/tests/rate_limiter_tests.rs

#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;

    use crate::config::{StrategyConfig, StrategyKind};
    use crate::error::RateLimiterError;
    use crate::test_utils::{
        count_allowed, create_failing_rate_limiter, create_test_rate_limiter, TEST_EPOCH_MS,
    };
    use crate::FailurePolicy;

    fn every_strategy() -> Vec<StrategyConfig> {
        vec![
            StrategyConfig::token_bucket(3, 0.01),
            StrategyConfig::fixed_window(3, Duration::from_secs(60)),
            StrategyConfig::sliding_window(3, Duration::from_secs(60)),
            StrategyConfig::sliding_window_counter(3, Duration::from_secs(60), 6),
            StrategyConfig::concurrent(3, Duration::from_secs(60)),
        ]
    }

    // Ten at once, the eleventh denied, one more a second later
    #[tokio::test]
    async fn test_token_bucket_burst_and_refill() {
        let (limiter, clock) = create_test_rate_limiter();
        let config = StrategyConfig::token_bucket(10, 1.0);

        assert_eq!(count_allowed(&limiter, "burst", &config, 10).await, 10);
        let decision = limiter.check("burst", &config).await.unwrap();
        assert!(!decision.allowed, "11th request should be denied");

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            count_allowed(&limiter, "burst", &config, 3).await,
            1,
            "Exactly one token should have been refilled"
        );
    }

    #[tokio::test]
    async fn test_fixed_window_reset_at_boundary() {
        let (limiter, clock) = create_test_rate_limiter();
        let config = StrategyConfig::fixed_window(5, Duration::from_secs(60));

        assert_eq!(count_allowed(&limiter, "fixed", &config, 6).await, 5);

        clock.set(TEST_EPOCH_MS + 60_000);
        let decision = limiter.check("fixed", &config).await.unwrap();
        assert!(decision.allowed, "New window should allow requests");
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_sliding_window_exactness() {
        let (limiter, clock) = create_test_rate_limiter();
        let config = StrategyConfig::sliding_window(3, Duration::from_secs(10));

        for second in [0, 1, 2] {
            clock.set(TEST_EPOCH_MS + second * 1_000);
            assert!(limiter.check("log", &config).await.unwrap().allowed);
        }

        clock.set(TEST_EPOCH_MS + 3_000);
        assert!(!limiter.check("log", &config).await.unwrap().allowed);

        clock.set(TEST_EPOCH_MS + 11_000);
        assert!(limiter.check("log", &config).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_concurrency_release_through_engine() {
        let (limiter, _clock) = create_test_rate_limiter();
        let config = StrategyConfig::concurrent(2, Duration::from_secs(30));

        let a = limiter.check("jobs", &config).await.unwrap();
        let b = limiter.check("jobs", &config).await.unwrap();
        assert!(a.allowed && b.allowed);

        let c = limiter.check("jobs", &config).await.unwrap();
        assert!(!c.allowed, "Third concurrent request should be denied");

        let slot_a = a.request_id.unwrap();
        assert!(limiter.release("jobs", &slot_a).await.unwrap());
        assert!(!limiter.release("jobs", &slot_a).await.unwrap(), "Double release is a no-op");

        let d = limiter.check("jobs", &config).await.unwrap();
        assert!(d.allowed, "Released slot should be reusable");
    }

    /// A slot taken through a labelled tier is freed by the plain release
    /// call, given only the identifier and the returned request id
    #[tokio::test]
    async fn test_release_frees_tier_labelled_slot() {
        let (limiter, _clock) = create_test_rate_limiter();
        let config = StrategyConfig::concurrent(1, Duration::from_secs(60)).with_tier("uploads");

        let held = limiter.check("tiered_jobs", &config).await.unwrap();
        assert_eq!(held.tier.as_deref(), Some("uploads"));
        let slot = held.request_id.unwrap();
        assert!(slot.starts_with("uploads/"), "got: {slot}");
        assert!(!limiter.check("tiered_jobs", &config).await.unwrap().allowed);

        assert!(limiter.release("tiered_jobs", &slot).await.unwrap());
        assert!(!limiter.release("tiered_jobs", &slot).await.unwrap());
        assert!(limiter.check("tiered_jobs", &config).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_release_handles_tier_labels_with_separators() {
        let (limiter, _clock) = create_test_rate_limiter();
        let config = StrategyConfig::concurrent(1, Duration::from_secs(60)).with_tier("api/v2");
        let plain = StrategyConfig::concurrent(1, Duration::from_secs(60));

        let tiered = limiter.check("jobs", &config).await.unwrap().request_id.unwrap();
        let untiered = limiter.check("jobs", &plain).await.unwrap().request_id.unwrap();
        assert!(!untiered.contains('/'));

        assert!(limiter.release("jobs", &tiered).await.unwrap());
        assert!(limiter.release("jobs", &untiered).await.unwrap());
        assert!(limiter.check("jobs", &config).await.unwrap().allowed);
        assert!(limiter.check("jobs", &plain).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_malformed_request_ids_are_rejected() {
        let (limiter, _clock) = create_test_rate_limiter();

        for request_id in ["uploads/", "/0b6c3f2e", "/"] {
            let result = limiter.release("jobs", request_id).await;
            assert!(
                matches!(result, Err(RateLimiterError::Config(_))),
                "{request_id} should be rejected"
            );
        }
        assert!(!limiter.release("jobs", "unknown_tier/0b6c3f2e").await.unwrap());
    }

    /// N racing checks against a bucket of N-1 tokens grant exactly N-1
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_atomicity_under_contention() {
        let (limiter, _clock) = create_test_rate_limiter();
        let limiter = Arc::new(limiter);
        let tasks = 100;
        let config = StrategyConfig::token_bucket(tasks as u64 - 1, 1.0);
        let barrier = Arc::new(Barrier::new(tasks));

        let handles = (0..tasks).map(|_| {
            let limiter = Arc::clone(&limiter);
            let barrier = Arc::clone(&barrier);
            let config = config.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                limiter.check("contended", &config).await.unwrap().allowed
            })
        });

        let results: Vec<bool> = join_all(handles)
            .await
            .into_iter()
            .map(|result| result.unwrap())
            .collect();
        let allowed = results.iter().filter(|allowed| **allowed).count();
        assert_eq!(allowed, tasks - 1);
        assert_eq!(results.len() - allowed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_every_strategy_holds_its_cap_under_contention() {
        let (limiter, _clock) = create_test_rate_limiter();
        let limiter = Arc::new(limiter);

        for config in every_strategy() {
            let handles = (0..20).map(|_| {
                let limiter = Arc::clone(&limiter);
                let config = config.clone();
                tokio::spawn(async move { limiter.check("race", &config).await.unwrap().allowed })
            });
            let allowed = join_all(handles)
                .await
                .into_iter()
                .filter(|result| *result.as_ref().unwrap())
                .count();
            assert_eq!(allowed, 3, "{} granted more than its cap", config.kind());
        }
    }

    /// A reset identifier behaves exactly like one never seen before
    #[tokio::test]
    async fn test_reset_is_equivalent_to_fresh_identifier() {
        let (limiter, _clock) = create_test_rate_limiter();

        for config in every_strategy() {
            let name = config.kind();
            count_allowed(&limiter, "worn", &config, 5).await;

            assert!(limiter.reset("worn", &config).await.unwrap(), "{}: state existed", name);
            assert!(!limiter.reset("worn", &config).await.unwrap(), "{}: second reset is a no-op", name);

            let reset = limiter.check("worn", &config).await.unwrap();
            let fresh = limiter.check(&format!("fresh_{name}"), &config).await.unwrap();
            assert_eq!(reset.allowed, fresh.allowed, "{}", name);
            assert_eq!(reset.remaining, fresh.remaining, "{}", name);
            assert_eq!(reset.reset_time, fresh.reset_time, "{}", name);
            assert_eq!(reset.limit, fresh.limit, "{}", name);
        }
    }

    /// Parameters at the edge of the millisecond range still enforce the
    /// cap and report a reset time no earlier than now
    #[tokio::test]
    async fn test_extreme_parameters_still_enforce() {
        let (limiter, _clock) = create_test_rate_limiter();
        let longest = Duration::from_millis(u64::MAX);

        let configs = vec![
            StrategyConfig::token_bucket(3, 1e-18),
            StrategyConfig::fixed_window(3, longest),
            StrategyConfig::fixed_window(3, Duration::MAX),
            StrategyConfig::sliding_window(3, longest),
            StrategyConfig::sliding_window(3, Duration::MAX),
            StrategyConfig::sliding_window_counter(3, Duration::MAX, 6),
            StrategyConfig::concurrent(3, longest),
            StrategyConfig::concurrent(3, Duration::MAX),
        ];

        for (index, config) in configs.iter().enumerate() {
            let identifier = format!("edge_{index}");
            assert_eq!(
                count_allowed(&limiter, &identifier, config, 5).await,
                3,
                "{} #{index} should hold its cap",
                config.kind()
            );
            let denied = limiter.check(&identifier, config).await.unwrap();
            assert!(!denied.allowed);
            assert!(denied.error.is_none());
            assert!(denied.reset_time >= TEST_EPOCH_MS, "{} #{index}", config.kind());
        }

        let bucket = limiter.check("edge_0", &configs[0]).await.unwrap();
        assert_eq!(bucket.reset_time, u64::MAX, "Refill too slow to ever finish");
    }

    #[tokio::test]
    async fn test_decision_is_enriched() {
        let (limiter, _clock) = create_test_rate_limiter();
        let config = StrategyConfig::fixed_window(5, Duration::from_secs(60)).with_tier("minute");

        assert_eq!(limiter.config().key_prefix, "test");

        let decision = limiter.check("user:42", &config).await.unwrap();
        assert_eq!(decision.identifier, "user:42");
        assert_eq!(decision.strategy, StrategyKind::FixedWindow);
        assert_eq!(decision.timestamp, TEST_EPOCH_MS);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.tier.as_deref(), Some("minute"));
        assert_eq!(decision.reset_time, TEST_EPOCH_MS + 60_000);
        assert!(decision.request_id.is_none());
        assert!(decision.error.is_none());
        assert!(!decision.bypassed);
    }

    #[tokio::test]
    async fn test_retry_after_for_denied_requests() {
        let (limiter, clock) = create_test_rate_limiter();
        let config = StrategyConfig::fixed_window(1, Duration::from_secs(60));

        let first = limiter.check("retry", &config).await.unwrap();
        assert_eq!(first.retry_after(), Duration::ZERO, "Allowed requests never wait");

        clock.set(TEST_EPOCH_MS + 10_000);
        let denied = limiter.check("retry", &config).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after(), Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_decision_serializes_in_camel_case() {
        let (limiter, _clock) = create_test_rate_limiter();
        let config = StrategyConfig::concurrent(1, Duration::from_secs(5));

        let decision = limiter.check("serde", &config).await.unwrap();
        let value = serde_json::to_value(&decision).unwrap();

        assert_eq!(value["allowed"], true);
        assert_eq!(value["strategy"], "concurrent");
        assert_eq!(value["resetTime"], TEST_EPOCH_MS + 5_000);
        assert!(value["requestId"].is_string());
        assert!(value.get("error").is_none(), "Absent error is omitted");

        let back: crate::Decision = serde_json::from_value(value).unwrap();
        assert_eq!(back, decision);
    }

    #[tokio::test]
    async fn test_configuration_errors_fail_fast() {
        let (limiter, storage, _clock) = create_failing_rate_limiter(FailurePolicy::Open);

        let zero_limit = StrategyConfig::fixed_window(0, Duration::from_secs(60));
        let result = limiter.check("user", &zero_limit).await;
        assert!(matches!(result, Err(RateLimiterError::Config(_))));

        let valid = StrategyConfig::fixed_window(5, Duration::from_secs(60));
        let result = limiter.check("", &valid).await;
        assert!(matches!(result, Err(RateLimiterError::Config(_))));

        let result = limiter.check_multi_tier("user", &[valid.clone(), zero_limit.clone()]).await;
        assert!(matches!(result, Err(RateLimiterError::Config(_))));

        let result = limiter.check_multi_tier("user", &[]).await;
        assert!(matches!(result, Err(RateLimiterError::Config(_))));

        let result = limiter.reset("user", &zero_limit).await;
        assert!(matches!(result, Err(RateLimiterError::Config(_))));

        let result = limiter.release("user", "").await;
        assert!(matches!(result, Err(RateLimiterError::Config(_))));

        assert_eq!(storage.calls(), 0, "Nothing should reach the store");
    }

    #[test]
    fn test_unknown_strategy_is_a_configuration_error() {
        let result = StrategyConfig::from_json(r#"{"strategy":"leaky_bucket","limit":5}"#);
        assert!(matches!(result, Err(RateLimiterError::Config(_))));

        let result = StrategyConfig::from_json(r#"{"limit":5,"window_size":1000}"#);
        assert!(matches!(result, Err(RateLimiterError::Config(_))));

        let result = StrategyConfig::from_json(r#"{"strategy":"fixed_window","limit":5}"#);
        assert!(matches!(result, Err(RateLimiterError::Config(_))), "window_size is required");
    }

    #[tokio::test]
    async fn test_identifiers_are_isolated() {
        let (limiter, _clock) = create_test_rate_limiter();
        let config = StrategyConfig::sliding_window(2, Duration::from_secs(60));

        assert_eq!(count_allowed(&limiter, "alice", &config, 5).await, 2);
        assert_eq!(count_allowed(&limiter, "bob", &config, 5).await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_slot_expires_without_release() {
        let (limiter, clock) = create_test_rate_limiter();
        let config = StrategyConfig::concurrent(1, Duration::from_secs(2));

        assert!(limiter.check("crash", &config).await.unwrap().allowed);
        assert!(!limiter.check("crash", &config).await.unwrap().allowed);

        clock.advance(Duration::from_millis(2_001));
        assert!(limiter.check("crash", &config).await.unwrap().allowed);
    }
}
