//! End-to-end rate-limiter behaviour: wait and error admission strategies,
//! sliding-window caps, and limiter wiring through the orchestrator.
//!
//! Run with: `cargo test --test e2e_limits`

use std::sync::Arc;
use std::time::{Duration, Instant};

use mindforge::{AcquireStrategy, LlmError, RateLimiterRegistry};

mod wait_strategy {
    use super::*;

    #[tokio::test]
    async fn test_back_to_back_calls_are_paced() {
        let registry = RateLimiterRegistry::new();
        registry.configure_bucket("paced", 1.0, 1).await;

        // burst 1 at 1 qps: three admissions need at least two seconds of
        // refill, and none of them errors.
        let start = Instant::now();
        for _ in 0..3 {
            registry
                .acquire("paced", AcquireStrategy::Wait, None)
                .await
                .unwrap();
        }
        assert!(
            start.elapsed() >= Duration::from_millis(1900),
            "calls were admitted too fast: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_long_run_admission_rate_bounded() {
        let registry = RateLimiterRegistry::new();
        registry.configure_bucket("rate", 10.0, 2).await;

        let start = Instant::now();
        let n = 12u32;
        for _ in 0..n {
            registry
                .acquire("rate", AcquireStrategy::Wait, None)
                .await
                .unwrap();
        }
        // 12 admissions with burst 2 at 10 qps need at least
        // (12 - 2) / 10 = 1 second of refill.
        assert!(
            start.elapsed() >= Duration::from_millis(950),
            "long-run admission rate exceeded qps: {:?}",
            start.elapsed()
        );
    }
}

mod error_strategy {
    use super::*;

    #[tokio::test]
    async fn test_exhausted_bucket_fails_fast() {
        let registry = RateLimiterRegistry::new();
        registry.configure_bucket("strict", 1.0, 1).await;

        // First call consumes the burst.
        registry
            .acquire("strict", AcquireStrategy::Error, None)
            .await
            .unwrap();

        // The next four fail immediately, well inside 50ms each.
        for _ in 0..4 {
            let start = Instant::now();
            let err = registry
                .acquire("strict", AcquireStrategy::Error, None)
                .await
                .unwrap_err();
            assert!(matches!(err, LlmError::RateLimited(_)));
            assert_eq!(err.status_code(), 429);
            assert!(start.elapsed() < Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn test_wait_with_timeout_fails_as_rate_limited() {
        let registry = RateLimiterRegistry::new();
        registry.configure_bucket("slow", 0.01, 1).await;
        registry
            .acquire("slow", AcquireStrategy::Wait, None)
            .await
            .unwrap();

        // Next token is ~100s away; a tight timeout converts the wait
        // into a rate-limit failure instead of hanging.
        let err = registry
            .acquire("slow", AcquireStrategy::Wait, Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RateLimited(_)));
    }
}

mod sliding_window {
    use super::*;

    #[tokio::test]
    async fn test_window_cap_holds_under_bursts() {
        let registry = RateLimiterRegistry::new();
        registry.configure_window("w", 4, 0.5).await;

        // Admissions within any 0.5s window never exceed 4.
        let mut admitted_in_first_window = 0;
        for _ in 0..10 {
            if registry
                .acquire("w", AcquireStrategy::Error, None)
                .await
                .is_ok()
            {
                admitted_in_first_window += 1;
            }
        }
        assert_eq!(admitted_in_first_window, 4);

        // After the window slides, capacity returns.
        tokio::time::sleep(Duration::from_millis(600)).await;
        registry
            .acquire("w", AcquireStrategy::Error, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_strategy_blocks_until_window_slides() {
        let registry = RateLimiterRegistry::new();
        registry.configure_window("wb", 2, 0.3).await;

        let start = Instant::now();
        for _ in 0..4 {
            registry
                .acquire("wb", AcquireStrategy::Wait, None)
                .await
                .unwrap();
        }
        // The third and fourth admissions each had to wait for the window.
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}

mod service_wiring {
    use super::*;
    use mindforge::{
        Config, EngineOverrides, MockProvider, Orchestrator, PrefixCache, RateLimitOverride,
    };

    const PASS: &str = r#"{"is_correct": true, "reasoning": "ok"}"#;

    fn config_with_rpm() -> Arc<Config> {
        let yaml = r#"
providers:
  mock-chat:
    base_url: https://chat.example.com
    api_key: sk-chat
models:
  limited:
    provider_id: mock-chat
    underlying_model: m-limited
    level: deepthink
    max_iterations: 3
    required_verifications: 1
    rpm: 120
"#;
        Arc::new(Config::from_yaml_str(yaml).unwrap())
    }

    #[tokio::test]
    async fn test_model_rpm_configures_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = Arc::new(RateLimiterRegistry::new());
        let svc = Orchestrator::with_limiter(
            config_with_rpm(),
            Arc::new(PrefixCache::open(dir.path()).unwrap()),
            limiter.clone(),
        );

        let mock = Arc::new(MockProvider::new().with_name("mock-chat"));
        mock.add_response("solution").await;
        mock.add_response(PASS).await;
        mock.add_response("summary").await;
        svc.registry().register("mock-chat", mock);

        svc.run_deepthink("limited", "p", &EngineOverrides::default())
            .await
            .unwrap();

        // rpm 120 → bucket under the default "{provider}:{model}" template.
        assert!(limiter.is_configured("mock:m-limited").await);
    }

    #[tokio::test]
    async fn test_request_override_beats_model_rpm() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = Arc::new(RateLimiterRegistry::new());
        let svc = Orchestrator::with_limiter(
            config_with_rpm(),
            Arc::new(PrefixCache::open(dir.path()).unwrap()),
            limiter.clone(),
        );

        let mock = Arc::new(MockProvider::new().with_name("mock-chat"));
        mock.add_response("solution").await;
        mock.add_response(PASS).await;
        mock.add_response("summary").await;
        svc.registry().register("mock-chat", mock);

        let overrides = EngineOverrides {
            rate_limit: Some(RateLimitOverride {
                qps: Some(100.0),
                burst: Some(10),
                bucket_key: Some("override-key".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        svc.run_deepthink("limited", "p", &overrides).await.unwrap();

        assert!(limiter.is_configured("override-key").await);
        // The default key was never touched.
        assert!(!limiter.is_configured("mock:m-limited").await);
    }
}
