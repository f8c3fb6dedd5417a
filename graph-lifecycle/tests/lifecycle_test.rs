use std::sync::Arc;
use std::time::Duration;

use common_bolt::mock::MockDriver;
use common_bolt::test_utils::{FakeBoltServer, FakeServerOptions};
use common_bolt::AuthToken;
use tokio::sync::Barrier;

use graph_lifecycle::test_utils::MockClientFactory;
use graph_lifecycle::{
    BoltClientFactory, ConnectionConfig, DisposalOutcome, HealthProbe, HealthStatus, InitError,
    LifecycleRegistry, LifecycleState, MetricsBridge, ShutdownHooks,
};

const CALLERS: usize = 8;

async fn assert_or_retry<F>(check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check())
}

fn config() -> ConnectionConfig {
    ConnectionConfig::new("bolt://localhost:7687")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_register_constructs_once() {
    let factory = MockClientFactory::new().delay(Duration::from_millis(200));
    let registry = LifecycleRegistry::new(Arc::new(factory.clone()));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let callers: Vec<_> = (0..CALLERS)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                registry.register("default", config()).await
            })
        })
        .collect();

    let mut handles = Vec::new();
    for caller in callers {
        handles.push(caller.await.unwrap().unwrap().handle().clone());
    }

    assert_eq!(factory.constructions(), 1);
    assert!(handles.iter().all(|h| h.same_client(&handles[0])));
    assert!(registry.get("default").unwrap().same_client(&handles[0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_register_shares_the_error_then_allows_retry() {
    let refused = InitError::ConnectionRefused("localhost:7687".to_string());
    let factory = MockClientFactory::new()
        .delay(Duration::from_millis(200))
        .fail_next(refused.clone());
    let registry = LifecycleRegistry::new(Arc::new(factory.clone()));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let callers: Vec<_> = (0..CALLERS)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                registry.register("default", config()).await
            })
        })
        .collect();

    for caller in callers {
        assert_eq!(caller.await.unwrap().unwrap_err(), refused);
    }
    assert_eq!(factory.constructions(), 1);
    assert_eq!(registry.state("default"), LifecycleState::Uninitialized);

    let _token = registry.register("default", config()).await.unwrap();
    assert_eq!(factory.constructions(), 2);
    assert_eq!(registry.state("default"), LifecycleState::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispose_closes_once() {
    let driver = MockDriver::new().close_delay(Duration::from_millis(50));
    let factory = MockClientFactory::new().with_driver(driver.clone());
    let registry = LifecycleRegistry::new(Arc::new(factory));
    let _token = registry.register("default", config()).await.unwrap();
    let barrier = Arc::new(Barrier::new(CALLERS));

    let callers: Vec<_> = (0..CALLERS)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                registry.dispose("default").await
            })
        })
        .collect();

    let mut closed = 0;
    for caller in callers {
        match caller.await.unwrap() {
            DisposalOutcome::Closed => closed += 1,
            DisposalOutcome::AlreadyDisposed => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(closed, 1);
    assert_eq!(driver.close_calls(), 1);
    assert_eq!(registry.state("default"), LifecycleState::Disposed);
}

#[tokio::test]
async fn test_dispose_waits_for_inflight_registration() {
    let driver = MockDriver::new();
    let factory = MockClientFactory::new()
        .with_driver(driver.clone())
        .delay(Duration::from_millis(200));
    let registry = LifecycleRegistry::new(Arc::new(factory.clone()));

    let registering = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.register("default", config()).await })
    };
    factory.wait_for_constructions(1).await;
    assert_eq!(registry.state("default"), LifecycleState::Initializing);

    let outcome = registry.dispose("default").await;

    assert!(matches!(outcome, DisposalOutcome::Closed));
    assert!(registering.await.unwrap().is_ok());
    assert_eq!(driver.close_calls(), 1);
    assert_eq!(registry.state("default"), LifecycleState::Disposed);
}

#[tokio::test]
async fn test_invalid_config_leaves_slot_retryable() {
    let factory = MockClientFactory::new();
    let registry = LifecycleRegistry::new(Arc::new(factory.clone()));

    for invalid in [ConnectionConfig::new(""), {
        let mut config = config();
        config.max_pool_size = 0;
        config
    }] {
        let err = registry.register("default", invalid).await.unwrap_err();
        assert!(matches!(err, InitError::InvalidConfig(_)));
        assert!(!err.is_retryable());
        assert_eq!(registry.state("default"), LifecycleState::Uninitialized);
        assert!(registry.get("default").is_none());
    }
    assert_eq!(factory.constructions(), 0);

    let _token = registry.register("default", config()).await.unwrap();
    assert!(registry.get("default").is_some());
}

#[tokio::test]
async fn test_empty_endpoint_opens_no_socket() {
    let server = FakeBoltServer::start(FakeServerOptions::default())
        .await
        .unwrap();
    let registry = LifecycleRegistry::new(Arc::new(BoltClientFactory));

    let err = registry
        .register("default", ConnectionConfig::new(""))
        .await
        .unwrap_err();

    assert!(matches!(err, InitError::InvalidConfig(_)));
    assert!(registry.get("default").is_none());
    assert_eq!(server.accepted(), 0);
}

#[tokio::test]
async fn test_metrics_start_at_zero_open_connections() {
    let registry = LifecycleRegistry::new(Arc::new(MockClientFactory::new()));
    let mut config = config();
    config.max_pool_size = 10;
    config.metrics_enabled = true;

    let _token = registry.register("default", config).await.unwrap();
    let source = MetricsBridge::new(registry.clone()).attach("default").unwrap();

    assert_eq!(source.readings().unwrap().open_connections, 0);
}

#[tokio::test]
async fn test_full_lifecycle_against_bolt_server() {
    let server = FakeBoltServer::start(FakeServerOptions::default())
        .await
        .unwrap();
    let registry = LifecycleRegistry::new(Arc::new(BoltClientFactory));
    let probe = HealthProbe::new(registry.clone());
    let bridge = MetricsBridge::new(registry.clone());
    let hooks = ShutdownHooks::new();

    let mut config = ConnectionConfig::new(server.uri());
    config.auth = AuthToken::Basic {
        username: "neo4j".to_string(),
        password: "password".to_string(),
    };
    config.max_pool_size = 10;
    config.metrics_enabled = true;

    registry
        .register_with_shutdown("default", config.clone(), &hooks)
        .await
        .unwrap();
    // a second registration hands back the same client without another callback
    registry
        .register_with_shutdown("default", config, &hooks)
        .await
        .unwrap();
    assert_eq!(hooks.pending(), 1);

    let source = bridge.attach("default").unwrap();
    assert_eq!(source.readings().unwrap().open_connections, 0);

    assert_eq!(probe.check("default").await, HealthStatus::Up);
    assert_eq!(server.resets(), 1);
    assert_eq!(source.readings().unwrap().open_connections, 1);
    assert_eq!(source.readings().unwrap().idle_connections, 1);

    hooks.run().await;
    hooks.run().await;

    assert_eq!(registry.state("default"), LifecycleState::Disposed);
    assert!(registry.get("default").is_none());
    assert_eq!(probe.check("default").await, HealthStatus::Unknown);
    assert!(source.readings().is_none());
    // connect probe plus the pooled connection
    assert_or_retry(|| server.goodbyes() == 2).await;
}

#[tokio::test]
async fn test_unreachable_server_reports_down() {
    let server = FakeBoltServer::start(FakeServerOptions::default())
        .await
        .unwrap();
    let registry = LifecycleRegistry::new(Arc::new(BoltClientFactory));
    let probe = HealthProbe::new(registry.clone());
    let mut config = ConnectionConfig::new(server.uri());
    config.connection_timeout = Duration::from_millis(200);
    config.health_timeout = Duration::from_millis(500);
    let _token = registry.register("default", config).await.unwrap();
    assert_eq!(probe.check("default").await, HealthStatus::Up);

    server.stop();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut status = probe.check("default").await;
    while status == HealthStatus::Up && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = probe.check("default").await;
    }
    assert!(matches!(status, HealthStatus::Down(_)));
    // probing never changes the lifecycle
    assert_eq!(registry.state("default"), LifecycleState::Ready);
}
