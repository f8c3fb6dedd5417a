use std::time::{Duration, Instant};

use common_bolt::test_utils::{refused_uri, FakeBoltServer, FakeServerOptions};
use common_bolt::{AuthToken, BoltDriver, BoltVersion, Driver, DriverConfig, DriverError};

fn basic_auth() -> AuthToken {
    AuthToken::Basic {
        username: "neo4j".to_string(),
        password: "password".to_string(),
    }
}

async fn assert_or_retry<F>(check: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check())
}

#[tokio::test]
async fn test_connect_leaves_no_open_connections() {
    let server = FakeBoltServer::start(FakeServerOptions::default())
        .await
        .unwrap();

    let driver = BoltDriver::connect(DriverConfig::new(server.uri(), basic_auth()))
        .await
        .unwrap();

    assert_eq!(server.hellos(), 1);
    assert_eq!(driver.pool_stats().open(), 0);
    assert_eq!(driver.pool_stats().created, 0);
    assert_or_retry(|| server.goodbyes() == 1).await;
    assert_or_retry(|| server.open_connections() == 0).await;
}

#[tokio::test]
async fn test_verify_connectivity_reuses_pooled_connection() {
    let server = FakeBoltServer::start(FakeServerOptions::default())
        .await
        .unwrap();
    let driver = BoltDriver::connect(DriverConfig::new(server.uri(), basic_auth()))
        .await
        .unwrap();

    driver.verify_connectivity().await.unwrap();
    driver.verify_connectivity().await.unwrap();

    assert_eq!(server.resets(), 2);
    let stats = driver.pool_stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.acquired, 2);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.open(), 1);
    assert_eq!(stats.total_in_use_count, 2);
}

#[tokio::test]
async fn test_rejected_credentials() {
    let server = FakeBoltServer::start(FakeServerOptions {
        reject_auth: true,
        ..Default::default()
    })
    .await
    .unwrap();

    let result = BoltDriver::connect(DriverConfig::new(server.uri(), basic_auth())).await;

    match result {
        Err(DriverError::AuthRejected(message)) => assert!(message.contains("unauthorized")),
        Err(other) => panic!("expected auth rejection, got {other:?}"),
        Ok(_) => panic!("expected auth rejection"),
    }
}

#[tokio::test]
async fn test_nothing_listening() {
    let uri = refused_uri().await.unwrap();

    let result = BoltDriver::connect(DriverConfig::new(uri, basic_auth())).await;

    assert!(matches!(result, Err(DriverError::ConnectionRefused(_))));
}

#[tokio::test]
async fn test_slow_handshake_times_out() {
    let server = FakeBoltServer::start(FakeServerOptions {
        handshake_delay: Duration::from_secs(5),
        ..Default::default()
    })
    .await
    .unwrap();
    let mut config = DriverConfig::new(server.uri(), basic_auth());
    config.connection_timeout = Duration::from_millis(100);

    let result = BoltDriver::connect(config).await;

    assert!(matches!(result, Err(DriverError::Timeout(_))));
}

#[tokio::test]
async fn test_no_common_protocol_version() {
    let server = FakeBoltServer::start(FakeServerOptions {
        version: None,
        ..Default::default()
    })
    .await
    .unwrap();

    let result = BoltDriver::connect(DriverConfig::new(server.uri(), basic_auth())).await;

    assert!(matches!(result, Err(DriverError::Protocol(_))));
}

#[tokio::test]
async fn test_invalid_configuration_opens_no_socket() {
    let server = FakeBoltServer::start(FakeServerOptions::default())
        .await
        .unwrap();
    let mut config = DriverConfig::new(server.uri(), basic_auth());
    config.max_pool_size = 0;

    let result = BoltDriver::connect(config).await;

    assert!(matches!(result, Err(DriverError::InvalidConfiguration(_))));
    assert_eq!(server.accepted(), 0);
}

#[tokio::test]
async fn test_close_says_goodbye_to_idle_connections() {
    let server = FakeBoltServer::start(FakeServerOptions::default())
        .await
        .unwrap();
    let driver = BoltDriver::connect(DriverConfig::new(server.uri(), basic_auth()))
        .await
        .unwrap();
    driver.verify_connectivity().await.unwrap();

    driver.close().await.unwrap();

    let stats = driver.pool_stats();
    assert_eq!(stats.open(), 0);
    assert_eq!(stats.idle, 0);
    // one for the connect probe, one for the pooled connection
    assert_or_retry(|| server.goodbyes() == 2).await;
    assert!(matches!(
        driver.verify_connectivity().await,
        Err(DriverError::Closed)
    ));
    // closing twice is a no-op
    driver.close().await.unwrap();
}

#[tokio::test]
async fn test_server_going_away_fails_the_ping() {
    let server = FakeBoltServer::start(FakeServerOptions::default())
        .await
        .unwrap();
    let driver = BoltDriver::connect(DriverConfig::new(server.uri(), basic_auth()))
        .await
        .unwrap();
    driver.verify_connectivity().await.unwrap();

    server.stop();
    assert_or_retry(|| server.open_connections() == 0).await;

    assert!(driver.verify_connectivity().await.is_err());
    // the broken connection is not returned to the pool
    assert_eq!(driver.pool_stats().idle, 0);
}

#[tokio::test]
async fn test_acquisition_times_out_when_pool_is_exhausted() {
    let server = FakeBoltServer::start(FakeServerOptions {
        reset_delay: Duration::from_millis(500),
        ..Default::default()
    })
    .await
    .unwrap();
    let mut config = DriverConfig::new(server.uri(), basic_auth());
    config.max_pool_size = 1;
    config.acquisition_timeout = Duration::from_millis(50);
    let driver = BoltDriver::connect(config).await.unwrap();

    let busy = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.verify_connectivity().await })
    };
    assert_or_retry(|| driver.pool_stats().in_use == 1).await;

    let result = driver.verify_connectivity().await;

    assert!(matches!(result, Err(DriverError::Timeout(_))));
    assert_eq!(driver.pool_stats().timed_out_to_acquire, 1);
    busy.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_negotiated_version_is_accepted() {
    let server = FakeBoltServer::start(FakeServerOptions {
        version: Some(BoltVersion { major: 4, minor: 1 }),
        ..Default::default()
    })
    .await
    .unwrap();

    let driver = BoltDriver::connect(DriverConfig::new(server.uri(), basic_auth()))
        .await
        .unwrap();

    driver.verify_connectivity().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_acquire_lowers_the_acquiring_gauge() {
    let server = FakeBoltServer::start(FakeServerOptions {
        reset_delay: Duration::from_millis(400),
        ..Default::default()
    })
    .await
    .unwrap();
    let mut config = DriverConfig::new(server.uri(), basic_auth());
    config.max_pool_size = 1;
    let driver = BoltDriver::connect(config).await.unwrap();

    let busy = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.verify_connectivity().await })
    };
    assert_or_retry(|| driver.pool_stats().in_use == 1).await;

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), driver.verify_connectivity()).await;
    assert!(abandoned.is_err());
    busy.await.unwrap().unwrap();

    let stats = driver.pool_stats();
    assert_eq!(stats.acquiring, 0);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.acquired, 1);
}

#[tokio::test]
async fn test_abandoned_open_counts_as_failed() {
    let server = FakeBoltServer::start(FakeServerOptions {
        handshake_delay: Duration::from_millis(300),
        ..Default::default()
    })
    .await
    .unwrap();
    let driver = BoltDriver::connect(DriverConfig::new(server.uri(), basic_auth()))
        .await
        .unwrap();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), driver.verify_connectivity()).await;
    assert!(abandoned.is_err());

    let stats = driver.pool_stats();
    assert_eq!(stats.created, 0);
    assert_eq!(stats.failed_to_create, 1);
    assert_eq!(stats.acquiring, 0);
    assert_eq!(stats.open(), 0);
    assert!(stats.total_connection_time > Duration::ZERO);
}

#[tokio::test]
async fn test_connection_returned_after_close_is_discarded() {
    let server = FakeBoltServer::start(FakeServerOptions {
        reset_delay: Duration::from_millis(300),
        ..Default::default()
    })
    .await
    .unwrap();
    let driver = BoltDriver::connect(DriverConfig::new(server.uri(), basic_auth()))
        .await
        .unwrap();

    let busy = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.verify_connectivity().await })
    };
    assert_or_retry(|| driver.pool_stats().in_use == 1).await;

    driver.close().await.unwrap();
    busy.await.unwrap().unwrap();

    let stats = driver.pool_stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.closed, 1);
    assert_eq!(stats.open(), 0);
}
