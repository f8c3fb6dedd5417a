use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::Target;
use crate::protocol::{self, BoltVersion, Request, Response};
use crate::{tls, Driver, DriverConfig, DriverError, PoolStats};

const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

trait BoltStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BoltStream for T {}

struct Connection {
    stream: Box<dyn BoltStream>,
    version: BoltVersion,
    created_at: Instant,
}

impl Connection {
    async fn request(&mut self, request: Request<'_>) -> Result<(), DriverError> {
        protocol::write_message(&mut self.stream, &request.encode()).await?;
        let response = protocol::read_message(&mut self.stream).await?;
        Response::decode(&response)?.into_result()
    }

    async fn goodbye(mut self) -> Result<(), DriverError> {
        let farewell = async {
            protocol::write_message(&mut self.stream, &Request::Goodbye.encode()).await?;
            self.stream.shutdown().await?;
            Ok::<_, DriverError>(())
        };
        match tokio::time::timeout(GOODBYE_TIMEOUT, farewell).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(GOODBYE_TIMEOUT)),
        }
    }
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    closed: AtomicU64,
    failed_to_create: AtomicU64,
    acquiring: AtomicU64,
    acquired: AtomicU64,
    timed_out_to_acquire: AtomicU64,
    in_use: AtomicU64,
    total_acquisition_ms: AtomicU64,
    total_connection_ms: AtomicU64,
    total_in_use_ms: AtomicU64,
    total_in_use_count: AtomicU64,
}

fn add_millis(counter: &AtomicU64, elapsed: Duration) {
    counter.fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
}

/// Keeps the `acquiring` gauge raised for as long as a caller waits for a
/// permit, including when the waiting future is dropped.
struct Acquiring<'a> {
    counters: &'a Counters,
}

impl<'a> Acquiring<'a> {
    fn start(counters: &'a Counters) -> Self {
        counters.acquiring.fetch_add(1, Ordering::Relaxed);
        Self { counters }
    }
}

impl Drop for Acquiring<'_> {
    fn drop(&mut self) {
        self.counters.acquiring.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Records one attempt to open a pooled connection. An attempt dropped
/// before it finished counts as failed.
struct OpenAttempt<'a> {
    counters: &'a Counters,
    started: Instant,
    created: bool,
}

impl Drop for OpenAttempt<'_> {
    fn drop(&mut self) {
        add_millis(&self.counters.total_connection_ms, self.started.elapsed());
        let outcome = if self.created {
            &self.counters.created
        } else {
            &self.counters.failed_to_create
        };
        outcome.fetch_add(1, Ordering::Relaxed);
    }
}

struct PoolInner {
    config: DriverConfig,
    target: Target,
    tls: Option<TlsConnector>,
    idle: Mutex<VecDeque<Connection>>,
    permits: Arc<Semaphore>,
    counters: Counters,
    closed: AtomicBool,
}

impl PoolInner {
    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<Connection>> {
        match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Opens a connection without touching the pool counters.
    async fn open(&self) -> Result<Connection, DriverError> {
        let opening = async {
            let address = &self.target.address;
            let tcp = TcpStream::connect((address.host.as_str(), address.port))
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::ConnectionRefused => {
                        DriverError::ConnectionRefused(address.to_string())
                    }
                    _ => DriverError::from(e),
                })?;
            tcp.set_nodelay(true)?;

            // from here on every early return drops the socket
            let mut stream: Box<dyn BoltStream> = match &self.tls {
                Some(connector) => Box::new(tls::wrap(connector, &address.host, tcp).await?),
                None => Box::new(tcp),
            };
            let version = protocol::handshake(&mut stream).await?;
            let mut connection = Connection {
                stream,
                version,
                created_at: Instant::now(),
            };
            connection
                .request(Request::Hello {
                    user_agent: &self.config.user_agent,
                    auth: &self.config.auth,
                })
                .await?;
            Ok::<_, DriverError>(connection)
        };

        match tokio::time::timeout(self.config.connection_timeout, opening).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(self.config.connection_timeout)),
        }
    }

    async fn open_pooled(&self) -> Result<Connection, DriverError> {
        let mut attempt = OpenAttempt {
            counters: &self.counters,
            started: Instant::now(),
            created: false,
        };
        let connection = self.open().await?;
        attempt.created = true;
        Ok(connection)
    }

    fn is_expired(&self, connection: &Connection) -> bool {
        self.config
            .max_connection_lifetime
            .is_some_and(|lifetime| connection.created_at.elapsed() > lifetime)
    }

    fn discard(&self, connection: Connection) {
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        drop(connection);
    }

    fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            created: c.created.load(Ordering::Relaxed),
            closed: c.closed.load(Ordering::Relaxed),
            failed_to_create: c.failed_to_create.load(Ordering::Relaxed),
            acquiring: c.acquiring.load(Ordering::Relaxed),
            acquired: c.acquired.load(Ordering::Relaxed),
            timed_out_to_acquire: c.timed_out_to_acquire.load(Ordering::Relaxed),
            in_use: c.in_use.load(Ordering::Relaxed),
            idle: self.lock_idle().len() as u64,
            total_acquisition_time: Duration::from_millis(c.total_acquisition_ms.load(Ordering::Relaxed)),
            total_connection_time: Duration::from_millis(c.total_connection_ms.load(Ordering::Relaxed)),
            total_in_use_time: Duration::from_millis(c.total_in_use_ms.load(Ordering::Relaxed)),
            total_in_use_count: c.total_in_use_count.load(Ordering::Relaxed),
        }
    }
}

/// A connection checked out of the pool. Dropping it returns the connection
/// unless it was marked broken or the pool has been closed meanwhile.
struct Pooled {
    pool: Arc<PoolInner>,
    connection: Option<Connection>,
    broken: bool,
    checked_out_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl Pooled {
    /// Runs a request, leaving the connection marked broken unless it
    /// completes. A cancelled request therefore never goes back to the pool.
    async fn request(&mut self, request: Request<'_>) -> Result<(), DriverError> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(DriverError::Closed);
        };
        self.broken = true;
        let result = connection.request(request).await;
        self.broken = match &result {
            Ok(()) => false,
            Err(DriverError::ServerFailure { .. }) => false,
            Err(_) => true,
        };
        result
    }
}

impl Drop for Pooled {
    fn drop(&mut self) {
        let counters = &self.pool.counters;
        counters.in_use.fetch_sub(1, Ordering::Relaxed);
        counters.total_in_use_count.fetch_add(1, Ordering::Relaxed);
        add_millis(&counters.total_in_use_ms, self.checked_out_at.elapsed());

        if let Some(connection) = self.connection.take() {
            // close() flips `closed` under the same lock before draining
            let mut idle = self.pool.lock_idle();
            if self.broken || self.pool.closed.load(Ordering::SeqCst) {
                self.pool.discard(connection);
            } else {
                idle.push_back(connection);
            }
        }
    }
}

/// Connection pool speaking Bolt to a single server.
#[derive(Clone)]
pub struct BoltDriver {
    inner: Arc<PoolInner>,
}

impl BoltDriver {
    /// Validates the configuration, builds TLS state and opens one connection
    /// to prove the server is reachable and accepts the credentials. That
    /// connection is closed again before returning, so a fresh driver holds
    /// no open connections.
    pub async fn connect(config: DriverConfig) -> Result<BoltDriver, DriverError> {
        config.validate()?;
        let target = config.target()?;
        let tls = tls::connector(&target.tls, config.hostname_verification)?;

        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(config.max_pool_size as usize)),
            config,
            target,
            tls,
            idle: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        });

        let probe = inner.open().await?;
        debug!(
            address = %inner.target.address,
            bolt_version = %probe.version,
            "bolt server reachable"
        );
        if let Err(e) = probe.goodbye().await {
            debug!(error = %e, "failed to close probe connection cleanly");
        }

        Ok(BoltDriver { inner })
    }

    async fn acquire(&self) -> Result<Pooled, DriverError> {
        let pool = &self.inner;
        if pool.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }

        let started = Instant::now();
        let waiting = Acquiring::start(&pool.counters);
        let permit = tokio::time::timeout(
            pool.config.acquisition_timeout,
            pool.permits.clone().acquire_owned(),
        )
        .await;
        drop(waiting);

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            // the semaphore is only closed by close()
            Ok(Err(_)) => return Err(DriverError::Closed),
            Err(_) => {
                pool.counters
                    .timed_out_to_acquire
                    .fetch_add(1, Ordering::Relaxed);
                return Err(DriverError::Timeout(pool.config.acquisition_timeout));
            }
        };

        let reused = loop {
            let candidate = pool.lock_idle().pop_front();
            match candidate {
                Some(connection) if pool.is_expired(&connection) => pool.discard(connection),
                other => break other,
            }
        };

        let connection = match reused {
            Some(connection) => connection,
            None => pool.open_pooled().await?,
        };

        pool.counters.acquired.fetch_add(1, Ordering::Relaxed);
        pool.counters.in_use.fetch_add(1, Ordering::Relaxed);
        add_millis(&pool.counters.total_acquisition_ms, started.elapsed());

        Ok(Pooled {
            pool: self.inner.clone(),
            connection: Some(connection),
            broken: false,
            checked_out_at: Instant::now(),
            _permit: permit,
        })
    }
}

#[async_trait]
impl Driver for BoltDriver {
    async fn verify_connectivity(&self) -> Result<(), DriverError> {
        let mut connection = self.acquire().await?;
        connection.request(Request::Reset).await
    }

    fn pool_stats(&self) -> PoolStats {
        self.inner.stats()
    }

    async fn close(&self) -> Result<(), DriverError> {
        let pool = &self.inner;
        let idle: Vec<Connection> = {
            let mut idle = pool.lock_idle();
            if pool.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            idle.drain(..).collect()
        };
        pool.permits.close();

        let total = idle.len();
        let mut failed = 0;
        for connection in idle {
            pool.counters.closed.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = connection.goodbye().await {
                debug!(error = %e, "connection did not close cleanly");
                failed += 1;
            }
        }

        if failed > 0 {
            warn!(
                address = %pool.target.address,
                failed, total, "some pooled connections did not close cleanly"
            );
            return Err(DriverError::Io(Arc::new(std::io::Error::other(format!(
                "{failed} of {total} connections did not close cleanly"
            )))));
        }
        Ok(())
    }
}
