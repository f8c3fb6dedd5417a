//! In-process Bolt server for tests. It speaks just enough of the protocol for
//! a driver to connect, authenticate, ping and say goodbye.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{self, Request, Response, MAGIC};
use crate::{BoltVersion, DriverError};

#[derive(Debug, Clone)]
pub struct FakeServerOptions {
    /// Version answered to the handshake, `None` refuses every proposal.
    pub version: Option<BoltVersion>,
    pub handshake_delay: Duration,
    pub reset_delay: Duration,
    pub reject_auth: bool,
}

impl Default for FakeServerOptions {
    fn default() -> Self {
        Self {
            version: Some(BoltVersion { major: 4, minor: 4 }),
            handshake_delay: Duration::ZERO,
            reset_delay: Duration::ZERO,
            reject_auth: false,
        }
    }
}

#[derive(Default)]
struct ServerCounters {
    accepted: AtomicU64,
    finished: AtomicU64,
    hellos: AtomicU64,
    resets: AtomicU64,
    goodbyes: AtomicU64,
}

pub struct FakeBoltServer {
    addr: SocketAddr,
    counters: Arc<ServerCounters>,
    reject_auth: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl FakeBoltServer {
    pub async fn start(options: FakeServerOptions) -> std::io::Result<FakeBoltServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let counters = Arc::new(ServerCounters::default());
        let reject_auth = Arc::new(AtomicBool::new(options.reject_auth));
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            options,
            counters.clone(),
            reject_auth.clone(),
            shutdown.clone(),
        ));

        Ok(FakeBoltServer {
            addr,
            counters,
            reject_auth,
            shutdown,
        })
    }

    pub fn uri(&self) -> String {
        format!("bolt://{}", self.addr)
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Stops accepting and drops every open connection.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn accepted(&self) -> u64 {
        self.counters.accepted.load(Ordering::SeqCst)
    }

    /// Connections accepted and not yet closed by either side.
    pub fn open_connections(&self) -> u64 {
        self.accepted() - self.counters.finished.load(Ordering::SeqCst)
    }

    pub fn hellos(&self) -> u64 {
        self.counters.hellos.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u64 {
        self.counters.resets.load(Ordering::SeqCst)
    }

    pub fn goodbyes(&self) -> u64 {
        self.counters.goodbyes.load(Ordering::SeqCst)
    }
}

impl Drop for FakeBoltServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A `bolt://` URI on a local port nothing listens on.
pub async fn refused_uri() -> std::io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(format!("bolt://{addr}"))
}

async fn accept_loop(
    listener: TcpListener,
    options: FakeServerOptions,
    counters: Arc<ServerCounters>,
    reject_auth: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    debug!(error = %e, "fake bolt server failed to accept");
                    continue;
                }
            },
        };

        counters.accepted.fetch_add(1, Ordering::SeqCst);
        let options = options.clone();
        let counters = counters.clone();
        let reject_auth = reject_auth.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = serve(stream, &options, &counters, &reject_auth) => {
                    if let Err(e) = result {
                        debug!(error = %e, "fake bolt connection ended");
                    }
                }
            }
            counters.finished.fetch_add(1, Ordering::SeqCst);
        });
    }
}

async fn serve(
    mut stream: TcpStream,
    options: &FakeServerOptions,
    counters: &ServerCounters,
    reject_auth: &AtomicBool,
) -> Result<(), DriverError> {
    let mut preamble = [0u8; 20];
    stream.read_exact(&mut preamble).await?;
    if preamble[..4] != MAGIC {
        return Err(DriverError::Protocol("client sent no bolt preamble".to_string()));
    }

    if !options.handshake_delay.is_zero() {
        tokio::time::sleep(options.handshake_delay).await;
    }
    let agreed = match options.version {
        Some(BoltVersion { major, minor }) => [0, 0, minor, major],
        None => [0; 4],
    };
    stream.write_all(&agreed).await?;
    if options.version.is_none() {
        return Ok(());
    }

    loop {
        let message = protocol::read_message(&mut stream).await?;
        let response = match Request::signature_of(&message) {
            Some(Request::HELLO) => {
                counters.hellos.fetch_add(1, Ordering::SeqCst);
                if reject_auth.load(Ordering::SeqCst) {
                    Response::Failure {
                        code: "Neo.ClientError.Security.Unauthorized".to_string(),
                        message: "The client is unauthorized due to authentication failure."
                            .to_string(),
                    }
                } else {
                    Response::Success
                }
            }
            Some(Request::RESET) => {
                counters.resets.fetch_add(1, Ordering::SeqCst);
                if !options.reset_delay.is_zero() {
                    tokio::time::sleep(options.reset_delay).await;
                }
                Response::Success
            }
            Some(Request::GOODBYE) => {
                counters.goodbyes.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            _ => Response::Failure {
                code: "Neo.ClientError.Request.Invalid".to_string(),
                message: "unsupported message".to_string(),
            },
        };
        protocol::write_message(&mut stream, &response.encode()).await?;
    }
}
