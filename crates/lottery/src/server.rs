use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::session::{self, SessionConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, lookup_host};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Concurrency unit a connection handler runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionUnit {
    /// One tokio task per connection.
    #[default]
    Task,
    /// One OS thread per connection.
    Thread,
}

/// Create a linked shutdown trigger and token.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownToken(rx))
}

/// Asks the server to stop accepting connections.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// Observes the shutdown request. Dropping the trigger without firing it
/// also counts as a request to stop.
#[derive(Debug, Clone)]
pub struct ShutdownToken(watch::Receiver<bool>);

impl ShutdownToken {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Resolve once shutdown has been requested.
    pub async fn triggered(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

/// Pause after a failed accept before trying again.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Wait out `ACCEPT_RETRY_DELAY` so a persistent accept error (e.g. EMFILE)
/// does not spin the loop. Returns false if shutdown was requested meanwhile.
async fn accept_backoff(shutdown: &mut ShutdownToken) -> bool {
    tokio::select! {
        _ = shutdown.triggered() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs connection handlers concurrently and waits for them on shutdown.
#[async_trait]
pub trait HandlerSpawner: Send {
    /// Start a handler. Must not block the accept loop.
    fn spawn(&mut self, handler: HandlerFuture);

    /// Handlers started and not yet reaped.
    fn in_flight(&self) -> usize;

    /// Wait for every handler started so far.
    async fn join_all(&mut self);
}

pub fn spawner_for(unit: ExecutionUnit) -> Box<dyn HandlerSpawner> {
    match unit {
        ExecutionUnit::Task => Box::new(TaskSpawner::new()),
        ExecutionUnit::Thread => Box::new(ThreadSpawner::new(Handle::current())),
    }
}

#[derive(Default)]
pub struct TaskSpawner {
    tasks: JoinSet<()>,
}

impl TaskSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                error!("Session handler failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl HandlerSpawner for TaskSpawner {
    fn spawn(&mut self, handler: HandlerFuture) {
        self.reap();
        self.tasks.spawn(handler);
    }

    fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    async fn join_all(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("Session handler failed: {}", e);
            }
        }
    }
}

/// Runs each handler on its own OS thread, driven by the runtime handle.
pub struct ThreadSpawner {
    runtime: Handle,
    threads: Vec<thread::JoinHandle<()>>,
    spawned: u64,
}

impl ThreadSpawner {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            threads: Vec::new(),
            spawned: 0,
        }
    }

    fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = self
            .threads
            .drain(..)
            .partition(|handle| handle.is_finished());
        self.threads = running;
        for handle in finished {
            join_thread(handle);
        }
    }
}

fn join_thread(handle: thread::JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("session").to_string();
    if handle.join().is_err() {
        error!("Session handler thread {} panicked", name);
    }
}

#[async_trait]
impl HandlerSpawner for ThreadSpawner {
    fn spawn(&mut self, handler: HandlerFuture) {
        self.reap();
        self.spawned += 1;

        let runtime = self.runtime.clone();
        let spawned = thread::Builder::new()
            .name(format!("session-{}", self.spawned))
            .spawn(move || runtime.block_on(handler));
        match spawned {
            Ok(handle) => self.threads.push(handle),
            // The handler (and its connection) is dropped with the closure.
            Err(e) => error!("Failed to spawn session thread: {}", e),
        }
    }

    fn in_flight(&self) -> usize {
        self.threads.len()
    }

    async fn join_all(&mut self) {
        let threads = std::mem::take(&mut self.threads);
        let joined = tokio::task::spawn_blocking(move || {
            for handle in threads {
                join_thread(handle);
            }
        })
        .await;
        if let Err(e) = joined {
            error!("Failed to join session threads: {}", e);
        }
    }
}

/// TCP front end: accepts agency connections and hands each one to a
/// concurrently running session.
pub struct LotteryServer {
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    session: SessionConfig,
    unit: ExecutionUnit,
}

impl LotteryServer {
    /// Bind `config.listen_addr` with a listen backlog of
    /// `config.listen_backlog`.
    pub async fn bind(config: &ServerConfig, coordinator: Arc<Coordinator>) -> io::Result<Self> {
        let addr = lookup_host(&config.listen_addr).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("could not resolve {}", config.listen_addr),
            )
        })?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.listen_backlog)?;
        info!(
            "Lottery server listening on {} for {} agencies",
            listener.local_addr()?,
            coordinator.agencies()
        );

        Ok(Self {
            listener,
            coordinator,
            session: SessionConfig {
                malformed_batch_policy: config.malformed_batch_policy,
                winners_format: config.winners_format,
            },
            unit: config.execution_unit,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, then wait for every
    /// in-flight session to finish.
    pub async fn run(self, mut shutdown: ShutdownToken) -> io::Result<()> {
        let mut spawner = spawner_for(self.unit);

        loop {
            debug!(action = "accept_connections", result = "in_progress");
            let accepted = tokio::select! {
                _ = shutdown.triggered() => None,
                accepted = self.listener.accept() => Some(accepted),
            };
            let Some(accepted) = accepted else {
                break;
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(action = "accept_connections", result = "fail", "{}", e);
                    if accept_backoff(&mut shutdown).await {
                        continue;
                    }
                    break;
                }
            };
            if shutdown.is_triggered() {
                info!(peer = %peer, "Discarding connection, server is stopping");
                drop(stream);
                break;
            }
            info!(action = "accept_connections", result = "success", ip = %peer.ip());

            let coordinator = Arc::clone(&self.coordinator);
            let config = self.session;
            spawner.spawn(Box::pin(session::serve(
                stream,
                peer.to_string(),
                coordinator,
                config,
            )));
        }

        info!(action = "stop_server", result = "in_progress");
        drop(self.listener);

        let in_flight = spawner.in_flight();
        if in_flight > 0 {
            warn!("Waiting for {} sessions to finish", in_flight);
        }
        spawner.join_all().await;
        info!(action = "stop_server", result = "success");
        Ok(())
    }
}
