//! Async driver: owns the socket, the timers and the collaborators, and
//! executes the effects produced by [`StreamEngine`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use feed_core::{now_ms, FrameReassembler, Sink};
use rustls::ClientConfig;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    catalogue::{CatalogueEntry, CatalogueLookup},
    engine::{Effect, StreamEngine},
    provider::SessionProvider,
    session::SessionState,
};

const READ_BUFFER: usize = 64 * 1024;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Opens the byte stream the session runs over.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self) -> Result<Self::Stream>;
}

pub struct TlsConnector {
    host: String,
    port: u16,
    tls: Arc<ClientConfig>,
}

impl TlsConnector {
    pub fn new(host: impl Into<String>, port: u16, tls: Arc<ClientConfig>) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }
}

#[async_trait]
impl Connector for TlsConnector {
    type Stream = tokio_rustls::client::TlsStream<TcpStream>;

    async fn connect(&self) -> Result<Self::Stream> {
        feed_core::tls::connect(&self.host, self.port, self.tls.clone()).await
    }
}

/// Unencrypted TCP, for local endpoints.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connecting to {}", self.addr))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

enum SocketEvent<S> {
    Opened(u64, Result<S>),
    Data(u64, Vec<u8>),
    Closed(u64),
}

struct ActiveConnection {
    epoch: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl ActiveConnection {
    fn shutdown(self) {
        self.reader.abort();
        // Dropping the sender ends the writer task, which shuts the write half.
        drop(self.outbound);
    }
}

/// Lookup settings forwarded to the catalogue collaborator.
#[derive(Debug, Clone)]
pub struct LookupSettings {
    pub fields: Vec<String>,
    pub max_results: usize,
}

pub struct StreamClient<C, S, P, L> {
    engine: StreamEngine,
    connector: Arc<C>,
    sink: Arc<S>,
    provider: Arc<P>,
    catalogue: Arc<L>,
    lookup: LookupSettings,
    tick: Duration,
    connect_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    state_tx: watch::Sender<SessionState>,
}

impl<C, S, P, L> StreamClient<C, S, P, L>
where
    C: Connector + 'static,
    S: Sink + 'static,
    P: SessionProvider + 'static,
    L: CatalogueLookup + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: StreamEngine,
        connector: Arc<C>,
        sink: Arc<S>,
        provider: Arc<P>,
        catalogue: Arc<L>,
        lookup: LookupSettings,
        tick: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let (state_tx, _) = watch::channel(engine.state());
        Self {
            engine,
            connector,
            sink,
            provider,
            catalogue,
            lookup,
            tick,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown,
            state_tx,
        }
    }

    /// Bound on one connection attempt, TLS handshake included.
    pub fn with_connect_timeout(mut self, limit: Duration) -> Self {
        self.connect_timeout = limit;
        self
    }

    /// Observe session state changes, e.g. for readiness probes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Log in, then run the session until shutdown is requested.
    pub async fn run(mut self) -> Result<StreamEngine> {
        let token = self.provider.login().await.context("logging in")?;
        self.engine.on_login(token, now_ms());

        let (socket_tx, mut socket_rx) = mpsc::channel::<SocketEvent<C::Stream>>(1024);
        let (lookup_tx, mut lookup_rx) = mpsc::channel::<Vec<CatalogueEntry>>(16);
        let (keepalive_tx, mut keepalive_rx) = mpsc::channel::<Result<String>>(4);

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (append_tx, appender) = spawn_appender(self.sink.clone());

        let mut reassembler = FrameReassembler::new();
        let mut conn: Option<ActiveConnection> = None;
        let mut epoch = 0u64;

        loop {
            let effects = tokio::select! {
                _ = ticker.tick() => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        self.engine.request_shutdown();
                    }
                    self.engine.tick(now_ms())
                }
                Some(event) = socket_rx.recv() => match event {
                    SocketEvent::Opened(e, result) if e == epoch => match result {
                        Ok(stream) => {
                            info!(epoch = e, "stream socket connected");
                            reassembler.reset();
                            conn = Some(spawn_connection(stream, e, socket_tx.clone()));
                            self.engine.on_open(now_ms());
                            Vec::new()
                        }
                        Err(err) => {
                            error!(error = %err, "stream connection failed");
                            self.engine.on_connect_failed(now_ms());
                            Vec::new()
                        }
                    },
                    SocketEvent::Data(e, bytes) if is_current(&conn, e) => {
                        let now = now_ms();
                        self.engine.on_data(now);
                        let mut effects = Vec::new();
                        for frame in reassembler.push(&bytes, now) {
                            effects.extend(self.engine.handle_frame(&frame));
                        }
                        effects
                    }
                    SocketEvent::Closed(e) if is_current(&conn, e) => {
                        info!(epoch = e, "stream socket closed");
                        if let Some(c) = conn.take() {
                            c.shutdown();
                        }
                        reassembler.reset();
                        self.engine.on_closed(now_ms());
                        Vec::new()
                    }
                    _ => {
                        debug!("event from a replaced connection ignored");
                        Vec::new()
                    }
                },
                Some(entries) = lookup_rx.recv() => self.engine.on_catalogue(entries, now_ms()),
                Some(result) = keepalive_rx.recv() => {
                    self.engine.on_keep_alive(result, now_ms());
                    Vec::new()
                }
            };

            for effect in effects {
                match effect {
                    Effect::Connect => {
                        epoch += 1;
                        let connector = self.connector.clone();
                        let tx = socket_tx.clone();
                        let e = epoch;
                        let limit = self.connect_timeout;
                        info!(epoch = e, "opening stream socket");
                        tokio::spawn(async move {
                            let result = match timeout(limit, connector.connect()).await {
                                Ok(result) => result,
                                Err(_) => Err(anyhow!("connect timed out after {limit:?}")),
                            };
                            let _ = tx.send(SocketEvent::Opened(e, result)).await;
                        });
                    }
                    Effect::Send(request) => match (&conn, request.encode()) {
                        (Some(c), Ok(line)) => {
                            debug!(id = request.id(), "sending request");
                            if c.outbound.send(line).is_err() {
                                warn!("writer closed, request dropped");
                            }
                        }
                        (None, _) => warn!(id = request.id(), "no open socket, request dropped"),
                        (_, Err(e)) => error!(error = %e, "failed to encode request"),
                    },
                    Effect::Close => {
                        if let Some(c) = conn.take() {
                            info!(epoch = c.epoch, "closing stream socket");
                            c.shutdown();
                        }
                        reassembler.reset();
                        self.engine.on_closed(now_ms());
                    }
                    Effect::Append { entity_id, record } => {
                        if append_tx.send((entity_id, record)).is_err() {
                            error!("record writer stopped, record dropped");
                        }
                    }
                    Effect::Relocate(task) => {
                        let sink = self.sink.clone();
                        tokio::spawn(async move {
                            if let Err(e) = sink
                                .relocate(&task.entity_id, &task.source, &task.archive)
                                .await
                            {
                                error!(entity = %task.entity_id, error = %e, "failed to archive log");
                            }
                        });
                    }
                    Effect::Lookup { session, ids } => {
                        let catalogue = self.catalogue.clone();
                        let lookup = self.lookup.clone();
                        let tx = lookup_tx.clone();
                        tokio::spawn(async move {
                            match catalogue
                                .lookup(&session, &ids, &lookup.fields, lookup.max_results)
                                .await
                            {
                                Ok(entries) => {
                                    let _ = tx.send(entries).await;
                                }
                                Err(e) => warn!(batch = ids.len(), error = %e, "metadata lookup failed"),
                            }
                        });
                    }
                    Effect::KeepAlive(token) => {
                        let provider = self.provider.clone();
                        let tx = keepalive_tx.clone();
                        tokio::spawn(async move {
                            let _ = tx.send(provider.keep_alive(&token).await).await;
                        });
                    }
                    Effect::Shutdown => {
                        if let Some(c) = conn.take() {
                            c.shutdown();
                        }
                        self.state_tx.send_replace(SessionState::Disconnected);
                        // Let queued records reach the sink before returning.
                        drop(append_tx);
                        let _ = appender.await;
                        info!("stream client stopped");
                        return Ok(self.engine);
                    }
                }
            }
            self.state_tx.send_replace(self.engine.state());
        }
    }
}

/// Single writer so records for an entity keep their order while the event
/// loop never waits on the sink.
fn spawn_appender<S: Sink + 'static>(
    sink: Arc<S>,
) -> (mpsc::UnboundedSender<(String, String)>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();
    let handle = tokio::spawn(async move {
        while let Some((entity_id, record)) = rx.recv().await {
            if let Err(e) = sink.append(&entity_id, &record).await {
                error!(entity = %entity_id, error = %e, "failed to persist record");
            }
        }
    });
    (tx, handle)
}

fn is_current(conn: &Option<ActiveConnection>, epoch: u64) -> bool {
    conn.as_ref().map(|c| c.epoch == epoch).unwrap_or(false)
}

fn spawn_connection<T>(
    stream: T,
    epoch: u64,
    events: mpsc::Sender<SocketEvent<T>>,
) -> ActiveConnection
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            if let Err(e) = write_half.write_all(&line).await {
                error!(epoch, error = %e, "socket write failed");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if events
                        .send(SocketEvent::Data(epoch, buf[..n].to_vec()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    error!(epoch, error = %e, "socket read failed");
                    break;
                }
            }
        }
        let _ = events.send(SocketEvent::Closed(epoch)).await;
    });

    ActiveConnection {
        epoch,
        outbound,
        reader,
    }
}
