mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::engine;
use feed_client::{
    CatalogueEntry, CatalogueLookup, Connector, LookupSettings, SessionProvider, SessionState,
    StreamClient, TcpConnector,
};
use feed_core::{config::StreamKind, Sink};
use serde_json::Value;
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};

#[derive(Default)]
struct MemorySink {
    records: Mutex<Vec<(String, String)>>,
}

impl MemorySink {
    fn records(&self) -> Vec<(String, String)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn append(&self, entity_id: &str, record: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .push((entity_id.to_string(), record.to_string()));
        Ok(())
    }

    async fn relocate(&self, _entity_id: &str, _source: &Path, _archive: &Path) -> Result<()> {
        Ok(())
    }
}

/// Fails every append for one entity, after a delay like a retrying sink.
struct FailingSink {
    failing: &'static str,
    inner: MemorySink,
}

#[async_trait]
impl Sink for FailingSink {
    async fn append(&self, entity_id: &str, record: &str) -> Result<()> {
        if entity_id == self.failing {
            sleep(Duration::from_millis(50)).await;
            anyhow::bail!("disk full");
        }
        self.inner.append(entity_id, record).await
    }

    async fn relocate(&self, _entity_id: &str, _source: &Path, _archive: &Path) -> Result<()> {
        Ok(())
    }
}

/// Connector whose attempts never complete.
#[derive(Default)]
struct HangingConnector {
    attempts: AtomicUsize,
}

#[async_trait]
impl Connector for HangingConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<TcpStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

struct StaticProvider;

#[async_trait]
impl SessionProvider for StaticProvider {
    async fn login(&self) -> Result<String> {
        Ok("tok".into())
    }

    async fn keep_alive(&self, token: &str) -> Result<String> {
        Ok(token.to_string())
    }
}

struct NoCatalogue;

#[async_trait]
impl CatalogueLookup for NoCatalogue {
    async fn lookup(
        &self,
        _session: &str,
        _ids: &[String],
        _fields: &[String],
        _max_results: usize,
    ) -> Result<Vec<CatalogueEntry>> {
        Ok(Vec::new())
    }
}

struct Peer {
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    writer: tokio::io::WriteHalf<TcpStream>,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Peer {
        let (stream, _) = listener.accept().await.unwrap();
        let (r, w) = tokio::io::split(stream);
        Peer {
            reader: BufReader::new(r),
            writer: w,
        }
    }

    async fn send(&mut self, msg: Value) {
        let mut line = msg.to_string().into_bytes();
        line.extend_from_slice(b"\r\n");
        self.writer.write_all(&line).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        assert!(line.ends_with("\r\n"), "request must be terminated: {line:?}");
        serde_json::from_str(line.trim_end()).unwrap()
    }

    /// Connection greeting, authentication and subscription handshake.
    /// Returns the subscription request.
    async fn handshake(&mut self, connection_id: &str) -> Value {
        self.send(serde_json::json!({"op": "connection", "connectionId": connection_id}))
            .await;
        let auth = self.recv().await;
        assert_eq!(auth["op"], "authentication");
        assert_eq!(auth["session"], "tok");
        self.send(serde_json::json!({
            "op": "status", "id": auth["id"], "statusCode": "SUCCESS", "connectionsAvailable": 9
        }))
        .await;
        let sub = self.recv().await;
        assert_eq!(sub["op"], "marketSubscription");
        self.send(serde_json::json!({"op": "status", "id": sub["id"], "statusCode": "SUCCESS"}))
            .await;
        sub
    }
}

fn lookup_settings() -> LookupSettings {
    LookupSettings {
        fields: vec![],
        max_results: 100,
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn streams_records_and_resumes_after_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let sink = Arc::new(MemorySink::default());
    let shutdown = Arc::new(AtomicBool::new(false));
    let client = StreamClient::new(
        engine(StreamKind::Market),
        Arc::new(TcpConnector::new(addr.to_string())),
        sink.clone(),
        Arc::new(StaticProvider),
        Arc::new(NoCatalogue),
        LookupSettings {
            fields: vec![],
            max_results: 100,
        },
        Duration::from_millis(20),
        shutdown.clone(),
    );
    let mut states = client.subscribe_state();
    let handle = tokio::spawn(client.run());

    let mut first = Peer::accept(&listener).await;
    let sub = first.handshake("conn-1").await;
    assert!(sub.get("initialClk").is_none());
    first
        .send(serde_json::json!({
            "op": "mcm", "id": sub["id"], "initialClk": "I1", "clk": "C1", "pt": 1,
            "ct": "SUB_IMAGE",
            "mc": [{"id": "1.201", "marketDefinition": {"status": "OPEN", "version": 1}}]
        }))
        .await;
    wait_for(|| !sink.records().is_empty()).await;
    assert_eq!(sink.records()[0].0, "1.201");
    assert!(sink.records()[0].1.contains("|1|"));
    drop(first);

    let mut second = Peer::accept(&listener).await;
    let resume = second.handshake("conn-2").await;
    assert_eq!(resume["initialClk"], "I1");
    assert_eq!(resume["clk"], "C1");

    timeout(Duration::from_secs(5), async {
        while *states.borrow_and_update() != SessionState::Subscribed {
            states.changed().await.unwrap();
        }
    })
    .await
    .expect("client did not resubscribe");

    shutdown.store(true, Ordering::SeqCst);
    let engine = timeout(Duration::from_secs(5), handle)
        .await
        .expect("client did not stop")
        .unwrap()
        .unwrap();
    assert!(engine.registry().get("1.201").is_some());
    assert_eq!(engine.session().connections_available(), Some(9));
}

#[tokio::test]
async fn stalled_connect_is_abandoned_and_retried() {
    let connector = Arc::new(HangingConnector::default());
    let shutdown = Arc::new(AtomicBool::new(false));
    let client = StreamClient::new(
        engine(StreamKind::Market),
        connector.clone(),
        Arc::new(MemorySink::default()),
        Arc::new(StaticProvider),
        Arc::new(NoCatalogue),
        lookup_settings(),
        Duration::from_millis(10),
        shutdown.clone(),
    )
    .with_connect_timeout(Duration::from_millis(50));
    let handle = tokio::spawn(client.run());

    wait_for(|| connector.attempts.load(Ordering::SeqCst) >= 3).await;

    shutdown.store(true, Ordering::SeqCst);
    let engine = timeout(Duration::from_secs(5), handle)
        .await
        .expect("client did not stop")
        .unwrap()
        .unwrap();
    assert_ne!(engine.state(), SessionState::Subscribed);
}

#[tokio::test]
async fn failed_appends_do_not_stall_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let sink = Arc::new(FailingSink {
        failing: "1.201",
        inner: MemorySink::default(),
    });
    let shutdown = Arc::new(AtomicBool::new(false));
    let client = StreamClient::new(
        engine(StreamKind::Market),
        Arc::new(TcpConnector::new(addr.to_string())),
        sink.clone(),
        Arc::new(StaticProvider),
        Arc::new(NoCatalogue),
        lookup_settings(),
        Duration::from_millis(20),
        shutdown.clone(),
    );
    let states = client.subscribe_state();
    let handle = tokio::spawn(client.run());

    let mut peer = Peer::accept(&listener).await;
    let sub = peer.handshake("conn-1").await;
    for n in 0..5 {
        peer.send(serde_json::json!({
            "op": "mcm", "id": sub["id"], "clk": format!("C{n}"), "pt": n,
            "mc": [{"id": "1.201", "rc": []}, {"id": "1.202", "rc": []}]
        }))
        .await;
    }
    wait_for(|| sink.inner.records().len() == 5).await;
    assert!(sink.inner.records().iter().all(|(id, _)| id == "1.202"));
    assert_eq!(*states.borrow(), SessionState::Subscribed);

    shutdown.store(true, Ordering::SeqCst);
    let engine = timeout(Duration::from_secs(5), handle)
        .await
        .expect("client did not stop")
        .unwrap()
        .unwrap();
    assert!(engine.registry().get("1.201").is_some());
}
