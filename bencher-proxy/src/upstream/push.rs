//! Streaming transport for websocket (`wss`) upstreams.
//!
//! One persistent connection with automatic reconnect. On every (re)connect
//! the client requests the current mining info once, subscribes to the
//! mining-info channel, and starts a heartbeat. Inbound text frames are
//! dispatched on their `cmd` field. Nonce submissions are fire-and-forget;
//! the protocol has no per-submission reply.
//!
//! The send side is serialized by a mutex shared between the heartbeat loop
//! and submitters. The receive side needs no mutex: the connection loop
//! owns the stream half exclusively.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::types::{MinerRound, MiningInfo, MiningInfoWire};

/// Client family version embedded in `miner_mark`. Pools identify the
/// client by this mark, so it tracks the upstream protocol, not the crate.
const MARK_VERSION: &str = "20190423";

/// Heartbeat send cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Close the connection when no heartbeat ack arrived for this long.
const HEARTBEAT_GRACE: Duration = Duration::from_secs(30);

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

fn heartbeat_stale(last_ack: Instant, now: Instant) -> bool {
    now.duration_since(last_ack) > HEARTBEAT_GRACE
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    cmd: &'a str,
    para: T,
}

#[derive(Serialize)]
struct ClientInfo<'a> {
    account_key: &'a str,
    miner_name: &'a str,
    miner_mark: String,
    capacity: i64,
}

#[derive(Serialize)]
struct SubscribeEvent<'a> {
    event: &'a str,
    data: SubscribeChannel<'a>,
    cid: u32,
}

#[derive(Serialize)]
struct SubscribeChannel<'a> {
    channel: &'a str,
}

#[derive(Serialize)]
struct NonceSubmission<'a> {
    account_key: &'a str,
    miner_name: &'a str,
    miner_mark: &'a str,
    capacity: i64,
    submit: Vec<NonceData>,
}

#[derive(Serialize)]
struct NonceData {
    #[serde(rename = "accountId")]
    account_id: u64,
    height: u64,
    nonce: String,
    deadline: u64,
    ts: i64,
}

#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(default)]
    cmd: String,
}

#[derive(Deserialize)]
struct InboundMiningInfo {
    para: MiningInfoWire,
}

/// Websocket upstream client.
pub struct PushUpstream {
    url: String,
    account_key: String,
    miner_name: String,
    capacity_gib: AtomicI64,
    available: AtomicBool,
    current: RwLock<Option<Arc<MiningInfo>>>,
    sink: Mutex<Option<WsSink>>,
    last_ack: StdMutex<Instant>,
}

impl PushUpstream {
    pub fn new(url: String, account_key: String, miner_name: String) -> Arc<Self> {
        Arc::new(Self {
            url,
            account_key,
            miner_name,
            capacity_gib: AtomicI64::new(0),
            available: AtomicBool::new(false),
            current: RwLock::new(None),
            sink: Mutex::new(None),
            last_ack: StdMutex::new(Instant::now()),
        })
    }

    /// Latest round delivered by the stream, once one has arrived.
    pub fn current(&self) -> Option<MiningInfo> {
        if !self.available.load(Ordering::Acquire) {
            return None;
        }
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            .cloned()
    }

    pub fn set_capacity(&self, total_gib: i64) {
        self.capacity_gib.store(total_gib, Ordering::Release);
    }

    fn client_info(&self) -> ClientInfo<'_> {
        ClientInfo {
            account_key: &self.account_key,
            miner_name: &self.miner_name,
            miner_mark: format!("{}.hdproxy.exe.{}", self.miner_name, MARK_VERSION),
            capacity: self.capacity_gib.load(Ordering::Acquire),
        }
    }

    async fn send(&self, frame: String) -> Result<()> {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => Ok(sink.send(Message::Text(frame)).await?),
            None => Err(Error::Upstream("websocket not connected".to_string())),
        }
    }

    /// Fire a nonce submission. Errors are logged, not surfaced; the
    /// admission path has already committed to a synthetic response.
    pub async fn submit_nonce(&self, round: &MinerRound) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0);
        let para = NonceSubmission {
            account_key: &self.account_key,
            miner_name: &self.miner_name,
            miner_mark: "",
            capacity: self.capacity_gib.load(Ordering::Acquire),
            submit: vec![NonceData {
                account_id: round.account_id,
                height: round.height,
                nonce: round.nonce.to_string(),
                deadline: round.deadline,
                ts,
            }],
        };
        let frame = match serde_json::to_string(&Envelope {
            cmd: "poolmgr.submit_nonce",
            para,
        }) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        if let Err(e) = self.send(frame).await {
            warn!(error = %e, "websocket submit failed");
        }
    }

    fn ack_heartbeat(&self) {
        *self.last_ack.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn heartbeat_lost(&self) -> bool {
        let last_ack = *self.last_ack.lock().unwrap_or_else(|e| e.into_inner());
        heartbeat_stale(last_ack, Instant::now())
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let frame = serde_json::to_string(&Envelope {
            cmd: "poolmgr.heartbeat",
            para: self.client_info(),
        })?;
        self.send(frame).await
    }

    /// Connect-time handshake: one-shot mining-info request, then the
    /// channel subscription.
    async fn subscribe(&self) -> Result<()> {
        self.send(r#"{"cmd":"mining_info","para":{}}"#.to_string())
            .await?;
        let subscription = serde_json::to_string(&SubscribeEvent {
            event: "#subscribe",
            data: SubscribeChannel {
                channel: "poolmgr.mining_info",
            },
            cid: 0,
        })?;
        self.send(subscription).await
    }

    fn handle_text(&self, text: &str) {
        let Ok(envelope) = serde_json::from_str::<InboundEnvelope>(text) else {
            return;
        };
        match envelope.cmd.as_str() {
            "poolmgr.heartbeat" => self.ack_heartbeat(),
            "mining_info" | "poolmgr.mining_info" => {
                let Ok(inbound) = serde_json::from_str::<InboundMiningInfo>(text) else {
                    return;
                };
                let info = Arc::new(MiningInfo::from(inbound.para).started());
                let height = info.height;
                *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(info);
                self.available.store(true, Ordering::Release);
                info!(height, "websocket upstream: new mining info received");
            }
            _ => {}
        }
    }

    /// Connection supervisor: dial, handshake, run, repeat until cancelled.
    pub async fn run(self: Arc<Self>, running: CancellationToken) {
        let mut backoff = RECONNECT_MIN;
        while !running.is_cancelled() {
            let connection = tokio::select! {
                _ = running.cancelled() => return,
                connected = connect_async(self.url.as_str()) => match connected {
                    Ok((connection, _)) => connection,
                    Err(e) => {
                        warn!(error = %e, url = %self.url, "websocket dial failed");
                        tokio::select! {
                            _ = running.cancelled() => return,
                            _ = sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(RECONNECT_MAX);
                        continue;
                    }
                },
            };
            backoff = RECONNECT_MIN;
            info!(url = %self.url, "websocket upstream connected");

            let (sink, mut stream) = connection.split();
            *self.sink.lock().await = Some(sink);
            self.ack_heartbeat();

            match self.subscribe().await {
                Err(e) => warn!(error = %e, "websocket subscribe failed"),
                Ok(()) => {
                    // The heartbeat runs as its own task for the lifetime of
                    // this connection; either side cancels the shared token
                    // to tear the connection down.
                    let connection_alive = running.child_token();
                    let heartbeat =
                        tokio::spawn(self.clone().heartbeat_loop(connection_alive.clone()));

                    loop {
                        tokio::select! {
                            _ = connection_alive.cancelled() => break,
                            frame = stream.next() => match frame {
                                Some(Ok(Message::Text(text))) => self.handle_text(&text),
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(error = %e, "websocket read failed");
                                    break;
                                }
                                None => {
                                    warn!("websocket upstream closed");
                                    break;
                                }
                            },
                        }
                    }
                    connection_alive.cancel();
                    let _ = heartbeat.await;
                }
            }

            // Dropping the sink closes the connection; the loop redials.
            *self.sink.lock().await = None;
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, connection_alive: CancellationToken) {
        let mut ticker = interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = connection_alive.cancelled() => return,
                _ = ticker.tick() => {
                    if self.heartbeat_lost() {
                        warn!("websocket upstream: heartbeat lost, reconnecting");
                        connection_alive.cancel();
                        return;
                    }
                    if let Err(e) = self.send_heartbeat().await {
                        warn!(error = %e, "websocket heartbeat send failed");
                        connection_alive.cancel();
                        return;
                    }
                }
            }
        }
    }
}
