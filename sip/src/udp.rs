use crate::conn::Conn;
use crate::handler::Dispatcher;
use crate::message::Message;
use crate::server::{run_request, CorrelationData, OutboundRequest, ServerConfig, TaskSet};
use crate::transaction::{spawn_sweeper, Registry, Transaction, TxError};
use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, warn};

const RETRANSMIT_TICK: Duration = Duration::from_millis(10);
const SWEEP_INTERVAL: Duration = Duration::from_millis(25);

/// One shared socket, a reader task per CPU, a retransmission sweep and a
/// deadline sweep per registry.
pub struct UdpDriver {
    cfg: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    active: Arc<Registry>,
    passive: Arc<Registry>,
    tasks: Arc<TaskSet>,
    stop: watch::Receiver<bool>,
    state: OnceLock<UdpState>,
}

struct UdpState {
    socket: Arc<UdpSocket>,
    via_host: String,
    via_port: u16,
}

impl UdpDriver {
    pub fn new(
        cfg: ServerConfig,
        dispatcher: Arc<Dispatcher>,
        tasks: Arc<TaskSet>,
        stop: watch::Receiver<bool>,
    ) -> UdpDriver {
        UdpDriver {
            cfg,
            dispatcher,
            active: Arc::new(Registry::new()),
            passive: Arc::new(Registry::new()),
            tasks,
            stop,
            state: OnceLock::new(),
        }
    }

    pub async fn serve(&self) -> Result<()> {
        let socket = Arc::new(UdpSocket::bind(&self.cfg.bind).await?);
        let local = socket.local_addr()?;
        let via_host = if local.ip().is_unspecified() {
            argus_utils::get_local_ip().unwrap_or_else(|| "127.0.0.1".to_string())
        } else {
            local.ip().to_string()
        };
        let state = UdpState {
            socket: socket.clone(),
            via_host,
            via_port: local.port(),
        };
        if self.state.set(state).is_err() {
            return Err(anyhow!("udp transport already serving"));
        }

        for _ in 0..num_cpus::get().max(1) {
            let socket = socket.clone();
            let dispatcher = self.dispatcher.clone();
            let active = self.active.clone();
            let passive = self.passive.clone();
            let max = self.cfg.max_message_size;
            let stop = self.stop.clone();
            self.tasks.spawn(async move {
                UdpDriver::run(socket, dispatcher, active, passive, max, stop)
                    .await;
            });
        }

        {
            let active = self.active.clone();
            let stop = self.stop.clone();
            self.tasks.spawn(async move {
                UdpDriver::retransmit_loop(active, stop).await;
            });
        }

        self.tasks
            .push(spawn_sweeper(self.active.clone(), SWEEP_INTERVAL, self.stop.clone()));
        self.tasks
            .push(spawn_sweeper(self.passive.clone(), SWEEP_INTERVAL, self.stop.clone()));

        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let state = self.state.get()?;
        state.socket.local_addr().ok()
    }

    pub async fn request(
        &self,
        msg: Message,
        dest: SocketAddr,
        data: Option<CorrelationData>,
    ) -> Result<()> {
        let state = self
            .state
            .get()
            .ok_or_else(|| anyhow!("udp transport is not serving"))?;
        run_request(OutboundRequest {
            registry: self.active.clone(),
            conn: Conn::udp(state.socket.clone(), dest),
            msg,
            data,
            tx_timeout: self.cfg.tx_timeout(),
            retransmit: Some((self.cfg.min_rto(), self.cfg.max_rto())),
            via_host: state.via_host.clone(),
            via_port: state.via_port,
        })
        .await
    }

    pub fn outstanding(&self) -> usize {
        self.active.len() + self.passive.len()
    }

    /// Force-finishes everything still registered; used on shutdown.
    pub fn drain_transactions(&self) -> Vec<Arc<Transaction>> {
        let mut drained = self.active.drain();
        drained.extend(self.passive.drain());
        drained
    }

    async fn run(
        socket: Arc<UdpSocket>,
        dispatcher: Arc<Dispatcher>,
        active: Arc<Registry>,
        passive: Arc<Registry>,
        max_message_size: usize,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; 65535];
        loop {
            tokio::select! {
                res = socket.recv_from(&mut buf) => match res {
                    Ok((n, peer)) => {
                        Self::handle_datagram(
                            &socket,
                            &dispatcher,
                            &active,
                            &passive,
                            max_message_size,
                            &buf[..n],
                            peer,
                        )
                        .await;
                    }
                    Err(e) => error!("udp socket receive error {e}"),
                },
                _ = stop.changed() => break,
            }
        }
    }

    /// A datagram may legally carry several messages back-to-back; a decode
    /// error abandons the remainder of that datagram only.
    async fn handle_datagram(
        socket: &Arc<UdpSocket>,
        dispatcher: &Arc<Dispatcher>,
        active: &Arc<Registry>,
        passive: &Arc<Registry>,
        max_message_size: usize,
        data: &[u8],
        peer: SocketAddr,
    ) {
        let data = data.to_vec();
        let decoded = argus_task::spawn_task(move || {
            let mut msgs = Vec::new();
            let mut offset = 0;
            while offset < data.len() {
                // keepalive CRLFs only
                if data[offset..]
                    .iter()
                    .all(|&b| matches!(b, b'\r' | b'\n' | b' '))
                {
                    break;
                }
                match Message::decode(&data[offset..], max_message_size) {
                    Ok((msg, used)) => {
                        offset += used;
                        msgs.push(msg);
                    }
                    Err(e) => return (msgs, Some(e)),
                }
            }
            (msgs, None)
        })
        .await;

        let (msgs, err) = match decoded {
            Ok(v) => v,
            Err(e) => {
                error!("udp decode task failed: {e}");
                return;
            }
        };
        if let Some(e) = err {
            debug!("udp datagram from {peer} decode error, dropping remainder: {e}");
        }

        for mut msg in msgs {
            if msg.is_request() {
                // the receiving side fills in where the request really
                // came from
                if let Some(via) = msg.via.first_mut() {
                    via.received = Some(peer.ip().to_string());
                    via.rport = Some(peer.port());
                }
            }
            let conn = Conn::udp(socket.clone(), peer);
            dispatcher.route(msg, conn, active, passive).await;
        }
    }

    /// Walks a snapshot of the active table every tick and resends anything
    /// whose interval has elapsed, fanning the snapshot out over at most one
    /// worker per CPU.
    async fn retransmit_loop(active: Arc<Registry>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(RETRANSMIT_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = active.snapshot();
                    if snapshot.is_empty() {
                        continue;
                    }
                    let workers = num_cpus::get().max(1);
                    let chunk = (snapshot.len() + workers - 1) / workers;
                    let mut parts = Vec::new();
                    for part in snapshot.chunks(chunk) {
                        let part = part.to_vec();
                        parts.push(tokio::spawn(async move {
                            let now = Instant::now();
                            for tx in part {
                                if tx.is_finished() {
                                    continue;
                                }
                                let Some(r) = tx.retransmit() else {
                                    continue;
                                };
                                if r.stopped() || !r.take_due(now) {
                                    continue;
                                }
                                if let Err(e) = tx.conn.send(r.payload()).await {
                                    warn!(
                                        "udp retransmit to {} failed: {e}",
                                        tx.conn.peer_addr()
                                    );
                                    tx.finish(TxError::Transport(e.to_string()));
                                }
                            }
                        }));
                    }
                    for part in parts {
                        let _ = part.await;
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }
}
