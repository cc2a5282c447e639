use crate::conn::{Conn, TransportError};
use crate::handler::Dispatcher;
use crate::message::Message;
use crate::server::{run_request, CorrelationData, OutboundRequest, ServerConfig, TaskSet};
use crate::transaction::{
    read_lock, spawn_sweeper, write_lock, Registry, Transaction,
};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader as AsyncBufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error};

const SWEEP_INTERVAL: Duration = Duration::from_millis(25);

/// Pooled connections are keyed by the packed remote address: a 128-bit
/// IPv6-normalized IP plus port, with IPv4 mapped into the IPv4-in-IPv6
/// space so one key space serves both families.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConnKey {
    ip: [u8; 16],
    port: u16,
}

impl From<SocketAddr> for ConnKey {
    fn from(addr: SocketAddr) -> ConnKey {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        ConnKey {
            ip: ip.octets(),
            port: addr.port(),
        }
    }
}

type Writer = Arc<Mutex<OwnedWriteHalf>>;

#[derive(Default)]
struct Pool {
    conns: RwLock<HashMap<ConnKey, Writer>>,
}

impl Pool {
    fn get(&self, key: &ConnKey) -> Option<Writer> {
        read_lock(&self.conns).get(key).cloned()
    }

    /// A freshly accepted connection replaces any stale entry for the peer.
    fn insert(&self, key: ConnKey, writer: Writer) {
        write_lock(&self.conns).insert(key, writer);
    }

    /// A concurrent dial to the same peer keeps the first connection.
    fn insert_if_absent(&self, key: ConnKey, writer: Writer) -> (Writer, bool) {
        let mut conns = write_lock(&self.conns);
        if let Some(existing) = conns.get(&key) {
            return (existing.clone(), true);
        }
        conns.insert(key, writer.clone());
        (writer, false)
    }

    fn remove(&self, key: &ConnKey) {
        write_lock(&self.conns).remove(key);
    }

    fn drain(&self) -> Vec<Writer> {
        write_lock(&self.conns).drain().map(|(_, w)| w).collect()
    }

    fn len(&self) -> usize {
        read_lock(&self.conns).len()
    }
}

/// Stream transport: a listener, a dial-or-reuse pool and one read task per
/// pooled connection. TCP already guarantees delivery, so there is no
/// resend machinery here; the transaction deadline still bounds the wait.
pub struct TcpDriver {
    cfg: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    active: Arc<Registry>,
    passive: Arc<Registry>,
    tasks: Arc<TaskSet>,
    stop: watch::Receiver<bool>,
    pool: Arc<Pool>,
    state: OnceLock<TcpState>,
}

struct TcpState {
    local: SocketAddr,
    via_host: String,
}

impl TcpDriver {
    pub fn new(
        cfg: ServerConfig,
        dispatcher: Arc<Dispatcher>,
        tasks: Arc<TaskSet>,
        stop: watch::Receiver<bool>,
    ) -> TcpDriver {
        TcpDriver {
            cfg,
            dispatcher,
            active: Arc::new(Registry::new()),
            passive: Arc::new(Registry::new()),
            tasks,
            stop,
            pool: Arc::new(Pool::default()),
            state: OnceLock::new(),
        }
    }

    pub async fn serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.cfg.bind).await?;
        let local = listener.local_addr()?;
        let via_host = if local.ip().is_unspecified() {
            argus_utils::get_local_ip().unwrap_or_else(|| "127.0.0.1".to_string())
        } else {
            local.ip().to_string()
        };
        if self.state.set(TcpState { local, via_host }).is_err() {
            return Err(anyhow!("tcp transport already serving"));
        }

        {
            let pool = self.pool.clone();
            let dispatcher = self.dispatcher.clone();
            let active = self.active.clone();
            let passive = self.passive.clone();
            let tasks = self.tasks.clone();
            let max = self.cfg.max_message_size;
            let mut stop = self.stop.clone();
            self.tasks.spawn(async move {
                loop {
                    tokio::select! {
                        res = listener.accept() => match res {
                            Ok((stream, peer)) => {
                                let (read, write) = stream.into_split();
                                let writer = Arc::new(Mutex::new(write));
                                pool.insert(ConnKey::from(peer), writer.clone());
                                spawn_stream(
                                    &tasks,
                                    read,
                                    writer,
                                    peer,
                                    pool.clone(),
                                    dispatcher.clone(),
                                    active.clone(),
                                    passive.clone(),
                                    max,
                                    stop.clone(),
                                );
                            }
                            Err(e) => error!("tcp accept error {e}"),
                        },
                        _ = stop.changed() => break,
                    }
                }
                // dropping the listener stops new work
            });
        }

        self.tasks
            .push(spawn_sweeper(self.active.clone(), SWEEP_INTERVAL, self.stop.clone()));
        self.tasks
            .push(spawn_sweeper(self.passive.clone(), SWEEP_INTERVAL, self.stop.clone()));

        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.get().map(|s| s.local)
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
            .ok_or_else(|| anyhow!("tcp transport is not serving"))?;
        let conn = self.conn_to(dest).await?;
        run_request(OutboundRequest {
            registry: self.active.clone(),
            conn,
            msg,
            data,
            tx_timeout: self.cfg.tx_timeout(),
            retransmit: None,
            via_host: state.via_host.clone(),
            via_port: state.local.port(),
        })
        .await
    }

    /// Reuses a pooled connection to `dest` or dials and pools a new one.
    async fn conn_to(&self, dest: SocketAddr) -> Result<Conn> {
        let key = ConnKey::from(dest);
        if let Some(writer) = self.pool.get(&key) {
            return Ok(Conn::tcp(writer, dest));
        }

        let stream = TcpStream::connect(dest)
            .await
            .map_err(|source| TransportError::Dial { addr: dest, source })?;
        let (read, write) = stream.into_split();
        let writer = Arc::new(Mutex::new(write));
        let (writer, existed) = self.pool.insert_if_absent(key, writer);
        if !existed {
            spawn_stream(
                &self.tasks,
                read,
                writer.clone(),
                dest,
                self.pool.clone(),
                self.dispatcher.clone(),
                self.active.clone(),
                self.passive.clone(),
                self.cfg.max_message_size,
                self.stop.clone(),
            );
        }
        Ok(Conn::tcp(writer, dest))
    }

    pub fn outstanding(&self) -> usize {
        self.active.len() + self.passive.len()
    }

    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    pub fn drain_transactions(&self) -> Vec<Arc<Transaction>> {
        let mut drained = self.active.drain();
        drained.extend(self.passive.drain());
        drained
    }

    /// Closes every pooled connection; their read tasks exit on the stop
    /// signal or the peer's close.
    pub async fn close_pool(&self) {
        for writer in self.pool.drain() {
            let mut writer = writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }
}

/// One read task per pooled connection: decode a sequential stream of
/// messages until a decode error or peer close, then evict and stop.
#[allow(clippy::too_many_arguments)]
fn spawn_stream(
    tasks: &Arc<TaskSet>,
    read: OwnedReadHalf,
    writer: Writer,
    peer: SocketAddr,
    pool: Arc<Pool>,
    dispatcher: Arc<Dispatcher>,
    active: Arc<Registry>,
    passive: Arc<Registry>,
    max_message_size: usize,
    mut stop: watch::Receiver<bool>,
) {
    tasks.spawn(async move {
        let mut reader = AsyncBufReader::new(read);
        loop {
            tokio::select! {
                res = Message::read_from(&mut reader, max_message_size) => match res {
                    Ok(msg) => {
                        let conn = Conn::tcp(writer.clone(), peer);
                        dispatcher.route(msg, conn, &active, &passive).await;
                    }
                    Err(e) => {
                        debug!("tcp connection {peer} closed: {e}");
                        break;
                    }
                },
                _ = stop.changed() => break,
            }
        }
        pool.remove(&ConnKey::from(peer));
        // finished transactions may still hold the writer; close the wire
        // explicitly rather than waiting on the last clone
        let _ = writer.lock().await.shutdown().await;
    });
}
