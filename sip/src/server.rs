use crate::conn::{Conn, TransportError, TransportType};
use crate::handler::{Dispatcher, Handlers};
use crate::message::{Message, Via};
use crate::tcp::TcpDriver;
use crate::transaction::{lock, Registry, Retransmit, Transaction, TransactionError, TxError, TxKey};
use crate::udp::UdpDriver;
use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Caller-supplied correlation data carried on an active transaction and
/// surfaced to response handlers.
pub type CorrelationData = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP socket and TCP listener share this address.
    pub bind: String,
    pub max_message_size: usize,
    pub min_rto_ms: u64,
    pub max_rto_ms: u64,
    pub tx_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:5060".to_string(),
            max_message_size: 65535,
            min_rto_ms: 500,
            max_rto_ms: 4000,
            tx_timeout_ms: 32_000,
        }
    }
}

impl ServerConfig {
    pub fn min_rto(&self) -> Duration {
        Duration::from_millis(self.min_rto_ms)
    }

    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_ms)
    }
}

/// Where an outbound request goes: which wire and which peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Destination {
    pub transport: TransportType,
    pub addr: SocketAddr,
}

impl Destination {
    pub fn udp(addr: SocketAddr) -> Destination {
        Destination {
            transport: TransportType::Udp,
            addr,
        }
    }

    pub fn tcp(addr: SocketAddr) -> Destination {
        Destination {
            transport: TransportType::Tcp,
            addr,
        }
    }
}

impl FromStr for Destination {
    type Err = anyhow::Error;

    /// Accepts `udp:host:port` / `tcp:host:port`.
    fn from_str(s: &str) -> Result<Destination> {
        let (transport, addr) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid destination {s}"))?;
        Ok(Destination {
            transport: TransportType::from_str(transport)
                .map_err(|_| anyhow!("invalid destination transport {transport}"))?,
            addr: addr.parse()?,
        })
    }
}

/// Spawned tasks — readers, sweepers, stream servers and handler chains —
/// joined at shutdown so the drain is graceful rather than abrupt.
/// Short-lived chain tasks register here too, so completed handles are
/// pruned on every insert to keep the list bounded by what is in flight.
#[derive(Default)]
pub struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub fn new() -> TaskSet {
        TaskSet::default()
    }

    pub fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) {
        let mut handles = lock(&self.handles);
        handles.retain(|handle| !handle.is_finished());
        handles.push(tokio::spawn(fut));
    }

    pub fn push(&self, handle: JoinHandle<()>) {
        let mut handles = lock(&self.handles);
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
    }

    pub async fn join_all(&self) {
        loop {
            let handles: Vec<_> = lock(&self.handles).drain(..).collect();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}

pub(crate) struct OutboundRequest {
    pub registry: Arc<Registry>,
    pub conn: Conn,
    pub msg: Message,
    pub data: Option<CorrelationData>,
    pub tx_timeout: Duration,
    /// `(min_rto, max_rto)` for UDP; `None` on stream transports.
    pub retransmit: Option<(Duration, Duration)>,
    pub via_host: String,
    pub via_port: u16,
}

/// Ties transaction cleanup to the caller's future: dropping the `request`
/// call (cancellation) finishes the transaction as canceled and removes it,
/// so a late response finds nothing. On every other path the finish attempt
/// loses and only the idempotent removal runs.
struct CancelGuard {
    registry: Arc<Registry>,
    tx: Arc<Transaction>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.tx.finish(TxError::Canceled);
        self.registry.remove(&self.tx.key);
    }
}

/// The single outbound path both drivers share: top the Via if the caller
/// left it off, register the active transaction, write, then block on
/// completion against the deadline.
pub(crate) async fn run_request(req: OutboundRequest) -> Result<()> {
    let OutboundRequest {
        registry,
        conn,
        mut msg,
        data,
        tx_timeout,
        retransmit,
        via_host,
        via_port,
    } = req;

    if msg.via.is_empty() {
        msg.via.push(Via {
            transport: conn.transport(),
            host: via_host,
            port: Some(via_port),
            branch: format!("z9hG4bK{}", argus_utils::rand_string(20)),
            ..Default::default()
        });
    }

    let bytes = msg.encode();
    let key = TxKey::from_msg(&msg)?;
    let deadline = Instant::now() + tx_timeout;
    let retransmit =
        retransmit.map(|(min, max)| Retransmit::new(bytes.clone(), min, max));

    let (tx, existed) = registry.get_or_insert(&key, {
        let key = key.clone();
        let conn = conn.clone();
        move || Transaction::active(key, conn, deadline, data, retransmit)
    });
    if existed {
        return Err(TransactionError::TransactionExists.into());
    }

    let _guard = CancelGuard {
        registry: registry.clone(),
        tx: tx.clone(),
    };

    if let Err(e) = conn.send(&bytes).await {
        tx.finish(TxError::Transport(e.to_string()));
        return Err(e.into());
    }

    let outcome = tokio::select! {
        outcome = tx.wait() => outcome,
        _ = tokio::time::sleep_until(deadline.into()) => {
            // the sweeper normally gets here first; this bounds the wait
            // even if it lags
            tx.finish(TxError::DeadlineExceeded);
            tx.outcome().unwrap_or(TxError::DeadlineExceeded)
        }
    };

    match outcome {
        TxError::Finished => Ok(()),
        e => Err(e.into()),
    }
}

/// Both transport drivers behind one request/serve/shutdown surface.
pub struct SipServer {
    udp: UdpDriver,
    tcp: TcpDriver,
    stop: watch::Sender<bool>,
    tasks: Arc<TaskSet>,
}

impl SipServer {
    pub fn new(cfg: ServerConfig, handlers: Handlers) -> SipServer {
        let (stop, stop_rx) = watch::channel(false);
        let tasks = Arc::new(TaskSet::new());
        let dispatcher =
            Dispatcher::new(Arc::new(handlers), cfg.tx_timeout(), tasks.clone());
        let udp = UdpDriver::new(
            cfg.clone(),
            dispatcher.clone(),
            tasks.clone(),
            stop_rx.clone(),
        );
        let tcp = TcpDriver::new(cfg, dispatcher, tasks.clone(), stop_rx);
        SipServer {
            udp,
            tcp,
            stop,
            tasks,
        }
    }

    /// Binds the UDP socket and the TCP listener and starts the reader and
    /// sweeper tasks. Returns once both transports are listening.
    pub async fn serve(&self) -> Result<()> {
        self.udp.serve().await?;
        self.tcp.serve().await?;
        Ok(())
    }

    /// Originates a request and blocks until its transaction finishes, the
    /// deadline passes, or this call's future is dropped. Always leaves the
    /// registry clean before returning.
    pub async fn request(
        &self,
        msg: Message,
        dest: Destination,
        data: Option<CorrelationData>,
    ) -> Result<()> {
        match dest.transport {
            TransportType::Udp => self.udp.request(msg, dest.addr, data).await,
            TransportType::Tcp => self.tcp.request(msg, dest.addr, data).await,
            other => Err(TransportError::Unsupported(other).into()),
        }
    }

    /// Graceful drain: stop accepting, force-finish everything outstanding
    /// with the shutdown outcome, close pooled connections, then wait for
    /// every spawned task to observe the stop signal and exit.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        for tx in self
            .udp
            .drain_transactions()
            .into_iter()
            .chain(self.tcp.drain_transactions())
        {
            tx.finish(TxError::ServerShutdown);
        }
        self.tcp.close_pool().await;
        self.tasks.join_all().await;
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr()
    }

    /// Transactions currently registered across both transports.
    pub fn outstanding(&self) -> usize {
        self.udp.outstanding() + self.tcp.outstanding()
    }

    /// Pooled TCP connections.
    pub fn pooled_connections(&self) -> usize {
        self.tcp.pooled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unsupported_transport_is_a_distinct_error() {
        let server = SipServer::new(
            ServerConfig {
                bind: "127.0.0.1:0".to_string(),
                ..Default::default()
            },
            Handlers::new(),
        );
        server.serve().await.unwrap();

        let dest = Destination {
            transport: TransportType::Tls,
            addr: "127.0.0.1:5061".parse().unwrap(),
        };
        let err = server
            .request(Message::default(), dest, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransportError>(),
            Some(TransportError::Unsupported(TransportType::Tls))
        ));

        server.shutdown().await;
    }

    #[test]
    fn destination_from_string() {
        let dest = Destination::from_str("udp:192.168.1.20:5060").unwrap();
        assert_eq!(TransportType::Udp, dest.transport);
        assert_eq!(5060, dest.addr.port());

        let dest = Destination::from_str("tcp:10.0.0.1:5061").unwrap();
        assert_eq!(TransportType::Tcp, dest.transport);

        assert!(Destination::from_str("sctp:1.2.3.4:5060").is_err());
        assert!(Destination::from_str("nonsense").is_err());
    }

    #[test]
    fn config_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(Duration::from_millis(500), cfg.min_rto());
        assert_eq!(Duration::from_millis(4000), cfg.max_rto());
        assert_eq!(Duration::from_secs(32), cfg.tx_timeout());
        assert_eq!(65535, cfg.max_message_size);

        let cfg: ServerConfig =
            toml::from_str("bind = \"127.0.0.1:5060\"\nmin_rto_ms = 100\n")
                .unwrap();
        assert_eq!("127.0.0.1:5060", cfg.bind);
        assert_eq!(Duration::from_millis(100), cfg.min_rto());
        assert_eq!(Duration::from_millis(4000), cfg.max_rto());
    }
}
