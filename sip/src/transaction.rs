use crate::conn::Conn;
use crate::message::{Message, MessageError, Method};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// Everything that can conclude a transaction. The completion contract
/// requires an outcome even on success, hence the `Finished` sentinel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TxError {
    #[error("transaction finished")]
    Finished,
    #[error("transaction deadline exceeded")]
    DeadlineExceeded,
    #[error("server shutdown")]
    ServerShutdown,
    #[error("request canceled by caller")]
    Canceled,
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction already exists")]
    TransactionExists,
    #[error("transaction already finished")]
    AlreadyFinished,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TxRole {
    /// Locally originated request.
    Active,
    /// Locally received request.
    Passive,
}

/// The matching identity for both roles: request method, Call-ID and the
/// top Via branch. An ACK folds onto INVITE so it finds the transaction it
/// acknowledges.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TxKey {
    pub method: Method,
    pub call_id: String,
    pub branch: String,
}

impl TxKey {
    pub fn from_msg(msg: &Message) -> Result<TxKey, MessageError> {
        let branch = msg
            .top_branch()
            .ok_or(MessageError::MissingHeader("Via"))?
            .to_string();
        let method = match msg.tx_method() {
            Method::ACK => Method::INVITE,
            m => m,
        };
        Ok(TxKey {
            method,
            call_id: msg.call_id.clone(),
            branch,
        })
    }
}

impl Display for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.method, self.call_id, self.branch)
    }
}

/// UDP resend state for an active transaction. The stop flag has one writer
/// (the 1xx path) and one reader (the sweep); relaxed atomics are enough,
/// a stale read costs at most one extra resend.
pub struct Retransmit {
    payload: Vec<u8>,
    max_rto: Duration,
    state: Mutex<RtoState>,
    stop: AtomicBool,
}

struct RtoState {
    rto: Duration,
    last_sent: Instant,
}

impl Retransmit {
    pub fn new(payload: Vec<u8>, min_rto: Duration, max_rto: Duration) -> Self {
        Retransmit {
            payload,
            max_rto,
            state: Mutex::new(RtoState {
                rto: min_rto,
                last_sent: Instant::now(),
            }),
            stop: AtomicBool::new(false),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// When the interval since the last send has elapsed, advances the state
    /// (timestamp refreshed, interval doubled up to the ceiling) and tells
    /// the sweep to resend.
    pub fn take_due(&self, now: Instant) -> bool {
        let mut state = lock(&self.state);
        if now.duration_since(state.last_sent) < state.rto {
            return false;
        }
        state.last_sent = now;
        state.rto = (state.rto * 2).min(self.max_rto);
        true
    }
}

pub struct Transaction {
    pub key: TxKey,
    pub role: TxRole,
    pub conn: Conn,
    pub deadline: Instant,
    /// Caller-supplied correlation data, surfaced to response handlers.
    pub data: Option<Arc<dyn Any + Send + Sync>>,
    retransmit: Option<Retransmit>,
    finished: AtomicBool,
    outcome: OnceLock<TxError>,
    done: Notify,
    handling: AtomicBool,
    cached_response: OnceLock<Arc<Vec<u8>>>,
}

impl Transaction {
    pub fn active(
        key: TxKey,
        conn: Conn,
        deadline: Instant,
        data: Option<Arc<dyn Any + Send + Sync>>,
        retransmit: Option<Retransmit>,
    ) -> Arc<Transaction> {
        Arc::new(Transaction {
            key,
            role: TxRole::Active,
            conn,
            deadline,
            data,
            retransmit,
            finished: AtomicBool::new(false),
            outcome: OnceLock::new(),
            done: Notify::new(),
            handling: AtomicBool::new(false),
            cached_response: OnceLock::new(),
        })
    }

    pub fn passive(key: TxKey, conn: Conn, deadline: Instant) -> Arc<Transaction> {
        Arc::new(Transaction {
            key,
            role: TxRole::Passive,
            conn,
            deadline,
            data: None,
            retransmit: None,
            finished: AtomicBool::new(false),
            outcome: OnceLock::new(),
            done: Notify::new(),
            handling: AtomicBool::new(false),
            cached_response: OnceLock::new(),
        })
    }

    /// The single finishing gate. Whoever wins the compare-and-swap records
    /// the outcome and closes the completion signal; every other caller
    /// (response arrival, sweep, shutdown, cancellation) loses quietly.
    pub fn finish(&self, outcome: TxError) -> bool {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.outcome.set(outcome);
        self.done.notify_waiters();
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn outcome(&self) -> Option<TxError> {
        self.outcome.get().cloned()
    }

    /// Blocks until the transaction is finished and returns its outcome.
    pub async fn wait(&self) -> TxError {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            // register for the wakeup before re-checking the outcome, so a
            // finish() landing in between cannot be missed
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome.get() {
                return outcome.clone();
            }
            notified.await;
        }
    }

    pub fn retransmit(&self) -> Option<&Retransmit> {
        self.retransmit.as_ref()
    }

    /// Suppresses further UDP resends without finishing (provisional
    /// response observed).
    pub fn stop_retransmit(&self) {
        if let Some(r) = self.retransmit.as_ref() {
            r.stop();
        }
    }

    /// Claims the single-flight right to run the handler chain.
    pub fn begin_handling(&self) -> bool {
        self.handling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn cache_response(&self, bytes: Vec<u8>) {
        let _ = self.cached_response.set(Arc::new(bytes));
    }

    pub fn cached_response(&self) -> Option<Arc<Vec<u8>>> {
        self.cached_response.get().cloned()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("key", &self.key)
            .field("role", &self.role)
            .field("finished", &self.is_finished())
            .finish()
    }
}

// std lock guards, recovering from poisoning: these locks are only ever
// held for map or counter updates, never across an await.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A keyed transaction table. Lookups dominate on the decode path, so the
/// map sits behind a read/write lock that is never held across an await;
/// sweeps act on snapshots taken under the read lock.
#[derive(Default)]
pub struct Registry {
    map: RwLock<HashMap<TxKey, Arc<Transaction>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Idempotent create: a concurrent duplicate gets the existing entry and
    /// a was-present flag instead of overwriting it.
    pub fn get_or_insert(
        &self,
        key: &TxKey,
        make: impl FnOnce() -> Arc<Transaction>,
    ) -> (Arc<Transaction>, bool) {
        {
            let map = read_lock(&self.map);
            if let Some(tx) = map.get(key) {
                return (tx.clone(), true);
            }
        }
        let mut map = write_lock(&self.map);
        if let Some(tx) = map.get(key) {
            return (tx.clone(), true);
        }
        let tx = make();
        map.insert(key.clone(), tx.clone());
        (tx, false)
    }

    pub fn get(&self, key: &TxKey) -> Option<Arc<Transaction>> {
        read_lock(&self.map).get(key).cloned()
    }

    pub fn remove(&self, key: &TxKey) -> Option<Arc<Transaction>> {
        write_lock(&self.map).remove(key)
    }

    pub fn snapshot(&self) -> Vec<Arc<Transaction>> {
        read_lock(&self.map).values().cloned().collect()
    }

    pub fn drain(&self) -> Vec<Arc<Transaction>> {
        write_lock(&self.map).drain().map(|(_, tx)| tx).collect()
    }

    pub fn len(&self) -> usize {
        read_lock(&self.map).len()
    }

    pub fn is_empty(&self) -> bool {
        read_lock(&self.map).is_empty()
    }
}

/// Finishes and evicts entries whose deadline has passed. One sweeper runs
/// per registry, independent of traffic.
pub fn spawn_sweeper(
    registry: Arc<Registry>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    for tx in registry.snapshot() {
                        if now >= tx.deadline {
                            if tx.finish(TxError::DeadlineExceeded) {
                                debug!("transaction {} deadline exceeded", tx.key);
                            }
                            registry.remove(&tx.key);
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tokio::net::UdpSocket;

    async fn test_conn() -> Conn {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Conn::udp(Arc::new(socket), "127.0.0.1:5060".parse().unwrap())
    }

    fn key(method: Method, call_id: &str, branch: &str) -> TxKey {
        TxKey {
            method,
            call_id: call_id.to_string(),
            branch: branch.to_string(),
        }
    }

    #[test]
    fn key_matching_triple() {
        let base = |v: &str| {
            [
                "MESSAGE sip:a@b SIP/2.0",
                &format!("Via: SIP/2.0/UDP 10.0.0.1;branch={v}"),
                "To: <sip:a@b>",
                "From: <sip:c@d>;tag=x",
                "Call-ID: keycall",
                "CSeq: 1 MESSAGE",
                "Content-Length: 0",
                "",
                "",
            ]
            .join("\r\n")
        };
        let one = TxKey::from_msg(&Message::from_str(&base("z9hG4bKone")).unwrap())
            .unwrap();
        let same = TxKey::from_msg(&Message::from_str(&base("z9hG4bKone")).unwrap())
            .unwrap();
        let other = TxKey::from_msg(&Message::from_str(&base("z9hG4bKtwo")).unwrap())
            .unwrap();
        assert_eq!(one, same);
        assert_ne!(one, other);
        assert_ne!(
            one,
            key(Method::REGISTER, "keycall", "z9hG4bKone"),
        );
        assert_ne!(one, key(Method::MESSAGE, "othercall", "z9hG4bKone"));
    }

    #[test]
    fn ack_folds_onto_invite() {
        let ack = [
            "ACK sip:a@b SIP/2.0",
            "Via: SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKinv",
            "To: <sip:a@b>;tag=y",
            "From: <sip:c@d>;tag=x",
            "Call-ID: ackcall",
            "CSeq: 1 ACK",
            "Content-Length: 0",
            "",
            "",
        ]
        .join("\r\n");
        let key = TxKey::from_msg(&Message::from_str(&ack).unwrap()).unwrap();
        assert_eq!(Method::INVITE, key.method);
    }

    #[tokio::test]
    async fn finish_exactly_once() {
        let tx = Transaction::passive(
            key(Method::MESSAGE, "call", "branch"),
            test_conn().await,
            Instant::now() + Duration::from_secs(1),
        );
        assert!(tx.finish(TxError::Finished));
        assert!(!tx.finish(TxError::DeadlineExceeded));
        assert_eq!(Some(TxError::Finished), tx.outcome());
        assert_eq!(TxError::Finished, tx.wait().await);
    }

    #[tokio::test]
    async fn wait_sees_late_finish() {
        let tx = Transaction::passive(
            key(Method::MESSAGE, "call", "branch"),
            test_conn().await,
            Instant::now() + Duration::from_secs(1),
        );
        let waiter = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.finish(TxError::ServerShutdown);
        assert_eq!(TxError::ServerShutdown, waiter.await.unwrap());
    }

    #[tokio::test]
    async fn registry_create_is_idempotent() {
        let registry = Registry::new();
        let conn = test_conn().await;
        let k = key(Method::MESSAGE, "call", "branch");
        let deadline = Instant::now() + Duration::from_secs(1);

        let (first, existed) = registry.get_or_insert(&k, || {
            Transaction::passive(k.clone(), conn.clone(), deadline)
        });
        assert!(!existed);

        let (second, existed) = registry.get_or_insert(&k, || {
            Transaction::passive(k.clone(), conn.clone(), deadline)
        });
        assert!(existed);
        assert!(Arc::ptr_eq(&first, &second));

        assert_eq!(1, registry.len());
        registry.remove(&k);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn sweeper_evicts_expired() {
        let registry = Arc::new(Registry::new());
        let conn = test_conn().await;
        let k = key(Method::MESSAGE, "call", "branch");
        let (tx, _) = registry.get_or_insert(&k, || {
            Transaction::passive(
                k.clone(),
                conn.clone(),
                Instant::now() + Duration::from_millis(30),
            )
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle =
            spawn_sweeper(registry.clone(), Duration::from_millis(10), stop_rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(Some(TxError::DeadlineExceeded), tx.outcome());
        assert!(registry.is_empty());

        let _ = stop_tx.send(true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn retransmit_backoff_doubles_to_ceiling() {
        let r = Retransmit::new(
            b"ping".to_vec(),
            Duration::from_millis(100),
            Duration::from_millis(400),
        );
        let start = Instant::now();
        assert!(!r.take_due(start + Duration::from_millis(50)));
        assert!(r.take_due(start + Duration::from_millis(100)));
        // doubled to 200ms
        assert!(!r.take_due(start + Duration::from_millis(250)));
        assert!(r.take_due(start + Duration::from_millis(300)));
        // doubled to 400ms
        assert!(r.take_due(start + Duration::from_millis(700)));
        // clamped at 400ms
        assert!(r.take_due(start + Duration::from_millis(1100)));

        r.stop();
        assert!(r.stopped());
    }
}
