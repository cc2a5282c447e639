use crate::conn::{Conn, TransportType};
use crate::message::{Message, Method};
use crate::server::TaskSet;
use crate::transaction::{
    Registry, Transaction, TransactionError, TxError, TxKey,
};
use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Ordered per-method callback chains. Registration happens once at startup;
/// the set is not safe to mutate while traffic is flowing, which is why the
/// server takes it by value and freezes it behind an `Arc`.
#[derive(Default)]
pub struct Handlers {
    requests: HashMap<Method, Vec<Arc<dyn RequestHandler>>>,
    responses: HashMap<Method, Vec<Arc<dyn ResponseHandler>>>,
}

impl Handlers {
    pub fn new() -> Handlers {
        Handlers::default()
    }

    pub fn on_request(
        &mut self,
        method: Method,
        handler: impl RequestHandler + 'static,
    ) -> &mut Self {
        self.requests
            .entry(method)
            .or_default()
            .push(Arc::new(handler));
        self
    }

    pub fn on_response(
        &mut self,
        method: Method,
        handler: impl ResponseHandler + 'static,
    ) -> &mut Self {
        self.responses
            .entry(method)
            .or_default()
            .push(Arc::new(handler));
        self
    }

    pub fn request_chain(&self, method: &Method) -> Vec<Arc<dyn RequestHandler>> {
        self.requests.get(method).cloned().unwrap_or_default()
    }

    pub fn response_chain(&self, method: &Method) -> Vec<Arc<dyn ResponseHandler>> {
        self.responses.get(method).cloned().unwrap_or_default()
    }
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext) -> Result<()>;
}

#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle(&self, ctx: &mut ResponseContext) -> Result<()>;
}

/// Chain walker handed to request handlers. `next` runs the rest of the
/// chain, `response`/`respond` send a reply and cut it short, `change`
/// swaps in a different chain for redirect-style reprocessing.
pub struct RequestContext {
    pub tx: Arc<Transaction>,
    pub msg: Message,
    pub conn: Conn,
    chain: Vec<Arc<dyn RequestHandler>>,
    cursor: usize,
}

impl RequestContext {
    pub fn new(
        tx: Arc<Transaction>,
        msg: Message,
        conn: Conn,
        chain: Vec<Arc<dyn RequestHandler>>,
    ) -> RequestContext {
        RequestContext {
            tx,
            msg,
            conn,
            chain,
            cursor: 0,
        }
    }

    pub async fn next(&mut self) -> Result<()> {
        while self.cursor < self.chain.len() && !self.tx.is_finished() {
            let handler = self.chain[self.cursor].clone();
            self.cursor += 1;
            handler.handle(self).await?;
        }
        Ok(())
    }

    /// Sends a status-only reply built from the request.
    pub async fn response(&mut self, code: u16, status: &str) -> Result<()> {
        let resp = self.msg.reply(code, status);
        self.respond(resp).await
    }

    /// Serializes and sends `resp`, finishing the transaction through the
    /// single gate and truncating the remaining chain. On UDP the bytes are
    /// kept on the transaction for duplicate replay.
    pub async fn respond(&mut self, resp: Message) -> Result<()> {
        let bytes = resp.encode();
        if !self.tx.finish(TxError::Finished) {
            return Err(TransactionError::AlreadyFinished.into());
        }
        if self.conn.transport() == TransportType::Udp {
            self.tx.cache_response(bytes.clone());
        }
        self.cursor = self.chain.len();
        self.conn.send(&bytes).await?;
        Ok(())
    }

    /// Abandons the current chain and substitutes another; the walk resumes
    /// from the front of the new chain.
    pub fn change(&mut self, chain: Vec<Arc<dyn RequestHandler>>) {
        self.chain = chain;
        self.cursor = 0;
    }
}

pub struct ResponseContext {
    pub tx: Arc<Transaction>,
    pub msg: Message,
    chain: Vec<Arc<dyn ResponseHandler>>,
    cursor: usize,
}

impl ResponseContext {
    pub fn new(
        tx: Arc<Transaction>,
        msg: Message,
        chain: Vec<Arc<dyn ResponseHandler>>,
    ) -> ResponseContext {
        ResponseContext {
            tx,
            msg,
            chain,
            cursor: 0,
        }
    }

    pub async fn next(&mut self) -> Result<()> {
        while self.cursor < self.chain.len() {
            let handler = self.chain[self.cursor].clone();
            self.cursor += 1;
            handler.handle(self).await?;
        }
        Ok(())
    }

    /// Stops the remaining chain.
    pub fn finish(&mut self) {
        self.cursor = self.chain.len();
    }
}

/// Routes decoded messages into the transaction tables and runs the matching
/// chain on a fresh task. Both transport drivers feed this.
pub struct Dispatcher {
    handlers: Arc<Handlers>,
    tx_timeout: Duration,
    tasks: Arc<TaskSet>,
}

impl Dispatcher {
    pub fn new(
        handlers: Arc<Handlers>,
        tx_timeout: Duration,
        tasks: Arc<TaskSet>,
    ) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            handlers,
            tx_timeout,
            tasks,
        })
    }

    pub async fn route(
        &self,
        msg: Message,
        conn: Conn,
        active: &Arc<Registry>,
        passive: &Arc<Registry>,
    ) {
        let key = match TxKey::from_msg(&msg) {
            Ok(key) => key,
            Err(e) => {
                debug!("dropping unmatchable message: {e}");
                return;
            }
        };

        if msg.is_request() {
            self.route_request(key, msg, conn, passive).await;
        } else {
            self.route_response(key, msg, active).await;
        }
    }

    async fn route_request(
        &self,
        key: TxKey,
        msg: Message,
        conn: Conn,
        passive: &Arc<Registry>,
    ) {
        let deadline = Instant::now() + self.tx_timeout;
        let (tx, existed) = passive.get_or_insert(&key, || {
            Transaction::passive(key.clone(), conn.clone(), deadline)
        });

        if existed {
            // a retry: replay the cached reply when done, drop while a
            // handler run is still in flight
            if tx.is_finished() {
                if let Some(bytes) = tx.cached_response() {
                    if let Err(e) = conn.send(&bytes).await {
                        warn!(
                            "replaying response to {} failed: {e}",
                            conn.peer_addr()
                        );
                    }
                }
            }
            return;
        }

        if !tx.begin_handling() {
            return;
        }

        let chain = self.handlers.request_chain(&key.method);
        if chain.is_empty() {
            debug!("no request handler registered for {}", key.method);
            return;
        }

        // tracked so shutdown drains in-flight chains instead of
        // abandoning them
        self.tasks.spawn(async move {
            let mut ctx = RequestContext::new(tx, msg, conn, chain);
            let run = AssertUnwindSafe(async move { ctx.next().await })
                .catch_unwind()
                .await;
            match run {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("request handler chain failed: {e:?}"),
                Err(_) => error!("request handler chain panicked"),
            }
        });
    }

    async fn route_response(
        &self,
        key: TxKey,
        msg: Message,
        active: &Arc<Registry>,
    ) {
        let Some(tx) = active.get(&key) else {
            debug!("no transaction for response, dropping ({})", key);
            return;
        };

        let code = msg.code.unwrap_or(0);
        let chain = self.handlers.response_chain(&key.method);
        let provisional = code < 200;
        if provisional {
            tx.stop_retransmit();
        }

        let active = active.clone();
        self.tasks.spawn(async move {
            if !chain.is_empty() {
                let mut ctx = ResponseContext::new(tx.clone(), msg, chain);
                let run = AssertUnwindSafe(async move { ctx.next().await })
                    .catch_unwind()
                    .await;
                match run {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("response handler chain failed: {e:?}"),
                    Err(_) => error!("response handler chain panicked"),
                }
            }
            // only a final response concludes the transaction
            if !provisional {
                tx.finish(TxError::Finished);
                active.remove(&tx.key);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::Mutex;
    use tokio::net::UdpSocket;

    struct Trace {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        and_respond: bool,
    }

    #[async_trait]
    impl RequestHandler for Trace {
        async fn handle(&self, ctx: &mut RequestContext) -> Result<()> {
            self.log.lock().unwrap().push(self.label.to_string());
            if self.and_respond {
                ctx.response(200, "OK").await?;
            }
            Ok(())
        }
    }

    struct Swap {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RequestHandler for Swap {
        async fn handle(&self, ctx: &mut RequestContext) -> Result<()> {
            self.log.lock().unwrap().push("swap".to_string());
            ctx.change(vec![Arc::new(Trace {
                label: "substituted",
                log: self.log.clone(),
                and_respond: false,
            })]);
            Ok(())
        }
    }

    fn request() -> Message {
        Message::from_str(
            &[
                "MESSAGE sip:a@b SIP/2.0",
                "Via: SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKchain",
                "To: <sip:a@b>",
                "From: <sip:c@d>;tag=x",
                "Call-ID: chaincall",
                "CSeq: 1 MESSAGE",
                "Content-Length: 0",
                "",
                "",
            ]
            .join("\r\n"),
        )
        .unwrap()
    }

    async fn context(chain: Vec<Arc<dyn RequestHandler>>) -> RequestContext {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = socket.local_addr().unwrap();
        let conn = Conn::udp(socket, peer);
        let msg = request();
        let key = TxKey::from_msg(&msg).unwrap();
        let tx = Transaction::passive(
            key,
            conn.clone(),
            Instant::now() + Duration::from_secs(1),
        );
        RequestContext::new(tx, msg, conn, chain)
    }

    #[tokio::test]
    async fn chain_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn RequestHandler>> = vec![
            Arc::new(Trace {
                label: "one",
                log: log.clone(),
                and_respond: false,
            }),
            Arc::new(Trace {
                label: "two",
                log: log.clone(),
                and_respond: false,
            }),
        ];
        let mut ctx = context(chain).await;
        ctx.next().await.unwrap();
        assert_eq!(vec!["one", "two"], *log.lock().unwrap());
    }

    #[tokio::test]
    async fn response_truncates_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn RequestHandler>> = vec![
            Arc::new(Trace {
                label: "responder",
                log: log.clone(),
                and_respond: true,
            }),
            Arc::new(Trace {
                label: "unreached",
                log: log.clone(),
                and_respond: false,
            }),
        ];
        let mut ctx = context(chain).await;
        let tx = ctx.tx.clone();
        ctx.next().await.unwrap();
        assert_eq!(vec!["responder"], *log.lock().unwrap());
        assert!(tx.is_finished());
        assert_eq!(Some(TxError::Finished), tx.outcome());
        // the reply was cached for duplicate replay on UDP
        assert!(tx.cached_response().is_some());
    }

    #[tokio::test]
    async fn change_substitutes_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn RequestHandler>> = vec![
            Arc::new(Swap { log: log.clone() }),
            Arc::new(Trace {
                label: "abandoned",
                log: log.clone(),
                and_respond: false,
            }),
        ];
        let mut ctx = context(chain).await;
        ctx.next().await.unwrap();
        assert_eq!(vec!["swap", "substituted"], *log.lock().unwrap());
    }

    #[tokio::test]
    async fn second_response_is_rejected() {
        let mut ctx = context(vec![]).await;
        ctx.response(200, "OK").await.unwrap();
        assert!(ctx.response(486, "Busy Here").await.is_err());
    }
}
