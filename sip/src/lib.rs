//! SIP signaling transaction engine for the argus GB/T 28181 platform.
//!
//! The engine frames SIP messages on the wire, runs active (locally
//! originated) and passive (locally received) transactions to completion,
//! drives UDP retransmission with exponential backoff, pools TCP
//! connections, and dispatches matched messages to registered handler
//! chains. GB28181 message bodies, SDP and device-control encoders are
//! consumers of this crate, not part of it.
//!
//! ## Core components
//!
//! - **Message codec**: parse and serialize against a byte budget
//! - **Transaction registry**: keyed tables with a once-only completion gate
//! - **Transport drivers**: shared-socket UDP with resend sweeps, pooled TCP
//! - **Handler dispatch**: per-method interceptor chains

pub mod conn;
pub mod handler;
pub mod message;
pub mod server;
pub mod tcp;
pub mod transaction;
pub mod udp;

pub use conn::{Conn, TransportError, TransportType};
pub use handler::{
    Handlers, RequestContext, RequestHandler, ResponseContext, ResponseHandler,
};
pub use message::{Address, Credentials, Cseq, Message, MessageError, Method, Uri, Via};
pub use server::{CorrelationData, Destination, ServerConfig, SipServer};
pub use transaction::{Transaction, TxError, TxKey};
