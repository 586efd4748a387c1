//! Browser Protocol Session - Rust Implementation
//!
//! A multiplexed request/response + event session over one connection to a
//! browser speaking the DevTools or WebDriver BiDi JSON protocol.
//!
//! # Architecture
//!
//! 1. **One reader**: a single dispatch task owns the transport's read half
//! 2. **Match by id, never by order**: any number of callers may have
//!    commands in flight, and responses may arrive in any order
//! 3. **Events never block commands**: responses resolve on the reader,
//!    subscription handlers run on a separate event task
//! 4. **Fail fast**: close fails everything outstanding at once; there is
//!    no retry or reconnect
//!
//! ```no_run
//! use protocol::{Session, SessionConfig};
//! use serde_json::{json, Value};
//!
//! # async fn demo() -> protocol::Result<()> {
//! let session = Session::connect("ws://localhost:9222/devtools/browser", SessionConfig::default()).await?;
//! let version: Value = session.send("Browser.getVersion", json!({})).await?;
//! println!("{}", version["product"]);
//! session.close("done").await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
mod dispatch;
pub mod error;
pub mod events;
pub mod pending;
pub mod router;
pub mod session;
pub mod target;
pub mod transport;

pub use codec::{Command, CommandId, RemoteError, SessionId};
pub use config::{SendOptions, SessionConfig};
pub use error::{CloseReason, Error, Result, TransportError};
pub use events::LifecycleEvent;
pub use router::SubscriptionHandle;
pub use session::{Session, SessionState, WeakSession};
pub use target::TargetSession;
pub use transport::{Frame, MemoryPeer, MemoryTransport, Transport, WebSocketTransport};
