//! ferry-services: transport, discovery, reliability, sessions, and the
//! import/export runtimes built on them.

pub mod discovery;
pub mod export;
pub mod import;
pub mod reliability;
pub mod session;
pub mod storage;
pub mod transport;

pub use export::{ExportOutcome, Exporter};
pub use import::{ImportEvent, ImportHandle, ImportServer};
pub use session::{Decision, SessionKey, SessionReport, SessionState};
pub use storage::{FileStore, PayloadStore};
pub use transport::{Datagram, SharedTransport, UdpTransport};
