// coedit-peer: client side of a collaborative editing session.
//
// A peer registers with the signaling relay, negotiates a direct channel
// with one remote peer and keeps a shared CRDT document converged over it.

pub mod config;
pub mod crdt;
pub mod error;
pub mod node;
pub mod relay_client;
pub mod session;
pub mod sync;
pub mod transport;

pub use config::PeerConfig;
pub use crdt::{CrdtDocument, YrsDocument};
pub use error::{CrdtError, SessionError, SyncError};
pub use node::{PeerEvent, PeerNode, PeerNotification};
pub use relay_client::{RelayConnectionManager, RelayEvent, WsSignalTransport};
pub use session::{PeerSessionController, SessionState};
pub use sync::{DebounceConfig, SyncManager};
pub use transport::{DataChannel, PeerTransport, TransportEvent, TransportState};
