//! Client core for the collaborative retro board.
//!
//! [`controller::RetroController`] owns one participant's view of a session:
//! it subscribes to card, vote and session changes through an
//! [`transport::EventTransport`], writes through a [`store::RecordStore`], and
//! reports to presentation with [`controller::ClientEvent`]s.

pub mod board;
pub mod controller;
pub mod error;
pub mod ledger;
pub mod state;
pub mod store;
pub mod timer;
pub mod transport;
pub mod ws_transport;

pub use controller::{ClientEvent, ControllerConfig, RetroController};
pub use error::{RetroError, StoreError};
pub use store::{HttpRecordStore, RecordStore};
pub use transport::{ConnectionStatus, EventTransport, LocalEventTransport};
pub use ws_transport::{WsEventTransport, WsTransportConfig};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
