/// Hub connection session: wire frames, lifecycle state machine, driver
pub mod connection;
pub mod frames;
pub mod state;

pub use connection::{HubSession, InboundEvent};
pub use frames::{ClientFrame, ServerFrame};
pub use state::{BackoffPolicy, ConnectionState, SessionEvent, SessionFsm};
