//! conclave-gateway: JSON control plane for conclave sessions
//!
//! Maps `method` + `params` requests onto sessions, agents and mailboxes, and
//! fans runtime events out to any number of observers. The transport carrying
//! the JSON (WebSocket, stdio, HTTP) is up to the embedder.

pub mod control;
pub mod events;
pub mod protocol;

pub use control::ControlPlane;
pub use events::EventBus;
pub use protocol::{GatewayError, GatewayEvent, GatewayRequest, GatewayResponse};
