//! OCPP protocol layer
//!
//! Everything that understands OCPP itself lives here: the OCPP-J framing,
//! subprotocol negotiation, the per-version wire types, the adapters that
//! translate them to the canonical model and the dispatcher that routes
//! inbound CALLs to business handlers.
//!
//! # Architecture
//! - `wire`: positional JSON frames (CALL, CALLRESULT, CALLERROR)
//! - `version`: subprotocol negotiation, newest first
//! - `adapter`: one translator per protocol family, selected by table lookup
//! - `manager`: adapter routing, validation and diagnostic events
//! - `dispatcher` / `handlers`: canonical business logic for inbound CALLs

pub mod adapter;
pub mod canonical;
pub mod dispatcher;
pub mod handlers;
pub mod manager;
pub mod messages;
pub mod messages_v2;
pub mod version;
pub mod wire;

pub use adapter::{ConversionError, ProtocolAdapter};
pub use canonical::{InternalMessage, MessageKind};
pub use dispatcher::{ActionDispatcher, ActionHandler, CallContext};
pub use manager::{AdapterEvent, ProtocolAdapterManager};
pub use version::{OcppProtocol, VersionInfo, VersionNegotiator};
pub use wire::{ErrorCode, FrameError, OcppMessage};
