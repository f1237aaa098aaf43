//! `FieldHub` Daemon
//!
//! Server-side coordinator for a fleet of remote field telemetry
//! receivers. Receivers reach us over reverse ssh tunnels; everything
//! observed about them flows through an in-process topic-keyed bus from
//! the ingress sources (connection watcher, trusted stream, datagram
//! listeners) to the consumers (message recorder, state aggregator,
//! sync manager, status responder).

pub mod bus;
pub mod ingress;
pub mod message;
pub mod recorder;
pub mod registry;
pub mod status;
pub mod storage;
pub mod sync;
pub mod watcher;
