//! Persistent store façade: message log plus receiver registry.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::{LoggedMessage, Receiver};
