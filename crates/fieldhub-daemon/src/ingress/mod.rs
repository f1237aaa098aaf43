//! Ingress sources: everything that turns bytes from outside into bus
//! messages.

pub mod dgram;
pub mod line;
pub mod stream;

pub use dgram::spawn_dgram;
pub use line::{LineReader, MAX_LINE};
pub use stream::spawn_trusted_stream;
