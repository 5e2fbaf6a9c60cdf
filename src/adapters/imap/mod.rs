pub mod connection;
pub mod envelopes;
pub mod idle;

pub use connection::{connect, ImapConnection};
pub use idle::IdleOutcome;
