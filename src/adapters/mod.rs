pub mod imap;
pub mod queue;
pub mod sqlite;
