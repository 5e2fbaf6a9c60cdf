pub mod mailboxes;
pub mod pool;
pub mod schema;
pub mod status;

pub use pool::{create_pool, DbPool};
pub use status::{Counter, StatusStore};
