//! Store access: schema management and the repo registry.

pub mod registry;
pub mod schema;
