mod schema;
mod store;

pub use store::{ResultStore, StoreError};
