//! Database and delivery-cache functionality

pub mod cache;
pub mod db;

// Re-exports for convenience
pub use cache::{fingerprint, CachedDelivery, DeliveryCache, NewDelivery};
pub use db::{create_pool, get_connection, DbConnection, DbPool};
