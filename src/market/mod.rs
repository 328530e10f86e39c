pub mod price_cache;
pub mod stream;
pub mod subscriptions;
pub mod types;
