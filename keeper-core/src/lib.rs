pub mod config;
pub mod context;
pub mod db;
pub mod events;
pub mod kafka;
pub mod models;
pub mod schema;
pub mod search;
pub mod store;

pub use config::Config;
pub use context::KeeperContext;
pub use db::DbPool;
pub use kafka::{EventConsumer, EventProducer};
pub use search::SearchClient;
