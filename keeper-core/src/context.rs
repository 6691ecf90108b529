use std::sync::Arc;

use crate::config::Config;
use crate::db::{create_pool, DbPool};
use crate::kafka::{create_consumer, create_producer, EventConsumer, EventProducer};
use crate::search::SearchClient;

/// Process-scoped handles, initialized once during startup and passed
/// explicitly to every component. Cloning is cheap; everything inside is
/// reference counted.
#[derive(Clone)]
pub struct KeeperContext {
    pub config: Arc<Config>,
    pub db_pool: Arc<DbPool>,
    pub producer: EventProducer,
    pub search: Arc<SearchClient>,
}

impl KeeperContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db_pool = create_pool(&config.database).await?;
        let producer = create_producer(&config.kafka)?;
        let search = Arc::new(SearchClient::new(&config.search)?);

        Ok(KeeperContext {
            config: Arc::new(config),
            db_pool,
            producer,
            search,
        })
    }

    pub fn create_consumer(&self, group_id: &str) -> anyhow::Result<EventConsumer> {
        create_consumer(&self.config.kafka, group_id)
    }
}
