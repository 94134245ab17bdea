//! Infrastructure wiring: product store, producer, dispatcher, feedback consumer.
//!
//! Selected once at startup from `AppConfig`:
//! - in-memory store + in-memory bus (dev/test, default)
//! - Postgres store + Redis Streams bus (`USE_PERSISTENT_STORES=true`)

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use catalogflow_events::{InMemoryBus, MessageConsumer, MessageProducer};
use catalogflow_infra::{
    AppConfig, MessagePublisher, OutboundDispatcher,
    product_store::{InMemoryProductStore, ProductStore},
    workers::{FeedbackConsumer, FeedbackConsumerConfig, FeedbackConsumerHandle, FeedbackStats},
};
#[cfg(feature = "redis")]
use catalogflow_infra::{
    event_bus::{ProducerSettings, RedisStreamsConsumer, RedisStreamsProducer},
    product_store::PostgresProductStore,
};
#[cfg(feature = "redis")]
use sqlx::PgPool;

/// Drain bound for in-flight messages at shutdown.
pub const PUBLISHER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub type SharedStore = Arc<dyn ProductStore>;
pub type SharedProducer = Arc<dyn MessageProducer>;
pub type Publisher = MessagePublisher<SharedProducer>;
pub type Dispatcher = OutboundDispatcher<SharedStore, SharedProducer>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    InMemory,
    Persistent,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::InMemory => "in_memory",
            Backend::Persistent => "persistent",
        }
    }
}

/// Process-wide services shared by every request.
pub struct AppServices {
    pub backend: Backend,
    pub dispatcher: Arc<Dispatcher>,
    pub publisher: Arc<Publisher>,
    feedback: Mutex<Option<FeedbackConsumerHandle>>,
}

impl AppServices {
    /// Wire the services around an existing store and producer.
    ///
    /// `consumer` is `None` when the feedback subscription could not be set
    /// up; dispatch keeps working without it.
    pub fn assemble<C>(
        backend: Backend,
        config: &AppConfig,
        store: SharedStore,
        producer: SharedProducer,
        consumer: Option<C>,
        cancel: CancellationToken,
    ) -> Self
    where
        C: MessageConsumer + 'static,
    {
        let publisher = Arc::new(MessagePublisher::new(
            producer,
            config.product_events_topic.clone(),
        ));
        let dispatcher = Arc::new(
            OutboundDispatcher::new(Arc::clone(&store), Arc::clone(&publisher))
                .with_inter_item_delay(config.dispatch_delay),
        );

        let feedback = consumer.map(|consumer| {
            FeedbackConsumer::new(consumer, store)
                .with_config(
                    FeedbackConsumerConfig::default().with_name(config.feedback_consumer_name.clone()),
                )
                .spawn(cancel)
        });

        Self {
            backend,
            dispatcher,
            publisher,
            feedback: Mutex::new(feedback),
        }
    }

    /// Feedback consumer state for health reporting.
    pub fn feedback_status(&self) -> (&'static str, Option<FeedbackStats>) {
        let guard = self.feedback.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            None => ("unavailable", None),
            Some(handle) if handle.is_finished() => ("stopped", Some(handle.stats())),
            Some(handle) => ("running", Some(handle.stats())),
        }
    }

    /// Stop the feedback consumer, then drain and close the producer.
    pub async fn shutdown(&self) {
        let handle = self
            .feedback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.publisher.shutdown(PUBLISHER_SHUTDOWN_TIMEOUT).await;
    }
}

pub async fn build_services(
    config: &AppConfig,
    cancel: CancellationToken,
) -> anyhow::Result<AppServices> {
    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config, cancel).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
            );
        }
    }

    Ok(build_in_memory_services(
        config,
        InMemoryProductStore::new(),
        Arc::new(InMemoryBus::new()),
        cancel,
    ))
}

/// In-memory wiring (dev/test): store + bus + feedback consumer on the bus.
pub fn build_in_memory_services(
    config: &AppConfig,
    store: InMemoryProductStore,
    bus: Arc<InMemoryBus>,
    cancel: CancellationToken,
) -> AppServices {
    let consumer = bus.consumer(config.feedback_topic.clone(), config.feedback_group.clone());
    AppServices::assemble(
        Backend::InMemory,
        config,
        Arc::new(store),
        bus,
        Some(consumer),
        cancel,
    )
}

#[cfg(feature = "redis")]
async fn build_persistent_services(
    config: &AppConfig,
    cancel: CancellationToken,
) -> anyhow::Result<AppServices> {
    use anyhow::Context;

    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresProductStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to prepare products schema")?;

    let producer = RedisStreamsProducer::connect(&config.bus_url, ProducerSettings::default())
        .await
        .context("failed to connect message producer")?;

    let consumer = match RedisStreamsConsumer::connect(
        &config.bus_url,
        config.feedback_topic.clone(),
        config.feedback_group.clone(),
        config.feedback_consumer_name.clone(),
    )
    .await
    {
        Ok(consumer) => Some(consumer),
        Err(err) => {
            tracing::error!(error = %err, "feedback consumer unavailable; dispatch keeps serving");
            None
        }
    };

    Ok(AppServices::assemble(
        Backend::Persistent,
        config,
        Arc::new(store),
        Arc::new(producer),
        consumer,
        cancel,
    ))
}
