//! Supervisor wiring collection watchers, the health server, and shutdown.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Settings;
use crate::mongo::{
    self, ChangeEventHandler, CreateCollectionOptions, HandlerError, MongoClient,
    WatchCollectionOptions,
};
use crate::nats::{self, AddStreamOptions, NatsClient, PublishOptions};
use crate::server::{self, NamedMonitor, Server};

#[derive(Debug, Error)]
pub enum Error {
    #[error("mongodb client error: {0}")]
    Mongo(#[from] mongo::Error),
    #[error("nats client error: {0}")]
    Nats(#[from] nats::Error),
    #[error("server error: {0}")]
    Server(#[from] server::Error),
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// True when `run` ended through the health server's clean-close
    /// sentinel, i.e. an orderly shutdown rather than a failure.
    pub fn is_server_closed(&self) -> bool {
        matches!(self, Self::Server(server::Error::Closed))
    }
}

/// The watcher's change-event handler: republish on the bus, with the
/// event id as the deduplication id.
struct EventPublisher {
    nats: Arc<dyn NatsClient>,
}

#[async_trait::async_trait]
impl ChangeEventHandler for EventPublisher {
    async fn handle(&self, subject: &str, msg_id: &str, data: &[u8]) -> Result<(), HandlerError> {
        self.nats
            .publish(&PublishOptions {
                subject: subject.to_string(),
                msg_id: msg_id.to_string(),
                data: data.to_vec(),
            })
            .await
            .map_err(|e| -> HandlerError { Box::new(e) })
    }
}

/// Supervisor for the MongoDB-to-NATS connector.
///
/// Owns both clients and the health server, runs one watcher task per
/// configured collection, and ties every task to a single cancellation
/// token: the first task to fail cancels the rest.
pub struct Connector {
    settings: Settings,
    mongo: Arc<dyn MongoClient>,
    nats: Arc<dyn NatsClient>,
    server: Arc<Server>,
    cancel: CancellationToken,
}

impl Connector {
    /// Connects both clients up front; either failure aborts before any
    /// watcher exists.
    pub async fn new(settings: Settings) -> Result<Self, Error> {
        let mongo = Arc::new(mongo::Client::connect(&settings.mongo).await?);
        let nats = Arc::new(nats::Client::connect(&settings.nats).await?);
        Ok(Self::with_clients(
            settings,
            mongo,
            nats,
            CancellationToken::new(),
        ))
    }

    fn with_clients<M, N>(
        settings: Settings,
        mongo: Arc<M>,
        nats: Arc<N>,
        cancel: CancellationToken,
    ) -> Self
    where
        M: MongoClient + 'static,
        N: NatsClient + 'static,
    {
        let monitors: Vec<Arc<dyn NamedMonitor>> = vec![
            mongo.clone() as Arc<dyn NamedMonitor>,
            nats.clone() as Arc<dyn NamedMonitor>,
        ];
        let server = Arc::new(Server::new(settings.server_addr.clone(), monitors));
        Self {
            settings,
            mongo,
            nats,
            server,
            cancel,
        }
    }

    /// Token observed by every connector task. Cancelling it triggers the
    /// same orderly shutdown as SIGINT/SIGTERM.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the connector until cancellation or the first task failure.
    ///
    /// Bootstraps every configured collection (watched collection, then token
    /// sidecar, then bus stream) before any watcher starts, then
    /// supervises the watcher tasks plus the health server. On the way out
    /// both clients are closed and the signal handler is released; close
    /// errors are logged, never returned.
    pub async fn run(&self) -> Result<(), Error> {
        let signals = self.spawn_signal_handler();
        let result = self.serve().await;
        self.cleanup().await;
        signals.abort();
        result
    }

    async fn serve(&self) -> Result<(), Error> {
        for coll in self.settings.collections() {
            self.mongo
                .create_collection(&CreateCollectionOptions {
                    db_name: coll.db_name.clone(),
                    coll_name: coll.coll_name.clone(),
                    capped: false,
                    size_in_bytes: 0,
                    change_stream_pre_and_post_images: coll.change_stream_pre_and_post_images,
                })
                .await?;
            self.mongo
                .create_collection(&CreateCollectionOptions {
                    db_name: coll.tokens_db_name.clone(),
                    coll_name: coll.tokens_coll_name.clone(),
                    capped: coll.tokens_coll_capped,
                    size_in_bytes: coll.tokens_coll_size_in_bytes,
                    change_stream_pre_and_post_images: false,
                })
                .await?;
            self.nats
                .add_stream(&AddStreamOptions {
                    stream_name: coll.stream_name.clone(),
                })
                .await?;
        }

        let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();
        let handler: Arc<dyn ChangeEventHandler> = Arc::new(EventPublisher {
            nats: self.nats.clone(),
        });

        for coll in self.settings.collections() {
            info!(db = %coll.db_name, coll = %coll.coll_name, "starting watcher");
            let opts = WatchCollectionOptions {
                watched_db_name: coll.db_name.clone(),
                watched_coll_name: coll.coll_name.clone(),
                resume_tokens_db_name: coll.tokens_db_name.clone(),
                resume_tokens_coll_name: coll.tokens_coll_name.clone(),
                resume_tokens_coll_capped: coll.tokens_coll_capped,
                change_stream_pre_and_post_images: coll.change_stream_pre_and_post_images,
                stream_name: coll.stream_name.clone(),
            };
            let mongo = self.mongo.clone();
            let cancel = self.cancel.clone();
            let handler = handler.clone();
            tasks.spawn(async move {
                mongo
                    .watch_collection(&opts, cancel, handler)
                    .await
                    .map_err(Error::from)
            });
        }

        let server = self.server.clone();
        tasks.spawn(async move { server.run().await.map_err(Error::from) });

        let server = self.server.clone();
        let cancel = self.cancel.clone();
        tasks.spawn(async move {
            cancel.cancelled().await;
            server.close();
            Ok(())
        });

        info!("connector started");

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(Error::Task(e)));
            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                }
                self.cancel.cancel();
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn cleanup(&self) {
        if let Err(e) = self.mongo.close().await {
            error!(error = %e, "could not close mongo client");
        }
        if let Err(e) = self.nats.close().await {
            error!(error = %e, "could not close nats client");
        }
    }

    fn spawn_signal_handler(&self) -> tokio::task::JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if wait_for_termination_signal(&cancel).await {
                info!("received termination signal, shutting down");
                cancel.cancel();
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal(cancel: &CancellationToken) -> bool {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!(error = %e, "could not register SIGTERM handler");
            cancel.cancelled().await;
            return false;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = terminate.recv() => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::config::{
        CollectionConfig, ConnectorConfig, LogConfig, MongoConfig, NatsConfig, ServerConfig,
    };
    use crate::server::MonitorError;

    #[derive(Default)]
    struct MockMongo {
        create_collection_err: bool,
        watch_collection_err: bool,
        create_collection_opts: Mutex<Vec<CreateCollectionOptions>>,
        watch_collection_opts: Mutex<Vec<WatchCollectionOptions>>,
        closed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl NamedMonitor for MockMongo {
        fn name(&self) -> &str {
            "mongo"
        }

        async fn monitor(&self) -> Result<(), MonitorError> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl MongoClient for MockMongo {
        async fn create_collection(
            &self,
            opts: &CreateCollectionOptions,
        ) -> Result<(), mongo::Error> {
            if self.create_collection_err {
                return Err(mongo::Error::ClientDisconnected);
            }
            self.create_collection_opts.lock().unwrap().push(opts.clone());
            Ok(())
        }

        async fn watch_collection(
            &self,
            opts: &WatchCollectionOptions,
            cancel: CancellationToken,
            _handler: Arc<dyn ChangeEventHandler>,
        ) -> Result<(), mongo::Error> {
            self.watch_collection_opts.lock().unwrap().push(opts.clone());
            if self.watch_collection_err {
                return Err(mongo::Error::ClientDisconnected);
            }
            cancel.cancelled().await;
            Ok(())
        }

        async fn close(&self) -> Result<(), mongo::Error> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockNats {
        add_stream_err: bool,
        publish_err: bool,
        add_stream_opts: Mutex<Vec<AddStreamOptions>>,
        publish_opts: Mutex<Vec<PublishOptions>>,
        closed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl NamedMonitor for MockNats {
        fn name(&self) -> &str {
            "nats"
        }

        async fn monitor(&self) -> Result<(), MonitorError> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl NatsClient for MockNats {
        async fn add_stream(&self, opts: &AddStreamOptions) -> Result<(), nats::Error> {
            if self.add_stream_err {
                return Err(nats::Error::ClientDisconnected);
            }
            self.add_stream_opts.lock().unwrap().push(opts.clone());
            Ok(())
        }

        async fn publish(&self, opts: &PublishOptions) -> Result<(), nats::Error> {
            if self.publish_err {
                return Err(nats::Error::ClientDisconnected);
            }
            self.publish_opts.lock().unwrap().push(opts.clone());
            Ok(())
        }

        async fn close(&self) -> Result<(), nats::Error> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_settings(collections: Vec<CollectionConfig>) -> Settings {
        Settings::new(ConnectorConfig {
            log: LogConfig::default(),
            mongo: MongoConfig {
                uri: "mongodb://127.0.0.1:27017".to_string(),
                auth_mechanism: None,
            },
            nats: NatsConfig {
                url: "nats://127.0.0.1:4222".to_string(),
                credentials: None,
                user: None,
                password: None,
                token: None,
            },
            server: ServerConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            collections,
        })
        .unwrap()
    }

    fn coll1_config() -> CollectionConfig {
        CollectionConfig {
            db_name: "connector-db".to_string(),
            coll_name: "coll1".to_string(),
            change_stream_pre_and_post_images: true,
            tokens_db_name: Some("tokens-db".to_string()),
            tokens_coll_name: Some("coll1-tokens".to_string()),
            tokens_coll_capped: true,
            tokens_coll_size_in_bytes: 2048,
            stream_name: Some("coll1-stream".to_string()),
        }
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn bootstraps_collections_and_stream_before_watching() {
        let mongo = Arc::new(MockMongo::default());
        let nats = Arc::new(MockNats::default());
        let cancel = CancellationToken::new();
        let connector = Connector::with_clients(
            test_settings(vec![coll1_config()]),
            mongo.clone(),
            nats.clone(),
            cancel.clone(),
        );

        let run = tokio::spawn(async move { connector.run().await });

        eventually(|| !mongo.watch_collection_opts.lock().unwrap().is_empty()).await;

        assert_eq!(
            *mongo.create_collection_opts.lock().unwrap(),
            vec![
                CreateCollectionOptions {
                    db_name: "connector-db".to_string(),
                    coll_name: "coll1".to_string(),
                    capped: false,
                    size_in_bytes: 0,
                    change_stream_pre_and_post_images: true,
                },
                CreateCollectionOptions {
                    db_name: "tokens-db".to_string(),
                    coll_name: "coll1-tokens".to_string(),
                    capped: true,
                    size_in_bytes: 2048,
                    change_stream_pre_and_post_images: false,
                },
            ]
        );
        assert_eq!(
            *nats.add_stream_opts.lock().unwrap(),
            vec![AddStreamOptions {
                stream_name: "coll1-stream".to_string(),
            }]
        );
        assert_eq!(
            *mongo.watch_collection_opts.lock().unwrap(),
            vec![WatchCollectionOptions {
                watched_db_name: "connector-db".to_string(),
                watched_coll_name: "coll1".to_string(),
                resume_tokens_db_name: "tokens-db".to_string(),
                resume_tokens_coll_name: "coll1-tokens".to_string(),
                resume_tokens_coll_capped: true,
                change_stream_pre_and_post_images: true,
                stream_name: "coll1-stream".to_string(),
            }]
        );

        cancel.cancel();
        let err = run.await.unwrap().unwrap_err();
        assert!(err.is_server_closed(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn collection_creation_failure_aborts_before_any_watcher() {
        let mongo = Arc::new(MockMongo {
            create_collection_err: true,
            ..Default::default()
        });
        let nats = Arc::new(MockNats::default());
        let connector = Connector::with_clients(
            test_settings(vec![coll1_config()]),
            mongo.clone(),
            nats.clone(),
            CancellationToken::new(),
        );

        let err = connector.run().await.unwrap_err();

        assert!(matches!(err, Error::Mongo(mongo::Error::ClientDisconnected)));
        assert!(mongo.watch_collection_opts.lock().unwrap().is_empty());
        assert!(mongo.closed.load(Ordering::SeqCst));
        assert!(nats.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stream_add_failure_aborts_before_any_watcher() {
        let mongo = Arc::new(MockMongo::default());
        let nats = Arc::new(MockNats {
            add_stream_err: true,
            ..Default::default()
        });
        let connector = Connector::with_clients(
            test_settings(vec![coll1_config()]),
            mongo.clone(),
            nats.clone(),
            CancellationToken::new(),
        );

        let err = connector.run().await.unwrap_err();

        assert!(matches!(err, Error::Nats(nats::Error::ClientDisconnected)));
        assert!(mongo.watch_collection_opts.lock().unwrap().is_empty());
        assert!(mongo.closed.load(Ordering::SeqCst));
        assert!(nats.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancellation_shuts_everything_down_and_closes_clients() {
        let mongo = Arc::new(MockMongo::default());
        let nats = Arc::new(MockNats::default());
        let cancel = CancellationToken::new();
        let connector = Connector::with_clients(
            test_settings(vec![coll1_config()]),
            mongo.clone(),
            nats.clone(),
            cancel.clone(),
        );

        let run = tokio::spawn(async move { connector.run().await });
        eventually(|| !mongo.watch_collection_opts.lock().unwrap().is_empty()).await;

        cancel.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run did not return after cancellation")
            .unwrap()
            .unwrap_err();

        assert!(err.is_server_closed(), "unexpected error: {err}");
        assert!(mongo.closed.load(Ordering::SeqCst));
        assert!(nats.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn watcher_failure_cancels_the_group() {
        let mongo = Arc::new(MockMongo {
            watch_collection_err: true,
            ..Default::default()
        });
        let nats = Arc::new(MockNats::default());
        let connector = Connector::with_clients(
            test_settings(vec![coll1_config()]),
            mongo.clone(),
            nats.clone(),
            CancellationToken::new(),
        );

        let err = tokio::time::timeout(Duration::from_secs(5), connector.run())
            .await
            .expect("run did not return after watcher failure")
            .unwrap_err();

        assert!(matches!(err, Error::Mongo(mongo::Error::ClientDisconnected)));
        assert!(mongo.closed.load(Ordering::SeqCst));
        assert!(nats.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn event_publisher_passes_the_event_id_as_dedup_id() {
        let nats = Arc::new(MockNats::default());
        let publisher = EventPublisher { nats: nats.clone() };

        publisher
            .handle("coll1-stream.insert", "event-1", b"{}")
            .await
            .unwrap();

        assert_eq!(
            *nats.publish_opts.lock().unwrap(),
            vec![PublishOptions {
                subject: "coll1-stream.insert".to_string(),
                msg_id: "event-1".to_string(),
                data: b"{}".to_vec(),
            }]
        );
    }

    #[tokio::test]
    async fn event_publisher_surfaces_publish_failures() {
        let nats = Arc::new(MockNats {
            publish_err: true,
            ..Default::default()
        });
        let publisher = EventPublisher { nats: nats.clone() };

        let err = publisher
            .handle("coll1-stream.insert", "event-1", b"{}")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("connection closed"));
        assert!(nats.publish_opts.lock().unwrap().is_empty());
    }
}
