//! MongoDB client: idempotent DDL and the resumable change-stream watcher.

pub mod resume_tokens;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::options::{
    ChangeStreamOptions, ClientOptions, Credential, FullDocumentBeforeChangeType,
    FullDocumentType,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MongoConfig;
use crate::server::{MonitorError, NamedMonitor};
use resume_tokens::ResumeTokens;

const CLIENT_NAME: &str = "mongo";

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("could not encode resume token: {0}")]
    TokenEncode(#[from] bson::ser::Error),
    #[error("could not serialize change event: {0}")]
    EventEncode(#[from] serde_json::Error),
    #[error("unsupported auth mechanism `{0}`")]
    UnsupportedAuthMechanism(String),
    #[error("change event handler failed: {0}")]
    Handler(#[source] HandlerError),
    #[error("could not reach mongo: connection closed")]
    ClientDisconnected,
}

/// Callback invoked for every change event, before its resume token is
/// persisted. A returned error stops the watcher.
#[async_trait]
pub trait ChangeEventHandler: Send + Sync {
    async fn handle(&self, subject: &str, msg_id: &str, data: &[u8]) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateCollectionOptions {
    pub db_name: String,
    pub coll_name: String,
    pub capped: bool,
    pub size_in_bytes: i64,
    pub change_stream_pre_and_post_images: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchCollectionOptions {
    pub watched_db_name: String,
    pub watched_coll_name: String,
    pub resume_tokens_db_name: String,
    pub resume_tokens_coll_name: String,
    pub resume_tokens_coll_capped: bool,
    pub change_stream_pre_and_post_images: bool,
    pub stream_name: String,
}

/// MongoDB operations the connector relies on; the concrete [`Client`] talks
/// to a real deployment, tests substitute their own implementation.
#[async_trait]
pub trait MongoClient: NamedMonitor {
    async fn create_collection(&self, opts: &CreateCollectionOptions) -> Result<(), Error>;

    /// Tails the collection's change stream until cancellation or a
    /// non-recoverable error, invoking `handler` per event and persisting
    /// the event's resume token after the handler succeeds.
    async fn watch_collection(
        &self,
        opts: &WatchCollectionOptions,
        cancel: CancellationToken,
        handler: Arc<dyn ChangeEventHandler>,
    ) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}

pub struct Client {
    client: mongodb::Client,
    closed: AtomicBool,
}

impl Client {
    pub async fn connect(cfg: &MongoConfig) -> Result<Self, Error> {
        let mut options = ClientOptions::parse(&cfg.uri).await?;
        if let Some(mechanism) = cfg.auth_mechanism.as_deref() {
            let mechanism = parse_auth_mechanism(mechanism)?;
            match options.credential.as_mut() {
                Some(credential) => credential.mechanism = Some(mechanism),
                None => {
                    options.credential = Some(Credential::builder().mechanism(mechanism).build())
                }
            }
        }
        let client = mongodb::Client::with_options(options)?;

        // The driver connects lazily; ping so an unreachable deployment
        // fails startup instead of the first watcher.
        client.database("admin").run_command(doc! {"ping": 1}).await?;
        info!("connected to mongo");
        Ok(Self {
            client,
            closed: AtomicBool::new(false),
        })
    }

    async fn handle_event(
        tokens: &ResumeTokens,
        stream_name: &str,
        handler: &dyn ChangeEventHandler,
        event: &ChangeStreamEvent<Document>,
    ) -> Result<(), Error> {
        let msg_id = event_id(&event.id)?;
        let subject = format!("{}.{}", stream_name, operation_name(&event.operation_type));
        let data = serde_json::to_vec(event)?;

        handler.handle(&subject, &msg_id, &data).await.map_err(|e| {
            error!(error = %e, subject = %subject, "change event handler failed");
            Error::Handler(e)
        })?;

        tokens.persist(&msg_id, &event.id).await.map_err(|e| {
            error!(error = %e, "could not persist resume token");
            e
        })?;
        debug!(subject = %subject, msg_id = %msg_id, "handled change event");
        Ok(())
    }
}

#[async_trait]
impl NamedMonitor for Client {
    fn name(&self) -> &str {
        CLIENT_NAME
    }

    async fn monitor(&self) -> Result<(), MonitorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Box::new(Error::ClientDisconnected));
        }
        if let Err(e) = self.client.database("admin").run_command(doc! {"ping": 1}).await {
            debug!(error = %e, "mongo ping failed");
            return Err(Box::new(Error::ClientDisconnected));
        }
        Ok(())
    }
}

#[async_trait]
impl MongoClient for Client {
    async fn create_collection(&self, opts: &CreateCollectionOptions) -> Result<(), Error> {
        let db = self.client.database(&opts.db_name);

        let mut create_options = mongodb::options::CreateCollectionOptions::default();
        if opts.capped {
            create_options.capped = Some(true);
            create_options.size = Some(opts.size_in_bytes as u64);
        }
        match db
            .create_collection(opts.coll_name.as_str())
            .with_options(create_options)
            .await
        {
            Ok(()) => debug!(db = %opts.db_name, coll = %opts.coll_name, "created collection"),
            Err(e) if namespace_exists(&e) => {
                debug!(db = %opts.db_name, coll = %opts.coll_name, "collection already exists")
            }
            Err(e) => {
                error!(error = %e, db = %opts.db_name, coll = %opts.coll_name, "could not create collection");
                return Err(e.into());
            }
        }

        if opts.change_stream_pre_and_post_images {
            db.run_command(doc! {
                "collMod": &opts.coll_name,
                "changeStreamPreAndPostImages": doc! {"enabled": true},
            })
            .await?;
        }
        Ok(())
    }

    async fn watch_collection(
        &self,
        opts: &WatchCollectionOptions,
        cancel: CancellationToken,
        handler: Arc<dyn ChangeEventHandler>,
    ) -> Result<(), Error> {
        let watched = self
            .client
            .database(&opts.watched_db_name)
            .collection::<Document>(&opts.watched_coll_name);
        let tokens = ResumeTokens::new(
            &self.client,
            &opts.resume_tokens_db_name,
            &opts.resume_tokens_coll_name,
            opts.resume_tokens_coll_capped,
        );

        loop {
            // Resume from the last persisted token; absent one, from "now".
            let resume_after = tokens.last_token().await?;
            debug!(
                db = %opts.watched_db_name,
                coll = %opts.watched_coll_name,
                resume = resume_after.is_some(),
                "opening change stream"
            );

            let mut cs_options = ChangeStreamOptions::default();
            cs_options.resume_after = resume_after;
            if opts.change_stream_pre_and_post_images {
                cs_options.full_document = Some(FullDocumentType::WhenAvailable);
                cs_options.full_document_before_change =
                    Some(FullDocumentBeforeChangeType::WhenAvailable);
            }

            let mut stream = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = async { watched.watch().with_options(cs_options).await } => res?,
            };
            info!(db = %opts.watched_db_name, coll = %opts.watched_coll_name, "started watching collection");

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    next = stream.next() => next,
                };
                match next {
                    None => {
                        warn!(db = %opts.watched_db_name, coll = %opts.watched_coll_name, "change stream ended");
                        return Ok(());
                    }
                    Some(Err(e)) if is_resumable(&e) => {
                        warn!(error = %e, "resumable change stream error, reopening from last persisted token");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "change stream error");
                        return Err(e.into());
                    }
                    Some(Ok(event)) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            res = Self::handle_event(&tokens, &opts.stream_name, handler.as_ref(), &event) => res?,
                        }
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client.clone().shutdown().await;
        info!("disconnected from mongo");
        Ok(())
    }
}

fn parse_auth_mechanism(s: &str) -> Result<mongodb::options::AuthMechanism, Error> {
    use mongodb::options::AuthMechanism;
    match s {
        "SCRAM-SHA-1" => Ok(AuthMechanism::ScramSha1),
        "SCRAM-SHA-256" => Ok(AuthMechanism::ScramSha256),
        "MONGODB-X509" => Ok(AuthMechanism::MongoDbX509),
        "PLAIN" => Ok(AuthMechanism::Plain),
        other => Err(Error::UnsupportedAuthMechanism(other.to_string())),
    }
}

fn namespace_exists(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        mongodb::error::ErrorKind::Command(command_err) if command_err.code == 48
    )
}

fn is_resumable(err: &mongodb::error::Error) -> bool {
    err.contains_label("ResumableChangeStreamError")
}

/// Stable message id for an event: the `_data` payload of its resume token.
fn event_id(token: &ResumeToken) -> Result<String, Error> {
    let raw = bson::to_bson(token)?;
    if let Bson::Document(doc) = &raw {
        if let Ok(data) = doc.get_str("_data") {
            return Ok(data.to_string());
        }
    }
    // Unusual token shape, fall back to its canonical JSON form.
    Ok(raw.into_canonical_extjson().to_string())
}

fn operation_name(op: &OperationType) -> &str {
    match op {
        OperationType::Insert => "insert",
        OperationType::Update => "update",
        OperationType::Replace => "replace",
        OperationType::Delete => "delete",
        OperationType::Drop => "drop",
        OperationType::DropDatabase => "dropDatabase",
        OperationType::Rename => "rename",
        OperationType::Invalidate => "invalidate",
        OperationType::Other(name) => name,
        _ => "unknown",
    }
}
