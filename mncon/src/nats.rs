//! NATS JetStream client used to republish change events.

use std::sync::atomic::{AtomicBool, Ordering};

use async_nats::connection::State;
use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::NatsConfig;
use crate::server::{MonitorError, NamedMonitor};

const CLIENT_NAME: &str = "nats";

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not connect to nats: {0}")]
    Connect(#[from] async_nats::ConnectError),
    #[error("could not read nats credentials: {0}")]
    Credentials(#[from] std::io::Error),
    #[error("could not add nats stream: {0}")]
    AddStream(#[from] jetstream::context::CreateStreamError),
    #[error("could not publish message: {0}")]
    Publish(#[from] jetstream::context::PublishError),
    #[error("could not drain nats connection: {0}")]
    Drain(#[from] async_nats::client::DrainError),
    #[error("could not reach nats: connection closed")]
    ClientDisconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddStreamOptions {
    pub stream_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub subject: String,
    pub msg_id: String,
    pub data: Vec<u8>,
}

/// NATS operations the connector relies on; the concrete [`Client`] talks to
/// a real server, tests substitute their own implementation.
#[async_trait]
pub trait NatsClient: NamedMonitor {
    async fn add_stream(&self, opts: &AddStreamOptions) -> Result<(), Error>;
    async fn publish(&self, opts: &PublishOptions) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
}

pub struct Client {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    closed: AtomicBool,
}

impl Client {
    pub async fn connect(cfg: &NatsConfig) -> Result<Self, Error> {
        let mut opts = async_nats::ConnectOptions::new();
        if let Some(path) = &cfg.credentials {
            opts = opts.credentials_file(path).await?;
        }
        if let (Some(user), Some(password)) = (&cfg.user, &cfg.password) {
            opts = opts.user_and_password(user.clone(), password.clone());
        }
        if let Some(token) = &cfg.token {
            opts = opts.token(token.clone());
        }
        let opts = opts.event_callback(|event| async move {
            match event {
                async_nats::Event::Disconnected => error!("disconnected from nats"),
                async_nats::Event::Connected => info!("reconnected to nats"),
                async_nats::Event::Closed => info!("nats connection closed"),
                other => debug!(event = %other, "nats connection event"),
            }
        });

        let client = opts.connect(&cfg.url).await?;
        let jetstream = jetstream::new(client.clone());
        info!(url = %cfg.url, "connected to nats");
        Ok(Self {
            client,
            jetstream,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl NamedMonitor for Client {
    fn name(&self) -> &str {
        CLIENT_NAME
    }

    async fn monitor(&self) -> Result<(), MonitorError> {
        if self.closed.load(Ordering::SeqCst)
            || matches!(self.client.connection_state(), State::Disconnected)
        {
            return Err(Box::new(Error::ClientDisconnected));
        }
        Ok(())
    }
}

#[async_trait]
impl NatsClient for Client {
    async fn add_stream(&self, opts: &AddStreamOptions) -> Result<(), Error> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: opts.stream_name.clone(),
                subjects: subjects_for(&opts.stream_name),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await?;
        debug!(stream_name = %opts.stream_name, "added nats stream");
        Ok(())
    }

    async fn publish(&self, opts: &PublishOptions) -> Result<(), Error> {
        let publish = jetstream::context::Publish::build()
            .message_id(&opts.msg_id)
            .payload(Bytes::from(opts.data.clone()));
        let ack = self
            .jetstream
            .send_publish(opts.subject.clone(), publish)
            .await?;
        ack.await?;
        debug!(subject = %opts.subject, msg_id = %opts.msg_id, "published message");
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client.drain().await?;
        info!("nats connection closed");
        Ok(())
    }
}

/// Streams carry every operation suffix under the stream's own prefix.
fn subjects_for(stream_name: &str) -> Vec<String> {
    vec![format!("{stream_name}.*")]
}
