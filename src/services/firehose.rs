// src/services/firehose.rs

//! Firehose subscription.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{Collection, StreamConfig};

/// Raw text frames from one connection. The stream ends, or yields an
/// error, when the connection is lost.
pub type MessageStream = BoxStream<'static, Result<String>>;

/// Source of raw firehose messages.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a subscription, resuming after `cursor` when given.
    async fn connect(&self, cursor: Option<i64>) -> Result<MessageStream>;
}

/// Jetstream WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct JetstreamSource {
    endpoint: Url,
    collections: Vec<Collection>,
}

impl JetstreamSource {
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)?;
        Ok(Self {
            endpoint,
            collections: config.subscribed(),
        })
    }

    /// Subscribe URL with `wantedCollections` and an optional resume cursor.
    pub fn subscribe_url(&self, cursor: Option<i64>) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            for collection in &self.collections {
                query.append_pair("wantedCollections", collection.nsid());
            }
            if let Some(cursor) = cursor {
                query.append_pair("cursor", &cursor.to_string());
            }
        }
        url
    }
}

#[async_trait]
impl EventSource for JetstreamSource {
    async fn connect(&self, cursor: Option<i64>) -> Result<MessageStream> {
        let url = self.subscribe_url(cursor);
        log::info!("Connecting to {url}");
        let (socket, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        log::debug!("Handshake complete ({})", response.status());

        let frames = socket.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => {
                    Some(String::from_utf8(bytes.to_vec()).map_err(AppError::decode))
                }
                Ok(Message::Close(frame)) => Some(Err(AppError::connection(format!(
                    "server closed the subscription: {frame:?}"
                )))),
                Ok(_) => None,
                Err(e) => Some(Err(AppError::WebSocket(e))),
            }
        });
        Ok(frames.boxed())
    }
}
