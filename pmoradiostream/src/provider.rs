//! [`ResourceProvider`] backed by the radio HTTP stream.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use pmorelay::{AudioByteStream, AudioResource, ResourceProvider};
use reqwest::header::CONTENT_TYPE;
use std::io;
use tracing::{info, warn};

use crate::client::RadioClient;
use crate::config::RadioStreamConfig;
use crate::error::Result;

pub struct RadioStreamProvider {
    client: RadioClient,
    volume: f32,
}

impl RadioStreamProvider {
    pub fn new(client: RadioClient, volume: f32) -> Self {
        Self { client, volume }
    }

    pub fn from_config(config: &RadioStreamConfig) -> Result<Self> {
        Ok(Self::new(
            RadioClient::from_config(config)?,
            config.volume_level(),
        ))
    }

    pub fn client(&self) -> &RadioClient {
        &self.client
    }

    fn title(&self) -> String {
        format!("{} Stream", self.client.station_name())
    }

    /// Resource that opens the stream on first read.
    fn fallback_resource(&self) -> AudioResource {
        let client = self.client.clone();
        let stream: AudioByteStream = Box::pin(try_stream! {
            let response = client
                .open_stream()
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            let mut body = RadioClient::byte_stream(response);
            while let Some(chunk) = body.next().await {
                yield chunk?;
            }
        });

        AudioResource::new(self.title(), stream)
            .with_inline_volume(self.volume)
            .degraded()
    }
}

#[async_trait]
impl ResourceProvider for RadioStreamProvider {
    async fn acquire(&self) -> pmorelay::Result<AudioResource> {
        match self.client.open_stream().await {
            Ok(response) => {
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);

                let mut resource =
                    AudioResource::new(self.title(), RadioClient::byte_stream(response))
                        .with_inline_volume(self.volume);
                if let Some(content_type) = content_type {
                    resource = resource.with_content_type(content_type);
                }
                info!(url = %self.client.stream_url(), "Radio stream opened");
                Ok(resource)
            }
            Err(err) => {
                warn!(
                    url = %self.client.stream_url(),
                    "Error opening radio stream, falling back to lazy stream: {}",
                    err
                );
                Ok(self.fallback_resource())
            }
        }
    }
}
