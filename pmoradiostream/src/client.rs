//! HTTP client for the radio stream and its status API

use crate::config::RadioStreamConfig;
use crate::error::{Error, Result};
use crate::status::{RadioStats, RadioStatus};
use futures::StreamExt;
use pmorelay::AudioByteStream;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, CONNECTION, USER_AGENT};
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// User-Agent sent to the status API
pub const STATUS_USER_AGENT: &str = "HiiZun-HitsTV-Bot/1.0";

/// Some stream servers reject non-browser clients
pub const STREAM_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Client for one radio station: its audio stream and its status endpoint.
///
/// ```no_run
/// # async fn demo() -> pmoradiostream::Result<()> {
/// let client = pmoradiostream::RadioClient::builder()
///     .stream_url("https://radio.example/stream")
///     .status_url("https://radio.example/api/status")
///     .build()?;
/// println!("Now playing: {}", client.current_song_title().await);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RadioClient {
    client: Client,
    stream_url: Url,
    status_url: Url,
    access_token: Option<String>,
    station_name: String,
    connect_timeout: Duration,
    status_timeout: Duration,
}

impl RadioClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn from_config(config: &RadioStreamConfig) -> Result<Self> {
        let mut builder = Self::builder()
            .stream_url(&config.stream_url)
            .status_url(&config.status_url)
            .station_name(&config.station_name)
            .connect_timeout(config.connect_timeout())
            .status_timeout(config.status_timeout());
        if let Some(token) = &config.access_token {
            builder = builder.access_token(token);
        }
        builder.build()
    }

    pub fn stream_url(&self) -> &Url {
        &self.stream_url
    }

    pub fn station_name(&self) -> &str {
        &self.station_name
    }

    fn stream_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(STREAM_USER_AGENT));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(ACCEPT, HeaderValue::from_static("audio/mpeg, audio/*"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers
    }

    /// Open the audio stream.
    ///
    /// Only the wait for response headers is bounded; the body is a live
    /// stream and stays open as long as the server sends it.
    pub async fn open_stream(&self) -> Result<Response> {
        debug!(url = %self.stream_url, "Opening radio stream");

        let request = self
            .client
            .get(self.stream_url.clone())
            .headers(Self::stream_headers())
            .send();

        let response = tokio::time::timeout(self.connect_timeout, request)
            .await
            .map_err(|_| Error::Timeout)??;

        if !response.status().is_success() {
            return Err(Error::Status {
                url: self.stream_url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    /// Adapt a stream response body to the relay's byte stream type.
    pub fn byte_stream(response: Response) -> AudioByteStream {
        response
            .bytes_stream()
            .map(|result| {
                result.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            })
            .boxed()
    }

    /// Fetch the status document, failing on any transport or HTTP error.
    pub async fn try_fetch_status(&self) -> Result<RadioStatus> {
        let mut request = self
            .client
            .get(self.status_url.clone())
            .header(USER_AGENT, STATUS_USER_AGENT)
            .timeout(self.status_timeout);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Status {
                url: self.status_url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    /// Fetch the status document, or a fallback document on failure.
    pub async fn fetch_status(&self) -> RadioStatus {
        match self.try_fetch_status().await {
            Ok(status) => {
                debug!("Radio status received");
                status
            }
            Err(err) => {
                warn!(url = %self.status_url, "Error fetching radio status: {}", err);
                RadioStatus::fallback(&self.station_name)
            }
        }
    }

    pub async fn detailed_stats(&self) -> RadioStats {
        self.fetch_status().await.stats(&self.station_name)
    }

    /// Title of the current song, or the station name when unknown.
    pub async fn current_song_title(&self) -> String {
        self.fetch_status()
            .await
            .song_title()
            .unwrap_or_else(|| self.station_name.clone())
    }
}

/// Builder for configuring a RadioClient
#[derive(Debug)]
pub struct ClientBuilder {
    client: Option<Client>,
    stream_url: String,
    status_url: String,
    access_token: Option<String>,
    station_name: String,
    connect_timeout: Duration,
    status_timeout: Duration,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        let defaults = RadioStreamConfig::default();
        Self {
            client: None,
            stream_url: defaults.stream_url.clone(),
            status_url: defaults.status_url.clone(),
            access_token: None,
            station_name: defaults.station_name.clone(),
            connect_timeout: defaults.connect_timeout(),
            status_timeout: defaults.status_timeout(),
        }
    }
}

impl ClientBuilder {
    /// Set a custom HTTP client
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = url.into();
        self
    }

    pub fn status_url(mut self, url: impl Into<String>) -> Self {
        self.status_url = url.into();
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn station_name(mut self, name: impl Into<String>) -> Self {
        self.station_name = name.into();
        self
    }

    /// Bound on the wait for the stream's response headers
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound on a whole status request
    pub fn status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<RadioClient> {
        let stream_url = Url::parse(&self.stream_url)?;
        let status_url = Url::parse(&self.status_url)?;

        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .connect_timeout(self.connect_timeout)
                .build()?,
        };

        Ok(RadioClient {
            client,
            stream_url,
            status_url,
            access_token: self.access_token,
            station_name: self.station_name,
            connect_timeout: self.connect_timeout,
            status_timeout: self.status_timeout,
        })
    }
}
