//! Playable audio resources and the upstream provider seam.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::Result;

/// Byte stream carried by a resource.
pub type AudioByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Inline volume shared between a resource and whoever plays it.
///
/// The level is a linear gain in `[0.0, 1.0]`.
#[derive(Clone)]
pub struct VolumeHandle {
    bits: Arc<AtomicU32>,
}

impl VolumeHandle {
    pub fn new(level: f32) -> Self {
        Self {
            bits: Arc::new(AtomicU32::new(level.clamp(0.0, 1.0).to_bits())),
        }
    }

    pub fn set(&self, level: f32) {
        self.bits
            .store(level.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Map a percentage in `[0, 100]` onto the linear gain.
    pub fn set_percent(&self, percent: u8) {
        self.set(f32::from(percent.min(100)) / 100.0);
    }
}

impl fmt::Debug for VolumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VolumeHandle").field(&self.get()).finish()
    }
}

/// One playable unit of audio obtained from the upstream provider.
pub struct AudioResource {
    title: String,
    content_type: Option<String>,
    degraded: bool,
    volume: Option<VolumeHandle>,
    stream: AudioByteStream,
}

impl AudioResource {
    pub fn new(title: impl Into<String>, stream: AudioByteStream) -> Self {
        Self {
            title: title.into(),
            content_type: None,
            degraded: false,
            volume: None,
            stream,
        }
    }

    /// Resource built from an in-memory buffer.
    pub fn from_bytes(title: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let chunk: std::io::Result<Bytes> = Ok(data.into());
        Self::new(title, futures::stream::iter(vec![chunk]).boxed())
    }

    /// Enable inline volume control, starting at `level`.
    pub fn with_inline_volume(mut self, level: f32) -> Self {
        self.volume = Some(VolumeHandle::new(level));
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Mark the resource as a fallback produced after the primary fetch failed.
    pub fn degraded(mut self) -> Self {
        self.degraded = true;
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn volume(&self) -> Option<&VolumeHandle> {
        self.volume.as_ref()
    }

    /// Split the resource into its volume handle and byte stream.
    pub fn into_parts(self) -> (Option<VolumeHandle>, AudioByteStream) {
        (self.volume, self.stream)
    }
}

impl fmt::Debug for AudioResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioResource")
            .field("title", &self.title)
            .field("content_type", &self.content_type)
            .field("degraded", &self.degraded)
            .field("volume", &self.volume)
            .finish()
    }
}

/// Produces playable resources on demand.
///
/// Implementations may fail or hand back a degraded resource; the manager
/// plays whatever it receives. An acquisition must never block forever.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn acquire(&self) -> Result<AudioResource>;
}
