//! Radio status document and the statistics derived from it.
//!
//! The status API has changed shape over time: the current track may sit at
//! the top level or under `streaming`, and the listener count under
//! `clients` or `streaming.listeners`. Every field is therefore optional and
//! unknown keys are kept in [`RadioStatus::extra`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

static TRACK_NUMBER_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\s+").unwrap());

const DEFAULT_BITRATE: u32 = 128;
const DEFAULT_FORMAT: &str = "MP3";
const DEFAULT_DESCRIPTION: &str = "Your favorite hits 24/7";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Elapsed seconds in the current track.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_track: Option<TrackInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listeners: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_live: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station: Option<StationInfo>,
}

/// Status document returned by the radio API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RadioStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_track: Option<TrackInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<StreamingInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clients: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tracks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shuffle: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Server uptime in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// Set when the document was synthesised because the API was unreachable.
    #[serde(skip)]
    pub fallback: bool,
}

impl RadioStatus {
    /// Document used when the status API cannot be reached.
    pub fn fallback(station_name: &str) -> Self {
        let extra = json!({
            "currentMedia": {
                "title": station_name,
                "displayText": format!("{station_name} Stream"),
                "playlist": "Main Hits",
            },
            "totalListeners": 0,
            "playbackPosition": "Unknown",
            "totalMusic": 0,
            "totalVideos": 0,
            "shuffleEnabled": false,
            "crossfadeDuration": 0,
            "isUsingFailover": false,
            "mediaType": "Music Stream",
        });

        Self {
            extra: match extra {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            fallback: true,
            ..Self::default()
        }
    }

    /// Current track, wherever the API put it.
    pub fn track(&self) -> Option<&TrackInfo> {
        self.current_track.as_ref().or_else(|| {
            self.streaming
                .as_ref()
                .and_then(|streaming| streaming.current_track.as_ref())
        })
    }

    pub fn station(&self) -> Option<&StationInfo> {
        self.streaming
            .as_ref()
            .and_then(|streaming| streaming.station.as_ref())
    }

    /// `clients` wins unless it is zero or absent.
    pub fn listeners(&self) -> u64 {
        self.clients
            .filter(|clients| *clients > 0)
            .or_else(|| self.streaming.as_ref().and_then(|s| s.listeners))
            .unwrap_or(0)
    }

    pub fn is_live(&self) -> bool {
        self.streaming
            .as_ref()
            .and_then(|streaming| streaming.is_live)
            .unwrap_or(false)
    }

    /// Cleaned title of the current track, if the API reported one.
    pub fn song_title(&self) -> Option<String> {
        self.track()
            .and_then(|track| track.title.as_deref())
            .filter(|title| !title.is_empty())
            .map(clean_title)
    }

    /// Derive the statistics shown to users. `default_station` fills the
    /// gaps the API leaves.
    pub fn stats(&self, default_station: &str) -> RadioStats {
        let station = self.station();
        let station_name = station
            .and_then(|s| s.name.clone())
            .unwrap_or_else(|| default_station.to_string());
        let position = self
            .track()
            .and_then(|track| track.position)
            .map(|seconds| seconds.max(0.0) as u64)
            .unwrap_or(0);

        RadioStats {
            current_song: self
                .song_title()
                .unwrap_or_else(|| default_station.to_string()),
            playlist: station_name.clone(),
            total_listeners: self.listeners(),
            position: format_position(position),
            total_tracks: self.total_tracks.unwrap_or(0),
            shuffle: self.shuffle.unwrap_or(false),
            bitrate: self
                .bitrate
                .or_else(|| station.and_then(|s| s.bitrate))
                .unwrap_or(DEFAULT_BITRATE),
            format: self
                .format
                .clone()
                .unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
            uptime_hours: (self.uptime.unwrap_or(0.0).max(0.0) / 3600.0) as u64,
            station_name,
            station_description: station
                .and_then(|s| s.description.clone())
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            live: self.is_live(),
        }
    }
}

/// Statistics derived from a [`RadioStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RadioStats {
    pub current_song: String,
    pub playlist: String,
    pub total_listeners: u64,
    /// `m:ss`
    pub position: String,
    pub total_tracks: u64,
    pub shuffle: bool,
    pub bitrate: u32,
    pub format: String,
    pub uptime_hours: u64,
    pub station_name: String,
    pub station_description: String,
    pub live: bool,
}

/// Strip a `.mp4` extension and the leading track number some files carry.
pub fn clean_title(title: &str) -> String {
    if !title.contains(".mp4") {
        return title.to_string();
    }
    let without_extension = title.replacen(".mp4", "", 1);
    TRACK_NUMBER_PREFIX
        .replace(&without_extension, "")
        .into_owned()
}

/// Format elapsed seconds as `m:ss`.
pub fn format_position(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}
