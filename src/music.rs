//! External song-metadata search. The provider sits behind a trait so the
//! engine can run without one (and tests can stub it); lookups are cached
//! for a few minutes to spare the upstream API.
//!
//! A provider failure is a `Transient` error. The engine degrades it to an
//! empty result: metadata is decoration, it never fails a bid.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_secs: u32,
    pub preview_url: Option<String>,
    pub cover_url: Option<String>,
}

#[async_trait]
pub trait TrackSearch: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> EngineResult<Vec<Track>>;
}

/// Deezer-compatible search client with a TTL cache.
pub struct DeezerCatalog {
    client: reqwest::Client,
    base_url: String,
    cache: Mutex<HashMap<String, (Instant, Vec<Track>)>>,
    cache_ttl: Duration,
}

impl DeezerCatalog {
    pub fn new(base_url: String, cache_ttl: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");

        Self { client, base_url, cache: Mutex::new(HashMap::new()), cache_ttl }
    }

    fn cache_get(&self, key: &str) -> Option<Vec<Track>> {
        let cache = self.cache.lock().expect("music cache lock poisoned");
        cache
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.cache_ttl)
            .map(|(_, tracks)| tracks.clone())
    }

    fn cache_put(&self, key: String, tracks: Vec<Track>) {
        let mut cache = self.cache.lock().expect("music cache lock poisoned");
        cache.retain(|_, (at, _)| at.elapsed() < self.cache_ttl);
        cache.insert(key, (Instant::now(), tracks));
    }
}

#[async_trait]
impl TrackSearch for DeezerCatalog {
    async fn search(&self, query: &str, limit: usize) -> EngineResult<Vec<Track>> {
        let cache_key = format!("search_{}_{}", query, limit);
        if let Some(hit) = self.cache_get(&cache_key) {
            return Ok(hit);
        }

        let url = format!("{}/search", self.base_url);
        let limit_param = limit.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[("q", query), ("limit", limit_param.as_str())])
            .send()
            .await
            .map_err(|e| EngineError::Transient(format!("track search request: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::Transient(format!(
                "track search returned {}",
                response.status()
            )));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("track search decode: {}", e)))?;

        let tracks: Vec<Track> = body
            .data
            .into_iter()
            .map(|t| Track {
                id: t.id.to_string(),
                title: t.title,
                artist: t.artist.name,
                album: t.album.title,
                duration_secs: t.duration,
                preview_url: t.preview,
                cover_url: t.album.cover_medium,
            })
            .collect();

        self.cache_put(cache_key, tracks.clone());
        Ok(tracks)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<ApiTrack>,
}

#[derive(Debug, Deserialize)]
struct ApiTrack {
    id: u64,
    title: String,
    artist: ApiArtist,
    album: ApiAlbum,
    #[serde(default)]
    duration: u32,
    #[serde(default)]
    preview: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiAlbum {
    title: String,
    #[serde(default)]
    cover_medium: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_decoding() {
        let json = r#"{
            "data": [{
                "id": 3135556,
                "title": "Harder, Better, Faster, Stronger",
                "artist": {"name": "Daft Punk"},
                "album": {"title": "Discovery", "cover_medium": "https://cdn/example.jpg"},
                "duration": 224,
                "preview": "https://cdn/preview.mp3"
            }],
            "total": 1
        }"#;
        let parsed: SearchResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.data.len(), 1);
        assert_eq!(parsed.data[0].artist.name, "Daft Punk");
    }

    #[test]
    fn test_cache_roundtrip() {
        let catalog =
            DeezerCatalog::new("http://localhost:1".to_string(), Duration::from_secs(60));
        assert!(catalog.cache_get("search_x_5").is_none());

        let track = Track {
            id: "1".to_string(),
            title: "T".to_string(),
            artist: "A".to_string(),
            album: "B".to_string(),
            duration_secs: 200,
            preview_url: None,
            cover_url: None,
        };
        catalog.cache_put("search_x_5".to_string(), vec![track]);
        assert_eq!(catalog.cache_get("search_x_5").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_transient() {
        let catalog =
            DeezerCatalog::new("http://127.0.0.1:9".to_string(), Duration::from_secs(60));
        let err = catalog.search("daft punk", 5).await.unwrap_err();
        assert!(matches!(err, EngineError::Transient(_)));
    }
}
