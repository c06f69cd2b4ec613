// Playlist plugin: serves a remote M3U playlist with its links pointed at this gateway.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::{Captures, Regex};
use reqwest::Client;
use tracing::{debug, error};

use super::{Plugin, PluginRequest};
use crate::config::PlaylistConfig;
use crate::error::{GatewayError, GatewayResult};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Characters left unescaped when quoting a transport URL into a path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'.').remove(b'-');

static GROUP_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\S.+) \((.+)\)").expect("Invalid group title regex"));

static TRANSPORT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mR)^(http.+)$").expect("Invalid transport line regex"));

static CONTENT_ID_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mR)^([0-9a-f]{40})$").expect("Invalid content id regex"));

struct CachedPlaylist {
    body: String,
    fetched: Instant,
}

pub struct PlaylistPlugin {
    config: PlaylistConfig,
    client: Client,
    cache: Mutex<Option<CachedPlaylist>>,
}

impl PlaylistPlugin {
    pub fn new(config: PlaylistConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            cache: Mutex::new(None),
        }
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.config.refresh_secs)
    }

    async fn playlist(&self) -> GatewayResult<String> {
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.as_ref() {
                if cached.fetched.elapsed() <= self.refresh_interval() {
                    return Ok(cached.body.clone());
                }
            }
        }

        debug!("downloading playlist from {}", self.config.url);
        let body = self.download().await.map_err(|e| {
            error!("can't download playlist: {}", e);
            GatewayError::Plugin(format!("playlist download failed: {e}"))
        })?;
        let body = group_titles(&body);

        *self.cache.lock() = Some(CachedPlaylist {
            body: body.clone(),
            fetched: Instant::now(),
        });
        Ok(body)
    }

    async fn download(&self) -> Result<String, reqwest::Error> {
        self.client
            .get(&self.config.url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }

    fn host_for(&self, request: &PluginRequest) -> GatewayResult<String> {
        let host = if !self.config.host.is_empty() {
            self.config.host.clone()
        } else {
            request
                .headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| GatewayError::BadRequest("missing Host header".to_string()))?
        };

        let ts = request
            .segments
            .first()
            .is_some_and(|s| s.eq_ignore_ascii_case("ts"));
        Ok(if ts { format!("ts://{host}") } else { host })
    }
}

#[async_trait]
impl Plugin for PlaylistPlugin {
    fn handlers(&self) -> &'static [&'static str] {
        &["ttvplaylist", "playlist"]
    }

    async fn handle(&self, request: PluginRequest) -> GatewayResult<Response> {
        let host = self.host_for(&request)?;
        let playlist = self.playlist().await?;

        let mut response = Response::new(Body::from(rewrite_links(&playlist, &host)));
        *response.status_mut() = StatusCode::OK;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-mpegurl"),
        );
        Ok(response)
    }
}

/// Turn `,Name (Group)` titles into `group-title="Group",Name`.
pub fn group_titles(playlist: &str) -> String {
    GROUP_TITLE
        .replace_all(playlist, r#" group-title="$2",$1"#)
        .into_owned()
}

/// Point transport URLs and content ids at the gateway on `host`.
pub fn rewrite_links(playlist: &str, host: &str) -> String {
    let rewritten = TRANSPORT_LINE.replace_all(playlist, |caps: &Captures| {
        format!(
            "http://{}/torrent/{}",
            host,
            utf8_percent_encode(&caps[1], PATH_SEGMENT)
        )
    });
    CONTENT_ID_LINE
        .replace_all(&rewritten, |caps: &Captures| {
            format!("http://{}/pid/{}", host, &caps[1])
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "#EXTM3U\n\
#EXTINF:-1,First Channel (News)\n\
http://tracker.example/first.acelive\n\
#EXTINF:-1,Second (Sport)\n\
0123456789abcdef0123456789abcdef01234567\n";

    #[test]
    fn test_group_titles() {
        let out = group_titles(SAMPLE);
        assert!(out.contains(r#"#EXTINF:-1 group-title="News",First Channel"#));
        assert!(out.contains(r#"#EXTINF:-1 group-title="Sport",Second"#));
    }

    #[test]
    fn test_rewrite_links() {
        let out = rewrite_links(SAMPLE, "gw:8000");
        assert!(out.contains(
            "http://gw:8000/torrent/http%3A%2F%2Ftracker.example%2Ffirst.acelive\n"
        ));
        assert!(out.contains("http://gw:8000/pid/0123456789abcdef0123456789abcdef01234567\n"));
        assert!(out.starts_with("#EXTM3U\n"));
    }

    #[test]
    fn test_rewrite_keeps_crlf() {
        let out = rewrite_links("http://a/b\r\n", "h");
        assert_eq!(out, "http://h/torrent/http%3A%2F%2Fa%2Fb\r\n");
    }

    #[test]
    fn test_ts_host_prefix() {
        let plugin = PlaylistPlugin::new(PlaylistConfig {
            url: "http://unused".to_string(),
            host: "gw:8000".to_string(),
            refresh_secs: 60,
        });
        let request = PluginRequest {
            segments: vec!["ts".to_string()],
            headers: Default::default(),
        };
        assert_eq!(plugin.host_for(&request).unwrap(), "ts://gw:8000");
    }
}
