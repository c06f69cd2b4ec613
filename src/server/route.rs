// Request path parsing: `/<kind>/<key>/<param>...` or `/<plugin token>/<segment>...`.

use percent_encoding::percent_decode_str;

use crate::config::MAX_POSITIONAL_PARAMS;
use crate::engine::StartKind;
use crate::error::{GatewayError, GatewayResult};
use crate::plugin::PluginRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Stream {
        kind: StartKind,
        /// Percent-decoded content id or transport URL.
        key: String,
        params: Vec<String>,
    },
    Plugin {
        token: String,
        segments: Vec<String>,
    },
}

pub fn parse_route(path: &str, plugins: &PluginRegistry) -> GatewayResult<Route> {
    let mut segments = path.trim_start_matches('/').split('/');
    let head = segments.next().unwrap_or_default().to_ascii_lowercase();

    if plugins.contains(&head) {
        return Ok(Route::Plugin {
            token: head,
            segments: segments.map(str::to_string).collect(),
        });
    }

    let kind = match head.as_str() {
        "pid" => StartKind::ContentId,
        "torrent" => StartKind::TransportUrl,
        "" => return Err(GatewayError::BadRequest("empty request path".to_string())),
        other => {
            return Err(GatewayError::BadRequest(format!(
                "unknown request type {other}"
            )))
        }
    };

    let raw_key = segments
        .next()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("missing content key".to_string()))?;
    let key = percent_decode_str(raw_key)
        .decode_utf8()
        .map_err(|_| GatewayError::BadRequest("content key is not valid UTF-8".to_string()))?
        .into_owned();

    let params = segments
        .take(MAX_POSITIONAL_PARAMS)
        .map(str::to_string)
        .collect();

    Ok(Route::Stream { kind, key, params })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::PlaylistConfig;
    use crate::plugin::playlist::PlaylistPlugin;

    fn plugins() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(PlaylistPlugin::new(PlaylistConfig {
            url: "http://127.0.0.1:1/list.m3u".to_string(),
            host: String::new(),
            refresh_secs: 60,
        })));
        registry
    }

    #[test]
    fn test_parse_pid() {
        let route = parse_route("/pid/abcdef/2", &plugins()).unwrap();
        assert_eq!(
            route,
            Route::Stream {
                kind: StartKind::ContentId,
                key: "abcdef".to_string(),
                params: vec!["2".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_torrent_decodes_key() {
        let route = parse_route(
            "/TORRENT/http%3A%2F%2Fhost%2Fa.acelive/0/1/2/3/4/5/6",
            &plugins(),
        )
        .unwrap();
        match route {
            Route::Stream { kind, key, params } => {
                assert_eq!(kind, StartKind::TransportUrl);
                assert_eq!(key, "http://host/a.acelive");
                assert_eq!(params.len(), MAX_POSITIONAL_PARAMS);
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn test_parse_plugin() {
        let route = parse_route("/playlist/ts", &plugins()).unwrap();
        assert_eq!(
            route,
            Route::Plugin {
                token: "playlist".to_string(),
                segments: vec!["ts".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_plugin_alias() {
        let route = parse_route("/ttvplaylist/ts", &plugins()).unwrap();
        assert_eq!(
            route,
            Route::Plugin {
                token: "ttvplaylist".to_string(),
                segments: vec!["ts".to_string()],
            }
        );
    }

    #[test]
    fn test_bad_routes() {
        let plugins = plugins();
        for path in ["/", "/pid", "/pid/", "/stream/abc", "/torrent/%FF"] {
            let err = parse_route(path, &plugins).unwrap_err();
            assert!(matches!(err, GatewayError::BadRequest(_)), "{path}");
        }
    }
}
