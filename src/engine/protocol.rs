// Engine control protocol: typed requests and one-shot decoding of response lines.

use serde_json::json;
use sha1::{Digest, Sha1};

use crate::config::{DEFAULT_PARAM, MAX_POSITIONAL_PARAMS};

/// Status code reported by the engine when playback failed.
pub const STATUS_ERROR: &str = "main:err";

/// Status code reported by the engine once a START has been accepted.
pub const STATUS_STARTING: &str = "main:starting";

/// What the content key of a request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartKind {
    /// 40-hex content identifier (`PID`).
    ContentId,
    /// URL of a transport descriptor (`TORRENT`).
    TransportUrl,
}

impl StartKind {
    fn wire_name(self) -> &'static str {
        match self {
            StartKind::ContentId => "PID",
            StartKind::TransportUrl => "TORRENT",
        }
    }
}

/// Positional parameters of a START/LOADASYNC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartParams {
    pub file_indexes: String,
    pub developer_id: String,
    pub affiliate_id: String,
    pub zone_id: String,
    pub stream_id: String,
}

impl Default for StartParams {
    fn default() -> Self {
        Self::from_positional::<&str>(&[])
    }
}

impl StartParams {
    /// Build from positional URL segments; missing trailing values become `"0"`.
    pub fn from_positional<S: AsRef<str>>(params: &[S]) -> Self {
        let mut values: Vec<String> = params
            .iter()
            .take(MAX_POSITIONAL_PARAMS)
            .map(|p| p.as_ref().to_string())
            .collect();
        values.resize(MAX_POSITIONAL_PARAMS, DEFAULT_PARAM.to_string());
        let mut it = values.into_iter();
        let mut next = || it.next().unwrap_or_else(|| DEFAULT_PARAM.to_string());
        Self {
            file_indexes: next(),
            developer_id: next(),
            affiliate_id: next(),
            zone_id: next(),
            stream_id: next(),
        }
    }
}

/// A START-class request: which content to play and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub kind: StartKind,
    /// Content id or transport URL.
    pub target: String,
    pub params: StartParams,
}

/// Lines the gateway sends to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineRequest {
    Hello,
    /// READY answering a keyed greeting; `key` is the already-derived token.
    ReadyKeyed { key: String },
    ReadyUnkeyed,
    Start(StartRequest),
    LoadAsync { tag: String, request: StartRequest },
    UserData { gender: u8, age: u8 },
    Shutdown,
}

impl EngineRequest {
    /// Render the request as a single protocol line, without terminator.
    pub fn encode(&self) -> String {
        match self {
            EngineRequest::Hello => "HELLOBG version=3".to_string(),
            EngineRequest::ReadyKeyed { key } => format!("READY key={}", key),
            EngineRequest::ReadyUnkeyed => "READY".to_string(),
            EngineRequest::Start(req) => {
                let p = &req.params;
                match req.kind {
                    StartKind::ContentId => {
                        format!("START PID {} {}", req.target, p.file_indexes)
                    }
                    StartKind::TransportUrl => format!(
                        "START TORRENT {} {} {} {} {} {}",
                        req.target,
                        p.file_indexes,
                        p.developer_id,
                        p.affiliate_id,
                        p.zone_id,
                        p.stream_id
                    ),
                }
            }
            EngineRequest::LoadAsync { tag, request } => {
                let p = &request.params;
                match request.kind {
                    StartKind::ContentId => format!(
                        "LOADASYNC {} {} {}",
                        tag,
                        request.kind.wire_name(),
                        request.target
                    ),
                    StartKind::TransportUrl => format!(
                        "LOADASYNC {} {} {} {} {} {}",
                        tag,
                        request.kind.wire_name(),
                        request.target,
                        p.developer_id,
                        p.affiliate_id,
                        p.zone_id
                    ),
                }
            }
            EngineRequest::UserData { gender, age } => {
                format!("USERDATA {}", json!([{ "gender": gender }, { "age": age }]))
            }
            EngineRequest::Shutdown => "SHUTDOWN".to_string(),
        }
    }
}

/// Derive the READY key from the greeting's session key and the product key.
///
/// The result is the product key's first `-`-delimited segment followed by the
/// hex SHA-1 of `session_key + product_key`.
pub fn ready_key(session_key: &str, product_key: &str) -> String {
    let prefix = product_key.split('-').next().unwrap_or_default();
    let mut hasher = Sha1::new();
    hasher.update(session_key.as_bytes());
    hasher.update(product_key.as_bytes());
    format!("{}-{}", prefix, hex::encode(hasher.finalize()))
}

/// A STATUS line: the status code plus the optional error detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: String,
    pub detail: String,
}

impl StatusLine {
    pub fn is_fatal(&self) -> bool {
        self.code == STATUS_ERROR
    }

    pub fn is_starting(&self) -> bool {
        self.code == STATUS_STARTING
    }
}

/// Lines the engine sends to the gateway, decoded once on arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineResponse {
    Hello { key: Option<String> },
    NotReady,
    Auth { level: Option<String> },
    GetUserData,
    /// START acknowledgement; `url` is absent when the engine has none yet.
    Start { url: Option<String> },
    LoadResp { tag: String, payload: String },
    State(String),
    Status(StatusLine),
    Pause,
    Resume,
    Stop,
    Shutdown,
    /// Informational `EVENT` lines other than `getuserdata`.
    Event(String),
    Unknown(String),
}

impl EngineResponse {
    pub fn decode(line: &str) -> Self {
        let line = line.trim();
        let (token, rest) = match line.split_once(char::is_whitespace) {
            Some((token, rest)) => (token, rest.trim()),
            None => (line, ""),
        };
        let mut args = rest.split_whitespace();

        match token.to_ascii_uppercase().as_str() {
            "HELLOTS" => EngineResponse::Hello {
                key: args
                    .find_map(|arg| arg.strip_prefix("key="))
                    .filter(|k| !k.is_empty())
                    .map(str::to_string),
            },
            "NOTREADY" => EngineResponse::NotReady,
            "AUTH" => EngineResponse::Auth {
                level: args.next().map(str::to_string),
            },
            "START" => EngineResponse::Start {
                url: args.next().map(str::to_string),
            },
            "LOADRESP" => {
                let (tag, payload) = match rest.split_once(char::is_whitespace) {
                    Some((tag, payload)) => (tag, payload.trim()),
                    None => (rest, ""),
                };
                EngineResponse::LoadResp {
                    tag: tag.to_string(),
                    payload: payload.to_string(),
                }
            }
            "STATE" => EngineResponse::State(args.next().unwrap_or_default().to_string()),
            "STATUS" => EngineResponse::Status(StatusLine {
                code: rest.split(';').next().unwrap_or_default().trim().to_string(),
                detail: line.split(';').nth(2).unwrap_or_default().trim().to_string(),
            }),
            "PAUSE" => EngineResponse::Pause,
            "RESUME" => EngineResponse::Resume,
            "STOP" => EngineResponse::Stop,
            "SHUTDOWN" => EngineResponse::Shutdown,
            "EVENT" => match args.next() {
                Some(name) if name.eq_ignore_ascii_case("getuserdata") => {
                    EngineResponse::GetUserData
                }
                Some(name) => EngineResponse::Event(name.to_string()),
                None => EngineResponse::Unknown(line.to_string()),
            },
            "GETUSERDATA" => EngineResponse::GetUserData,
            _ => EngineResponse::Unknown(line.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_are_neutral() {
        let params = StartParams::default();
        assert_eq!(params, StartParams::from_positional(&["0", "0", "0", "0", "0"]));
        assert_eq!(params.stream_id, DEFAULT_PARAM);
    }

    #[test]
    fn test_decode_hello_with_key() {
        assert_eq!(
            EngineResponse::decode("HELLOTS version=3.1.16 key=ab12cd"),
            EngineResponse::Hello {
                key: Some("ab12cd".to_string())
            }
        );
        assert_eq!(
            EngineResponse::decode("HELLOTS version=3.1.16"),
            EngineResponse::Hello { key: None }
        );
    }

    #[test]
    fn test_decode_prefix_collisions() {
        // START / STATE / STATUS / STOP share prefixes but decode distinctly.
        assert_eq!(
            EngineResponse::decode("START http://127.0.0.1:6878/content/x stream=1"),
            EngineResponse::Start {
                url: Some("http://127.0.0.1:6878/content/x".to_string())
            }
        );
        assert_eq!(
            EngineResponse::decode("STATE 2"),
            EngineResponse::State("2".to_string())
        );
        assert_eq!(EngineResponse::decode("STOP"), EngineResponse::Stop);
        assert!(matches!(
            EngineResponse::decode("STATUS main:buf;10;0"),
            EngineResponse::Status(_)
        ));
    }

    #[test]
    fn test_decode_start_without_url() {
        assert_eq!(
            EngineResponse::decode("START"),
            EngineResponse::Start { url: None }
        );
    }

    #[test]
    fn test_decode_status_detail() {
        let EngineResponse::Status(status) =
            EngineResponse::decode("status main:err;code=7;disk full")
        else {
            panic!("expected status");
        };
        assert!(status.is_fatal());
        assert_eq!(status.code, "main:err");
        assert_eq!(status.detail, "disk full");

        let EngineResponse::Status(status) = EngineResponse::decode("STATUS main:err") else {
            panic!("expected status");
        };
        assert!(status.is_fatal());
        assert_eq!(status.detail, "");

        let EngineResponse::Status(status) = EngineResponse::decode("STATUS main:starting")
        else {
            panic!("expected status");
        };
        assert!(status.is_starting());
    }

    #[test]
    fn test_decode_loadresp() {
        assert_eq!(
            EngineResponse::decode(r#"LOADRESP 7 {"status": 1, "infohash": "abc"}"#),
            EngineResponse::LoadResp {
                tag: "7".to_string(),
                payload: r#"{"status": 1, "infohash": "abc"}"#.to_string()
            }
        );
    }

    #[test]
    fn test_decode_events() {
        assert_eq!(
            EngineResponse::decode("EVENT getuserdata"),
            EngineResponse::GetUserData
        );
        assert_eq!(
            EngineResponse::decode("EVENT livepos last=1"),
            EngineResponse::Event("livepos".to_string())
        );
        assert!(matches!(
            EngineResponse::decode("WHATEVER 1"),
            EngineResponse::Unknown(_)
        ));
    }

    #[test]
    fn test_encode_start() {
        let req = StartRequest {
            kind: StartKind::ContentId,
            target: "0123456789abcdef0123456789abcdef01234567".to_string(),
            params: StartParams::from_positional(&["2"]),
        };
        assert_eq!(
            EngineRequest::Start(req).encode(),
            "START PID 0123456789abcdef0123456789abcdef01234567 2"
        );

        let req = StartRequest {
            kind: StartKind::TransportUrl,
            target: "http://host/file.acelive".to_string(),
            params: StartParams::from_positional(&["0", "1"]),
        };
        assert_eq!(
            EngineRequest::Start(req.clone()).encode(),
            "START TORRENT http://host/file.acelive 0 1 0 0 0"
        );
        assert_eq!(
            EngineRequest::LoadAsync {
                tag: "9".to_string(),
                request: req
            }
            .encode(),
            "LOADASYNC 9 TORRENT http://host/file.acelive 1 0 0"
        );
    }

    #[test]
    fn test_encode_userdata() {
        assert_eq!(
            EngineRequest::UserData { gender: 1, age: 3 }.encode(),
            r#"USERDATA [{"gender":1},{"age":3}]"#
        );
    }

    #[test]
    fn test_ready_key() {
        let key = ready_key("abc", "prefix-rest");
        let (prefix, digest) = key.split_once('-').unwrap();
        assert_eq!(prefix, "prefix");
        assert_eq!(digest.len(), 40);
        assert_eq!(key, ready_key("abc", "prefix-rest"));
        assert_ne!(key, ready_key("abd", "prefix-rest"));
    }
}
