// Channel directory announcements: tells a CyberTV directory which channels
// and servers are live.

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use tracing::debug;

use crate::config::CyberTvConfig;
use crate::error::{GatewayError, GatewayResult};

/// Characters escaped inside a query value.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// External directory listing this gateway and the channels it serves.
///
/// Announcements are advisory; callers log failures and carry on.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Mark channel `id` live (`true`) or gone (`false`).
    async fn channel_active(&self, id: &str, active: bool) -> GatewayResult<()>;

    /// Mark this gateway itself as up or down.
    async fn server_active(&self, active: bool) -> GatewayResult<()>;
}

/// Announces over plain HTTP GETs, as the CyberTV directory expects.
pub struct HttpChannelDirectory {
    config: CyberTvConfig,
    http_port: u16,
    client: Client,
}

impl HttpChannelDirectory {
    /// `http_port` is the port this gateway's HTTP surface listens on.
    pub fn new(config: CyberTvConfig, http_port: u16) -> Self {
        Self {
            config,
            http_port,
            client: Client::new(),
        }
    }

    /// Address viewers use for channel `id`.
    pub fn channel_url(&self, id: &str) -> String {
        format!(
            "http://{}:{}/{}",
            self.config.global_ip, self.config.output_port, id
        )
    }

    fn channel_request(&self, id: &str, active: bool) -> String {
        format!(
            "{}{}&ch_name={}&ch_url={}&active={}",
            self.config.add_channel_url,
            self.config.password_hash,
            utf8_percent_encode(id, QUERY_VALUE),
            utf8_percent_encode(&self.channel_url(id), QUERY_VALUE),
            u8::from(active)
        )
    }

    fn server_request(&self, active: bool) -> String {
        let addr = format!("{}:{}", self.config.global_ip, self.http_port);
        format!(
            "{}{}&serv_addr={}&serv_active={}",
            self.config.add_server_url,
            self.config.password_hash,
            utf8_percent_encode(&addr, QUERY_VALUE),
            u8::from(active)
        )
    }

    async fn get(&self, url: &str, timeout: Duration) -> GatewayResult<()> {
        debug!("directory request {}", url);
        self.client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| GatewayError::UpstreamFetch(format!("directory: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ChannelDirectory for HttpChannelDirectory {
    async fn channel_active(&self, id: &str, active: bool) -> GatewayResult<()> {
        self.get(&self.channel_request(id, active), self.config.timeout())
            .await
    }

    async fn server_active(&self, active: bool) -> GatewayResult<()> {
        self.get(&self.server_request(active), self.config.timeout())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> HttpChannelDirectory {
        HttpChannelDirectory::new(
            CyberTvConfig {
                add_channel_url: "http://dir/add_ch.php?pass=".to_string(),
                add_server_url: "http://dir/add_serv.php?pass=".to_string(),
                password_hash: "5f4dcc3b".to_string(),
                global_ip: "203.0.113.7".to_string(),
                output_port: 8081,
                timeout_secs: 10,
            },
            8000,
        )
    }

    #[test]
    fn test_channel_request() {
        assert_eq!(
            directory().channel_request("abc", true),
            "http://dir/add_ch.php?pass=5f4dcc3b&ch_name=abc\
             &ch_url=http%3A%2F%2F203.0.113.7%3A8081%2Fabc&active=1"
        );
    }

    #[test]
    fn test_server_request() {
        assert_eq!(
            directory().server_request(false),
            "http://dir/add_serv.php?pass=5f4dcc3b&serv_addr=203.0.113.7%3A8000&serv_active=0"
        );
    }
}
