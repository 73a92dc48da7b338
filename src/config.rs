use crate::error::Result;
use crate::job::codec::{ImageFormat, OutputMode};
use crate::peer::ice::parse_ice_servers;
use crate::peer::types::IceServerConfig;
use crate::session::SessionConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_ICE_SERVERS_JSON: &str = r#"[{"urls":"stun:stun.l.google.com:19302"}]"#;

#[derive(Parser, Debug, Clone)]
#[command(name = "lcm-rtc")]
#[command(about = "Image generation over a WebRTC data channel")]
pub struct Config {
    /// Relay listen host
    #[arg(long, env = "LCM_RTC_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Relay listen port
    #[arg(long, env = "LCM_RTC_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Default ICE servers as JSON
    #[arg(long, env = "LCM_RTC_ICE_SERVERS", default_value = DEFAULT_ICE_SERVERS_JSON)]
    pub ice_servers: String,

    /// Send results as JSON with a data URI instead of raw image bytes
    #[arg(long, env = "LCM_RTC_DATAURI", default_value_t = false)]
    pub datauri: bool,

    /// Encoding of result images
    #[arg(long, env = "LCM_RTC_FORMAT", value_enum, default_value_t = ImageFormat::Webp)]
    pub format: ImageFormat,

    /// Seconds without a keepalive before a session is closed
    #[arg(long, env = "LCM_RTC_IDLE_TIMEOUT_SECS", default_value_t = 30)]
    pub idle_timeout_secs: u64,

    /// Upper bound on ICE gathering per answer, in seconds
    #[arg(long, default_value_t = 10)]
    pub ice_gather_timeout_secs: u64,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, env = "LCM_RTC_LOG", default_value = "info")]
    pub log_filter: String,
}

impl Config {
    pub fn listen_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn ice_servers(&self) -> Result<Vec<IceServerConfig>> {
        parse_ice_servers(&self.ice_servers)
    }

    pub fn output_mode(&self) -> OutputMode {
        if self.datauri {
            OutputMode::DataUri
        } else {
            OutputMode::Binary
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            gather_timeout: Duration::from_secs(self.ice_gather_timeout_secs),
        }
    }
}
