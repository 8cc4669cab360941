//! Session configuration
//!
//! Defaults are the values the microscope firmware expects. Each field can be
//! overridden with a `WIFISCOPE_*` environment variable through
//! [`SessionConfig::from_env`]; invalid values are logged and ignored.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use crate::decoder::{ChannelOrder, DEFAULT_OUTPUT_HEIGHT, DEFAULT_OUTPUT_WIDTH};
use crate::frame_assembler::{MergePolicy, DEFAULT_MIN_FRAME_LEN};
use crate::handoff::DEFAULT_QUEUE_CAPACITY;
use crate::protocol::MAX_DATAGRAM_LEN;

/// Camera address on its own access point
pub const DEFAULT_PEER_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 29, 1);

/// Camera command port
pub const DEFAULT_COMMAND_PORT: u16 = 20000;

/// Local port the camera streams to
pub const DEFAULT_STREAM_PORT: u16 = 10900;

/// A heartbeat is sent when a frame whose id is a multiple of this starts
pub const DEFAULT_HEARTBEAT_INTERVAL: u16 = 25;

/// Sleep after an empty poll
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Environment variable prefix
const ENV_PREFIX: &str = "WIFISCOPE_";

/// Everything a streaming session needs to know
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Camera command endpoint
    pub peer: SocketAddr,
    /// Local port to receive the stream on
    pub stream_port: u16,
    /// Receive buffer size
    pub max_datagram_len: usize,
    /// Frames at or below this many bytes are never decoded
    pub min_frame_len: usize,
    /// Heartbeat on frame ids divisible by this (0 disables keep-alive)
    pub heartbeat_interval: u16,
    /// Decoded image width
    pub output_width: u32,
    /// Decoded image height
    pub output_height: u32,
    /// Pixel layout handed to the consumer
    pub channel_order: ChannelOrder,
    /// Hand-off queue capacity
    pub queue_capacity: usize,
    /// Sleep after an empty poll; zero spins
    pub idle_backoff: Duration,
    /// Skip decoding frames that arrive faster than this rate
    pub max_fps: Option<u32>,
    /// Treatment of frames that lost their first fragment
    pub merge_policy: MergePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer: SocketAddr::V4(SocketAddrV4::new(DEFAULT_PEER_ADDR, DEFAULT_COMMAND_PORT)),
            stream_port: DEFAULT_STREAM_PORT,
            max_datagram_len: MAX_DATAGRAM_LEN,
            min_frame_len: DEFAULT_MIN_FRAME_LEN,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            output_width: DEFAULT_OUTPUT_WIDTH,
            output_height: DEFAULT_OUTPUT_HEIGHT,
            channel_order: ChannelOrder::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            max_fps: None,
            merge_policy: MergePolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults overlaid with `WIFISCOPE_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    ///
    /// `lookup` receives full variable names such as `WIFISCOPE_HOST`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Self::default();

        if let Some(host) = get("HOST") {
            match host.parse::<std::net::IpAddr>() {
                Ok(ip) => config.peer.set_ip(ip),
                Err(_) => log::warn!("Invalid {}HOST '{}', keeping default", ENV_PREFIX, host),
            }
        }
        if let Some(port) = parse_var(&get, "COMMAND_PORT") {
            config.peer.set_port(port);
        }
        if let Some(port) = parse_var(&get, "STREAM_PORT") {
            config.stream_port = port;
        }
        if let Some(len) = parse_var(&get, "MAX_DATAGRAM_LEN") {
            config.max_datagram_len = len;
        }
        if let Some(interval) = parse_var(&get, "HEARTBEAT_INTERVAL") {
            config.heartbeat_interval = interval;
        }
        if let Some(width) = parse_nonzero(&get, "OUTPUT_WIDTH") {
            config.output_width = width;
        }
        if let Some(height) = parse_nonzero(&get, "OUTPUT_HEIGHT") {
            config.output_height = height;
        }
        if let Some(order) = get("CHANNEL_ORDER") {
            config.channel_order = ChannelOrder::from_env_str(&order);
        }
        if let Some(capacity) = parse_var(&get, "QUEUE_CAPACITY") {
            config.queue_capacity = capacity;
        }
        if let Some(ms) = parse_var::<u64, _>(&get, "IDLE_BACKOFF_MS") {
            config.idle_backoff = Duration::from_millis(ms);
        }
        if let Some(fps) = parse_var::<u32, _>(&get, "MAX_FPS") {
            config.max_fps = (fps > 0).then_some(fps);
        }
        if let Some(policy) = get("MERGE_POLICY") {
            config.merge_policy = MergePolicy::from_env_str(&policy);
        }

        config
    }

    /// Minimum time between decoded frames, if rate limiting is on
    pub fn min_frame_interval(&self) -> Option<Duration> {
        self.max_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Parse a numeric variable, logging and ignoring bad values
fn parse_var<T, G>(get: &G, name: &str) -> Option<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    let raw = get(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Invalid {}{} '{}', keeping default", ENV_PREFIX, name, raw);
            None
        }
    }
}

/// Like [`parse_var`], but zero is also rejected
fn parse_nonzero<G>(get: &G, name: &str) -> Option<u32>
where
    G: Fn(&str) -> Option<String>,
{
    match parse_var::<u32, _>(get, name)? {
        0 => {
            log::warn!("{}{} must be non-zero, keeping default", ENV_PREFIX, name);
            None
        }
        value => Some(value),
    }
}
