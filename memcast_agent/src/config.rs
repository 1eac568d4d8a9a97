//! Startup configuration: command line flags, then `MEMCAST_*` env vars, then defaults.
//! Nothing here is reloadable at runtime.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::StartupError;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_WS_PATH: &str = "/wsUrl";
pub const DEFAULT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4;
pub const MAX_CHANNEL_CAPACITY: usize = 8;
pub const DEFAULT_WRITE_BUFFER: usize = 1024;
pub const DEFAULT_MAX_MESSAGE: usize = 64 * 1024;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_WEB_DIR: &str = "web";

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub ws_path: String,
    pub sample_interval: Duration,
    pub channel_capacity: usize,
    pub write_buffer_size: usize,
    pub max_message_size: usize,
    pub send_timeout: Duration,
    pub pause_when_idle: bool,
    pub web_dir: PathBuf,
    pub enable_tls: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            ws_path: DEFAULT_WS_PATH.to_string(),
            sample_interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            write_buffer_size: DEFAULT_WRITE_BUFFER,
            max_message_size: DEFAULT_MAX_MESSAGE,
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            pause_when_idle: true,
            web_dir: PathBuf::from(DEFAULT_WEB_DIR),
            enable_tls: false,
        }
    }
}

impl AgentConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// What the binary should do after argument parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run(AgentConfig),
    Help(String),
}

pub fn usage(prog: &str) -> String {
    format!(
        "Usage: {prog} [--port PORT|-p PORT] [--bind ADDR] [--path WS_PATH] [--interval-ms MS] \
         [--web-dir DIR] [--no-idle-pause] [--enableSSL]"
    )
}

/// Parse process arguments against the real environment.
pub fn from_env() -> Result<Command, StartupError> {
    parse_args(std::env::args(), |k| std::env::var(k).ok())
}

/// Parse `args` (program name first). `env` looks up `MEMCAST_*` fallbacks so
/// tests can supply their own.
pub fn parse_args<I, F>(args: I, env: F) -> Result<Command, StartupError>
where
    I: IntoIterator<Item = String>,
    F: Fn(&str) -> Option<String>,
{
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "memcast_agent".into());

    let mut port: Option<String> = None;
    let mut bind: Option<String> = None;
    let mut path: Option<String> = None;
    let mut interval: Option<String> = None;
    let mut web_dir: Option<String> = None;
    let mut no_idle_pause = false;
    let mut enable_tls = false;

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help(usage(&prog))),
            "--port" | "-p" => port = Some(required(&mut it, &arg)?),
            "--bind" => bind = Some(required(&mut it, &arg)?),
            "--path" => path = Some(required(&mut it, &arg)?),
            "--interval-ms" => interval = Some(required(&mut it, &arg)?),
            "--web-dir" => web_dir = Some(required(&mut it, &arg)?),
            "--no-idle-pause" => no_idle_pause = true,
            "--enableSSL" => enable_tls = true,
            _ if arg.starts_with("--port=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    port = Some(v.to_string());
                }
            }
            _ => {
                return Err(StartupError::Config(format!(
                    "unexpected argument {arg:?}. {}",
                    usage(&prog)
                )))
            }
        }
    }

    let mut cfg = AgentConfig::default();

    if let Some(v) = port.or_else(|| env("MEMCAST_PORT")) {
        cfg.port = parse_value("port", &v)?;
    }
    if let Some(v) = bind.or_else(|| env("MEMCAST_BIND")) {
        cfg.bind = parse_value("bind address", &v)?;
    }
    if let Some(v) = path.or_else(|| env("MEMCAST_WS_PATH")) {
        if !v.starts_with('/') {
            return Err(StartupError::Config(format!(
                "websocket path must start with '/': {v:?}"
            )));
        }
        cfg.ws_path = v;
    }
    if let Some(v) = interval.or_else(|| env("MEMCAST_INTERVAL_MS")) {
        let ms: u64 = parse_value("sample interval", &v)?;
        if ms == 0 {
            return Err(StartupError::Config("sample interval must be > 0".into()));
        }
        cfg.sample_interval = Duration::from_millis(ms);
    }
    if let Some(v) = env("MEMCAST_CHANNEL_CAPACITY") {
        let n: usize = parse_value("channel capacity", &v)?;
        cfg.channel_capacity = n.clamp(1, MAX_CHANNEL_CAPACITY);
    }
    if let Some(v) = env("MEMCAST_WRITE_BUFFER") {
        cfg.write_buffer_size = parse_value("write buffer size", &v)?;
    }
    if let Some(v) = env("MEMCAST_MAX_MESSAGE") {
        cfg.max_message_size = parse_value("max message size", &v)?;
    }
    if let Some(v) = env("MEMCAST_SEND_TIMEOUT_MS") {
        let ms: u64 = parse_value("send timeout", &v)?;
        cfg.send_timeout = Duration::from_millis(ms.max(1));
    }
    if no_idle_pause {
        cfg.pause_when_idle = false;
    } else if let Some(v) = env("MEMCAST_IDLE_PAUSE") {
        cfg.pause_when_idle = v != "0";
    }
    if let Some(v) = web_dir.or_else(|| env("MEMCAST_WEB_DIR")) {
        cfg.web_dir = PathBuf::from(v);
    }
    cfg.enable_tls = enable_tls;

    Ok(Command::Run(cfg))
}

fn required<I: Iterator<Item = String>>(it: &mut I, flag: &str) -> Result<String, StartupError> {
    it.next()
        .ok_or_else(|| StartupError::Config(format!("{flag} expects a value")))
}

fn parse_value<T: FromStr>(what: &str, raw: &str) -> Result<T, StartupError> {
    raw.trim()
        .parse()
        .map_err(|_| StartupError::Config(format!("invalid {what}: {raw:?}")))
}
