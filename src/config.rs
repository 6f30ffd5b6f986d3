//! Tunables shared by the server, the client and both transports.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// The path the front door answers on.
    /// Defaults to `/socket.io/`.
    pub req_path: String,

    /// The interval at which the keepalive loop enqueues a ping frame,
    /// advertised to the remote in the connection header.
    /// Defaults to 30 seconds.
    pub ping_interval: Duration,

    /// The amount of time the remote may sit on a ping before considering
    /// the connection dead, advertised in the connection header.
    /// Defaults to 60 seconds.
    pub ping_timeout: Duration,

    /// Upper bound on a single transport read.
    /// Defaults to 60 seconds.
    pub receive_timeout: Duration,

    /// Upper bound on a single transport write. For the polling transport
    /// this is also how long a GET request is held open waiting for a frame.
    /// Defaults to 60 seconds.
    pub send_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            req_path: "/socket.io/".to_owned(),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(60),
            receive_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The path the front door answers on.
    pub fn req_path(mut self, req_path: impl Into<String>) -> Self {
        self.config.req_path = req_path.into();
        self
    }

    /// The interval between keepalive pings.
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.config.ping_interval = ping_interval;
        self
    }

    /// How long the remote may sit on a ping.
    pub fn ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.config.ping_timeout = ping_timeout;
        self
    }

    /// Upper bound on a single transport read.
    pub fn receive_timeout(mut self, receive_timeout: Duration) -> Self {
        self.config.receive_timeout = receive_timeout;
        self
    }

    /// Upper bound on a single transport write / long-poll hold.
    pub fn send_timeout(mut self, send_timeout: Duration) -> Self {
        self.config.send_timeout = send_timeout;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
