//! Connection options for each transport
//!
//! The structs in this module can be flattened into command line option sets. Every value
//! falls back to an environment variable and finally to a default matching a local development
//! setup. They are never modified by the transports.

use crate::helpers::parse_seconds;
use crate::transport::DEFAULT_RESPONSE_TIMEOUT;
use std::time::Duration;
use structopt::StructOpt;

/// Options for connecting to a Redis server
#[derive(Debug, Clone, StructOpt)]
pub struct RedisOptions {
    /// Redis server hostname
    #[structopt(long, env = "REDIS_HOST", default_value = "localhost", value_name = "host")]
    pub host: String,

    /// Redis server port
    #[structopt(long, env = "REDIS_PORT", default_value = "6379", value_name = "port")]
    pub port: u16,

    /// Seconds to wait for a reply before giving up
    #[structopt(
        long = "timeout",
        env = "RPC_TIMEOUT",
        default_value = "10",
        value_name = "seconds",
        parse(try_from_str = parse_seconds)
    )]
    pub response_timeout: Duration,
}

impl RedisOptions {
    /// Creates options for the given server using the default response timeout
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Connection URL of the server
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self::new("localhost", 6379)
    }
}

/// Options for connecting to an AMQP broker like RabbitMQ
#[derive(Debug, Clone, StructOpt)]
pub struct RabbitMqOptions {
    /// AMQP broker URL
    #[structopt(
        long,
        env = "RABBITMQ_URL",
        default_value = "amqp://localhost:5672",
        value_name = "url"
    )]
    pub url: String,

    /// Queue requests and events are published to
    #[structopt(long, env = "RABBITMQ_QUEUE", default_value = "rpc_queue", value_name = "name")]
    pub queue: String,

    /// Seconds to wait for a reply before giving up
    #[structopt(
        long = "timeout",
        env = "RPC_TIMEOUT",
        default_value = "10",
        value_name = "seconds",
        parse(try_from_str = parse_seconds)
    )]
    pub response_timeout: Duration,
}

impl RabbitMqOptions {
    /// Creates options for the given broker and queue using the default response timeout
    pub fn new(url: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue: queue.into(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl Default for RabbitMqOptions {
    fn default() -> Self {
        Self::new("amqp://localhost:5672", "rpc_queue")
    }
}

/// Options for connecting to a NATS cluster
#[derive(Debug, Clone, StructOpt)]
pub struct NatsOptions {
    /// NATS server URLs, tried in order until one accepts the connection
    #[structopt(
        long = "server",
        env = "NATS_SERVERS",
        default_value = "nats://localhost:4222",
        value_name = "url",
        use_delimiter = true
    )]
    pub servers: Vec<String>,

    /// Seconds to wait for a reply before giving up
    #[structopt(
        long = "timeout",
        env = "RPC_TIMEOUT",
        default_value = "10",
        value_name = "seconds",
        parse(try_from_str = parse_seconds)
    )]
    pub response_timeout: Duration,
}

impl NatsOptions {
    /// Creates options for the given servers using the default response timeout
    pub fn new<S: Into<String>>(servers: impl IntoIterator<Item = S>) -> Self {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl Default for NatsOptions {
    fn default() -> Self {
        Self::new(vec!["nats://localhost:4222"])
    }
}

/// Options for connecting to a TCP microservice
#[derive(Debug, Clone, StructOpt)]
pub struct TcpOptions {
    /// Hostname of the microservice
    #[structopt(long, env = "TCP_HOST", default_value = "localhost", value_name = "host")]
    pub host: String,

    /// Port of the microservice
    #[structopt(long, env = "TCP_PORT", default_value = "3000", value_name = "port")]
    pub port: u16,

    /// Seconds to wait for a reply before giving up
    #[structopt(
        long = "timeout",
        env = "RPC_TIMEOUT",
        default_value = "10",
        value_name = "seconds",
        parse(try_from_str = parse_seconds)
    )]
    pub response_timeout: Duration,
}

impl TcpOptions {
    /// Creates options for the given endpoint using the default response timeout
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Address in `host:port` notation
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self::new("localhost", 3000)
    }
}
