use anyhow::{Context, Result};
use nest_rpc_client::helpers::parse_json;
use nest_rpc_client::transport::BoxedTransport;
use nest_rpc_client::{Client, Payload};
use structopt::StructOpt;

#[cfg(feature = "nats")]
use nest_rpc_client::{options::NatsOptions, transport::request_reply::nats::NatsTransport};
#[cfg(feature = "rabbitmq")]
use nest_rpc_client::{options::RabbitMqOptions, transport::queue::amqp::RabbitMqTransport};
#[cfg(feature = "redis")]
use nest_rpc_client::{options::RedisOptions, transport::pubsub::redis::RedisTransport};
#[cfg(feature = "tcp")]
use nest_rpc_client::{options::TcpOptions, transport::tcp::TcpTransport};

#[derive(Debug, StructOpt)]
#[structopt(about = "Sends requests and events to NestJS style microservices.")]
struct MainOptions {
    /// Log level, scopable to different modules
    ///
    /// Levels: trace, debug, info, warn, error
    #[structopt(
        short,
        long,
        global = true,
        env = "RUST_LOG",
        default_value = "warn",
        value_name = "level"
    )]
    log: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Talk to the microservice through Redis publish/subscribe
    #[cfg(feature = "redis")]
    Redis {
        #[structopt(flatten)]
        options: RedisOptions,

        #[structopt(subcommand)]
        action: Action,
    },

    /// Talk to the microservice through a RabbitMQ queue
    #[cfg(feature = "rabbitmq")]
    #[structopt(name = "rabbitmq")]
    RabbitMq {
        #[structopt(flatten)]
        options: RabbitMqOptions,

        #[structopt(subcommand)]
        action: Action,
    },

    /// Talk to the microservice through NATS request/reply
    #[cfg(feature = "nats")]
    Nats {
        #[structopt(flatten)]
        options: NatsOptions,

        #[structopt(subcommand)]
        action: Action,
    },

    /// Talk to the microservice over a TCP connection
    #[cfg(feature = "tcp")]
    Tcp {
        #[structopt(flatten)]
        options: TcpOptions,

        #[structopt(subcommand)]
        action: Action,
    },
}

#[derive(Debug, StructOpt)]
enum Action {
    /// Sends a request and prints the reply
    Send {
        /// Pattern the request is addressed to
        pattern: String,

        /// JSON payload of the request
        #[structopt(default_value = "null", parse(try_from_str = parse_json))]
        data: Payload,
    },

    /// Sends an event without waiting for a reply
    Emit {
        /// Pattern the event is addressed to
        pattern: String,

        /// JSON payload of the event
        #[structopt(default_value = "null", parse(try_from_str = parse_json))]
        data: Payload,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let main_options = MainOptions::from_args();

    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&main_options.log)
        .init();

    let (transport, action) = match main_options.cmd {
        #[cfg(feature = "redis")]
        Command::Redis { options, action } => {
            let transport: BoxedTransport = Box::new(RedisTransport::from_options(&options));
            (transport, action)
        }

        #[cfg(feature = "rabbitmq")]
        Command::RabbitMq { options, action } => {
            let transport: BoxedTransport = Box::new(RabbitMqTransport::from_options(&options));
            (transport, action)
        }

        #[cfg(feature = "nats")]
        Command::Nats { options, action } => {
            let transport: BoxedTransport = Box::new(NatsTransport::from_options(&options));
            (transport, action)
        }

        #[cfg(feature = "tcp")]
        Command::Tcp { options, action } => {
            let transport: BoxedTransport = Box::new(TcpTransport::from_options(&options));
            (transport, action)
        }
    };

    let client = Client::new(transport);

    client
        .scoped(|client| async move {
            match action {
                Action::Send { pattern, data } => {
                    let reply = client.send(&pattern, data).await?;
                    println!("{}", reply);
                }
                Action::Emit { pattern, data } => {
                    client.emit(&pattern, data).await?;
                    log::info!("Emitted event to {}", pattern);
                }
            }

            Ok(())
        })
        .await
        .context("Unable to talk to microservice")?;

    Ok(())
}
