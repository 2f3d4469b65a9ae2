//! NodeLink - Cluster node communication
//!
//! Runs a node, or talks to one from the command line.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nodelink::buffer::{DataBufMut, DataRead};
use nodelink::config::{self, Config};
use nodelink::network::{NetworkChannel, NetworkClient, NetworkServer, ServerEvent};
use nodelink::protocol::{self, channels, Packet, PacketListenerRegistry, MAX_FRAME_SIZE};
use nodelink::rpc::{RpcArguments, RpcHandlerRegistry, RpcSender};

/// Channel the node answers echo queries on
const ECHO_CHANNEL: i32 = 1;

/// NodeLink - Cluster node communication
#[derive(Parser)]
#[command(name = "nodelink")]
#[command(author = "NodeLink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Packet transport, queries and RPC between cluster nodes", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node that answers echo queries and `Node` RPC calls
    Node {
        /// Port to listen on (overrides the configuration)
        #[arg(short, long)]
        port: Option<u16>,

        /// Node name to report (overrides the configuration)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Send a text query to a node and print the reply
    Query {
        /// Node address (host:port)
        #[arg(short, long)]
        server: String,

        /// Routing channel
        #[arg(long, default_value_t = ECHO_CHANNEL)]
        channel: i32,

        /// Text to send
        message: String,

        /// Query timeout in milliseconds
        #[arg(short, long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Invoke a `Node` RPC method (name, uptime, channels)
    Call {
        /// Node address (host:port)
        #[arg(short, long)]
        server: String,

        /// Method to invoke
        method: String,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Node { port, name } => {
            run_node(config, port, name).await?;
        }
        Commands::Query {
            server,
            channel,
            message,
            timeout_ms,
        } => {
            run_query(&config, &server, channel, &message, Duration::from_millis(timeout_ms)).await?;
        }
        Commands::Call { server, method } => {
            run_call(&config, &server, &method).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info();
        }
    }

    Ok(())
}

/// Run a node until Ctrl+C
async fn run_node(config: Config, port: Option<u16>, name: Option<String>) -> anyhow::Result<()> {
    let name = name.unwrap_or_else(|| config.general.name.clone());
    let mut net_config = config.network_config();
    if let Some(port) = port {
        net_config.port = port;
    }

    let registry = Arc::new(PacketListenerRegistry::new());
    registry.register(ECHO_CHANNEL, echo);

    let open_channels = Arc::new(AtomicUsize::new(0));
    let handlers = Arc::new(node_handlers(&name, open_channels.clone()));
    handlers.install(&registry);

    let mut server = NetworkServer::with_registry(net_config, registry);
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("server event receiver already taken"))?;

    let bind_addr = server.start().await?;

    println!("\n========================================");
    println!("  NodeLink Node Running");
    println!("========================================");
    println!("  Name: {}", name);
    println!("  Address: {}", bind_addr);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::ChannelOpened { channel_id, remote_addr } => {
                        open_channels.fetch_add(1, Ordering::SeqCst);
                        println!("+ Channel {} opened ({})", channel_id, remote_addr);
                    }
                    ServerEvent::ChannelClosed { channel_id, remote_addr } => {
                        open_channels.fetch_sub(1, Ordering::SeqCst);
                        println!("- Channel {} closed ({})", channel_id, remote_addr);
                    }
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    tracing::info!("Node stopped");

    Ok(())
}

/// Answer every text query with the same text
fn echo(channel: &NetworkChannel, packet: &Packet) -> anyhow::Result<()> {
    if !packet.is_query() {
        return Ok(());
    }

    let message = packet.content().read_string()?;
    tracing::debug!("Echo for channel {}: {}", channel.id(), message);

    let mut reply = DataBufMut::new();
    reply.write_string(&message);
    channel.send(packet.response(reply.freeze())?)?;
    Ok(())
}

fn node_handlers(name: &str, open_channels: Arc<AtomicUsize>) -> RpcHandlerRegistry {
    let handlers = RpcHandlerRegistry::new();
    let started = Instant::now();

    let name = name.to_string();
    handlers.register("Node", "name", move |_: &mut RpcArguments| -> anyhow::Result<String> {
        Ok(name.clone())
    });
    handlers.register("Node", "uptime", move |_: &mut RpcArguments| -> anyhow::Result<String> {
        Ok(format!("{}s", started.elapsed().as_secs()))
    });
    handlers.register("Node", "channels", move |_: &mut RpcArguments| -> anyhow::Result<String> {
        Ok(open_channels.load(Ordering::SeqCst).to_string())
    });
    handlers
}

async fn connect(config: &Config, server: &str) -> anyhow::Result<NetworkChannel> {
    let client = NetworkClient::new(config.network_config());
    let channel = match server.parse::<SocketAddr>() {
        Ok(addr) => client.connect(addr).await?,
        Err(_) => {
            let (host, port) = match server.rsplit_once(':') {
                Some((host, port)) => (host, port.parse()?),
                None => (server, protocol::DEFAULT_PORT),
            };
            client.connect_hostname(host, port).await?
        }
    };
    Ok(channel)
}

/// Send one text query and print the reply
async fn run_query(
    config: &Config,
    server: &str,
    channel_number: i32,
    message: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let channel = connect(config, server).await?;

    let mut content = DataBufMut::new();
    content.write_string(message);
    let started = Instant::now();
    let response = channel
        .query(Packet::new_query(channel_number, content.freeze()), timeout)
        .await?;
    tracing::debug!("Reply received after {:?}", started.elapsed());

    println!("{}", response.content().read_string()?);
    channel.close();
    Ok(())
}

/// Invoke a `Node` method and print its result
async fn run_call(config: &Config, server: &str, method: &str) -> anyhow::Result<()> {
    let channel = connect(config, server).await?;
    let node = RpcSender::new("Node", channel.clone()).with_timeout(config.rpc.call_timeout());

    let result: String = node.invoke(method).call().await?;
    println!("{}", result);

    channel.close();
    Ok(())
}

/// Print protocol information
fn print_protocol_info() {
    println!("NodeLink Protocol Information");
    println!("=============================\n");

    println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Max Frame Size: {} bytes", MAX_FRAME_SIZE);

    println!("\nReserved Channels:");
    println!("  {:>3}  query responses", channels::QUERY_RESPONSE);
    println!("  {:>3}  remote method invocations", channels::RPC);
    println!("  {:>3}  echo (nodelink node)", ECHO_CHANNEL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["nodelink", "info"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_query_arguments() {
        let cli = Cli::try_parse_from(["nodelink", "query", "--server", "127.0.0.1:1410", "hello"]).unwrap();
        match cli.command {
            Commands::Query {
                server,
                channel,
                message,
                timeout_ms,
            } => {
                assert_eq!(server, "127.0.0.1:1410");
                assert_eq!(channel, ECHO_CHANNEL);
                assert_eq!(message, "hello");
                assert_eq!(timeout_ms, 5000);
            }
            _ => panic!("expected query command"),
        }
    }

    #[test]
    fn test_node_handlers() {
        let handlers = node_handlers("alpha", Arc::new(AtomicUsize::new(3)));
        let mut invocation = nodelink::rpc::RpcInvocation::new("Node", "channels");

        let mut result = handlers.invoke(&invocation).unwrap();
        assert_eq!(result.read_string().unwrap(), "3");

        invocation.method = "name".to_string();
        let mut result = handlers.invoke(&invocation).unwrap();
        assert_eq!(result.read_string().unwrap(), "alpha");
    }
}
