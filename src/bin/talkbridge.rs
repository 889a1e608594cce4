use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use talkbridge::{
    setup_local_tracing, setup_tracing, AppError, AppResult, BridgeConfig, Client,
    DefaultMessages, Endpoint, EventSender, Frame, MessageModel, Server, ServerEvent,
};
use tokio::{runtime, signal};
use tracing::{info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// also write logs to an hourly rolling file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// accept connections and echo every message back to its sender
    Serve,
    /// connect, send one text message and sign off
    Dial { text: Vec<String> },
    PrintConfig,
}

/// UTF-8 text, one message per frame.
#[derive(Debug, Default, Clone)]
struct TextMessage(String);

impl TextMessage {
    fn new(text: &str) -> Self {
        TextMessage(text.to_string())
    }
}

impl MessageModel for TextMessage {
    fn load(&mut self, payload: &[u8]) -> AppResult<()> {
        self.0 = String::from_utf8(payload.to_vec())
            .map_err(|e| AppError::CorruptMessage(e.to_string()))?;
        Ok(())
    }

    fn get_bytes(&self) -> AppResult<Bytes> {
        Ok(Frame::encode(self.0.as_bytes())?.freeze())
    }
}

fn default_messages() -> DefaultMessages<TextMessage> {
    DefaultMessages::new(
        Some(TextMessage::new("HELLO")),
        Some(TextMessage::new("BYE")),
        Some(TextMessage::new("PING")),
    )
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();

    if commandline.verbose > 0 && std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }
    let _log_guard = match &commandline.log_dir {
        Some(dir) => Some(setup_tracing(dir, "info")?),
        None => {
            setup_local_tracing()?;
            None
        }
    };

    //setup config
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = if config_path.exists() {
        BridgeConfig::set_up_config(&config_path)?
    } else {
        warn!("config file {} not found, using defaults", config_path.display());
        BridgeConfig::default()
    };

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    match commandline.command.unwrap_or(Command::Serve) {
        Command::Serve => rt.block_on(serve(config)),
        Command::Dial { text } => rt.block_on(dial(config, text.join(" "))),
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}

async fn serve(config: BridgeConfig) -> AppResult<()> {
    let server: Server<TextMessage> = Server::from_config(&config);
    server.set_default_messages(default_messages());
    server.subscribe(|sender, event| match event {
        ServerEvent::ClientConnected(connection) => {
            info!(
                "client {} connected from {}:{}",
                connection.id(),
                connection.address(),
                connection.port()
            );
        }
        ServerEvent::MessageReceived(message) => {
            info!("received {:?}", message.0);
            if let EventSender::Connection(connection) = sender {
                connection.send_message(message.clone());
            }
        }
        ServerEvent::SignOff(_) => {
            if let Some(connection) = sender.connection() {
                info!("client {} signed off", connection.id());
            }
        }
        ServerEvent::Error(error) => warn!("{}", error),
        _ => {}
    });

    let local_addr = server.start_listener().await?;
    info!("talkbridge listening on {}", local_addr);

    signal::ctrl_c().await?;
    info!("get shutdown signal");
    server.stop_listener(Some(TextMessage::new("BYE"))).await;
    Ok(())
}

async fn dial(config: BridgeConfig, text: String) -> AppResult<()> {
    let client: Client<TextMessage> = Client::from_config(&config);
    client.set_default_messages(default_messages());
    client.on_message_received(|_, message| println!("{}", message.0));
    client.on_error(|_, error| warn!("{}", error));

    client.connect(config.network.heartbeat_enabled).await?;
    info!(
        "connected to {}:{}",
        client.remote_address(),
        client.remote_port()
    );
    client.send_message(TextMessage(text));

    // leave time for the echo before signing off
    tokio::time::sleep(Duration::from_millis(500)).await;
    let sign_off = client.default_messages().sign_off;
    client.send_disconnect_message(sign_off).await;
    Ok(())
}
