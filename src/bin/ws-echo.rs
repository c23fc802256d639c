//! Echo server: upgrades every allowed request and sends each text message back.

use std::path::PathBuf;

use clap::Parser;
use hybi_upgrade::{Acceptor, AcceptorConfig, Message, Upgrade};
use tokio::io::AsyncWriteExt as _;
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ws-echo")]
#[command(about = "WebSocket echo server speaking draft-75, draft-76 and draft-07/08/13", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    listen: String,

    /// TOML file with acceptor settings
    #[arg(short, long)]
    config: Option<PathBuf>,
}

const NOT_WEBSOCKET: &[u8] = b"HTTP/1.1 426 Upgrade Required\r\n\
    Content-Type: text/plain\r\n\
    Content-Length: 24\r\n\
    Connection: close\r\n\
    \r\n\
    WebSocket endpoint only\n";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ws_echo=info,hybi_upgrade=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => AcceptorConfig::load(path)?,
        None => AcceptorConfig::default(),
    };

    let listener = TcpListener::bind(&cli.listen).await?;
    let local_addr = listener.local_addr()?;
    config.server_port.get_or_insert(local_addr.port());
    let acceptor = Acceptor::from_config(&config);

    tracing::info!(
        address = %local_addr,
        max_message_size = config.max_message_size,
        "Listening for connections"
    );

    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(&acceptor, stream).await {
                tracing::warn!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

async fn serve(acceptor: &Acceptor, stream: TcpStream) -> Result<(), hybi_upgrade::ConnectionError> {
    let mut conn = match acceptor.accept(stream).await? {
        Upgrade::Accepted(conn) => conn,
        Upgrade::Declined {
            request,
            mut stream,
            reason,
            ..
        } => {
            tracing::info!(path = %request.uri().path(), ?reason, "declining non-websocket request");
            stream.write_all(NOT_WEBSOCKET).await?;
            stream.shutdown().await?;
            return Ok(());
        }
    };

    while let Some(message) = conn.receive().await? {
        match message {
            Message::Text(text) => conn.send_text(&text).await?,
            Message::Binary(data) => {
                tracing::debug!(len = data.len(), "ignoring binary message");
            }
        }
    }
    Ok(())
}
