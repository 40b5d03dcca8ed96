use anyhow::Result;
use btlink::config::{Config, TransportMode};
use btlink::connection::{ConnectionManager, ConnectionState, LinkEvent};
use btlink::transport::{RfcommTransport, TcpTransport, Transport};
use btlink::{logging, LinkError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    logging::init_tracing(&config.logging)?;
    info!("btlink starting ({:?} transport)", config.transport.mode);

    match config.transport.mode {
        TransportMode::Rfcomm => {
            let transport = RfcommTransport::open(&config.transport).await?;
            run(ConnectionManager::new(transport, config.link.clone())).await
        }
        TransportMode::Tcp => {
            info!("  TCP simulation on {}", config.transport.tcp_bind);
            let transport =
                TcpTransport::new(config.transport.tcp_bind, config.transport.tcp_peers.clone());
            run(ConnectionManager::new(transport, config.link.clone())).await
        }
    }
}

/// Console consumer: stdin commands in, link events out
async fn run<T: Transport>(mut conn: ConnectionManager<T>) -> Result<()> {
    if let Err(e) = conn.check_radio().await {
        error!("{}", e);
        return Err(e.into());
    }

    info!("Using {} transport", conn.transport().name());
    info!("Commands: /peers, /connect [address] [--insecure], /start, /stop, /quit");
    conn.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = conn.next_event() => {
                handle_event(&event);
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !handle_command(&mut conn, line.trim()).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    conn.stop();
    Ok(())
}

/// Returns `false` when the user asked to quit
async fn handle_command<T: Transport>(conn: &mut ConnectionManager<T>, line: &str) -> bool {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("/quit") => return false,
        Some("/start") => conn.start(),
        Some("/stop") => conn.stop(),
        Some("/state") => info!("State: {}", conn.state()),
        Some("/peers") => match conn.paired_peers().await {
            Ok(peers) if peers.is_empty() => warn!("{}", LinkError::NoPairedPeers),
            Ok(peers) => {
                for peer in peers {
                    info!("  {}", peer);
                }
            }
            Err(e) => error!("{}", e),
        },
        Some("/connect") => {
            let mut address = None;
            let mut secure = true;
            for word in words {
                match word {
                    "--insecure" => secure = false,
                    other => address = Some(other),
                }
            }
            // Failures are also reported as notices on the event stream
            if let Err(e) = conn.connect_paired(address, secure).await {
                debug!("connect rejected: {}", e);
            }
        }
        Some(cmd) if cmd.starts_with('/') => warn!("Unknown command: {}", cmd),
        Some(_) => match conn.write(line.as_bytes().to_vec()) {
            Ok(()) => {}
            Err(LinkError::NotConnected) => {
                warn!("Not connected, use /connect to pick a paired device");
            }
            Err(e) => warn!("{}", e),
        },
        None => debug!("Nothing to send"),
    }
    true
}

fn handle_event(event: &LinkEvent) {
    match event {
        LinkEvent::StateChanged(ConnectionState::Connected) => info!("Connected"),
        LinkEvent::StateChanged(ConnectionState::Connecting) => info!("Connecting"),
        LinkEvent::StateChanged(ConnectionState::Listen) => info!("Listening for connections"),
        LinkEvent::StateChanged(ConnectionState::None) => info!("Not connected"),
        LinkEvent::DataSent(bytes) => info!("Sent: {}", String::from_utf8_lossy(bytes)),
        LinkEvent::DataReceived { bytes, length } => {
            info!("Received: {}", String::from_utf8_lossy(&bytes[..*length]));
        }
        LinkEvent::PeerNamed(name) => info!("Connected device {}", name),
        LinkEvent::Notice(text) => warn!("{}", text),
    }
}
