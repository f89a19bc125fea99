//! Server network layer handling WebSocket channels and core loop coordination

use crate::broadcast::{ConnId, Outbox};
use crate::context::SyncContext;
use crate::persistence::SyncFailure;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{ClientEvent, ServerEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};

/// Messages sent from channel tasks to the core loop
#[derive(Debug)]
pub enum ServerMessage {
    Connected { conn: ConnId, outbox: Outbox },
    EventReceived { conn: ConnId, event: ClientEvent },
    Disconnected { conn: ConnId },
}

/// Accepts channels and drives the synchronization core
pub struct Server {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    context: SyncContext,
    failures: Option<mpsc::UnboundedReceiver<SyncFailure>>,

    server_tx: Option<mpsc::UnboundedSender<ServerMessage>>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn bind(
        addr: &str,
        context: SyncContext,
        failures: Option<mpsc::UnboundedReceiver<SyncFailure>>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on {}", local_addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            listener: Some(listener),
            local_addr,
            context,
            failures,
            server_tx: Some(server_tx),
            server_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns task that accepts channels and starts one task per channel
    fn spawn_acceptor(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = self.listener.take().ok_or("server already running")?;
        let server_tx = self.server_tx.take().ok_or("server already running")?;

        tokio::spawn(async move {
            let mut next_conn: ConnId = 1;

            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let conn = next_conn;
                        next_conn += 1;
                        let server_tx = server_tx.clone();

                        tokio::spawn(async move {
                            if let Err(e) = serve_channel(conn, stream, addr, server_tx).await {
                                warn!("Connection {} from {} failed: {}", conn, addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });

        Ok(())
    }

    /// Main server loop: one event at a time, each run to completion
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_acceptor()?;
        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::Connected { conn, outbox }) => {
                            self.context.connect(conn, outbox);
                        }
                        Some(ServerMessage::EventReceived { conn, event }) => {
                            self.context.handle_event(conn, event, Instant::now());
                        }
                        Some(ServerMessage::Disconnected { conn }) => {
                            self.context.disconnect(conn, Instant::now());
                        }
                        None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = self.context.sweep_due() => {
                    self.context.sweep(Instant::now());
                },

                failure = next_failure(&mut self.failures) => {
                    match failure {
                        Some(failure) => error!(
                            "Gave up syncing {} of game {} after {} attempt(s): {}",
                            failure.kind, failure.game_id, failure.attempts, failure.error
                        ),
                        None => {
                            warn!("Persistence worker stopped");
                            self.failures = None;
                        }
                    }
                },
            }
        }

        Ok(())
    }
}

async fn next_failure(
    failures: &mut Option<mpsc::UnboundedReceiver<SyncFailure>>,
) -> Option<SyncFailure> {
    match failures {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Runs one channel: upgrade, read frames into the core, write its outbox
async fn serve_channel(
    conn: ConnId,
    stream: TcpStream,
    addr: SocketAddr,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) -> Result<(), tungstenite::Error> {
    let socket = tokio_tungstenite::accept_async(stream).await?;
    info!("Connection {} opened from {}", conn, addr);

    let (mut sink, mut source) = socket.split();
    let (outbox, mut inbox) = mpsc::unbounded_channel::<Arc<ServerEvent>>();

    if server_tx
        .send(ServerMessage::Connected { conn, outbox })
        .is_err()
    {
        return Ok(());
    }

    // Ends once the core drops the outbox
    tokio::spawn(async move {
        while let Some(event) = inbox.recv().await {
            let text = match serde_json::to_string(event.as_ref()) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {}: {}", event.name(), e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::text(text)).await {
                debug!("Connection {} write failed: {}", conn, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                Ok(event) => {
                    if server_tx
                        .send(ServerMessage::EventReceived { conn, event })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => warn!("Malformed frame from connection {}: {}", conn, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Connection {} read failed: {}", conn, e);
                break;
            }
        }
    }

    info!("Connection {} closed", conn);
    let _ = server_tx.send(ServerMessage::Disconnected { conn });
    Ok(())
}
