use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use shared::{
    ClientEvent, GameDraft, GameReady, PlayerSpec, ScoreRequest, ServerEvent, StartRequest,
    UndoRequest,
};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Drives one scripted scoring session against a running server
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// WebSocket URL of the server
    #[clap(short, long, default_value = "ws://127.0.0.1:3000")]
    url: String,
    /// Uid to register with
    #[clap(long, default_value = "test-client")]
    uid: String,
}

async fn send(socket: &mut Socket, event: &ClientEvent) -> Result<(), Box<dyn std::error::Error>> {
    let text = serde_json::to_string(event)?;
    println!("-> {}", text);
    socket.send(Message::text(text)).await?;
    Ok(())
}

// Prints everything the server sends until it goes quiet
async fn drain(socket: &mut Socket) -> Result<Vec<ServerEvent>, Box<dyn std::error::Error>> {
    let mut events = Vec::new();
    while let Ok(Some(frame)) = timeout(Duration::from_millis(300), socket.next()).await {
        if let Message::Text(text) = frame? {
            match serde_json::from_str::<ServerEvent>(text.as_str()) {
                Ok(event) => {
                    println!("<- {:?}", event);
                    events.push(event);
                }
                Err(e) => println!("Failed to parse server event: {}", e),
            }
        }
    }
    Ok(events)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("Connecting to {}", args.url);
    let (mut socket, _) = connect_async(args.url.as_str()).await?;
    drain(&mut socket).await?;

    send(&mut socket, &ClientEvent::Register(Some(args.uid.clone()))).await?;
    drain(&mut socket).await?;

    let start = StartRequest {
        game_id: None,
        game: GameDraft {
            players: Some(vec![PlayerSpec::named("Alice"), PlayerSpec::named("Bob")]),
            name: Some("Test game".to_string()),
        },
    };
    send(&mut socket, &ClientEvent::GameStart(start)).await?;

    let game_id = drain(&mut socket)
        .await?
        .into_iter()
        .find_map(|event| match event {
            ServerEvent::GameReady(GameReady::Ready { game_id, .. }) => Some(game_id),
            _ => None,
        })
        .ok_or("server did not confirm the game")?;
    println!("Game ready: {}", game_id);

    send(&mut socket, &ClientEvent::GameGet(game_id.clone())).await?;
    drain(&mut socket).await?;

    for (player_selected, points) in [(0, 4), (1, 10), (0, 2)] {
        let score = ScoreRequest {
            game_id: game_id.clone(),
            points,
            player_selected,
        };
        send(&mut socket, &ClientEvent::GameScore(score)).await?;
        drain(&mut socket).await?;
    }

    send(
        &mut socket,
        &ClientEvent::GameUndo(UndoRequest {
            game_id: game_id.clone(),
        }),
    )
    .await?;
    drain(&mut socket).await?;

    send(&mut socket, &ClientEvent::Disconnect).await?;
    drain(&mut socket).await?;

    socket.close(None).await?;
    println!("Test client finished");
    Ok(())
}
