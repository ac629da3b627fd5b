use std::error::Error;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{self, AsyncBufReadExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const USAGE: &str = "usage: relay_cli <ws-url> <room> [--join]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let (Some(base), Some(room)) = (args.next(), args.next()) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };
    let join = args.any(|a| a == "--join");

    // 1. Build ws://host/ws?room=...&join=1
    let mut url = Url::parse(&base)?;
    url.query_pairs_mut().append_pair("room", &room);
    if join {
        url.query_pairs_mut().append_pair("join", "1");
    }

    // 2. Connect; a rejected room comes back as an HTTP error
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();

    println!("Connected to room {}{}", room, if join { " (joined)" } else { "" });
    println!("Type a message and press Enter:");

    // 3. Print everything the other player sends
    let reader = tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => println!("\n> Peer: {}", text),
                Ok(Message::Binary(bytes)) => println!("\n> Peer: <{} bytes>", bytes.len()),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    eprintln!("Read error: {}", e);
                    break;
                }
            }
        }
        println!("Disconnected");
    });

    // 4. Send stdin lines as text frames
    let mut stdin = io::BufReader::new(io::stdin()).lines();
    while let Ok(Some(line)) = stdin.next_line().await {
        if write.send(Message::text(line)).await.is_err() {
            break;
        }
    }

    let _ = write.close().await;
    reader.abort();

    Ok(())
}
