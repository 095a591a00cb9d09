//! Manual smoke client for the stream transport.
//!
//! Joins, announces a few positions and a chat line, prints everything
//! the server pushes back, then disconnects.

use shared::{Event, PosUpdate, RecvBuffer};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:4110".to_string());

    let socket = TcpStream::connect(&addr).await?;
    println!("Connected to {}", addr);
    let (mut reader, mut writer) = socket.into_split();

    // Print every event the server pushes
    let printer = tokio::spawn(async move {
        let mut recv = RecvBuffer::new();
        let mut buf = [0u8; 2048];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let Ok(lines) = recv.push(&buf[..n]) else {
                        break;
                    };
                    for line in lines {
                        match Event::decode(&line) {
                            Some(event) => println!("<- {:?}", event),
                            None => println!("<- (unparsed) {}", line.trim_end()),
                        }
                    }
                }
            }
        }
        println!("Server closed the connection");
    });

    println!("-> JOIN as SmokeTest");
    writer.write_all(b"JOIN|SmokeTest|hero|1\n").await?;
    sleep(Duration::from_millis(200)).await;

    for step in 0..5i32 {
        let pos = PosUpdate {
            map: "town".to_string(),
            x: step * 2,
            y: step,
            direction: 2,
            speed: 4,
            character_name: "hero".to_string(),
            character_index: 1,
        };
        let line = format!(
            "POS|{}|{}|{}|{}|{}|{}|{}\n",
            pos.map, pos.x, pos.y, pos.direction, pos.speed, pos.character_name, pos.character_index
        );
        println!("-> {}", line.trim_end());
        writer.write_all(line.as_bytes()).await?;
        sleep(Duration::from_millis(500)).await;
    }

    println!("-> CHAT");
    writer.write_all(b"CHAT|smoke test complete\n").await?;
    sleep(Duration::from_millis(500)).await;

    drop(writer);
    let _ = printer.await;
    Ok(())
}
