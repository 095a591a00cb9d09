//! Stream transport adapter: persistent TCP connections
//!
//! Each accepted connection gets two tasks: a reader that accumulates
//! delimited records and drives the relay, and a writer that drains an
//! unbounded channel onto the socket. Fan-out only ever touches the
//! channel, so one slow or dead client never stalls another.
//!
//! A connection is an unidentified placeholder until its JOIN is
//! admitted; until then it is invisible to the registry and receives
//! nothing. Malformed records are dropped without closing anything.
//! Unterminated input past the size cap tears the connection down.

use log::{debug, info, warn};
use shared::{RecvBuffer, RecvError, Request};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::relay::SharedRelay;

/// Accept loop; one connection task per client.
pub async fn run_listener(listener: TcpListener, relay: SharedRelay) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!("Stream connection from {}", addr);
                let relay = relay.clone();
                tokio::spawn(async move {
                    handle_connection(socket, addr, relay).await;
                });
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Drives one connection from accept to close.
async fn handle_connection(socket: TcpStream, addr: SocketAddr, relay: SharedRelay) {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Writer task: once every sender is gone (session removed or join
    // rejected) the channel closes, the task ends, and dropping the
    // write half sends FIN.
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    // The sender is held here only until JOIN hands it to the session.
    let mut tx_slot = Some(tx);
    let mut my_id: Option<u32> = None;
    let mut recv = RecvBuffer::new();
    let mut read_buf = [0u8; 2048];

    'conn: loop {
        let n = match reader.read(&mut read_buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Read error from {}: {}", addr, e);
                break;
            }
        };

        let lines = match recv.push(&read_buf[..n]) {
            Ok(lines) => lines,
            Err(RecvError::Overflow) => {
                warn!("Oversized unterminated input from {}, dropping connection", addr);
                break;
            }
        };

        for line in lines {
            let Some(request) = Request::decode(&line) else {
                debug!("Dropping unparseable record from {}", addr);
                continue;
            };

            match request {
                Request::Join {
                    name,
                    character_name,
                    character_index,
                } => {
                    if my_id.is_some() {
                        // Already identified; repeated JOIN is dropped
                        continue;
                    }
                    let Some(tx) = tx_slot.take() else {
                        continue;
                    };
                    match relay.lock().await.join_stream(
                        name.clone(),
                        character_name,
                        character_index,
                        addr,
                        tx,
                    ) {
                        Some(id) => {
                            info!("{} joined as player {} from {}", name, id, addr);
                            my_id = Some(id);
                        }
                        // Server full: terminate without a response
                        None => break 'conn,
                    }
                }
                // Resolved against the registry by address; inert for a
                // connection that never identified itself.
                Request::Pos(pos) => {
                    relay.lock().await.stream_pos(addr, pos);
                }
                Request::Chat { text } => {
                    relay.lock().await.stream_chat(addr, text);
                }
            }
        }
    }

    drop(tx_slot);
    relay.lock().await.disconnect_stream(addr);
    debug!("Stream connection from {} closed", addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationSink;
    use crate::registry::ServerConfig;
    use crate::relay::Relay;
    use shared::MAX_LINE_LEN;
    use tokio::io::{AsyncBufReadExt, BufReader};

    async fn start_server(max_players: usize) -> (SocketAddr, SharedRelay) {
        let relay = Relay::new(
            ServerConfig {
                name: "StreamTest".to_string(),
                motd: "motd".to_string(),
                max_players,
            },
            NotificationSink::detached(),
        )
        .into_shared();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_listener(listener, relay.clone()));
        (addr, relay)
    }

    async fn read_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        line
    }

    #[tokio::test]
    async fn test_join_receives_welcome_motd_batch() {
        let (addr, _relay) = start_server(8).await;

        let socket = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"JOIN|Alice|hero|1\n").await.unwrap();

        assert_eq!(read_line(&mut reader).await, "WELCOME|1|StreamTest\n");
        assert_eq!(read_line(&mut reader).await, "CHAT|0|StreamTest|motd\n");
    }

    #[tokio::test]
    async fn test_messages_before_join_are_inert() {
        let (addr, relay) = start_server(8).await;

        let socket = TcpStream::connect(addr).await.unwrap();
        let (_read_half, mut write_half) = socket.into_split();

        write_half.write_all(b"CHAT|too early\n").await.unwrap();
        write_half
            .write_all(b"POS|town|1|2|0|4|hero|1\n")
            .await
            .unwrap();
        write_half.flush().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.lock().await.count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_records_keep_connection_open() {
        let (addr, relay) = start_server(8).await;

        let socket = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"GARBAGE|x\n\n").await.unwrap();
        write_half.write_all(b"JOIN|Alice|hero|1\n").await.unwrap();

        assert_eq!(read_line(&mut reader).await, "WELCOME|1|StreamTest\n");
        assert_eq!(relay.lock().await.count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_unterminated_input_disconnects() {
        let (addr, relay) = start_server(8).await;

        let socket = TcpStream::connect(addr).await.unwrap();
        let (mut read_half, mut write_half) = socket.into_split();

        write_half.write_all(b"JOIN|Alice|hero|1\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.lock().await.count(), 1);

        let flood = vec![b'x'; MAX_LINE_LEN + 16];
        write_half.write_all(&flood).await.unwrap();
        write_half.flush().await.unwrap();

        // Server tears the session down and closes the socket
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(relay.lock().await.count(), 0);

        let mut sink = Vec::new();
        let n = tokio::time::timeout(
            Duration::from_secs(2),
            read_half.read_to_end(&mut sink),
        )
        .await
        .expect("expected the server to close the connection");
        assert!(n.is_ok());
    }

    #[tokio::test]
    async fn test_full_server_closes_without_response() {
        let (addr, relay) = start_server(1).await;

        let first = TcpStream::connect(addr).await.unwrap();
        let (_first_read, mut first_write) = first.into_split();
        first_write.write_all(b"JOIN|Alice|hero|1\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.lock().await.count(), 1);

        let second = TcpStream::connect(addr).await.unwrap();
        let (mut second_read, mut second_write) = second.into_split();
        second_write.write_all(b"JOIN|Bob|hero|1\n").await.unwrap();

        // Rejected outright: the connection closes with no bytes sent
        let mut sink = Vec::new();
        let n = tokio::time::timeout(
            Duration::from_secs(2),
            second_read.read_to_end(&mut sink),
        )
        .await
        .expect("expected the server to close the connection")
        .unwrap();
        assert_eq!(n, 0);
        assert_eq!(relay.lock().await.count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_delplayer() {
        let (addr, relay) = start_server(8).await;

        let a = TcpStream::connect(addr).await.unwrap();
        let (a_read, mut a_write) = a.into_split();
        let mut a_reader = BufReader::new(a_read);
        a_write.write_all(b"JOIN|Alice|hero|1\n").await.unwrap();
        read_line(&mut a_reader).await; // WELCOME
        read_line(&mut a_reader).await; // MOTD

        let b = TcpStream::connect(addr).await.unwrap();
        let (_b_read, mut b_write) = b.into_split();
        b_write.write_all(b"JOIN|Bob|hero|2\n").await.unwrap();
        assert_eq!(read_line(&mut a_reader).await, "ADDPLAYER|2|Bob|hero|2\n");

        drop(b_write);
        assert_eq!(read_line(&mut a_reader).await, "DELPLAYER|2\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.lock().await.count(), 1);
    }
}
