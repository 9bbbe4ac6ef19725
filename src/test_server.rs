//! Minimal HTTP stub standing in for an Ollama server in tests.

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

/// A request as seen by the stub.
#[derive(Debug)]
pub struct Captured {
    pub head: String,
    pub body: String,
}

/// Serves `body` with `status` to every connection, on a random loopback port.
///
/// Returns the `host:port` to connect to and a channel receiving each request.
pub async fn serve(
    status: &'static str,
    body: &'static str,
) -> (String, mpsc::UnboundedReceiver<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let captured = read_request(&mut socket).await;
            let _ = tx.send(captured);

            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (host, rx)
}

/// Returns a loopback address nothing listens on.
pub async fn unused_host() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

async fn read_request(socket: &mut TcpStream) -> Captured {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = socket.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);

        let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&data[..end]).into_owned();
        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);

        let body_start = end + 4;
        if data.len() >= body_start + content_length {
            let body =
                String::from_utf8_lossy(&data[body_start..body_start + content_length]).into_owned();
            return Captured { head, body };
        }
    }

    Captured {
        head: String::from_utf8_lossy(&data).into_owned(),
        body: String::new(),
    }
}
