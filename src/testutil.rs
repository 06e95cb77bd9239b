use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Canned-response HTTP/1.1 server for exercising the reqwest-facing code
/// without the network. Serves one queued `(status, body)` per connection;
/// once the queue is exhausted it answers a generic ok envelope.
pub struct TestServer {
    pub hits: Arc<AtomicUsize>,
    pub requests: Arc<tokio::sync::Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn_http_server(responses: Vec<(u16, String)>) -> (String, TestServer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_task = Arc::clone(&hits);
    let requests = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let requests_task = Arc::clone(&requests);

    let handle = tokio::spawn(async move {
        let mut queue = responses.into_iter();
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            hits_task.fetch_add(1, Ordering::SeqCst);
            let (status, body) = queue
                .next()
                .unwrap_or((200, "{\"ok\":true,\"result\":{}}".to_owned()));

            let request = read_full_request(&mut stream).await;
            requests_task.lock().await.push(request);

            let reason = match status {
                200 => "OK",
                400 => "Bad Request",
                429 => "Too Many Requests",
                500 => "Internal Server Error",
                502 => "Bad Gateway",
                _ => "OK",
            };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len(),
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    (
        format!("http://{addr}"),
        TestServer {
            hits,
            requests,
            handle,
        },
    )
}

/// Drains headers plus any content-length body so the client never sees a
/// connection closed mid-request; returns the raw request text for
/// assertions.
async fn read_full_request(stream: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return String::from_utf8_lossy(&buf).into_owned(),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                    break pos + 4;
                }
            }
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let content_length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut remaining = content_length.saturating_sub(buf.len() - header_end);
    while remaining > 0 {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                remaining = remaining.saturating_sub(n);
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
