//! Scripted HTTP server for provider tests.

use genapply_core::{StreamCallback, StreamChunk};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct MockHttpResponse {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<String>,
}

impl MockHttpResponse {
    pub fn sse(frames: &[&str]) -> Self {
        let mut body = String::new();
        for frame in frames {
            body.push_str("data: ");
            body.push_str(frame);
            body.push_str("\n\n");
        }
        Self {
            status: 200,
            body,
            retry_after: None,
        }
    }

    pub fn error(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            retry_after: None,
        }
    }
}

pub(crate) struct MockServer {
    pub base_url: String,
    request_count: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<(String, String)>>>,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockServer {
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    /// `(request line, body)` of every request received so far.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub(crate) fn start_mock_server(responses: Vec<MockHttpResponse>) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    listener
        .set_nonblocking(true)
        .expect("set nonblocking listener");
    let addr = listener.local_addr().expect("addr");
    let request_count = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let count_thread = Arc::clone(&request_count);
    let requests_thread = Arc::clone(&requests);
    let (tx, rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        loop {
            if rx.try_recv().is_ok() {
                break;
            }
            match listener.accept() {
                Ok((mut stream, _)) => {
                    stream.set_nonblocking(false).expect("blocking stream");
                    let request = read_http_request(&mut stream).unwrap_or_default();
                    requests_thread.lock().expect("requests lock").push(request);
                    let idx = count_thread.fetch_add(1, Ordering::SeqCst);
                    let selected = responses
                        .get(idx)
                        .or_else(|| responses.last())
                        .cloned()
                        .unwrap_or_else(|| MockHttpResponse::error(500, "{\"error\":\"empty script\"}"));
                    let content_type = if selected.status == 200 {
                        "text/event-stream"
                    } else {
                        "application/json"
                    };
                    let mut head = format!(
                        "HTTP/1.1 {} Scripted\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n",
                        selected.status,
                        selected.body.len()
                    );
                    if let Some(retry_after) = selected.retry_after {
                        head.push_str(&format!("Retry-After: {retry_after}\r\n"));
                    }
                    head.push_str("\r\n");
                    let _ = stream.write_all(format!("{head}{}", selected.body).as_bytes());
                    let _ = stream.flush();
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(2));
                }
                Err(_) => break,
            }
        }
    });
    MockServer {
        base_url: format!("http://{addr}"),
        request_count,
        requests,
        stop_tx: Some(tx),
        handle: Some(handle),
    }
}

fn read_http_request(stream: &mut TcpStream) -> std::io::Result<(String, String)> {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];
    let mut header_end = None;
    while header_end.is_none() {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        header_end = buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|idx| idx + 4);
    }
    let header_len = header_end.unwrap_or(buffer.len());
    let headers = String::from_utf8_lossy(&buffer[..header_len]).to_string();
    let content_length = headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buffer[header_len..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    let request_line = headers.lines().next().unwrap_or_default().to_string();
    Ok((request_line, String::from_utf8_lossy(&body).to_string()))
}

/// Callback that records text deltas and tool call names.
pub(crate) fn recording_callback() -> (StreamCallback, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let cb: StreamCallback = Arc::new(move |chunk| {
        let entry = match chunk {
            StreamChunk::ContentDelta(text) => text,
            StreamChunk::ToolCallStart { tool_name, .. } => format!("[call {tool_name}]"),
            StreamChunk::ToolCallEnd { tool_name, .. } => format!("[done {tool_name}]"),
            StreamChunk::Done => "[DONE]".to_string(),
        };
        sink.lock().expect("seen lock").push(entry);
    });
    (cb, seen)
}
