//! In-process NNTP server speaking just enough RFC 3977 for triage

use nzb_triage::ServerConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Default)]
struct ServerState {
    articles: Mutex<HashMap<String, Vec<u8>>>,
    credentials: Option<(String, String)>,
    connections: AtomicUsize,
    stat_commands: AtomicUsize,
    body_commands: AtomicUsize,
}

/// Fake news server bound to an ephemeral localhost port
pub struct FakeNntpServer {
    port: u16,
    state: Arc<ServerState>,
    handle: JoinHandle<()>,
}

impl FakeNntpServer {
    /// Start a server that accepts any client
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    /// Start a server that requires AUTHINFO with these credentials
    pub async fn start_with_auth(user: &str, pass: &str) -> Self {
        Self::start_with(Some((user.to_string(), pass.to_string()))).await
    }

    async fn start_with(credentials: Option<(String, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake NNTP server");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(ServerState {
            credentials,
            ..ServerState::default()
        });

        let accept_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, Arc::clone(&accept_state)));
            }
        });

        Self { port, state, handle }
    }

    /// Store an article body under `message_id` (without angle brackets)
    pub fn add_article(&self, message_id: &str, body: Vec<u8>) {
        self.state
            .articles
            .lock()
            .expect("articles lock")
            .insert(message_id.to_string(), body);
    }

    /// Server settings pointing at this instance
    pub fn server_config(&self) -> ServerConfig {
        let mut server = ServerConfig::new("127.0.0.1");
        server.port = self.port;
        server.connect_timeout = Duration::from_secs(5);
        if let Some((user, pass)) = &self.state.credentials {
            server.username = Some(user.clone());
            server.password = Some(pass.clone());
        }
        server
    }

    /// TCP connections accepted so far
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// STAT commands received so far
    pub fn stat_commands(&self) -> usize {
        self.state.stat_commands.load(Ordering::SeqCst)
    }

    /// BODY commands received so far
    pub fn body_commands(&self) -> usize {
        self.state.body_commands.load(Ordering::SeqCst)
    }
}

impl Drop for FakeNntpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn strip_brackets(arg: &str) -> &str {
    arg.trim().trim_start_matches('<').trim_end_matches('>')
}

/// Dot-stuff `body` and append the terminating line
fn multiline(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    for line in body.split_inclusive(|b| *b == b'\n') {
        if line.starts_with(b".") {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

async fn serve(socket: tokio::net::TcpStream, state: Arc<ServerState>) {
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read);
    if write.write_all(b"200 nzb-triage test server ready\r\n").await.is_err() {
        return;
    }

    let mut authenticated = state.credentials.is_none();
    let mut pending_user: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end();
        let (verb, arg) = command.split_once(' ').unwrap_or((command, ""));

        let reply: Vec<u8> = match verb.to_ascii_uppercase().as_str() {
            "AUTHINFO" => {
                let (kind, value) = arg.split_once(' ').unwrap_or((arg, ""));
                match (kind.to_ascii_uppercase().as_str(), &state.credentials) {
                    ("USER", _) => {
                        pending_user = Some(value.to_string());
                        b"381 password required\r\n".to_vec()
                    }
                    ("PASS", Some((user, pass)))
                        if pending_user.as_deref() == Some(user.as_str()) && value == pass =>
                    {
                        authenticated = true;
                        b"281 authentication accepted\r\n".to_vec()
                    }
                    ("PASS", None) => {
                        authenticated = true;
                        b"281 authentication accepted\r\n".to_vec()
                    }
                    _ => b"481 authentication failed\r\n".to_vec(),
                }
            }
            "QUIT" => {
                let _ = write.write_all(b"205 bye\r\n").await;
                return;
            }
            _ if !authenticated => b"480 authentication required\r\n".to_vec(),
            "DATE" => b"111 20240101000000\r\n".to_vec(),
            "STAT" => {
                state.stat_commands.fetch_add(1, Ordering::SeqCst);
                let id = strip_brackets(arg);
                let present = state.articles.lock().expect("articles lock").contains_key(id);
                if present {
                    format!("223 0 <{}>\r\n", id).into_bytes()
                } else {
                    b"430 no such article\r\n".to_vec()
                }
            }
            "BODY" => {
                state.body_commands.fetch_add(1, Ordering::SeqCst);
                let id = strip_brackets(arg);
                let body = state.articles.lock().expect("articles lock").get(id).cloned();
                match body {
                    Some(body) => {
                        let mut reply = format!("222 0 <{}>\r\n", id).into_bytes();
                        reply.extend(multiline(&body));
                        reply
                    }
                    None => b"430 no such article\r\n".to_vec(),
                }
            }
            _ => b"500 command not recognized\r\n".to_vec(),
        };

        if write.write_all(&reply).await.is_err() {
            return;
        }
    }
}
