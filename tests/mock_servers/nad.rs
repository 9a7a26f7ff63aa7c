#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]
//! Mock NAD C338
//!
//! Speaks the line protocol of port 30001: commands arrive without a
//! terminator, every report is a `Key=Value\r\n` line.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// A command as received by the amplifier
#[derive(Debug, Clone)]
pub struct ReceivedCommand {
    pub text: String,
    pub at: Instant,
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

#[derive(Default)]
struct Connections {
    writers: Vec<SharedWriter>,
    tasks: Vec<JoinHandle<()>>,
}

/// Mock amplifier server
pub struct MockNadAmp {
    addr: SocketAddr,
    state: Arc<Mutex<BTreeMap<String, String>>>,
    commands: Arc<Mutex<Vec<ReceivedCommand>>>,
    connections: Arc<Mutex<Connections>>,
    accepted: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

/// Power on, volume -40 dB, unmuted, on the TV input
pub fn default_state() -> BTreeMap<String, String> {
    [
        ("Main.Model", "NADC338"),
        ("Main.Power", "On"),
        ("Main.Volume", "-40"),
        ("Main.Mute", "Off"),
        ("Main.Source", "TV"),
        ("Main.Bass", "Off"),
        ("Main.Brightness", "2"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl MockNadAmp {
    /// Start a mock amplifier on a random port with `default_state()`
    pub async fn start() -> Self {
        Self::start_with(default_state()).await
    }

    pub async fn start_with(initial: BTreeMap<String, String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(Mutex::new(initial));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(Connections::default()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let handle = {
            let state = state.clone();
            let commands = commands.clone();
            let connections = connections.clone();
            let accepted = accepted.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let state = state.clone();
                    let commands = commands.clone();
                    let mut conns = connections.lock().await;
                    let (read_half, write_half) = stream.into_split();
                    let writer = Arc::new(Mutex::new(write_half));
                    conns.writers.push(writer.clone());
                    conns.tasks.push(tokio::spawn(async move {
                        handle_connection(read_half, writer, state, commands).await;
                    }));
                }
            })
        };

        Self {
            addr,
            state,
            commands,
            connections,
            accepted,
            handle,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of TCP connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Commands received so far, in order
    pub async fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .await
            .iter()
            .map(|c| c.text.clone())
            .collect()
    }

    pub async fn received(&self) -> Vec<ReceivedCommand> {
        self.commands.lock().await.clone()
    }

    /// Current value of a key, as the amplifier reports it
    pub async fn value(&self, key: &str) -> Option<String> {
        self.state.lock().await.get(key).cloned()
    }

    /// Number of keys the full report contains
    pub async fn key_count(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn set_value(&self, key: &str, value: &str) {
        self.state
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
    }

    /// Send raw bytes to every connected client (front panel / IR changes)
    pub async fn push(&self, data: &[u8]) {
        let writers = self.connections.lock().await.writers.clone();
        for writer in writers {
            let _ = writer.lock().await.write_all(data).await;
        }
    }

    /// Close every client connection
    pub async fn drop_connections(&self) {
        let mut conns = self.connections.lock().await;
        for task in conns.tasks.drain(..) {
            task.abort();
        }
        for writer in conns.writers.drain(..) {
            let _ = writer.lock().await.shutdown().await;
        }
    }
}

impl Drop for MockNadAmp {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    writer: SharedWriter,
    state: Arc<Mutex<BTreeMap<String, String>>>,
    commands: Arc<Mutex<Vec<ReceivedCommand>>>,
) {
    let mut buf = vec![0u8; 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let at = Instant::now();
        let data = String::from_utf8_lossy(&buf[..n]).to_string();

        for text in split_commands(&data) {
            commands.lock().await.push(ReceivedCommand {
                text: text.to_string(),
                at,
            });

            let reply = {
                let mut state = state.lock().await;
                respond(&mut state, text)
            };
            if !reply.is_empty() && writer.lock().await.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Commands are not terminated; every one starts with `Main`
fn split_commands(data: &str) -> Vec<&str> {
    let starts: Vec<usize> = data.match_indices("Main").map(|(i, _)| i).collect();
    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| {
            let end = starts.get(n + 1).copied().unwrap_or(data.len());
            data[start..end].trim()
        })
        .filter(|c| !c.is_empty())
        .collect()
}

fn line(key: &str, value: &str) -> String {
    format!("{}={}\r\n", key, value)
}

fn respond(state: &mut BTreeMap<String, String>, command: &str) -> String {
    if command == "Main?" {
        // The amplifier pads its full report with a NUL
        let mut reply = String::from("\0");
        for (key, value) in state.iter() {
            reply.push_str(&line(key, value));
        }
        return reply;
    }

    if let Some((key, value)) = command.split_once('=') {
        state.insert(key.to_string(), value.to_string());
        return line(key, value);
    }

    let (key, op) = command.split_at(command.len() - 1);
    match op {
        "?" => state
            .get(key)
            .map(|value| line(key, value))
            .unwrap_or_default(),
        "+" | "-" => {
            let Some(current) = state.get(key).cloned() else {
                return String::new();
            };
            let next = match (current.as_str(), current.parse::<f64>()) {
                ("On", _) => "Off".to_string(),
                ("Off", _) => "On".to_string(),
                (_, Ok(n)) if op == "+" => format!("{}", n + 1.0),
                (_, Ok(n)) => format!("{}", n - 1.0),
                _ => current,
            };
            state.insert(key.to_string(), next.clone());
            line(key, &next)
        }
        _ => String::new(),
    }
}
