//! TCP client for the NAD C338
//!
//! One `NadClient` per amplifier. The client owns the write half of the
//! connection and the last known `DeviceState`; the read half is handed to
//! the caller by `connect()` and driven through `read_loop()`, so the
//! adapter decides how to multiplex reading with shutdown and commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::protocol::{
    make_command, parse_part, DeviceState, Operator, Value, C338_SOURCES, CMD_MAIN, CMD_MUTE,
    CMD_POWER, CMD_SOURCE, CMD_VOLUME,
};
use super::{NadError, NadResult};

pub const DEFAULT_PORT: u16 = 30001;
/// Minimum spacing between two commands; the amplifier drops commands sent faster
pub const CMD_MIN_INTERVAL: Duration = Duration::from_millis(150);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

const LINE_TERMINATOR: &[u8] = b"\r\n";
const READ_CHUNK: usize = 1024;
/// Longest pending line kept while waiting for its terminator
const MAX_LINE_LEN: usize = 4096;

/// Connection settings for a client
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub port: u16,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub command_interval: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            command_interval: CMD_MIN_INTERVAL,
        }
    }
}

/// Write side of a live connection
struct CommandWriter {
    write_half: OwnedWriteHalf,
    last_command: Option<Instant>,
}

/// Incoming byte buffer plus the state it has produced so far
#[derive(Default)]
struct ReadState {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a terminator
    scanned: usize,
    state: DeviceState,
}

pub struct NadClient {
    host: String,
    settings: ClientSettings,
    writer: Mutex<Option<CommandWriter>>,
    read_state: Mutex<ReadState>,
    state_tx: watch::Sender<DeviceState>,
    closing: AtomicBool,
}

impl NadClient {
    pub fn new(host: impl Into<String>, settings: ClientSettings) -> Self {
        let (state_tx, _) = watch::channel(DeviceState::default());
        Self {
            host: host.into(),
            settings,
            writer: Mutex::new(None),
            read_state: Mutex::new(ReadState::default()),
            state_tx,
            closing: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// `host:port` of the amplifier
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.settings.port)
    }

    /// Subscribe to state changes. The receiver always holds the latest state.
    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.state_tx.subscribe()
    }

    /// Whether `disconnect()` was requested since the last `connect()`
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Open the TCP connection and ask the amplifier for its full state.
    ///
    /// Returns the read half, to be driven with `read_loop()`.
    pub async fn connect(&self) -> NadResult<OwnedReadHalf> {
        self.closing.store(false, Ordering::SeqCst);

        let addr = self.addr();
        debug!("Connecting to {}", addr);

        let stream = timeout(self.settings.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| NadError::ConnectTimeout(addr.clone()))??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        {
            let mut writer = self.writer.lock().await;
            *writer = Some(CommandWriter {
                write_half,
                last_command: None,
            });
        }

        info!("Connected to {}", addr);
        self.query_state().await?;

        Ok(read_half)
    }

    /// Read notifications until the connection closes.
    ///
    /// Always ends with an error: EOF is reported as `ConnectionClosed`.
    pub async fn read_loop(&self, mut reader: OwnedReadHalf) -> NadResult<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(NadError::ConnectionClosed(self.addr()));
            }
            self.ingest(&chunk[..n]).await;
        }
    }

    /// Feed raw bytes from the amplifier.
    ///
    /// NUL bytes are dropped, complete `\r\n` lines are parsed and applied
    /// together as one update. Subscribers are notified once per call if
    /// anything was applied. Returns whether the state changed.
    pub async fn ingest(&self, data: &[u8]) -> bool {
        let snapshot = {
            let mut read_state = self.read_state.lock().await;
            let ReadState {
                buffer,
                scanned,
                state,
            } = &mut *read_state;
            buffer.extend(data.iter().copied().filter(|b| *b != 0));

            let mut parts = Vec::new();
            let mut start = 0usize;
            while let Some(pos) = find_terminator(&buffer[(*scanned).max(start)..]) {
                let end = (*scanned).max(start) + pos;
                let line = String::from_utf8_lossy(&buffer[start..end]).into_owned();
                start = end + LINE_TERMINATOR.len();
                if line.is_empty() {
                    continue;
                }

                match parse_part(&line) {
                    Ok(part) => parts.push(part),
                    Err(NadError::UnknownCommand(key)) => {
                        debug!("Ignoring unknown key from {}: {}", self.host, key);
                    }
                    Err(e) => {
                        warn!("Skipping line from {}: {}", self.host, e);
                    }
                }
            }
            buffer.drain(..start);

            if buffer.len() > MAX_LINE_LEN {
                warn!(
                    "Dropping {} bytes from {} without a line terminator",
                    buffer.len(),
                    self.host
                );
                buffer.clear();
            }
            // A trailing `\r` may still be completed by the next read
            *scanned = buffer.len().saturating_sub(LINE_TERMINATOR.len() - 1);

            if !state.apply_batch(parts) {
                return false;
            }
            state.clone()
        };

        debug!("State changed on {}: {:?}", self.host, snapshot);
        self.state_tx.send_replace(snapshot);
        true
    }

    /// Forget the connection and all state after the socket went away.
    ///
    /// Returns the (now empty) state, which is also sent to subscribers.
    pub async fn connection_lost(&self) -> DeviceState {
        {
            let mut writer = self.writer.lock().await;
            *writer = None;
        }

        let snapshot = {
            let mut read_state = self.read_state.lock().await;
            read_state.buffer.clear();
            read_state.scanned = 0;
            read_state.state.clear();
            read_state.state.clone()
        };

        if self.is_closing() {
            debug!("Disconnected from {} because of close", self.host);
        } else {
            warn!("Disconnected from {}", self.host);
        }

        self.state_tx.send_replace(snapshot.clone());
        snapshot
    }

    /// Close the connection on request; no reconnection should follow
    pub async fn disconnect(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.write_half.shutdown().await;
        }
    }

    /// Send a command, throttled to `command_interval`
    pub async fn exec_command(
        &self,
        command: &str,
        operator: Operator,
        value: Option<Value>,
    ) -> NadResult<()> {
        let cmd = make_command(command, operator, value)?;

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| NadError::NotConnected(self.host.clone()))?;

        if let Some(last) = writer.last_command {
            let ready_at = last + self.settings.command_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }

        debug!("Sending to {}: {}", self.host, cmd);
        writer.write_half.write_all(cmd.as_bytes()).await?;
        writer.write_half.flush().await?;
        writer.last_command = Some(Instant::now());

        Ok(())
    }

    /// Snapshot of the current device state
    pub async fn status(&self) -> DeviceState {
        self.read_state.lock().await.state.clone()
    }

    /// Ask the amplifier to report every `Main.*` value
    pub async fn query_state(&self) -> NadResult<()> {
        self.exec_command(CMD_MAIN, Operator::Query, None).await
    }

    pub async fn power_off(&self) -> NadResult<()> {
        self.exec_command(CMD_POWER, Operator::Set, Some(Value::Bool(false)))
            .await
    }

    pub async fn power_on(&self) -> NadResult<()> {
        self.exec_command(CMD_POWER, Operator::Set, Some(Value::Bool(true)))
            .await
    }

    /// Set the volume in dB (-80 up to, not including, 0)
    pub async fn set_volume(&self, volume: f64) -> NadResult<()> {
        self.exec_command(CMD_VOLUME, Operator::Set, Some(Value::Float(volume)))
            .await
    }

    pub async fn volume_up(&self) -> NadResult<()> {
        self.exec_command(CMD_VOLUME, Operator::Increase, None).await
    }

    pub async fn volume_down(&self) -> NadResult<()> {
        self.exec_command(CMD_VOLUME, Operator::Decrease, None).await
    }

    pub async fn mute(&self) -> NadResult<()> {
        self.exec_command(CMD_MUTE, Operator::Set, Some(Value::Bool(true)))
            .await
    }

    pub async fn unmute(&self) -> NadResult<()> {
        self.exec_command(CMD_MUTE, Operator::Set, Some(Value::Bool(false)))
            .await
    }

    pub async fn select_source(&self, source: &str) -> NadResult<()> {
        self.exec_command(CMD_SOURCE, Operator::Set, Some(Value::from(source)))
            .await
    }

    pub fn available_sources(&self) -> Vec<String> {
        C338_SOURCES.iter().map(|s| s.to_string()).collect()
    }
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(LINE_TERMINATOR.len())
        .position(|w| w == LINE_TERMINATOR)
}
