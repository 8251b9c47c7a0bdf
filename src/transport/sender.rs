use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{
    encode_frame, ControlCommand, FrameDecoder, CMD_ACCEPT_BACK_PRESSURE, MAX_COMMAND_LEN,
};
use super::{Shared, TransportConfig, TransportError};

/// An open connection to the backend.
///
/// The read half belongs to a control-channel task that lives as long as
/// the connection does.
struct Connection {
    writer: BufWriter<OwnedWriteHalf>,
    closed: Arc<AtomicBool>,
    reader_cancel: CancellationToken,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_cancel.cancel();
    }
}

/// Clears the in-flight flag however `send` returns.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the socket and performs framed sends with reconnect and retry.
pub(super) struct Sender {
    host: String,
    port: u16,
    accept_back_pressure: bool,
    retries: u32,
    retry_delay: Duration,
    conn: Option<Connection>,
    shared: Arc<Shared>,
}

impl Sender {
    pub(super) fn new(cfg: &TransportConfig, shared: Arc<Shared>) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            accept_back_pressure: cfg.accept_back_pressure,
            retries: cfg.retries,
            retry_delay: cfg.retry_delay,
            conn: None,
            shared,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(super) fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_open)
    }

    /// Open a connection if there is no usable one.
    pub(super) async fn ensure_connected(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        self.conn = None;

        match self.connect().await {
            Ok(conn) => {
                self.conn = Some(conn);
                Ok(())
            }
            Err(e) => {
                error!(
                    host = %self.host,
                    port = self.port,
                    error = %e,
                    "could not open a connection to the backend",
                );

                if self.shared.draining.load(Ordering::Acquire) {
                    let dropped = self.shared.queue.discard_all();
                    self.shared.stats.record_discarded(dropped);
                    error!(
                        host = %self.host,
                        port = self.port,
                        discarded = dropped,
                        "connection lost while waiting for empty queue, discarding messages",
                    );
                }

                Err(e)
            }
        }
    }

    async fn connect(&mut self) -> Result<Connection, TransportError> {
        self.shared.stats.record_connect_attempt();
        info!(host = %self.host, port = self.port, "opening connection to backend");

        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|source| TransportError::Connect {
                addr: self.addr(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let (read, write) = stream.into_split();

        // A replacement backend knows nothing of its predecessor's requests.
        self.shared.slow_down_ms.store(0, Ordering::Release);

        let closed = Arc::new(AtomicBool::new(false));
        let reader_cancel = self.shared.cancel.child_token();
        tokio::spawn(read_control(
            read,
            Arc::clone(&self.shared),
            self.accept_back_pressure,
            Arc::clone(&closed),
            reader_cancel.clone(),
        ));

        let mut conn = Connection {
            writer: BufWriter::new(write),
            closed,
            reader_cancel,
        };

        if self.accept_back_pressure {
            let mut frame = Vec::with_capacity(CMD_ACCEPT_BACK_PRESSURE.len() + 1);
            encode_frame(CMD_ACCEPT_BACK_PRESSURE, &mut frame);
            conn.writer.write_all(&frame).await?;
            conn.writer.flush().await?;
        }

        self.shared.stats.record_connection_opened();
        info!(
            host = %self.host,
            port = self.port,
            accept_back_pressure = self.accept_back_pressure,
            "connected to backend",
        );

        Ok(conn)
    }

    /// Send one framed message, reconnecting and retrying on failure.
    ///
    /// Makes at most `retries + 1` attempts. A message that cannot be sent
    /// is dropped and reported as `MessageLost`.
    pub(super) async fn send(&mut self, text: &str, flush: bool) -> Result<(), TransportError> {
        let shared = Arc::clone(&self.shared);
        let _in_flight = InFlight::enter(&shared.sending);

        let delay = self.slow_down_delay();
        if !delay.is_zero() {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut frame = Vec::with_capacity(text.len() + 1);
        encode_frame(text, &mut frame);

        let attempts = self.retries + 1;
        for attempt in 0..attempts {
            if self.ensure_connected().await.is_ok() {
                let flush = flush || !self.slow_down_delay().is_zero();
                match self.write(&frame, flush).await {
                    Ok(()) => {
                        self.shared.stats.record_sent(frame.len());
                        return Ok(());
                    }
                    Err(e) => {
                        error!(
                            host = %self.host,
                            port = self.port,
                            error = %e,
                            "failed to send message to backend",
                        );
                        self.conn = None;
                    }
                }
            }

            if self.shared.cancel.is_cancelled() {
                break;
            }

            let remaining = attempts - attempt - 1;
            if remaining > 0 {
                info!(remaining, "will retry {} more times", remaining);
                tokio::select! {
                    _ = self.shared.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        self.shared.stats.record_lost();
        error!(
            host = %self.host,
            port = self.port,
            attempts,
            bytes = frame.len(),
            "message not sent and lost",
        );
        Err(TransportError::MessageLost { attempts })
    }

    async fn write(&mut self, frame: &[u8], flush: bool) -> io::Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        conn.writer.write_all(frame).await?;
        if flush {
            conn.writer.flush().await?;
        }
        Ok(())
    }

    fn slow_down_delay(&self) -> Duration {
        if !self.accept_back_pressure {
            return Duration::ZERO;
        }
        Duration::from_millis(self.shared.slow_down_ms.load(Ordering::Acquire))
    }

    /// Flush and close the connection, if any.
    pub(super) async fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        info!(host = %self.host, port = self.port, "closing connection to backend");
        if let Err(e) = conn.writer.flush().await {
            debug!(error = %e, "flush on close failed");
        }
        if let Err(e) = conn.writer.shutdown().await {
            debug!(error = %e, "shutdown on close failed");
        }
    }
}

/// Watch the read half for control frames until EOF, error or cancellation.
async fn read_control(
    mut read: OwnedReadHalf,
    shared: Arc<Shared>,
    accept_back_pressure: bool,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; MAX_COMMAND_LEN];

    loop {
        let read_result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = read.read(&mut buf) => r,
        };

        match read_result {
            Ok(0) => {
                info!("backend has closed the connection");
                break;
            }
            Ok(n) => {
                for frame in decoder.feed(&buf[..n]) {
                    apply_command(
                        ControlCommand::parse(&frame),
                        &shared,
                        accept_back_pressure,
                    );
                }
            }
            Err(e) => {
                info!(error = %e, "error reading control channel from backend");
                break;
            }
        }
    }

    closed.store(true, Ordering::Release);
}

fn apply_command(cmd: ControlCommand, shared: &Shared, accept_back_pressure: bool) {
    let previous = shared.slow_down_ms.load(Ordering::Acquire);

    match cmd {
        ControlCommand::SlowDown { millis } => {
            if !accept_back_pressure {
                return;
            }
            if previous != millis {
                debug!(millis, "back pressure requested");
            }
            shared.slow_down_ms.store(millis, Ordering::Release);
        }
        ControlCommand::SpeedUp | ControlCommand::Unrecognized(_) => {
            if let ControlCommand::Unrecognized(command) = &cmd {
                if accept_back_pressure {
                    error!(
                        command = %command,
                        "control command not understood, treating it as a back pressure cancellation",
                    );
                }
            }
            if accept_back_pressure && previous > 0 {
                debug!("back pressure request cancelled");
            }
            shared.slow_down_ms.store(0, Ordering::Release);
        }
    }
}
