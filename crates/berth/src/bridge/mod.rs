//! Byte bridge between a connection and a container's pseudo-terminal.
//!
//! Two pumps run on dedicated threads since pty I/O is blocking:
//! pty output is forwarded verbatim as [`ServerEvent::Stdout`], and input
//! bytes are written verbatim to the pty in the order they were sent.
//! Status lines never pass through the bridge.

mod pty;

pub use pty::NativePtySpawner;

use std::io::{Read, Write};
use std::sync::Mutex;
use std::thread;

use berth_protocol::ServerEvent;
use bytes::Bytes;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const READ_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("empty terminal command")]
    EmptyCommand,

    #[error("failed to create pty: {0}")]
    CreateFailed(String),

    #[error("failed to spawn terminal process: {0}")]
    SpawnFailed(String),

    #[error("terminal closed")]
    Closed,

    #[error("pty i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminates a spawned terminal process.
pub trait TtyKill: Send {
    /// Kill the process. Killing an already-exited process is not an error.
    fn kill(&mut self) -> std::io::Result<()>;
}

/// A freshly spawned terminal process and its pty ends.
pub struct TtyProcess {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub killer: Box<dyn TtyKill>,
}

/// Spawns terminal processes. Implemented by the native pty spawner and by
/// fakes in tests.
pub trait TtySpawner: Send + Sync {
    fn spawn(&self, argv: &[String]) -> Result<TtyProcess, BridgeError>;
}

/// An attached bridge. Dropping it without [`TtyBridge::kill`] leaves the
/// process running until its pty closes.
pub struct TtyBridge {
    input: mpsc::UnboundedSender<Bytes>,
    killer: Mutex<Box<dyn TtyKill>>,
    closed: CancellationToken,
}

impl TtyBridge {
    /// Start both pumps. Output goes to `output`; `closed` fires when the
    /// pty reports EOF (the shell exited) or the output side went away.
    pub fn attach(process: TtyProcess, output: mpsc::Sender<ServerEvent>) -> Result<Self, BridgeError> {
        let TtyProcess {
            mut reader,
            mut writer,
            killer,
        } = process;
        let closed = CancellationToken::new();
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Bytes>();

        let reader_closed = closed.clone();
        thread::Builder::new()
            .name("berth-pty-read".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = Bytes::copy_from_slice(&buf[..n]);
                            if output.blocking_send(ServerEvent::Stdout(chunk)).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!("pty read ended: {}", e);
                            break;
                        }
                    }
                }
                reader_closed.cancel();
            })?;

        thread::Builder::new()
            .name("berth-pty-write".to_string())
            .spawn(move || {
                while let Some(bytes) = input_rx.blocking_recv() {
                    if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
                        debug!("pty write ended: {}", e);
                        break;
                    }
                }
            })?;

        Ok(Self {
            input: input_tx,
            killer: Mutex::new(killer),
            closed,
        })
    }

    /// Queue input bytes for the pty.
    pub fn send_input(&self, bytes: Bytes) -> Result<(), BridgeError> {
        self.input.send(bytes).map_err(|_| BridgeError::Closed)
    }

    /// Fires when the terminal's output side has ended.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Kill the terminal process. Tolerates a process that already exited,
    /// e.g. because its container was stopped first.
    pub fn kill(&self) {
        let mut killer = self.killer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = killer.kill() {
            warn!("failed to kill terminal process: {}", e);
        }
    }
}
