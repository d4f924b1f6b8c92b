//! Terminal processes on a native pseudo-terminal via `portable-pty`.

use log::debug;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};

use super::{BridgeError, TtyKill, TtyProcess, TtySpawner};

/// Spawns `<engine> exec -it <container> <shell>` (or any argv) on a new pty.
#[derive(Debug, Clone)]
pub struct NativePtySpawner {
    size: PtySize,
}

impl Default for NativePtySpawner {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl NativePtySpawner {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            size: PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            },
        }
    }
}

impl TtySpawner for NativePtySpawner {
    fn spawn(&self, argv: &[String]) -> Result<TtyProcess, BridgeError> {
        let (program, args) = argv.split_first().ok_or(BridgeError::EmptyCommand)?;

        let pair = native_pty_system()
            .openpty(self.size)
            .map_err(|e| BridgeError::CreateFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))?;
        // The child holds its own copy; ours would keep the pty open after exit.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BridgeError::Io(std::io::Error::other(e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BridgeError::Io(std::io::Error::other(e)))?;
        let killer = child.clone_killer();

        let pid = child.process_id();
        std::thread::Builder::new()
            .name("berth-pty-wait".to_string())
            .spawn(move || match child.wait() {
                Ok(status) => debug!("terminal process {:?} exited: {:?}", pid, status),
                Err(e) => debug!("waiting on terminal process {:?} failed: {}", pid, e),
            })?;

        Ok(TtyProcess {
            reader,
            writer,
            killer: Box::new(NativeKiller {
                killer,
                master: Some(pair.master),
            }),
        })
    }
}

struct NativeKiller {
    killer: Box<dyn ChildKiller + Send + Sync>,
    master: Option<Box<dyn MasterPty + Send>>,
}

impl TtyKill for NativeKiller {
    fn kill(&mut self) -> std::io::Result<()> {
        let result = match self.killer.kill() {
            Ok(()) => Ok(()),
            // Already exited.
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::InvalidInput
                ) || e.raw_os_error() == Some(3) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        };
        // Closing the master hangs up the pty and unblocks the reader.
        self.master.take();
        result
    }
}
