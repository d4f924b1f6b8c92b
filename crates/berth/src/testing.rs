//! In-process fakes for the container engine and the terminal spawner.
//!
//! Compiled for unit tests and behind the `testing` feature for integration
//! tests.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::time::Duration;

use async_trait::async_trait;

use crate::bridge::{BridgeError, TtyKill, TtyProcess, TtySpawner};
use crate::container::{
    ContainerEngine, ContainerError, ContainerResult, ContainerSpec, ContainerState,
};
use crate::scheduler::ExpiryScheduler;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A container known to the fake engine.
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub state: ContainerState,
}

/// Engine operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailOp {
    CreateVolume,
    BuildImage,
    Create,
    Start,
    Stop,
    Remove,
    RemoveVolume,
}

#[derive(Default)]
struct EngineState {
    containers: HashMap<String, FakeContainer>,
    volumes: HashSet<String>,
    images: HashSet<String>,
    calls: Vec<String>,
    failing: HashSet<FailOp>,
    /// For each `start`, whether a cleanup task was pending for that id.
    cleanup_pending_at_start: Vec<(String, bool)>,
}

/// In-memory container engine that records every call.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
    next_id: AtomicU64,
    scheduler: Mutex<Option<ExpiryScheduler>>,
    start_delay: Mutex<Option<Duration>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        lock(&self.state)
    }

    /// Record, at every `start`, whether `scheduler` still holds a task for it.
    pub fn observe_scheduler(&self, scheduler: ExpiryScheduler) {
        *lock(&self.scheduler) = Some(scheduler);
    }

    /// Make `start` take this long.
    pub fn set_start_delay(&self, delay: Duration) {
        *lock(&self.start_delay) = Some(delay);
    }

    pub fn fail(&self, op: FailOp) {
        self.lock().failing.insert(op);
    }

    pub fn heal(&self, op: FailOp) {
        self.lock().failing.remove(&op);
    }

    pub fn add_image(&self, image: &str) {
        self.lock().images.insert(image.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn containers(&self) -> HashMap<String, FakeContainer> {
        self.lock().containers.clone()
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.lock().containers.get(id).cloned()
    }

    pub fn volumes(&self) -> HashSet<String> {
        self.lock().volumes.clone()
    }

    pub fn cleanup_pending_at_start(&self) -> Vec<(String, bool)> {
        self.lock().cleanup_pending_at_start.clone()
    }

    /// Simulate the container disappearing behind our back.
    pub fn forget_container(&self, id: &str) {
        self.lock().containers.remove(id);
    }

    /// Simulate the container being started outside the manager.
    pub fn set_state(&self, id: &str, state: ContainerState) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.state = state;
        }
    }

    fn record(&self, call: String, op: Option<FailOp>) -> ContainerResult<()> {
        let mut state = self.lock();
        state.calls.push(call.clone());
        match op {
            Some(op) if state.failing.contains(&op) => Err(ContainerError::CommandFailed {
                command: call,
                message: "injected failure".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create_volume(&self, name: &str) -> ContainerResult<()> {
        self.record(format!("create_volume {name}"), Some(FailOp::CreateVolume))?;
        self.lock().volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> ContainerResult<()> {
        self.record(format!("remove_volume {name}"), Some(FailOp::RemoveVolume))?;
        if self.lock().volumes.remove(name) {
            Ok(())
        } else {
            Err(ContainerError::VolumeNotFound(name.to_string()))
        }
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        self.record(format!("image_exists {image}"), None)?;
        Ok(self.lock().images.contains(image))
    }

    async fn build_image(&self, image: &str, dockerfile: &Path) -> ContainerResult<()> {
        self.record(
            format!("build_image {image} {}", dockerfile.display()),
            Some(FailOp::BuildImage),
        )?;
        self.lock().images.insert(image.to_string());
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        spec.validate()?;
        self.record(format!("create {}", spec.name), Some(FailOp::Create))?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("c{n:04}");
        let mut state = self.lock();
        if state
            .containers
            .values()
            .any(|c| c.spec.name == spec.name)
        {
            return Err(ContainerError::CommandFailed {
                command: "create".to_string(),
                message: format!("name {} is already in use", spec.name),
            });
        }
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                state: ContainerState::Created,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> ContainerResult<()> {
        let scheduler = lock(&self.scheduler).clone();
        if let Some(scheduler) = scheduler {
            let pending = scheduler
                .get(container_id)
                .await
                .map(|t| t.is_some())
                .unwrap_or(false);
            self.lock()
                .cleanup_pending_at_start
                .push((container_id.to_string(), pending));
        }

        let delay = *lock(&self.start_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.record(format!("start {container_id}"), Some(FailOp::Start))?;
        match self.lock().containers.get_mut(container_id) {
            Some(c) => {
                c.state = ContainerState::Running;
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn stop(&self, container_id: &str, _grace_seconds: u32) -> ContainerResult<()> {
        self.record(format!("stop {container_id}"), Some(FailOp::Stop))?;
        match self.lock().containers.get_mut(container_id) {
            Some(c) => {
                c.state = ContainerState::Exited;
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn remove(&self, container_id: &str) -> ContainerResult<()> {
        self.record(format!("remove {container_id}"), Some(FailOp::Remove))?;
        match self.lock().containers.remove(container_id) {
            Some(_) => Ok(()),
            None => Err(ContainerError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn container_state(&self, container_id: &str) -> ContainerResult<ContainerState> {
        Ok(self
            .lock()
            .containers
            .get(container_id)
            .map(|c| c.state)
            .unwrap_or(ContainerState::Missing))
    }

    async fn health_check(&self) -> ContainerResult<String> {
        Ok("fake".to_string())
    }

    fn tty_command(&self, container_id: &str, shell: &str) -> Vec<String> {
        vec![
            "fake".to_string(),
            "exec".to_string(),
            "-it".to_string(),
            container_id.to_string(),
            shell.to_string(),
        ]
    }
}

/// One fake terminal process.
pub struct FakeTerminal {
    pub argv: Vec<String>,
    output: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    input: Arc<Mutex<Vec<u8>>>,
    killed: AtomicBool,
}

impl FakeTerminal {
    /// Produce pty output.
    pub fn emit(&self, bytes: &[u8]) {
        if let Some(tx) = lock(&self.output).as_ref() {
            let _ = tx.send(bytes.to_vec());
        }
    }

    /// Close the pty (the shell exited).
    pub fn hang_up(&self) {
        lock(&self.output).take();
    }

    pub fn input(&self) -> Vec<u8> {
        lock(&self.input).clone()
    }

    pub async fn wait_for_input(&self, len: usize) {
        for _ in 0..200 {
            if lock(&self.input).len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

struct FakeReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(bytes) => self.pending = bytes,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct FakeWriter(Arc<Mutex<Vec<u8>>>);

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct FakeKiller(Arc<FakeTerminal>);

impl TtyKill for FakeKiller {
    fn kill(&mut self) -> std::io::Result<()> {
        self.0.killed.store(true, Ordering::SeqCst);
        self.0.hang_up();
        Ok(())
    }
}

/// Spawner handing out [`FakeTerminal`]s.
#[derive(Default)]
pub struct FakeSpawner {
    terminals: Mutex<Vec<Arc<FakeTerminal>>>,
    fail: AtomicBool,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn terminals(&self) -> Vec<Arc<FakeTerminal>> {
        lock(&self.terminals).clone()
    }

    pub fn last(&self) -> Option<Arc<FakeTerminal>> {
        lock(&self.terminals).last().cloned()
    }
}

impl TtySpawner for FakeSpawner {
    fn spawn(&self, argv: &[String]) -> Result<TtyProcess, BridgeError> {
        if argv.is_empty() {
            return Err(BridgeError::EmptyCommand);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(BridgeError::SpawnFailed("injected failure".to_string()));
        }

        let (tx, rx) = mpsc::channel();
        let input = Arc::new(Mutex::new(Vec::new()));
        let terminal = Arc::new(FakeTerminal {
            argv: argv.to_vec(),
            output: Mutex::new(Some(tx)),
            input: input.clone(),
            killed: AtomicBool::new(false),
        });
        lock(&self.terminals).push(terminal.clone());

        Ok(TtyProcess {
            reader: Box::new(FakeReader {
                rx,
                pending: Vec::new(),
            }),
            writer: Box::new(FakeWriter(input)),
            killer: Box::new(FakeKiller(terminal)),
        })
    }
}
