use std::{collections::HashMap, path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const DEFAULT_MAX_TERMINALS: usize = 8;
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TerminalError {
    #[error("unknown terminal {0}")]
    Unknown(String),
    #[error("terminal {0} is already open")]
    Duplicate(String),
    #[error("terminal limit reached ({0})")]
    TooMany(usize),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("terminal io failed: {0}")]
    Io(String),
}

impl TerminalError {
    pub fn code(&self) -> &'static str {
        match self {
            TerminalError::Unknown(_) => "unknown_terminal",
            TerminalError::Duplicate(_) => "duplicate_terminal",
            TerminalError::TooMany(_) => "too_many_terminals",
            TerminalError::Spawn(_) => "spawn_failed",
            TerminalError::Io(_) => "terminal_io",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSpec {
    pub terminal_id: String,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<PathBuf>,
}

/// Output from a terminal process. `generation` tells a reopened channel apart from a
/// previous process that used the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutput {
    Data {
        terminal_id: String,
        generation: u64,
        bytes: Vec<u8>,
    },
    Exited {
        terminal_id: String,
        generation: u64,
        code: Option<u32>,
    },
}

/// Where a backend process reports output. Backends usually read from a dedicated thread and
/// use the blocking sends.
#[derive(Debug, Clone)]
pub struct TerminalSink {
    terminal_id: Arc<str>,
    generation: u64,
    tx: mpsc::Sender<TerminalOutput>,
}

impl TerminalSink {
    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    pub fn data(&self, bytes: Vec<u8>) -> TerminalOutput {
        TerminalOutput::Data {
            terminal_id: self.terminal_id.to_string(),
            generation: self.generation,
            bytes,
        }
    }

    pub fn exited(&self, code: Option<u32>) -> TerminalOutput {
        TerminalOutput::Exited {
            terminal_id: self.terminal_id.to_string(),
            generation: self.generation,
            code,
        }
    }

    /// Returns false once the connection is gone. Must not be called from async context.
    pub fn send_blocking(&self, output: TerminalOutput) -> bool {
        self.tx.blocking_send(output).is_ok()
    }

    pub fn try_send(&self, output: TerminalOutput) -> bool {
        self.tx.try_send(output).is_ok()
    }
}

pub trait TerminalBackend: Send + Sync {
    fn open(
        &self,
        spec: &TerminalSpec,
        sink: TerminalSink,
    ) -> Result<Box<dyn TerminalProcess>, TerminalError>;
}

pub trait TerminalProcess: Send {
    /// Queues input for the process. Must not block the caller.
    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError>;
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TerminalError>;
    fn kill(&mut self);
}

struct TerminalChannel {
    generation: u64,
    process: Box<dyn TerminalProcess>,
}

/// The terminal channels owned by one client connection. Dropping the mux kills every
/// process it still holds.
pub struct TerminalMux {
    backend: Arc<dyn TerminalBackend>,
    output: mpsc::Sender<TerminalOutput>,
    channels: HashMap<String, TerminalChannel>,
    limit: usize,
    next_generation: u64,
}

impl TerminalMux {
    pub fn new(
        backend: Arc<dyn TerminalBackend>,
        output: mpsc::Sender<TerminalOutput>,
        limit: usize,
    ) -> Self {
        Self {
            backend,
            output,
            channels: HashMap::new(),
            limit,
            next_generation: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn contains(&self, terminal_id: &str) -> bool {
        self.channels.contains_key(terminal_id)
    }

    pub fn is_current(&self, terminal_id: &str, generation: u64) -> bool {
        self.channels
            .get(terminal_id)
            .map(|channel| channel.generation == generation)
            .unwrap_or(false)
    }

    pub fn open(&mut self, spec: TerminalSpec) -> Result<(), TerminalError> {
        if self.channels.contains_key(&spec.terminal_id) {
            return Err(TerminalError::Duplicate(spec.terminal_id));
        }
        if self.channels.len() >= self.limit {
            return Err(TerminalError::TooMany(self.limit));
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let sink = TerminalSink {
            terminal_id: Arc::from(spec.terminal_id.as_str()),
            generation,
            tx: self.output.clone(),
        };
        let process = self.backend.open(&spec, sink)?;
        info!(
            event = "terminal_opened",
            terminal_id = %spec.terminal_id,
            cols = spec.cols,
            rows = spec.rows
        );
        self.channels.insert(
            spec.terminal_id,
            TerminalChannel {
                generation,
                process,
            },
        );
        Ok(())
    }

    pub fn write(&mut self, terminal_id: &str, data: &[u8]) -> Result<(), TerminalError> {
        self.channel(terminal_id)?.process.write(data)
    }

    pub fn resize(&mut self, terminal_id: &str, cols: u16, rows: u16) -> Result<(), TerminalError> {
        self.channel(terminal_id)?.process.resize(cols, rows)
    }

    pub fn close(&mut self, terminal_id: &str) -> Result<(), TerminalError> {
        let mut channel = self
            .channels
            .remove(terminal_id)
            .ok_or_else(|| TerminalError::Unknown(terminal_id.to_string()))?;
        channel.process.kill();
        info!(event = "terminal_closed", terminal_id = terminal_id);
        Ok(())
    }

    /// Forgets a channel whose process exited. Exits from a superseded generation are ignored.
    pub fn on_exit(&mut self, terminal_id: &str, generation: u64) -> bool {
        if !self.is_current(terminal_id, generation) {
            return false;
        }
        self.channels.remove(terminal_id);
        true
    }

    pub fn close_all(&mut self) {
        for (terminal_id, mut channel) in self.channels.drain() {
            channel.process.kill();
            warn!(event = "terminal_killed", terminal_id = %terminal_id);
        }
    }

    fn channel(&mut self, terminal_id: &str) -> Result<&mut TerminalChannel, TerminalError> {
        self.channels
            .get_mut(terminal_id)
            .ok_or_else(|| TerminalError::Unknown(terminal_id.to_string()))
    }
}

impl Drop for TerminalMux {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded {
        writes: Vec<(String, Vec<u8>)>,
        resizes: Vec<(String, u16, u16)>,
        killed: Vec<String>,
    }

    #[derive(Default)]
    struct MockBackend {
        recorded: Arc<Mutex<Recorded>>,
        fail_spawn: bool,
    }

    struct MockProcess {
        sink: TerminalSink,
        recorded: Arc<Mutex<Recorded>>,
    }

    impl TerminalBackend for MockBackend {
        fn open(
            &self,
            _spec: &TerminalSpec,
            sink: TerminalSink,
        ) -> Result<Box<dyn TerminalProcess>, TerminalError> {
            if self.fail_spawn {
                return Err(TerminalError::Spawn("no shell".to_string()));
            }
            sink.try_send(sink.data(b"$ ".to_vec()));
            Ok(Box::new(MockProcess {
                sink,
                recorded: Arc::clone(&self.recorded),
            }))
        }
    }

    impl TerminalProcess for MockProcess {
        fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
            let id = self.sink.terminal_id().to_string();
            self.recorded
                .lock()
                .expect("lock")
                .writes
                .push((id, data.to_vec()));
            self.sink.try_send(self.sink.data(data.to_vec()));
            Ok(())
        }

        fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TerminalError> {
            let id = self.sink.terminal_id().to_string();
            self.recorded.lock().expect("lock").resizes.push((id, cols, rows));
            Ok(())
        }

        fn kill(&mut self) {
            let id = self.sink.terminal_id().to_string();
            self.recorded.lock().expect("lock").killed.push(id);
        }
    }

    fn spec(id: &str) -> TerminalSpec {
        TerminalSpec {
            terminal_id: id.to_string(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            cwd: None,
        }
    }

    fn mux(limit: usize) -> (TerminalMux, mpsc::Receiver<TerminalOutput>, Arc<Mutex<Recorded>>) {
        let backend = MockBackend::default();
        let recorded = Arc::clone(&backend.recorded);
        let (tx, rx) = mpsc::channel(32);
        (TerminalMux::new(Arc::new(backend), tx, limit), rx, recorded)
    }

    #[test]
    fn channels_are_routed_by_terminal_id() {
        let (mut mux, mut rx, recorded) = mux(4);
        mux.open(spec("a")).expect("open a");
        mux.open(spec("b")).expect("open b");
        mux.write("b", b"ls\r").expect("write");
        mux.resize("a", 120, 40).expect("resize");

        let recorded = recorded.lock().expect("lock");
        assert_eq!(recorded.writes, vec![("b".to_string(), b"ls\r".to_vec())]);
        assert_eq!(recorded.resizes, vec![("a".to_string(), 120, 40)]);
        drop(recorded);

        let mut ids = Vec::new();
        while let Ok(TerminalOutput::Data { terminal_id, .. }) = rx.try_recv() {
            ids.push(terminal_id);
        }
        assert_eq!(ids, vec!["a", "b", "b"]);
    }

    #[test]
    fn duplicate_unknown_and_limit_errors() {
        let (mut mux, _rx, _recorded) = mux(1);
        mux.open(spec("a")).expect("open");
        assert_eq!(
            mux.open(spec("a")).map_err(|err| err.code()),
            Err("duplicate_terminal")
        );
        assert_eq!(mux.open(spec("b")), Err(TerminalError::TooMany(1)));
        assert_eq!(
            mux.write("zzz", b"x"),
            Err(TerminalError::Unknown("zzz".to_string()))
        );
        assert_eq!(mux.close("zzz").map_err(|err| err.code()), Err("unknown_terminal"));
    }

    #[test]
    fn spawn_failure_leaves_no_channel() {
        let backend = MockBackend {
            fail_spawn: true,
            ..MockBackend::default()
        };
        let (tx, _rx) = mpsc::channel(4);
        let mut mux = TerminalMux::new(Arc::new(backend), tx, 4);
        assert_eq!(mux.open(spec("a")).map_err(|err| err.code()), Err("spawn_failed"));
        assert!(mux.is_empty());
    }

    #[test]
    fn stale_exit_does_not_close_reopened_channel() {
        let (mut mux, mut rx, recorded) = mux(4);
        mux.open(spec("a")).expect("open");
        let Ok(TerminalOutput::Data { generation: first, .. }) = rx.try_recv() else {
            panic!("expected prompt")
        };
        mux.close("a").expect("close");
        mux.open(spec("a")).expect("reopen");
        let Ok(TerminalOutput::Data { generation: second, .. }) = rx.try_recv() else {
            panic!("expected prompt")
        };
        assert_ne!(first, second);

        assert!(!mux.on_exit("a", first));
        assert!(mux.contains("a"));
        assert!(mux.on_exit("a", second));
        assert!(!mux.contains("a"));
        assert_eq!(recorded.lock().expect("lock").killed, vec!["a".to_string()]);
    }

    #[test]
    fn dropping_mux_kills_remaining_processes() {
        let (mut mux, _rx, recorded) = mux(4);
        mux.open(spec("a")).expect("open a");
        mux.open(spec("b")).expect("open b");
        drop(mux);
        let mut killed = recorded.lock().expect("lock").killed.clone();
        killed.sort();
        assert_eq!(killed, vec!["a".to_string(), "b".to_string()]);
    }
}
