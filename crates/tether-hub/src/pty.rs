use crate::terminal::{
    TerminalBackend, TerminalError, TerminalProcess, TerminalSink, TerminalSpec,
};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{self, ErrorKind, Read, Write};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

const READ_CHUNK_BYTES: usize = 8192;
/// Input chunks queued for a shell that is not reading its stdin.
const INPUT_QUEUE_CHUNKS: usize = 64;

/// Spawns the configured shell on a native pseudo-terminal per channel.
#[derive(Debug, Clone)]
pub struct PtyBackend {
    shell: String,
}

impl PtyBackend {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    input: mpsc::Sender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

fn spawn_error(err: impl std::fmt::Display) -> TerminalError {
    TerminalError::Spawn(err.to_string())
}

/// Writes queued input on its own thread; a blocked PTY never stalls the caller.
fn spawn_input_writer(
    terminal_id: &str,
    mut writer: Box<dyn Write + Send>,
) -> io::Result<mpsc::Sender<Vec<u8>>> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE_CHUNKS);
    let id = terminal_id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-in-{terminal_id}"))
        .spawn(move || {
            while let Some(chunk) = rx.blocking_recv() {
                if let Err(err) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
                    debug!(event = "pty_write_end", terminal_id = %id, error = %err);
                    break;
                }
            }
        })?;
    Ok(tx)
}

fn queue_input(input: &mpsc::Sender<Vec<u8>>, data: &[u8]) -> Result<(), TerminalError> {
    match input.try_send(data.to_vec()) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            Err(TerminalError::Io("terminal input queue full".to_string()))
        }
        Err(TrySendError::Closed(_)) => Err(TerminalError::Io("terminal input closed".to_string())),
    }
}

impl TerminalBackend for PtyBackend {
    fn open(
        &self,
        spec: &TerminalSpec,
        sink: TerminalSink,
    ) -> Result<Box<dyn TerminalProcess>, TerminalError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(spawn_error)?;

        let mut cmd = CommandBuilder::new(&self.shell);
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");
        let mut child = pair.slave.spawn_command(cmd).map_err(spawn_error)?;
        // The child holds the only slave fd now, so the reader sees EOF when it exits.
        drop(pair.slave);

        let killer = child.clone_killer();
        let mut reader = pair.master.try_clone_reader().map_err(spawn_error)?;
        let writer = pair.master.take_writer().map_err(spawn_error)?;
        let input = spawn_input_writer(&spec.terminal_id, writer).map_err(spawn_error)?;

        std::thread::Builder::new()
            .name(format!("pty-{}", spec.terminal_id))
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK_BYTES];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if !sink.send_blocking(sink.data(buf[..n].to_vec())) {
                                break;
                            }
                        }
                        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                        Err(err) => {
                            debug!(
                                event = "pty_read_end",
                                terminal_id = sink.terminal_id(),
                                error = %err
                            );
                            break;
                        }
                    }
                }
                let code = match child.wait() {
                    Ok(status) => Some(status.exit_code()),
                    Err(err) => {
                        warn!(
                            event = "pty_wait_error",
                            terminal_id = sink.terminal_id(),
                            error = %err
                        );
                        None
                    }
                };
                sink.send_blocking(sink.exited(code));
            })
            .map_err(spawn_error)?;

        Ok(Box::new(PtyProcess {
            master: pair.master,
            input,
            killer,
        }))
    }
}

impl TerminalProcess for PtyProcess {
    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        queue_input(&self.input, data)
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| TerminalError::Io(err.to_string()))
    }

    fn kill(&mut self) {
        if let Err(err) = self.killer.kill() {
            debug!(event = "pty_kill_error", error = %err);
        }
    }
}
