use crate::{
    errors::RuntimeError,
    runtime::{ExitStatus, Shell, ShellControl, ShellEvent, ShellPeer},
};
use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use sandterm_protocol::TerminalSize;
use std::{
    fmt,
    io::{self, Read, Write},
    thread,
};
use tokio::sync::mpsc;

const READ_BUFFER_SIZE: usize = 8192;

fn pty_error<E: fmt::Display>(err: E) -> RuntimeError {
    RuntimeError::Pty(err.to_string())
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Exit code reported when the shell's status can't be collected
const UNKNOWN_EXIT_CODE: u32 = 1;

/// Run a local program under a new pseudo-terminal
///
/// This blocks while the pty is opened and the program is started, so call it
/// from a blocking task. Three threads are left behind to service the
/// process: one reading terminal output, one waiting for exit, and one acting
/// on [ShellControl] requests. The exit is only reported after the reader has
/// drained the terminal, so no output is lost behind it.
pub(crate) fn spawn(
    program: &str,
    args: &[String],
    size: TerminalSize,
) -> Result<Shell, RuntimeError> {
    let pair = native_pty_system()
        .openpty(pty_size(size))
        .map_err(pty_error)?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    cmd.cwd("/");
    cmd.env("TERM", "xterm-256color");

    let mut child = pair.slave.spawn_command(cmd).map_err(pty_error)?;
    drop(pair.slave);

    let reader = pair.master.try_clone_reader().map_err(pty_error)?;
    let writer = pair.master.take_writer().map_err(pty_error)?;
    let killer = child.clone_killer();

    let (shell, ShellPeer { events, control }) = Shell::pair();

    let output = events.clone();
    let reader = thread::Builder::new()
        .name("pty-read".to_string())
        .spawn(move || read_output(reader, output))?;

    thread::Builder::new()
        .name("pty-wait".to_string())
        .spawn(move || {
            let status = match child.wait() {
                Ok(status) => ExitStatus::new(
                    status.exit_code(),
                    status.signal().map(|s| s.to_string()),
                ),
                Err(err) => {
                    log::warn!("waiting for shell failed, {}", err);
                    ExitStatus::new(UNKNOWN_EXIT_CODE, None)
                }
            };
            if reader.join().is_err() {
                log::warn!("pty reader panicked");
            }
            log::debug!("shell exited, {:?}", status);
            let _ = events.blocking_send(ShellEvent::Exited(status));
        })?;

    thread::Builder::new()
        .name("pty-control".to_string())
        .spawn(move || serve_control(control, pair.master, writer, killer))?;

    Ok(shell)
}

fn read_output(mut reader: Box<dyn Read + Send>, events: mpsc::Sender<ShellEvent>) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(len) => {
                let chunk = Bytes::copy_from_slice(&buf[..len]);
                if events.blocking_send(ShellEvent::Output(chunk)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // Linux reports EIO once the last process holding the terminal exits
            Err(_) => break,
        }
    }
    log::trace!("pty reader finished");
}

fn serve_control(
    mut control: mpsc::UnboundedReceiver<ShellControl>,
    master: Box<dyn MasterPty + Send>,
    mut writer: Box<dyn Write + Send>,
    mut killer: Box<dyn ChildKiller + Send + Sync>,
) {
    while let Some(request) = control.blocking_recv() {
        match request {
            ShellControl::Input(text) => {
                let result = writer
                    .write_all(text.as_bytes())
                    .and_then(|_| writer.flush());
                if let Err(err) = result {
                    log::debug!("shell input dropped, {}", err);
                }
            }
            ShellControl::Resize(size) => {
                if let Err(err) = master.resize(pty_size(size)) {
                    log::debug!("shell resize to {} failed, {}", size, err);
                }
            }
            ShellControl::Kill => break,
        }
    }
    // Either an explicit kill or every handle is gone; both end the process.
    if let Err(err) = killer.kill() {
        log::trace!("shell kill, {}", err);
    }
}
