//! Terminal bridge between a client connection and a shell in a container
//!
//! A bridge owns two streams: shell events coming out of the container, and
//! messages coming in from the client. It relays until one side finishes,
//! then tears the other side down. The shell never outlives the connection.

use crate::{
    errors::BridgeError,
    runtime::{ExitStatus, Runtime, Shell, ShellEvent},
    session::{Session, SessionRegistry},
};
use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use sandterm_protocol::{close, exit_banner, Input, TerminalParams, TerminalSize};
use std::{fmt, mem, str, sync::Arc};

/// Why a relay stopped
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Ending {
    /// The shell exited with this status
    ShellExited(ExitStatus),
    /// The shell's event stream ended without an exit status
    ShellLost,
    /// The client closed the connection
    ClientClosed,
    /// Reading from or writing to the client failed
    ClientError(String),
}

/// Opens terminals for sessions, and relays them
pub struct Bridge {
    registry: Arc<SessionRegistry>,
    runtime: Arc<dyn Runtime>,
}

impl Bridge {
    pub fn new(registry: Arc<SessionRegistry>, runtime: Arc<dyn Runtime>) -> Self {
        Bridge { registry, runtime }
    }

    /// Check a connection's parameters against the session registry
    pub fn authorize(&self, params: &TerminalParams) -> Result<Session, BridgeError> {
        match (&params.session_id, &params.secret) {
            (Some(session_id), Some(secret)) => self
                .registry
                .authorize(session_id, secret)
                .ok_or(BridgeError::Unauthorized),
            _ => Err(BridgeError::Unauthorized),
        }
    }

    /// Serve one terminal connection from handshake to close
    ///
    /// `tx` and `rx` are the two halves of the client connection. Errors are
    /// logged and end the connection; nothing is returned to the caller
    /// besides the reason the relay stopped, if it ever started.
    pub async fn serve<Tx, Rx, E>(
        &self,
        params: &TerminalParams,
        mut tx: Tx,
        rx: Rx,
    ) -> Option<Ending>
    where
        Tx: Sink<Message> + Unpin,
        Tx::Error: fmt::Display,
        Rx: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        let session = match self.authorize(params) {
            Ok(session) => session,
            Err(err) => {
                log::info!("rejecting terminal for {:?}, {}", params.session_id, err);
                close_with(&mut tx, close::POLICY, "Invalid session").await;
                return None;
            }
        };
        log::info!(
            "terminal connected for session {} container {}",
            session.session_id,
            session.container_id
        );

        let size = TerminalSize::default();
        let shell = match self.runtime.exec(&session.container_id, size).await {
            Ok(shell) => shell,
            Err(err) => {
                log::error!("shell for session {} failed, {}", session.session_id, err);
                let notice = format!("\r\n[shell] failed to start: {}\r\n", err);
                let _ = tx.send(Message::Text(notice.into())).await;
                close_with(&mut tx, close::INTERNAL, "Shell failed to start").await;
                return None;
            }
        };

        let mut relay = Relay {
            registry: &self.registry,
            session: &session,
            shell,
            size,
            decoder: Utf8Decoder::default(),
        };
        let ending = relay.run(&mut tx, rx).await;
        relay.shell.kill();
        log::info!("terminal for session {} ended, {:?}", session.session_id, ending);

        if matches!(ending, Ending::ShellExited(_) | Ending::ShellLost) {
            let tail = relay.decoder.finish();
            if !tail.is_empty() {
                let _ = tx.send(Message::Text(tail.into())).await;
            }
        }
        if let Ending::ShellExited(status) = &ending {
            let banner = exit_banner(status.code(), status.signal());
            let _ = tx.send(Message::Text(banner.into())).await;
            close_with(&mut tx, close::NORMAL, "Shell exited").await;
        } else if ending == Ending::ShellLost {
            close_with(&mut tx, close::NORMAL, "Shell exited").await;
        }
        Some(ending)
    }
}

struct Relay<'a> {
    registry: &'a SessionRegistry,
    session: &'a Session,
    shell: Shell,
    size: TerminalSize,
    decoder: Utf8Decoder,
}

impl Relay<'_> {
    async fn run<Tx, Rx, E>(&mut self, tx: &mut Tx, mut rx: Rx) -> Ending
    where
        Tx: Sink<Message> + Unpin,
        Tx::Error: fmt::Display,
        Rx: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        loop {
            tokio::select! {
                event = self.shell.next_event() => match event {
                    Some(ShellEvent::Output(chunk)) => {
                        let text = self.decoder.decode(&chunk);
                        if !text.is_empty() {
                            if let Err(err) = tx.send(Message::Text(text.into())).await {
                                return Ending::ClientError(err.to_string());
                            }
                        }
                    }
                    Some(ShellEvent::Exited(status)) => return Ending::ShellExited(status),
                    None => return Ending::ShellLost,
                },
                message = rx.next() => match message {
                    None | Some(Ok(Message::Close(_))) => return Ending::ClientClosed,
                    Some(Err(err)) => {
                        log::warn!("terminal connection error, {}", err);
                        return Ending::ClientError(err.to_string());
                    }
                    Some(Ok(Message::Text(text))) => self.input(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => self.input(&String::from_utf8_lossy(&bytes)),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                },
            }
        }
    }

    fn input(&mut self, text: &str) {
        match Input::classify(text) {
            Input::Resize(size) => {
                log::debug!("session {} resize to {}", self.session.session_id, size);
                self.size = size;
                if let Err(err) = self.shell.resize(size) {
                    log::debug!("resize not applied, {}", err);
                }
            }
            Input::Raw(raw) => {
                if let Err(err) = self.shell.write(raw) {
                    log::debug!("input not delivered, {}", err);
                }
                self.registry.touch(self.session.session_id.as_str());
            }
        }
    }
}

/// Turns a stream of output chunks into text
///
/// A character split across two chunks is held back until the rest of it
/// arrives. Bytes that can never be valid UTF-8 become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    partial: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = mem::take(&mut self.partial);
        bytes.extend_from_slice(chunk);

        let mut text = String::with_capacity(bytes.len());
        let mut rest = &bytes[..];
        loop {
            match str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    text.push_str(str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.partial = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        text
    }

    /// Whatever is still held back, once no more chunks will come
    fn finish(&mut self) -> String {
        String::from_utf8_lossy(&mem::take(&mut self.partial)).into_owned()
    }
}

async fn close_with<Tx>(tx: &mut Tx, code: u16, reason: &str)
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: fmt::Display,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(err) = tx.send(Message::Close(Some(frame))).await {
        log::debug!("close frame not sent, {}", err);
    }
    let _ = tx.close().await;
}
