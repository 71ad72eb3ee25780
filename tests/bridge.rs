mod common;

use axum::extract::ws::Message;
use bytes::Bytes;
use common::{init_logging, FakeRuntime};
use futures_util::{stream, Stream};
use sandterm::{
    bridge::Ending,
    runtime::{ExitStatus, ShellControl, ShellEvent, ShellPeer},
    Bridge, ContainerPool, Limits, Session, SessionRegistry,
};
use sandterm_protocol::{close, TerminalParams, TerminalSize};
use std::{pin::Pin, sync::Arc, time::Duration};
use tokio::sync::mpsc;

type ClientStream = Pin<Box<dyn Stream<Item = Result<Message, String>> + Send>>;

struct Harness {
    runtime: Arc<FakeRuntime>,
    registry: Arc<SessionRegistry>,
    bridge: Bridge,
    session: Session,
}

impl Harness {
    async fn new() -> Self {
        init_logging();
        let runtime = FakeRuntime::new();
        let pool = Arc::new(ContainerPool::new(runtime.clone(), 0));
        let registry = Arc::new(SessionRegistry::new(
            pool,
            runtime.clone(),
            Limits::default(),
        ));
        let bridge = Bridge::new(registry.clone(), runtime.clone());
        let session = registry.create_session("client").await.unwrap();
        Harness {
            runtime,
            registry,
            bridge,
            session,
        }
    }

    fn params(&self) -> TerminalParams {
        TerminalParams {
            session_id: Some(self.session.session_id.to_string()),
            secret: Some(self.session.secret().to_string()),
        }
    }

    async fn shell(&self) -> (TerminalSize, ShellPeer) {
        loop {
            if let Some((id, size, peer)) = self.runtime.take_shell() {
                assert_eq!(id, self.session.container_id);
                return (size, peer);
            }
            tokio::task::yield_now().await;
        }
    }
}

fn client() -> (mpsc::UnboundedSender<Result<Message, String>>, ClientStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let rx = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) });
    (tx, Box::pin(rx))
}

fn text(s: &str) -> Message {
    Message::Text(s.into())
}

fn close_code(message: &Message) -> Option<u16> {
    match message {
        Message::Close(Some(frame)) => Some(frame.code),
        _ => None,
    }
}

#[tokio::test]
async fn wrong_secret_is_rejected_without_a_shell() {
    let h = Harness::new().await;
    let (_input, rx) = client();
    let mut sent = Vec::new();
    let params = TerminalParams {
        session_id: Some(h.session.session_id.to_string()),
        secret: Some("0".repeat(64)),
    };

    assert_eq!(h.bridge.serve(&params, &mut sent, rx).await, None);
    assert_eq!(sent.len(), 1);
    assert_eq!(close_code(&sent[0]), Some(close::POLICY));
    assert_eq!(h.runtime.exec_count(), 0);
}

#[tokio::test]
async fn missing_parameters_are_rejected() {
    let h = Harness::new().await;
    for params in [
        TerminalParams::default(),
        TerminalParams {
            session_id: Some(h.session.session_id.to_string()),
            secret: None,
        },
        TerminalParams {
            session_id: Some("unknown".to_string()),
            secret: Some(h.session.secret().to_string()),
        },
    ] {
        let (_input, rx) = client();
        let mut sent = Vec::new();
        assert_eq!(h.bridge.serve(&params, &mut sent, rx).await, None);
        assert_eq!(close_code(&sent[0]), Some(close::POLICY));
    }
    assert_eq!(h.runtime.exec_count(), 0);
}

#[tokio::test]
async fn terminated_session_is_rejected() {
    let h = Harness::new().await;
    h.registry
        .terminate(h.session.session_id.as_str())
        .await;
    let (_input, rx) = client();
    let mut sent = Vec::new();
    assert_eq!(h.bridge.serve(&h.params(), &mut sent, rx).await, None);
    assert_eq!(close_code(&sent[0]), Some(close::POLICY));
}

#[tokio::test]
async fn exec_failure_reports_and_closes() {
    let h = Harness::new().await;
    h.runtime.fail_exec(true);
    let (_input, rx) = client();
    let mut sent = Vec::new();

    assert_eq!(h.bridge.serve(&h.params(), &mut sent, rx).await, None);
    assert_eq!(sent.len(), 2);
    match &sent[0] {
        Message::Text(notice) => assert!(notice.as_str().contains("failed to start")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(close_code(&sent[1]), Some(close::INTERNAL));
}

#[tokio::test(start_paused = true)]
async fn relays_both_ways_until_the_shell_exits() {
    let h = Harness::new().await;
    let (input, rx) = client();
    let mut sent = Vec::new();
    let id = h.session.session_id.as_str();
    let created_at = h.session.last_heartbeat_at;

    let drive = async {
        let (size, mut peer) = h.shell().await;
        assert_eq!(size, TerminalSize::new(80, 24));

        tokio::time::advance(Duration::from_secs(30)).await;
        input.send(Ok(text("  ls -la\n"))).unwrap();
        input
            .send(Ok(text(r#"{"type":"resize","cols":120,"rows":40}"#)))
            .unwrap();
        input
            .send(Ok(text(r#"{"type":"resize","cols":"wide","rows":40}"#)))
            .unwrap();
        input.send(Ok(Message::Binary(Bytes::from_static(b"pwd\n")))).unwrap();

        assert_eq!(
            peer.control.recv().await,
            Some(ShellControl::Input("  ls -la\n".to_string()))
        );
        assert_eq!(
            peer.control.recv().await,
            Some(ShellControl::Resize(TerminalSize::new(120, 40)))
        );
        assert_eq!(
            peer.control.recv().await,
            Some(ShellControl::Input(
                r#"{"type":"resize","cols":"wide","rows":40}"#.to_string()
            ))
        );
        assert_eq!(
            peer.control.recv().await,
            Some(ShellControl::Input("pwd\n".to_string()))
        );
        assert!(h.registry.get(id).unwrap().last_heartbeat_at > created_at);

        peer.events
            .send(ShellEvent::Output(Bytes::from_static(b"hello\r\n")))
            .await
            .unwrap();
        peer.events
            .send(ShellEvent::Output(Bytes::from_static(&[0xff, 0xfe])))
            .await
            .unwrap();
        peer.events
            .send(ShellEvent::Exited(ExitStatus::new(0, None)))
            .await
            .unwrap();
        peer
    };

    let params = h.params();
    let (ending, _peer) = tokio::join!(h.bridge.serve(&params, &mut sent, rx), drive);
    drop(input);

    assert_eq!(
        ending,
        Some(Ending::ShellExited(ExitStatus::new(0, None)))
    );
    assert_eq!(sent.len(), 4);
    assert_eq!(sent[0], text("hello\r\n"));
    assert_eq!(sent[1], text("\u{fffd}\u{fffd}"));
    assert_eq!(sent[2], text("\r\n[shell] session ended\r\n"));
    assert_eq!(close_code(&sent[3]), Some(close::NORMAL));
}

#[tokio::test]
async fn characters_split_across_chunks_stay_text() {
    let h = Harness::new().await;
    let (input, rx) = client();
    let mut sent = Vec::new();

    let drive = async {
        let (_, peer) = h.shell().await;
        let chunks: [&[u8]; 3] = [b"caf\xc3", b"\xa9\r\n", b"\xe2\x82"];
        for chunk in chunks {
            peer.events
                .send(ShellEvent::Output(Bytes::copy_from_slice(chunk)))
                .await
                .unwrap();
        }
        peer.events
            .send(ShellEvent::Exited(ExitStatus::new(0, None)))
            .await
            .unwrap();
        peer
    };
    let params = h.params();
    let (ending, _peer) = tokio::join!(h.bridge.serve(&params, &mut sent, rx), drive);
    drop(input);

    assert!(matches!(ending, Some(Ending::ShellExited(_))));
    assert_eq!(sent[0], text("caf"));
    assert_eq!(sent[1], text("\u{e9}\r\n"));
    // an unfinished character is flushed before the banner
    assert_eq!(sent[2], text("\u{fffd}"));
    assert_eq!(sent[3], text("\r\n[shell] session ended\r\n"));
    assert_eq!(close_code(&sent[4]), Some(close::NORMAL));
    assert!(sent.iter().all(|m| !matches!(m, Message::Binary(_))));
}

#[tokio::test]
async fn abnormal_exit_banner() {
    let h = Harness::new().await;
    let (input, rx) = client();
    let mut sent = Vec::new();

    let drive = async {
        let (_, peer) = h.shell().await;
        let status = ExitStatus::new(130, Some("SIGINT".to_string()));
        peer.events.send(ShellEvent::Exited(status)).await.unwrap();
        peer
    };
    let params = h.params();
    let (ending, _peer) = tokio::join!(h.bridge.serve(&params, &mut sent, rx), drive);
    drop(input);

    assert!(matches!(ending, Some(Ending::ShellExited(_))));
    assert_eq!(
        sent[0],
        text("\r\n[shell] shell exited (code=130, signal=SIGINT)\r\n")
    );
    assert_eq!(close_code(&sent[1]), Some(close::NORMAL));
}

#[tokio::test]
async fn lost_shell_closes_the_connection() {
    let h = Harness::new().await;
    let (input, rx) = client();
    let mut sent = Vec::new();

    let drive = async {
        let (_, peer) = h.shell().await;
        drop(peer);
    };
    let params = h.params();
    let (ending, ()) = tokio::join!(h.bridge.serve(&params, &mut sent, rx), drive);
    drop(input);

    assert_eq!(ending, Some(Ending::ShellLost));
    assert_eq!(sent.len(), 1);
    assert_eq!(close_code(&sent[0]), Some(close::NORMAL));
}

#[tokio::test]
async fn destroying_the_container_closes_the_connection() {
    let h = Harness::new().await;
    let (input, rx) = client();
    let mut sent = Vec::new();

    let drive = async {
        while h.runtime.exec_count() == 0 {
            tokio::task::yield_now().await;
        }
        h.registry.terminate(h.session.session_id.as_str()).await;
    };
    let params = h.params();
    let (ending, ()) = tokio::join!(h.bridge.serve(&params, &mut sent, rx), drive);
    drop(input);

    assert_eq!(ending, Some(Ending::ShellLost));
    assert_eq!(sent.len(), 1);
    assert_eq!(close_code(&sent[0]), Some(close::NORMAL));
    assert_eq!(h.runtime.destroy_count(&h.session.container_id), 1);
}

#[tokio::test]
async fn client_close_kills_the_shell() {
    let h = Harness::new().await;
    let (input, rx) = client();
    let mut sent = Vec::new();

    let drive = async {
        let (_, mut peer) = h.shell().await;
        input.send(Ok(Message::Close(None))).unwrap();
        loop {
            match peer.control.recv().await {
                Some(ShellControl::Kill) => break,
                Some(other) => panic!("unexpected {:?}", other),
                None => panic!("shell dropped without a kill"),
            }
        }
    };
    let params = h.params();
    let (ending, ()) = tokio::join!(h.bridge.serve(&params, &mut sent, rx), drive);

    assert_eq!(ending, Some(Ending::ClientClosed));
    assert!(sent.is_empty());
    // the session itself outlives its terminal
    assert!(h.registry.get(h.session.session_id.as_str()).is_some());
}

#[tokio::test]
async fn client_error_ends_the_relay() {
    let h = Harness::new().await;
    let (input, rx) = client();
    let mut sent = Vec::new();

    let drive = async {
        let (_, peer) = h.shell().await;
        input.send(Err("connection reset".to_string())).unwrap();
        peer
    };
    let params = h.params();
    let (ending, _peer) = tokio::join!(h.bridge.serve(&params, &mut sent, rx), drive);

    assert_eq!(
        ending,
        Some(Ending::ClientError("connection reset".to_string()))
    );
}

#[tokio::test]
async fn connections_to_one_session_coexist() {
    let h = Harness::new().await;
    let (first_input, first_rx) = client();
    let (second_input, second_rx) = client();
    let mut first_sent = Vec::new();
    let mut second_sent = Vec::new();

    let drive = async {
        let (_, a) = h.shell().await;
        let (_, b) = h.shell().await;
        first_input.send(Ok(Message::Close(None))).unwrap();
        second_input.send(Ok(Message::Close(None))).unwrap();
        (a, b)
    };
    let params = h.params();
    let (first, second, _peers) = tokio::join!(
        h.bridge.serve(&params, &mut first_sent, first_rx),
        h.bridge.serve(&params, &mut second_sent, second_rx),
        drive
    );

    assert_eq!(first, Some(Ending::ClientClosed));
    assert_eq!(second, Some(Ending::ClientClosed));
    assert_eq!(h.runtime.exec_count(), 2);
}
