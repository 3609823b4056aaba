//! # Connection Tests: lifecycle events through ConnectionHub
//!
//! Open, message, error and close events enter the pipeline as tasks that
//! stages select by event kind; replies and broadcasts land on the
//! connection as frames.

use http_relay::{
    Bytes, Connection, ConnectionHub, EventKind, PipelineBuilder, Predicate, RelayError,
    RelayServer, Stage, Terminal,
};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingConnection {
    frames: Mutex<Vec<String>>,
    broken: bool,
}

impl RecordingConnection {
    fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    fn frames(&self) -> Vec<String> {
        let mut frames = self.frames.lock().unwrap().clone();
        frames.sort();
        frames
    }
}

impl Connection for RecordingConnection {
    fn send(&self, frame: Bytes) -> Result<(), RelayError> {
        if self.broken {
            return Err(RelayError::Protocol("connection reset".into()));
        }
        self.frames
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&frame).into_owned());
        Ok(())
    }
}

/// First generation of one event kind.
fn on(kind: EventKind) -> Predicate {
    Predicate::all([Predicate::tag(""), Predicate::event(kind)])
}

/// Each stage picks its event kind; data documents carry the error code and
/// the close status.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stages_filter_on_connection_events() {
    let closes = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let close_log = closes.clone();
    let error_log = errors.clone();

    let relay = RelayServer::from_builder(
        PipelineBuilder::new()
            .stage(Stage::map("greet", on(EventKind::Open), |t| {
                let path = t.request().path.clone();
                t.append(format!("welcome to {}", path));
                t.set_tag("respond");
                Ok(())
            }))
            .stage(Stage::map("shout", on(EventKind::Message), |t| {
                let body = String::from_utf8_lossy(&t.request().body).to_uppercase();
                t.append(body);
                t.set_tag("respond");
                Ok(())
            }))
            .stage(Stage::map("errors", on(EventKind::Error), move |t| {
                let data = t.data().cloned().unwrap_or_default();
                error_log.lock().unwrap().push(data["errorCode"]["value"].as_i64());
                t.set_tag("respond");
                Ok(())
            }))
            .stage(Stage::map("farewell", on(EventKind::Close), move |t| {
                let data = t.data().cloned().unwrap_or_default();
                close_log
                    .lock()
                    .unwrap()
                    .push((t.request().connection, data["status"].as_u64()));
                t.append("bye");
                t.set_tag("respond");
                Ok(())
            }))
            .terminal(Terminal::echo("reply", Predicate::tag("respond"))),
    )
    .unwrap()
    .start()
    .unwrap();

    let hub = ConnectionHub::new(relay.handle());
    let peer = Arc::new(RecordingConnection::default());
    let id = hub.open("/chat", peer.clone()).unwrap();
    assert_eq!(hub.len(), 1);

    hub.message(id, "hello").unwrap();
    hub.error(id, "system", 104).unwrap();
    hub.close(id, 1000, "done").unwrap();
    assert!(hub.is_empty());
    assert!(matches!(hub.message(id, "late"), Err(RelayError::UnknownConnection(_))));

    let handle = relay.handle();
    relay.shutdown().await;

    // The error event replies with an empty body and the close reply has no
    // connection left to go to.
    assert_eq!(peer.frames(), vec!["HELLO".to_string(), "welcome to /chat".to_string()]);
    assert_eq!(*errors.lock().unwrap(), vec![Some(104)]);
    assert_eq!(*closes.lock().unwrap(), vec![(Some(id), Some(1000))]);
    assert_eq!(handle.stats().fallbacks, 0);
}

/// Broadcast reaches every open connection and skips closed and broken ones.
#[tokio::test]
async fn test_broadcast_reaches_open_connections() {
    let relay = RelayServer::from_builder(
        PipelineBuilder::new().terminal(Terminal::echo("reply", Predicate::Always)),
    )
    .unwrap()
    .start()
    .unwrap();

    let hub = ConnectionHub::new(relay.handle()).with_tag("events");
    let a = Arc::new(RecordingConnection::default());
    let b = Arc::new(RecordingConnection::default());
    let gone = Arc::new(RecordingConnection::default());
    let broken = Arc::new(RecordingConnection::broken());

    hub.open("/json", a.clone()).unwrap();
    hub.open("/json", b.clone()).unwrap();
    let gone_id = hub.open("/json", gone.clone()).unwrap();
    hub.open("/json", broken.clone()).unwrap();
    hub.close(gone_id, 1001, "going away").unwrap();

    assert_eq!(hub.broadcast("Broadcasting from /json path"), 2);
    hub.send(gone_id, "direct").unwrap_err();

    relay.shutdown().await;
    for peer in [&a, &b] {
        assert_eq!(peer.frames(), vec!["Broadcasting from /json path".to_string()]);
    }
    assert!(gone.frames().is_empty());
}
