//! # Pipeline Tests: chaining, completion disciplines, exactly-once replies
//!
//! Drives a running relay through `on_request` / `publish` and observes the
//! replies written to an in-memory sink.

use http_relay::{
    CompletionDiscipline, Outcome, Predicate, PipelineBuilder, PublishOutcome, RelayError,
    RelayServer, Reply, Request, Stage, StageError, StageInput, Task, Terminal, TerminalInput,
    MemorySink,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

/// Terminal replying with the buffer as body and the trace in `X-Trace`.
fn tracing_terminal(tag: &str) -> Terminal {
    Terminal::new("terminal", Predicate::tag(tag), |input: TerminalInput| async move {
        let task = input.task;
        if task.is_fallback("fallback") {
            let data = task.data().cloned().unwrap_or_default();
            return Ok(Reply::json(503, &data));
        }
        Ok::<_, StageError>(
            Reply::ok(task.buffer().to_vec()).with_header("X-Trace", task.trace().join(",")),
        )
    })
}

fn abc_stages() -> Vec<Stage> {
    [("1", "2", "A"), ("2", "3", "B"), ("3", "respond", "C")]
        .into_iter()
        .map(|(tag, next, chunk)| {
            Stage::map(tag, Predicate::tag(tag), move |t| {
                t.append(chunk);
                t.set_tag(next);
                Ok(())
            })
        })
        .collect()
}

async fn run_abc(completion: CompletionDiscipline) {
    let relay = RelayServer::from_builder(
        PipelineBuilder::new()
            .with_completion(completion)
            .stages(abc_stages())
            .terminal(tracing_terminal("respond")),
    )
    .unwrap()
    .start()
    .unwrap();

    let sink = Arc::new(MemorySink::default());
    relay
        .on_request_tagged(Request::new("GET", "/abc"), sink.clone(), "1")
        .unwrap();

    assert!(sink.wait_for(1, WAIT).await, "no reply for the ABC chain");
    let replies = sink.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status, 200);
    assert_eq!(&replies[0].body[..], b"ABC");
    let trace = replies[0]
        .headers
        .iter()
        .find(|(k, _)| k == "X-Trace")
        .map(|(_, v)| v.clone());
    assert_eq!(trace.as_deref(), Some("1,2,3,terminal"));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_abc_chain_fire_and_forget() {
    run_abc(CompletionDiscipline::FireAndForget).await;
}

#[tokio::test]
async fn test_abc_chain_wait_for_all() {
    run_abc(CompletionDiscipline::WaitForAll).await;
}

/// Many concurrent requests through the same chain each get their own reply.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_correlations_do_not_interfere() {
    let relay = RelayServer::from_builder(
        PipelineBuilder::new()
            .stages(abc_stages())
            .terminal(tracing_terminal("respond")),
    )
    .unwrap()
    .start()
    .unwrap();

    let sinks: Vec<_> = (0..64).map(|_| Arc::new(MemorySink::default())).collect();
    for sink in &sinks {
        relay
            .on_request_tagged(Request::new("GET", "/"), sink.clone(), "1")
            .unwrap();
    }
    for sink in &sinks {
        assert!(sink.wait_for(1, WAIT).await);
        assert_eq!(&sink.replies()[0].body[..], b"ABC");
    }

    relay.shutdown().await;
}

/// Under wait-for-all, every stage matching the generation completes before
/// the terminal observes it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_for_all_joins_every_stage() {
    const N: usize = 6;
    let completed = Arc::new(AtomicUsize::new(0));

    let mut builder = PipelineBuilder::new().with_completion(CompletionDiscipline::WaitForAll);
    for i in 0..N {
        let completed = completed.clone();
        let delay = Duration::from_millis(20 * (i as u64 + 1));
        builder = builder.stage(Stage::new(
            &format!("audit-{}", i),
            Predicate::Always,
            move |_input: StageInput| {
                let completed = completed.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StageError>(Outcome::Done)
                }
            },
        ));
    }
    let seen = completed.clone();
    let relay = RelayServer::from_builder(builder.terminal(Terminal::new(
        "terminal",
        Predicate::tag("go"),
        move |_input: TerminalInput| {
            let seen = seen.load(Ordering::SeqCst);
            async move { Ok::<_, StageError>(Reply::ok(seen.to_string())) }
        },
    )))
    .unwrap()
    .start()
    .unwrap();

    let sink = Arc::new(MemorySink::default());
    relay
        .on_request_tagged(Request::new("GET", "/"), sink.clone(), "go")
        .unwrap();

    assert!(sink.wait_for(1, WAIT).await);
    assert_eq!(&sink.replies()[0].body[..], N.to_string().as_bytes());

    relay.shutdown().await;
}

/// Under fire-and-forget, slow background stages do not gate the reply.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fire_and_forget_ignores_slow_stages() {
    let mut builder = PipelineBuilder::new().with_completion(CompletionDiscipline::FireAndForget);
    for i in 0..8 {
        builder = builder.stage(Stage::new(
            &format!("slow-{}", i),
            Predicate::Always,
            |_input: StageInput| async {
                tokio::time::sleep(Duration::from_millis(800)).await;
                Ok::<_, StageError>(Outcome::Done)
            },
        ));
    }
    let relay = RelayServer::from_builder(builder.terminal(Terminal::echo("terminal", Predicate::tag("go"))))
        .unwrap()
        .start()
        .unwrap();

    let sink = Arc::new(MemorySink::default());
    let t = Instant::now();
    relay
        .on_request_tagged(Request::new("GET", "/"), sink.clone(), "go")
        .unwrap();
    assert!(sink.wait_for(1, WAIT).await);
    let latency = t.elapsed();
    assert!(latency < Duration::from_millis(400), "terminal waited on slow stages: {:?}", latency);

    relay.shutdown().await;
    println!("test_fire_and_forget_ignores_slow_stages: terminal latency = {:?}", latency);
}

/// Two stages republishing towards the terminal still yield exactly one reply.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_terminal_publishes_reply_once() {
    let fork = |name: &str| {
        Stage::map(name, Predicate::tag("1"), |t| {
            t.set_tag("respond");
            Ok(())
        })
    };
    let relay = RelayServer::from_builder(
        PipelineBuilder::new()
            .stage(fork("left"))
            .stage(fork("right"))
            .terminal(Terminal::echo("terminal", Predicate::tag("respond"))),
    )
    .unwrap()
    .start()
    .unwrap();

    let sink = Arc::new(MemorySink::default());
    relay
        .on_request_tagged(Request::new("GET", "/"), sink.clone(), "1")
        .unwrap();
    assert!(sink.wait_for(1, WAIT).await);

    relay.shutdown().await;
    assert_eq!(sink.count(), 1, "terminal replied more than once");
}

/// A republish for a correlation that already replied is discarded.
#[tokio::test]
async fn test_publish_after_terminal_is_discarded() {
    let relay = RelayServer::from_builder(
        PipelineBuilder::new().terminal(Terminal::echo("terminal", Predicate::tag("respond"))),
    )
    .unwrap()
    .start()
    .unwrap();

    let sink = Arc::new(MemorySink::default());
    let correlation = relay.open(Request::new("GET", "/"), sink.clone());
    let outcome = relay.publish(Task::new(correlation.clone(), "respond")).unwrap();
    assert_eq!(outcome, PublishOutcome::Delivered(1));
    assert!(sink.wait_for(1, WAIT).await);

    let again = relay.publish(Task::new(correlation, "respond")).unwrap();
    assert_eq!(again, PublishOutcome::Discarded);
    assert_eq!(relay.stats().discarded, 1);

    relay.shutdown().await;
    assert_eq!(sink.count(), 1);
}

/// A tag nobody listens to is answered through the fallback path, once.
#[tokio::test]
async fn test_unmatched_tag_gets_single_fallback_reply() {
    let relay = RelayServer::from_builder(
        PipelineBuilder::new()
            .stages(abc_stages())
            .terminal(tracing_terminal("respond")),
    )
    .unwrap()
    .start()
    .unwrap();

    let sink = Arc::new(MemorySink::default());
    relay
        .on_request_tagged(Request::new("GET", "/"), sink.clone(), "nowhere")
        .unwrap();

    assert!(sink.wait_for(1, WAIT).await, "unmatched task hung");
    let reply = &sink.replies()[0];
    assert_eq!(reply.status, 503);
    let data: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(data["error"], "no_matching_stage");

    let stats = relay.stats();
    assert_eq!(stats.unmatched, 1);
    assert_eq!(stats.fallbacks, 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.count(), 1);
    relay.shutdown().await;
}

/// A chain stuck inside a stage is answered when its deadline expires.
#[tokio::test]
async fn test_deadline_expiry_synthesises_fallback() {
    let relay = RelayServer::from_builder(
        PipelineBuilder::new()
            .with_deadline(Duration::from_millis(100))
            .stage(Stage::new("stuck", Predicate::tag("1"), |_input: StageInput| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, StageError>(Outcome::Done)
            }))
            .terminal(tracing_terminal("respond")),
    )
    .unwrap()
    .start()
    .unwrap();

    let sink = Arc::new(MemorySink::default());
    let t = Instant::now();
    relay
        .on_request_tagged(Request::new("GET", "/"), sink.clone(), "1")
        .unwrap();

    assert!(sink.wait_for(1, WAIT).await);
    assert!(t.elapsed() >= Duration::from_millis(100));
    let data: serde_json::Value = serde_json::from_slice(&sink.replies()[0].body).unwrap();
    assert_eq!(data["error"], "deadline_exceeded");
    assert_eq!(sink.count(), 1);

    // Expiry aborted the stuck stage, so shutdown has nothing to wait for.
    let t = Instant::now();
    relay.shutdown().await;
    assert!(t.elapsed() < Duration::from_secs(1), "shutdown waited on an expired stage");
    assert_eq!(sink.count(), 1);
}

/// When the terminal itself cannot answer, the sink's own fallback is used.
#[tokio::test]
async fn test_failing_terminal_falls_back_to_sink_reply() {
    let relay = RelayServer::from_builder(
        PipelineBuilder::new()
            .with_deadline(Duration::from_millis(50))
            .stage(Stage::new("stuck", Predicate::tag("1"), |_input: StageInput| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, StageError>(Outcome::Done)
            }))
            .terminal(Terminal::new("terminal", Predicate::tag("respond"), |_input: TerminalInput| async {
                Err::<Reply, _>(StageError::new("template missing"))
            })),
    )
    .unwrap()
    .start()
    .unwrap();

    let sink = Arc::new(MemorySink::default());
    relay
        .on_request_tagged(Request::new("GET", "/"), sink.clone(), "1")
        .unwrap();

    assert!(sink.wait_for(1, WAIT).await);
    assert_eq!(sink.replies()[0].status, 504);
    relay.shutdown().await;
    assert_eq!(sink.count(), 1);
}

/// Stages stuck on every stage permit neither starve the terminal nor keep an
/// expired request from its fallback reply, and expiry hands the permit back.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stuck_stage_does_not_starve_replies() {
    let relay = RelayServer::from_builder(
        PipelineBuilder::new()
            .with_max_in_flight(1)
            .with_deadline(Duration::from_millis(100))
            .stage(Stage::new("stuck", Predicate::tag("1"), |_input: StageInput| async {
                std::future::pending::<()>().await;
                Ok::<_, StageError>(Outcome::Done)
            }))
            .stage(Stage::map("quick", Predicate::tag("quick"), |t| {
                t.append("quick");
                t.set_tag("respond");
                Ok(())
            }))
            .terminal(tracing_terminal("respond")),
    )
    .unwrap()
    .start()
    .unwrap();

    let stuck = Arc::new(MemorySink::default());
    let healthy = Arc::new(MemorySink::default());
    relay
        .on_request_tagged(Request::new("GET", "/stuck"), stuck.clone(), "1")
        .unwrap();
    relay
        .on_request_tagged(Request::new("GET", "/healthy"), healthy.clone(), "respond")
        .unwrap();

    assert!(healthy.wait_for(1, WAIT).await, "terminal starved by a stuck stage");
    assert_eq!(healthy.replies()[0].status, 200);
    assert!(stuck.wait_for(1, WAIT).await, "deadline fallback starved by a stuck stage");
    let data: serde_json::Value = serde_json::from_slice(&stuck.replies()[0].body).unwrap();
    assert_eq!(data["error"], "deadline_exceeded");

    let after = Arc::new(MemorySink::default());
    relay
        .on_request_tagged(Request::new("GET", "/after"), after.clone(), "quick")
        .unwrap();
    assert!(after.wait_for(1, WAIT).await, "stage permit never came back");
    assert_eq!(&after.replies()[0].body[..], b"quick");

    assert_eq!(relay.stats().fallbacks, 1);
    relay.shutdown().await;
}

/// Shutdown aborts what is still running once the grace period is over and
/// answers the affected peer with the transport's fallback.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_aborts_stuck_actions_after_grace() {
    let relay = RelayServer::from_builder(
        PipelineBuilder::new()
            .with_deadline(Duration::from_secs(60))
            .with_shutdown_grace(Duration::from_millis(200))
            .stage(Stage::new("stuck", Predicate::tag("1"), |_input: StageInput| async {
                std::future::pending::<()>().await;
                Ok::<_, StageError>(Outcome::Done)
            }))
            .terminal(tracing_terminal("respond")),
    )
    .unwrap()
    .start()
    .unwrap();
    let handle = relay.handle();

    let sink = Arc::new(MemorySink::default());
    relay
        .on_request_tagged(Request::new("GET", "/"), sink.clone(), "1")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let t = Instant::now();
    let stopped = tokio::time::timeout(Duration::from_secs(3), relay.shutdown()).await;
    assert!(stopped.is_ok(), "shutdown hung on a stuck stage");
    assert!(t.elapsed() >= Duration::from_millis(200), "grace period was not honoured");

    assert_eq!(sink.count(), 1);
    assert_eq!(sink.replies()[0].status, 500);
    assert_eq!(handle.stats().fallbacks, 1);
}

/// Under wait-for-all the terminal also waits for stages that picked up an
/// earlier generation of the same request.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_for_all_joins_earlier_generations() {
    let audits = Arc::new(AtomicUsize::new(0));
    let done = audits.clone();
    let seen = audits.clone();

    let relay = RelayServer::from_builder(
        PipelineBuilder::new()
            .with_completion(CompletionDiscipline::WaitForAll)
            .stage(Stage::new("audit", Predicate::tag("1"), move |_input: StageInput| {
                let done = done.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StageError>(Outcome::Done)
                }
            }))
            .stage(Stage::map("step", Predicate::tag("1"), |t| {
                t.set_tag("respond");
                Ok(())
            }))
            .terminal(Terminal::new("terminal", Predicate::tag("respond"), move |_input: TerminalInput| {
                let audited = seen.load(Ordering::SeqCst);
                async move { Ok::<_, StageError>(Reply::ok(audited.to_string())) }
            })),
    )
    .unwrap()
    .start()
    .unwrap();

    let sink = Arc::new(MemorySink::default());
    relay
        .on_request_tagged(Request::new("GET", "/"), sink.clone(), "1")
        .unwrap();

    assert!(sink.wait_for(1, WAIT).await);
    assert_eq!(&sink.replies()[0].body[..], b"1", "terminal ran before the audit finished");
    assert_eq!(audits.load(Ordering::SeqCst), 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_publish_after_shutdown_is_channel_closed() {
    let relay = RelayServer::from_builder(
        PipelineBuilder::new().terminal(Terminal::echo("terminal", Predicate::Always)),
    )
    .unwrap()
    .start()
    .unwrap();
    let handle = relay.handle();
    relay.shutdown().await;

    let sink = Arc::new(MemorySink::default());
    let err = handle
        .on_request(Request::new("GET", "/"), sink.clone())
        .unwrap_err();
    assert!(matches!(err, RelayError::ChannelClosed));
    assert!(handle.is_closed());
    assert_eq!(sink.count(), 0);
}

/// A serial stage processes deliveries in the order they were published.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_serial_stage_keeps_fifo_order() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let log = seen.clone();
    let relay = RelayServer::from_builder(
        PipelineBuilder::new()
            .stage(
                Stage::tap("ledger", Predicate::tag("entry"), move |t| {
                    log.lock().unwrap().push(t.request().path.clone());
                    Ok(())
                })
                .serial(),
            )
            .terminal(Terminal::echo("terminal", Predicate::tag("entry"))),
    )
    .unwrap()
    .start()
    .unwrap();

    let sinks: Vec<_> = (0..20).map(|_| Arc::new(MemorySink::default())).collect();
    for (i, sink) in sinks.iter().enumerate() {
        relay
            .on_request_tagged(Request::new("POST", format!("/{}", i)), sink.clone(), "entry")
            .unwrap();
    }
    relay.shutdown().await;

    let expected: Vec<String> = (0..20).map(|i| format!("/{}", i)).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
}

/// Outside any runtime the relay builds its own worker pool.
#[test]
fn test_owned_runtime_when_started_outside_tokio() {
    let relay = RelayServer::from_builder(
        PipelineBuilder::new()
            .with_worker_threads(2)
            .stages(abc_stages())
            .terminal(tracing_terminal("respond")),
    )
    .unwrap()
    .start()
    .unwrap();

    let sink = Arc::new(MemorySink::default());
    relay
        .on_request_tagged(Request::new("GET", "/"), sink.clone(), "1")
        .unwrap();
    let arrived = relay.runtime().block_on(sink.wait_for(1, WAIT));
    assert!(arrived);
    assert_eq!(&sink.replies()[0].body[..], b"ABC");

    relay.shutdown_blocking();
}
