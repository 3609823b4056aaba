use http_relay::{
    CompletionDiscipline, MemorySink, PipelineBuilder, Predicate, RelayServer, Request, Stage,
    Terminal,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    for completion in [CompletionDiscipline::FireAndForget, CompletionDiscipline::WaitForAll] {
        let relay = RelayServer::from_builder(
            PipelineBuilder::new()
                .with_completion(completion)
                .stage(Stage::map("1", Predicate::tag("1"), |t| {
                    t.append("A");
                    t.set_tag("2");
                    Ok(())
                }))
                .stage(Stage::map("2", Predicate::tag("2"), |t| {
                    t.append("B");
                    t.set_tag("3");
                    Ok(())
                }))
                .stage(Stage::map("3", Predicate::tag("3"), |t| {
                    t.append("C");
                    t.set_tag("respond");
                    Ok(())
                }))
                .terminal(Terminal::echo("terminal", Predicate::tag("respond"))),
        )?
        .start()?;

        let sink = Arc::new(MemorySink::default());
        relay.on_request_tagged(Request::new("GET", "/"), sink.clone(), "1")?;
        sink.wait_for(1, Duration::from_secs(1)).await;

        for reply in sink.replies() {
            tracing::info!(
                "{:?}: {} {}",
                completion,
                reply.status,
                String::from_utf8_lossy(&reply.body)
            );
        }
        tracing::info!("{:?}: {:?}", completion, relay.stats());
        relay.shutdown().await;
    }

    Ok(())
}
