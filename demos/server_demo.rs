use http_relay::{
    HttpFrontDoor, PipelineBuilder, Predicate, RelayConfig, RelayServer, Reply, Stage,
    StageError, Terminal, TerminalInput,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };

    let relay = RelayServer::from_builder(
        PipelineBuilder::new()
            .with_config(config)
            .stage(Stage::tap("access-log", Predicate::Always, |t| {
                tracing::info!("{} {} {} (tag `{}`)", t.id(), t.request().method, t.request().path, t.tag());
                Ok(())
            }))
            .stage(Stage::map("string", Predicate::tag("string"), |t| {
                t.append("Hello from the relay");
                t.set_tag("respond");
                Ok(())
            }))
            .stage(Stage::map("json", Predicate::tag("json"), |t| {
                t.attach_json_body();
                t.set_tag("respond");
                Ok(())
            }))
            .terminal(Terminal::new("respond", Predicate::tag("respond"), |input: TerminalInput| async move {
                let task = input.task;
                if task.is_fallback("fallback") {
                    let data = task.data().cloned().unwrap_or_default();
                    return Ok(Reply::json(500, &data));
                }
                Ok::<_, StageError>(match task.data() {
                    Some(doc) => Reply::json(200, doc),
                    None => Reply::text(200, &task.buffer_str()),
                })
            })),
    )?
    .start()?;

    HttpFrontDoor::new(relay.handle())
        .bind("GET", "/string", "string")
        .bind("POST", "/json", "json")
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    relay.shutdown().await;
    Ok(())
}
