use std::sync::Arc;
use std::time::Duration;
use tessera::engine::DetachedHost;
use tessera::operations::{Operation, OperationSpec, Resolved};
use tessera::{
    compile, parse_str, ErrorKind, ExecutionContext, MemoryDatasource, OperationEngine, OperationState, Providers,
    RenderError, RenderRequest, Runtime, RuntimeConfig, Value,
};

fn rows() -> Vec<Value> {
    vec![
        Value::from_json(serde_json::json!({"id": 1})),
        Value::from_json(serde_json::json!({"id": 2})),
    ]
}

fn operation(source: &str) -> Operation {
    let doc = parse_str(source).unwrap();
    let node = doc.nodes.iter().find(|n| n.kind.is_operation()).unwrap();
    let spec = OperationSpec::from_node(node).unwrap();
    match spec
        .resolve(&ExecutionContext::isolated(), &RuntimeConfig::default())
        .unwrap()
    {
        Resolved::Ready(op) => op,
        Resolved::Rejected(e) => panic!("rejected: {}", e),
    }
}

fn engine(datasource: Arc<MemoryDatasource>) -> OperationEngine {
    let providers = Providers {
        datasource,
        ..Providers::default()
    };
    OperationEngine::new(Arc::new(RuntimeConfig::default()), providers)
}

#[tokio::test]
async fn test_cache_hit_within_ttl_skips_target() {
    let datasource = Arc::new(MemoryDatasource::new().with_rows("main", rows()));
    let engine = engine(datasource.clone());
    let op = operation(r#"<q:query name="q" datasource="main" cache="true">SELECT * FROM t</q:query>"#);

    let first = engine.execute(&op, &mut DetachedHost).await.unwrap();
    let second = engine.execute(&op, &mut DetachedHost).await.unwrap();
    assert_eq!(datasource.call_count(), 1);
    assert_eq!(first.data, second.data);
    assert_eq!(first.record_count, second.record_count);
    assert_eq!(first.column_list, second.column_list);
    assert_eq!(engine.cache().metrics().hits, 1);
}

#[tokio::test]
async fn test_concurrent_renders_share_one_execution() {
    let datasource = Arc::new(
        MemoryDatasource::new()
            .with_rows("main", rows())
            .delayed(Duration::from_millis(20)),
    );
    let runtime = Runtime::builder().datasource(datasource.clone()).build();
    let doc = parse_str(
        r#"<q:query name="q" datasource="main" cache="true">SELECT * FROM t</q:query>{q.recordCount}"#,
    )
    .unwrap();

    let renders = (0..8).map(|_| runtime.render(&doc, RenderRequest::new()));
    for output in futures::future::join_all(renders).await {
        assert_eq!(output.unwrap().body, "2");
    }
    assert_eq!(datasource.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_entry_expires_after_ttl() {
    let datasource = Arc::new(MemoryDatasource::new().with_rows("main", rows()));
    let engine = engine(datasource.clone());
    let op = operation(r#"<q:query name="q" datasource="main" cache_ttl="1">SELECT 1</q:query>"#);

    engine.execute(&op, &mut DetachedHost).await.unwrap();
    tokio::time::advance(Duration::from_millis(500)).await;
    engine.execute(&op, &mut DetachedHost).await.unwrap();
    assert_eq!(datasource.call_count(), 1);

    tokio::time::advance(Duration::from_millis(600)).await;
    engine.execute(&op, &mut DetachedHost).await.unwrap();
    assert_eq!(datasource.call_count(), 2);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    let datasource = Arc::new(MemoryDatasource::new().with_rows("main", rows()).failing(1));
    let engine = engine(datasource.clone());
    let op = operation(r#"<q:query name="q" datasource="main" cache="true">SELECT 1</q:query>"#);

    assert!(!engine.execute(&op, &mut DetachedHost).await.unwrap().success);
    assert!(engine.execute(&op, &mut DetachedHost).await.unwrap().success);
    assert_eq!(datasource.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_bound_is_exact() {
    let datasource = Arc::new(MemoryDatasource::new().with_rows("main", rows()).failing(100));
    let engine = engine(datasource.clone());
    let op = operation(
        r#"<q:query name="q" datasource="main" retry="3" retry_delay="50">SELECT 1</q:query>"#,
    );

    let result = engine.execute(&op, &mut DetachedHost).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(datasource.call_count(), 3);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Database);
    assert_eq!(error.message, "connection to 'main' refused");
}

#[tokio::test]
async fn test_retry_recovers_before_bound() {
    let datasource = Arc::new(MemoryDatasource::new().with_rows("main", rows()).failing(2));
    let engine = engine(datasource.clone());
    let op = operation(r#"<q:query name="q" datasource="main" retry="3">SELECT 1</q:query>"#);

    let result = engine.execute(&op, &mut DetachedHost).await.unwrap();
    assert!(result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.record_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_polling_reexecutes_on_interval_and_refetch() {
    let datasource = Arc::new(MemoryDatasource::new().with_rows("main", rows()));
    let runtime = Runtime::builder().datasource(datasource.clone()).build();
    let doc = parse_str(
        r#"<q:query name="q" datasource="main" interval="1000">SELECT 1</q:query>{q.recordCount}"#,
    )
    .unwrap();

    let output = runtime.render(&doc, RenderRequest::new()).await.unwrap();
    assert_eq!(output.body, "2");
    assert_eq!(output.live.len(), 1);
    let live = &output.live[0];
    assert_eq!(live.name(), "q");
    assert!(matches!(live.state(), OperationState::Success(_)));
    assert_eq!(datasource.call_count(), 1);

    tokio::time::sleep(Duration::from_millis(1010)).await;
    assert_eq!(datasource.call_count(), 2);

    live.refetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(datasource.call_count(), 3);
    assert!(matches!(live.state(), OperationState::Success(_)));
}

#[tokio::test(start_paused = true)]
async fn test_polling_stops_when_dropped() {
    let datasource = Arc::new(MemoryDatasource::new().with_rows("main", rows()));
    let runtime = Runtime::builder().datasource(datasource.clone()).build();
    let doc = parse_str(r#"<q:query name="q" datasource="main" interval="100">SELECT 1</q:query>"#).unwrap();

    let output = runtime.render(&doc, RenderRequest::new()).await.unwrap();
    drop(output);
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(datasource.call_count(), 1);
}

#[tokio::test]
async fn test_data_file_resolves_against_base_dir() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("people.csv"), "name,age\nAnn,34\nBob,27\n").unwrap();
    let mut config = RuntimeConfig::default();
    config.data.base_dir = Some(dir.path().to_path_buf());
    let runtime = Runtime::builder().config(config).build();

    let doc = parse_str(
        r#"<q:data name="p" source="people.csv" type="csv"/><q:loop query="p">{p.name}={p.age};</q:loop>"#,
    )
    .unwrap();
    let output = runtime.render(&doc, RenderRequest::new()).await.unwrap();
    assert_eq!(output.body, "Ann=34;Bob=27;");

    let doc = parse_str(r#"<q:data name="p" source="missing.csv" type="csv"/>{p.error.kind}"#).unwrap();
    let output = runtime.render(&doc, RenderRequest::new()).await.unwrap();
    assert_eq!(output.body, "io");
}

/// Render through the interpreter and the compiled unit, bounded in time
async fn render_both_within(source: &str, limit: Duration) -> [Result<String, RenderError>; 2] {
    let doc = parse_str(source).unwrap();
    let unit = compile(&doc).unwrap();
    let runtime = Runtime::default();
    let interpreted = tokio::time::timeout(limit, runtime.render(&doc, RenderRequest::new()))
        .await
        .expect("interpreted render should not hang");
    let compiled = tokio::time::timeout(limit, runtime.render_compiled(&unit, RenderRequest::new()))
        .await
        .expect("compiled render should not hang");
    [interpreted.map(|o| o.body), compiled.map(|o| o.body)]
}

#[tokio::test]
async fn test_cached_local_invoke_sees_current_caller_state() {
    let source = r#"<q:function name="double"><q:param name="x" type="integer"/><q:return value="{x * 2}"/></q:function><q:set name="x" value="1"/><q:invoke name="a" function="double" cache="true"/>{a.data},<q:set name="x" value="5"/><q:invoke name="b" function="double" cache="true"/>{b.data}"#;
    for body in render_both_within(source, Duration::from_secs(5)).await {
        assert_eq!(body.unwrap(), "2,10");
    }
}

#[tokio::test]
async fn test_cached_recursive_invoke_completes() {
    let finite = r#"<q:function name="f"><q:param name="n" type="integer"/><q:if condition="n <= 0"><q:return value="done"/></q:if><q:invoke name="r" function="f" cache="true"><q:param name="n" value="{n - 1}"/></q:invoke><q:return value="{r.data}"/></q:function><q:invoke name="out" function="f" cache="true"><q:param name="n" value="3"/></q:invoke>{out.data}"#;
    for body in render_both_within(finite, Duration::from_secs(5)).await {
        assert_eq!(body.unwrap(), "done");
    }

    let unbounded = r#"<q:function name="f"><q:param name="n" type="integer"/><q:invoke name="r" function="f" cache="true"><q:param name="n" value="{n}"/></q:invoke></q:function><q:invoke name="out" function="f" cache="true"><q:param name="n" value="3"/></q:invoke>"#;
    for body in render_both_within(unbounded, Duration::from_secs(5)).await {
        let err = body.unwrap_err();
        assert!(err.to_string().starts_with("maximum call depth of 64 exceeded"), "{}", err);
    }
}

#[tokio::test(start_paused = true)]
async fn test_stopped_poller_keeps_last_state() {
    let datasource = Arc::new(MemoryDatasource::new().with_rows("main", rows()));
    let runtime = Runtime::builder().datasource(datasource.clone()).build();
    let doc = parse_str(r#"<q:query name="q" datasource="main" interval="100">SELECT 1</q:query>"#).unwrap();

    let mut output = runtime.render(&doc, RenderRequest::new()).await.unwrap();
    let live = output.live.pop().unwrap();
    let subscriber = live.subscribe();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(datasource.call_count(), 2);

    live.stop();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(datasource.call_count(), 2);
    assert!(matches!(*subscriber.borrow(), OperationState::Success(_)));
}
