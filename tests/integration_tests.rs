use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use tessera::{
    compile, parse_file, parse_str, Fixtures, MemoryDatasource, RenderOutput, RenderRequest, Runtime,
    Value,
};

fn json(value: serde_json::Value) -> Value {
    Value::from_json(value)
}

async fn render(source: &str) -> RenderOutput {
    let doc = parse_str(source).expect("source should parse");
    Runtime::default()
        .render(&doc, RenderRequest::new())
        .await
        .expect("render should succeed")
}

/// Render through both backends and check they agree byte for byte
async fn render_both(runtime: &Runtime, source: &str) -> String {
    let doc = parse_str(source).expect("source should parse");
    let unit = compile(&doc).expect("source should compile");
    let interpreted = runtime.render(&doc, RenderRequest::new()).await.unwrap();
    let compiled = runtime.render_compiled(&unit, RenderRequest::new()).await.unwrap();
    assert_eq!(interpreted.body, compiled.body);
    interpreted.body
}

#[tokio::test]
async fn test_loop_accumulates_count() {
    let output = render(
        r#"<q:set name="count" value="0"/>
           <q:loop items="{[1, 2, 3]}" item="n"><q:set name="count" operation="add" value="{n}"/></q:loop>"#,
    )
    .await;
    assert_eq!(output.variable("count"), Value::Integer(6));
}

#[tokio::test]
async fn test_query_loop_over_mocked_rows() {
    let datasource = Arc::new(MemoryDatasource::new().with_rows(
        "main",
        vec![
            json(serde_json::json!({"id": 1, "name": "Ann"})),
            json(serde_json::json!({"id": 2, "name": "Bob"})),
            json(serde_json::json!({"id": 3, "name": "Cid"})),
        ],
    ));
    let runtime = Runtime::builder().datasource(datasource.clone()).build();
    let doc = parse_str(
        r#"<q:query name="users" datasource="main">SELECT id, name FROM users</q:query><ul><q:loop query="users"><li>{users.id}={users.name}</li></q:loop></ul>"#,
    )
    .unwrap();

    let output = runtime.render(&doc, RenderRequest::new()).await.unwrap();
    assert_eq!(output.body, "<ul><li>1=Ann</li><li>2=Bob</li><li>3=Cid</li></ul>");
    assert_eq!(output.variable("result").member("recordCount"), Value::Integer(3));
    assert_eq!(output.variable("users").member("columnList"), Value::from("id,name"));
    assert_eq!(datasource.executed()[0].statement, "SELECT id, name FROM users");
}

#[tokio::test]
async fn test_loop_and_function_locals_do_not_leak() {
    let output = render(
        r#"<q:function name="f"><q:set name="local" value="1"/></q:function><q:loop list="a,b" item="x"><q:set name="inner" value="{x}"/></q:loop>[{inner}][{x}]<q:invoke function="f"/>[{local}]"#,
    )
    .await;
    assert_eq!(output.body, "[][][]");
    assert!(output.variable("inner").is_undefined());
    assert!(output.variable("x").is_undefined());
    assert!(output.variable("local").is_undefined());
}

#[tokio::test]
async fn test_loop_binds_index_in_order() {
    let output = render(
        r#"<q:loop items="{['a', 'b', 'c']}" item="letter" index="i">{i}:{letter};</q:loop>[{letter}{i}]"#,
    )
    .await;
    assert_eq!(output.body, "0:a;1:b;2:c;[]");
}

#[tokio::test]
async fn test_if_chain_is_exclusive() {
    let source = r#"<q:if condition="n > 10">big<q:elseif condition="n > 3">medium</q:elseif><q:elseif condition="n > 1">small</q:elseif><q:else>tiny</q:else></q:if>"#;
    let doc = parse_str(source).unwrap();
    let runtime = Runtime::default();
    for (n, expected) in [(20i64, "big"), (5, "medium"), (11, "big"), (2, "small"), (0, "tiny")] {
        let output = runtime
            .render(&doc, RenderRequest::new().variable("n", n))
            .await
            .unwrap();
        assert_eq!(output.body, expected, "n = {}", n);
    }
}

#[tokio::test]
async fn test_undefined_propagates_silently() {
    let output = render(r#"<p>[{nobody.name}]</p><q:dump var="{missing}" label="Undefined Var"/>"#).await;
    assert_eq!(output.body, "<p>[]</p>Undefined Var => undefined\n");
}

#[tokio::test]
async fn test_failed_operation_does_not_abort_render() {
    let output = render(
        r#"<q:query name="q" datasource="main">SELECT 1</q:query><q:if condition="q.success">ok<q:else>failed: {q.error.kind}</q:else></q:if>"#,
    )
    .await;
    assert_eq!(output.body, "failed: database");
}

#[tokio::test]
async fn test_application_scope_is_shared_across_sessions() {
    let runtime = Runtime::default();
    let doc = parse_str(r#"<q:set name="application.hits" operation="increment"/>{application.hits}"#).unwrap();
    let a = runtime.render(&doc, RenderRequest::new().session("a")).await.unwrap();
    let b = runtime.render(&doc, RenderRequest::new().session("b")).await.unwrap();
    assert_eq!(a.body, "1");
    assert_eq!(b.body, "2");
}

#[test]
fn test_documented_negative_examples() {
    let cases = [
        (
            r#"<q:data name="d" type="xml">a<q:field name="x"/></q:data>"#,
            "Field requires 'xpath' attribute",
        ),
        (
            r#"<q:fetch name="r" url="https://a.test"><q:header value="x"/></q:fetch>"#,
            "Header requires 'name' attribute",
        ),
        (
            r#"<q:invoke name="r"/>"#,
            "Invoke requires a target (function, component, url, endpoint or service)",
        ),
        (
            r#"<q:function name="f">x</q:function><q:invoke name="r" function="f" url="https://a.test"/>"#,
            "Invoke can only specify one target",
        ),
        (r#"<q:set value="1"/>"#, "Set requires 'name' attribute"),
        (
            r#"<q:loop item="x">z</q:loop>"#,
            "Loop requires a source (items, list, query or from/to)",
        ),
    ];
    for (source, reason) in cases {
        let err = parse_str(source).unwrap_err();
        assert_eq!(err.reason, reason, "source: {}", source);
        assert!(compile_rejects(source));
    }
}

fn compile_rejects(source: &str) -> bool {
    parse_str(source).and_then(|doc| compile(&doc)).is_err()
}

#[tokio::test]
async fn test_demos_render_identically_in_both_backends() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");
    let fixtures = Fixtures::from_file(&dir.join("fixtures.json")).unwrap();
    let runtime = Runtime::builder().providers(fixtures.into_providers()).build();

    let mut demos: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("tess"))
        .collect();
    demos.sort();
    assert!(demos.len() >= 4);

    for path in demos {
        let doc = parse_file(&path).unwrap();
        let unit = compile(&doc).unwrap();
        let interpreted = runtime.render(&doc, RenderRequest::new()).await.unwrap();
        let compiled = runtime.render_compiled(&unit, RenderRequest::new()).await.unwrap();
        assert_eq!(interpreted.body, compiled.body, "{}", path.display());
    }
}

#[tokio::test]
async fn test_demo_outputs() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");
    let fixtures = Fixtures::from_file(&dir.join("fixtures.json")).unwrap();
    let runtime = Runtime::builder().providers(fixtures.into_providers()).build();

    let basics = runtime
        .render(&parse_file(&dir.join("basics.tess")).unwrap(), RenderRequest::new())
        .await
        .unwrap();
    assert!(basics.body.contains("<h1>INVENTORY</h1>"));
    assert!(basics.body.contains(r#"<li class="odd">1: 1</li>"#));
    assert!(basics.body.contains("<p>large order (14)</p>"));
    assert!(!basics.body.contains("small order"));
    assert!(basics.body.contains("<p>count=6 max=5 len=5</p>"));
    assert!(basics.body.ends_with("Undefined Var => undefined\n"));

    let components = runtime
        .render(&parse_file(&dir.join("components.tess")).unwrap(), RenderRequest::new())
        .await
        .unwrap();
    assert!(components
        .body
        .contains(r#"<section class="card"><h2>News</h2><p>Nothing new today</p></section>"#));
    assert!(components.body.contains("<h2>Untitled</h2>"));
    assert!(components.body.contains("<p>card failed: validation</p>"));
    assert!(components.body.contains("<footer>Hello, Ada!</footer>"));

    let data = runtime
        .render(&parse_file(&dir.join("data.tess")).unwrap(), RenderRequest::new())
        .await
        .unwrap();
    assert!(data
        .body
        .contains("<tr><td>1</td><td>Cid</td><td>41</td><td>core</td></tr>"));
    assert!(data.body.contains("<p>3 people, columns age,name,team</p>"));
    assert!(data.body.contains(r#"<li id="web">Web</li>"#));
    assert_eq!(data.logs[0].message, "imported 3 rows");

    let dashboard = runtime
        .render(&parse_file(&dir.join("dashboard.tess")).unwrap(), RenderRequest::new())
        .await
        .unwrap();
    assert!(dashboard.body.contains("<h1>Users (3)</h1>"));
    assert!(dashboard.body.contains(r#"<li data-id="1">Ann (admin)</li>"#));
    assert!(dashboard.body.contains(r#"<li data-id="2">Bob</li>"#));
    assert!(dashboard.body.contains("<p>Service status: operational, 200</p>"));
}

#[tokio::test]
async fn test_inline_corpus_matches_between_backends() {
    let runtime = Runtime::default();
    let corpus = [
        r#"<q:set name="a" value="{[1, 2, 3]}"/><q:loop items="{a}" item="x" index="i"><b>{x * i}</b></q:loop>"#,
        r#"<q:function name="fact"><q:param name="n" type="integer"/><q:if condition="n <= 1"><q:return value="1"/></q:if><q:invoke name="r" function="fact"><q:param name="n" value="{n - 1}"/></q:invoke><q:return value="{n * r.data}"/></q:function><q:invoke name="f" function="fact"><q:param name="n" value="5"/></q:invoke>{f.data}"#,
        r#"<q:component name="page"><q:param name="who" default="world"/><p title="hi {who}">Hello {who}</p></q:component>"#,
        r#"<q:loop from="10" to="1" step="-3" item="k">{k},</q:loop>"#,
        r#"<q:set name="s" value="x"/><q:set name="s" operation="append" value="y"/>{s}<q:log message="s is {s}"/>"#,
    ];
    let mut bodies = Vec::new();
    for source in corpus {
        bodies.push(render_both(&runtime, source).await);
    }
    assert_eq!(bodies[0], "<b>0</b><b>2</b><b>6</b>");
    assert_eq!(bodies[1], "120");
    assert_eq!(bodies[2], r#"<p title="hi world">Hello world</p>"#);
}

#[tokio::test]
async fn test_dump_quotes_strings_but_not_numbers() {
    let runtime = Runtime::default();
    let body = render_both(
        &runtime,
        r#"<q:set name="n" value="1"/><q:set name="s" value="{'1'}"/><q:dump var="{n}"/><q:dump var="{s}" label="s"/><q:dump var="{[s, n]}" label="both"/>"#,
    )
    .await;
    assert_eq!(body, "n => 1\ns => \"1\"\nboth => [\"1\", 1]\n");
}
