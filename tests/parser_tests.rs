use proptest::prelude::*;
use tessera::{compile, parse_str, RenderRequest, Runtime};

/// Fragments that combine into valid sources
fn fragment() -> impl Strategy<Value = String> {
    let name = prop::sample::select(vec!["a", "b", "total", "item"]);
    let number = -20i64..20;
    prop_oneof![
        "[a-z ]{1,12}".prop_map(|text| text),
        (name.clone(), number.clone())
            .prop_map(|(n, v)| format!(r#"<q:set name="{}" value="{}"/>"#, n, v)),
        (name.clone(), number.clone()).prop_map(|(n, v)| format!(
            r#"<q:set name="{}" operation="add" value="{{{}}}"/>"#,
            n, v
        )),
        name.clone().prop_map(|n| format!("<p>{{{}}}</p>", n)),
        (name.clone(), 0i64..5).prop_map(|(n, to)| format!(
            r#"<q:loop from="1" to="{}" item="i"><b>{{i + {}}}</b></q:loop>"#,
            to, n
        )),
        (name, number).prop_map(|(n, v)| format!(
            r#"<q:if condition="{} > {}">yes<q:else>no</q:else></q:if>"#,
            n, v
        )),
    ]
}

fn source() -> impl Strategy<Value = String> {
    prop::collection::vec(fragment(), 0..8).prop_map(|parts| parts.concat())
}

proptest! {
    #[test]
    fn parse_is_deterministic(src in source()) {
        let first = parse_str(&src);
        let second = parse_str(&src);
        prop_assert!(first.is_ok(), "generated source should parse: {}", src);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn parse_never_panics_on_arbitrary_text(src in "[<>a-z:/=\" {}]{0,40}") {
        let _ = parse_str(&src);
    }

    #[test]
    fn backends_agree(src in source()) {
        let doc = parse_str(&src).unwrap();
        let unit = compile(&doc).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (interpreted, compiled) = rt.block_on(async {
            let runtime = Runtime::default();
            let interpreted = runtime.render(&doc, RenderRequest::new()).await;
            let compiled = runtime.render_compiled(&unit, RenderRequest::new()).await;
            (interpreted.map(|o| o.body), compiled.map(|o| o.body))
        });
        prop_assert_eq!(interpreted.map_err(|e| e.to_string()), compiled.map_err(|e| e.to_string()));
    }
}

#[test]
fn test_reparse_of_same_file_is_equal() {
    let src = r#"<div class="x"><q:set name="a" value="1"/><q:loop list="a,b" item="v">{v}</q:loop></div>"#;
    assert_eq!(parse_str(src).unwrap(), parse_str(src).unwrap());
}

#[test]
fn test_error_positions() {
    let err = parse_str("<p>\n  <q:set name=\"a\"/>\n</p>").unwrap_err();
    assert_eq!(err.reason, "Set requires 'value' attribute");
    let span = err.span.expect("attribute errors carry a span");
    assert_eq!(span.line, 2);
}
