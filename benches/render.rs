//! Parse, compile and render benchmarks, interpreted against compiled

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use tessera::{compile, parse_str, RenderRequest, Runtime};

/// A page with `rows` loop iterations, a helper function and a conditional
fn generate_page(rows: usize) -> String {
    format!(
        r#"<q:function name="label">
    <q:param name="n" type="integer"/>
    <q:if condition="n % 3 == 0"><q:return value="fizz"/></q:if>
    <q:return value="{{n}}"/>
</q:function>
<table>
<q:loop from="1" to="{rows}" item="i" index="idx">
    <q:invoke name="l" function="label"><q:param name="n" value="{{i}}"/></q:invoke>
    <tr class="{{idx % 2 == 0 ? 'even' : 'odd'}}"><td>{{i}}</td><td>{{l.data}}</td></tr>
</q:loop>
</table>
<q:set name="total" value="0"/>
<q:loop from="1" to="{rows}" item="i"><q:set name="total" operation="add" value="{{i}}"/></q:loop>
<p>{{total}}</p>"#
    )
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for rows in [10, 100] {
        let source = generate_page(rows);
        group.throughput(Throughput::Bytes(source.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &source, |b, source| {
            b.iter(|| parse_str(black_box(source)).unwrap())
        });
    }
    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let doc = parse_str(&generate_page(100)).unwrap();
    c.bench_function("compile/100", |b| b.iter(|| compile(black_box(&doc)).unwrap()));
}

fn bench_render(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let runtime = Runtime::default();

    let mut group = c.benchmark_group("render");
    for rows in [10, 100, 1000] {
        let doc = parse_str(&generate_page(rows)).unwrap();
        let unit = compile(&doc).unwrap();

        group.bench_with_input(BenchmarkId::new("interpreted", rows), &doc, |b, doc| {
            b.iter(|| rt.block_on(runtime.render(doc, RenderRequest::new())).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("compiled", rows), &unit, |b, unit| {
            b.iter(|| rt.block_on(runtime.render_compiled(unit, RenderRequest::new())).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse, bench_compile, bench_render);
criterion_main!(benches);
