use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use uaproxy_config::Config;
use uaproxy_core::Rewriter;
use uaproxy_core::http::{HttpHead, HttpParser};
use uaproxy_core::metadata::{LinkInfo, Metadata};

/// Helper to build a request head with the given number of filler headers
fn build_request(extra_headers: usize) -> Vec<u8> {
    let mut head = b"GET /index.html?q=1 HTTP/1.1\r\nHost: www.example.com\r\n".to_vec();
    for i in 0..extra_headers {
        head.extend_from_slice(format!("X-Filler-{}: value-{}\r\n", i, i).as_bytes());
    }
    head.extend_from_slice(
        b"User-Agent: Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36\r\n\r\n",
    );
    head
}

fn bench_head_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("head_parsing");

    for count in &[0usize, 8, 32] {
        let request = build_request(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &request, |b, request| {
            b.iter(|| {
                let mut parser = HttpParser::new();
                parser.parse(black_box(request)).unwrap()
            });
        });
    }

    group.finish();
}

fn bench_partial_head(c: &mut Criterion) {
    // Parsing restarts from scratch on every read, so measure the
    // incomplete case too
    let request = build_request(16);
    let partial = &request[..request.len() - 4];

    c.bench_function("partial_head", |b| {
        b.iter(|| {
            let mut parser = HttpParser::new();
            let _ = parser.parse(black_box(partial));
        });
    });
}

fn bench_header_edits(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_edits");
    let request = build_request(8);

    group.bench_function("overwrite_fixed", |b| {
        b.iter(|| {
            let mut head = HttpHead::parse(&request).unwrap();
            head.overwrite_header_fixed("User-Agent", black_box("FFF")).unwrap()
        });
    });

    group.bench_function("set_header", |b| {
        b.iter(|| {
            let mut head = HttpHead::parse(&request).unwrap();
            head.set_header("User-Agent", black_box("curl/8.4.0")).unwrap();
        });
    });

    group.bench_function("delete_and_add", |b| {
        b.iter(|| {
            let mut head = HttpHead::parse(&request).unwrap();
            head.delete_header("X-Filler-3").unwrap();
            head.add_header("X-Added", black_box("1")).unwrap();
        });
    });

    group.finish();
}

fn bench_global_rewrite(c: &mut Criterion) {
    let rewriter = Rewriter::from_config(&Config::default()).unwrap();
    let link = Arc::new(LinkInfo::new("10.0.0.2:50000", "93.184.216.34:80"));
    let request = build_request(8);

    c.bench_function("global_rewrite", |b| {
        b.iter(|| {
            let head = HttpHead::parse(&request).unwrap();
            let mut meta = Metadata::for_request(link.clone(), head, None);
            rewriter.rewrite_request(black_box(&mut meta))
        });
    });
}

criterion_group!(
    benches,
    bench_head_parsing,
    bench_partial_head,
    bench_header_edits,
    bench_global_rewrite
);
criterion_main!(benches);
