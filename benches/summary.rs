use criterion::{criterion_group, criterion_main, Criterion};
use std::path::Path;

use mailsummary::model::message_info::MessageInfo;
use mailsummary::summary::{DefaultBackend, FolderSummary, SummaryContext, SummaryOptions};

fn fixture_path() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("simple.mbox")
}

fn bench_parse_mbox(c: &mut Criterion) {
    let fixture_path = fixture_path();
    c.bench_function("parse_simple_mbox", |b| {
        b.iter(|| {
            let parser = mailsummary::parser::mbox::MboxParser::new(&fixture_path).unwrap();
            let mut count = 0u64;
            parser
                .parse(
                    &mut |_message| {
                        count += 1;
                        true
                    },
                    None,
                )
                .unwrap();
            count
        })
    });
}

fn bench_sync_mbox(c: &mut Criterion) {
    let fixture_path = fixture_path();
    let dir = tempfile::tempdir().unwrap();
    c.bench_function("sync_simple_mbox", |b| {
        b.iter(|| {
            let summary = mailsummary::summary::MboxSummary::new(
                dir.path().join(".simple.summary"),
                mailsummary::summary::MboxBackend,
                SummaryContext::shared(),
                SummaryOptions {
                    build_content: true,
                    ..SummaryOptions::default()
                },
            );
            summary.sync_from_mbox(&fixture_path, None).unwrap()
        })
    });
}

/// A folder of `n` synthetic records.
fn populated(dir: &Path, n: usize) -> FolderSummary<DefaultBackend> {
    let summary = FolderSummary::new(
        dir.join(".bench.summary"),
        DefaultBackend,
        SummaryContext::shared(),
        SummaryOptions {
            fsync: false,
            ..SummaryOptions::default()
        },
    );
    let context = std::sync::Arc::clone(summary.context());
    for i in 0..n {
        summary.add(MessageInfo {
            subject: context.intern(&format!("Message number {i}")),
            from: context.intern("Bench Sender <bench@example.com>"),
            to: context.intern("reader@example.com"),
            size: 1024,
            ..MessageInfo::default()
        });
    }
    summary
}

fn bench_save_load(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let summary = populated(dir.path(), 10_000);

    c.bench_function("save_10k_records", |b| {
        b.iter(|| {
            summary.touch();
            summary.save().unwrap()
        })
    });

    c.bench_function("load_10k_records", |b| {
        b.iter(|| {
            let fresh = FolderSummary::new(
                dir.path().join(".bench.summary"),
                DefaultBackend,
                SummaryContext::shared(),
                SummaryOptions::default(),
            );
            fresh.load().unwrap()
        })
    });

    c.bench_function("lookup_uid", |b| b.iter(|| summary.uid("5000").is_some()));
}

criterion_group!(benches, bench_parse_mbox, bench_sync_mbox, bench_save_load);
criterion_main!(benches);
