use std::path::Path;

use binix_isolation::{
    BrowserContextId, IsolatedOriginSource, IsolationContext, Origin, PolicyConfig, ProcessId, SecurityPolicy,
    UrlInfo,
};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use url::Url;

const PROFILE: BrowserContextId = BrowserContextId::new(1);

fn locked_policy() -> (SecurityPolicy, ProcessId) {
    let policy = SecurityPolicy::new(PolicyConfig::standard());
    policy.add_future_isolated_origin_patterns(
        "https://login.a.test, https://[*.]bank.test",
        IsolatedOriginSource::CommandLine,
        None,
    );
    let process = ProcessId::new(1);
    policy.add(process, PROFILE);
    let context = IsolationContext::new(policy.create_browsing_group(), PROFILE);
    let lock = policy.process_lock_for(&context, &UrlInfo::new(Url::parse("https://a.test/").unwrap()));
    policy.lock_process(&context, process, false, &lock);
    policy.grant_read_file(process, Path::new("/home/user/downloads"));
    (policy, process)
}

/// Hot path of every storage and navigation check
fn benchmark_access_checks(c: &mut Criterion) {
    let (policy, process) = locked_policy();
    let same_site = Origin::parse("https://www.a.test").unwrap();
    let cross_site = Origin::parse("https://b.test").unwrap();
    let page = Url::parse("https://a.test/page").unwrap();

    let mut group = c.benchmark_group("access");

    group.bench_function("can_access_data_same_site", |b| {
        b.iter(|| policy.can_access_data_for_origin(process, black_box(&same_site)))
    });

    // Denials also build a report for the observer.
    group.bench_function("can_access_data_cross_site", |b| {
        b.iter(|| policy.can_access_data_for_origin(process, black_box(&cross_site)))
    });

    group.bench_function("can_commit_url", |b| {
        b.iter(|| policy.can_commit_url(process, black_box(&page)))
    });

    group.bench_function("can_read_nested_file", |b| {
        let file = Path::new("/home/user/downloads/a/b/c/report.pdf");
        b.iter(|| policy.can_read_file(process, black_box(file)))
    });

    group.finish();
}

fn benchmark_site_computation(c: &mut Criterion) {
    let (policy, _) = locked_policy();
    let context = IsolationContext::new(policy.create_browsing_group(), PROFILE);

    let mut group = c.benchmark_group("site");

    for spec in ["https://www.a.test/", "https://x.login.a.test/", "https://deep.sub.bank.test/"] {
        let info = UrlInfo::new(Url::parse(spec).unwrap());
        group.bench_function(spec, |b| {
            b.iter(|| policy.process_lock_for(&context, black_box(&info)))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_access_checks, benchmark_site_computation);
criterion_main!(benches);
