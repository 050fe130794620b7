//! Integration tests for the Binix isolation policy
//!
//! These tests drive the public API the way the browser process does:
//! register processes, lock them, grant access and ask for decisions.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::Duration;

use binix_isolation::embedder::PolicyDelegate;
use binix_isolation::policy::{FileSystemType, FileSystemUrl, IsolatedFileSystemRegistry};
use binix_isolation::scheduler::{ExecutionContext, ManualTaskRunner, TokioTaskRunner};
use binix_isolation::{
    BrowserContextId, IsolatedOriginSource, IsolationContext, Origin, PolicyConfig, ProcessId, ProcessLock,
    SecurityPolicy, UrlInfo,
};
use mockall::mock;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use url::Url;

const PROFILE: BrowserContextId = BrowserContextId::new(1);

static LOGGER: Once = Once::new();

fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn url(spec: &str) -> Url {
    Url::parse(spec).unwrap()
}

fn origin(spec: &str) -> Origin {
    Origin::parse(spec).unwrap()
}

/// Lock `process` to the site of `spec` in a fresh browsing group
fn lock_to(policy: &SecurityPolicy, process: ProcessId, spec: &str) -> IsolationContext {
    let context = IsolationContext::new(policy.create_browsing_group(), PROFILE);
    let lock = policy.process_lock_for(&context, &UrlInfo::new(url(spec)));
    policy.lock_process(&context, process, false, &lock);
    context
}

mock! {
    Delegate {}

    impl PolicyDelegate for Delegate {
        fn is_handled_url(&self, url: &Url) -> bool;
        fn should_lock_process_to_site(&self, browser_context: Option<BrowserContextId>, site_url: &Url) -> bool;
    }
}

#[test]
fn test_commit_and_relock_scenario() {
    init_logging();
    let policy = SecurityPolicy::new(PolicyConfig::standard());
    let process = ProcessId::new(7);
    policy.add(process, PROFILE);
    policy.grant_commit_origin(process, &origin("https://a.test"));
    let context = lock_to(&policy, process, "https://a.test/");

    assert!(policy.can_commit_url(process, &url("https://a.test/page")));
    assert!(!policy.can_commit_url(process, &url("https://b.test/page")));

    let locked = policy.process_lock(process);
    let other = policy.process_lock_for(&context, &UrlInfo::new(url("https://b.test/")));
    let relock = catch_unwind(AssertUnwindSafe(|| {
        policy.lock_process(&context, process, false, &other);
    }));
    assert!(relock.is_err());
    assert_eq!(policy.process_lock(process), locked);
    assert!(policy.can_commit_url(process, &url("https://a.test/page")));
}

#[test]
fn test_future_isolated_origin_scenario() {
    init_logging();
    let policy = SecurityPolicy::new(PolicyConfig::partial());
    let secure = origin("https://secure.example.com");

    let g0 = IsolationContext::new(policy.create_browsing_group(), PROFILE);
    let threshold = policy.next_browsing_group_id();
    assert_eq!(policy.add_future_isolated_origins(&[secure.clone()], IsolatedOriginSource::Test, None), 1);
    let g1 = IsolationContext::new(policy.create_browsing_group(), PROFILE);

    assert!(g1.browsing_group.unwrap() >= threshold);
    assert!(policy.is_isolated_origin(&g1, &secure, false));
    assert!(!policy.is_isolated_origin(&g0, &secure, false));

    let info = UrlInfo::new(url("https://secure.example.com/login"));
    assert!(policy.process_lock_for(&g1, &info).is_locked_to_site());
    assert!(policy.process_lock_for(&g0, &info).allows_any_site());
}

#[test]
fn test_isolated_origin_specificity() {
    let policy = SecurityPolicy::new(PolicyConfig::partial());
    policy.add_future_isolated_origin_patterns(
        "https://isolated.example.com, https://[*.]a.isolated.example.com",
        IsolatedOriginSource::Test,
        None,
    );
    let context = IsolationContext::new(policy.create_browsing_group(), PROFILE);

    assert_eq!(
        policy.get_matching_process_isolated_origin(&context, &origin("https://x.a.isolated.example.com"), false),
        Some(origin("https://x.a.isolated.example.com"))
    );
    assert_eq!(
        policy.get_matching_process_isolated_origin(&context, &origin("https://b.isolated.example.com"), false),
        Some(origin("https://isolated.example.com"))
    );
}

#[test]
fn test_handle_outlives_removal() {
    init_logging();
    let runner = Arc::new(ManualTaskRunner::new());
    let registry = Arc::new(IsolatedFileSystemRegistry::new());
    let config = PolicyConfig::standard().with_cleanup_delay(Duration::from_secs(30), Duration::from_secs(2));
    let policy = SecurityPolicy::builder(config)
        .with_task_runner(runner.clone())
        .with_file_system_references(registry.clone())
        .build();
    let process = ProcessId::new(3);
    policy.add(process, PROFILE);
    lock_to(&policy, process, "https://a.test/");
    policy.grant_read_file(process, Path::new("/home/user/doc.txt"));
    policy.grant_read_file_system(process, "drop");

    let handle = policy.create_handle(process);
    policy.remove(process);

    assert!(handle.can_commit_url(&url("https://a.test/page")));
    assert!(handle.can_read_file(Path::new("/home/user/doc.txt")));
    assert!(handle.can_access_data_for_origin(&origin("https://a.test")));
    assert!(!policy.create_handle(process).is_valid());

    let duplicate = handle.duplicate();
    drop(handle);
    assert!(duplicate.can_commit_url(&url("https://a.test/page")));
    assert_eq!(runner.pending_task_count(), 0);

    drop(duplicate);
    assert_eq!(runner.pending_task_count(), 1);
    assert!(!policy.can_commit_url(process, &url("https://a.test/page")));
    assert!(registry.is_registered("drop"));

    runner.advance(Duration::from_secs(32));
    assert!(!registry.is_registered("drop"));
}

#[test]
fn test_invalid_handle_fails_closed() {
    let policy = SecurityPolicy::new(PolicyConfig::standard());
    let handle = policy.create_handle(ProcessId::new(42));
    assert!(!handle.is_valid());
    assert!(!handle.can_commit_url(&url("https://a.test/")));
    assert!(!handle.can_read_file(Path::new("/tmp/x")));
    let fs_url = FileSystemUrl::new(origin("https://a.test"), FileSystemType::Temporary, "x");
    assert!(!handle.can_read_file_system_file(&fs_url));
    assert!(!handle.duplicate().is_valid());
}

#[test]
fn test_delegate_controls_process_model() {
    let mut delegate = MockDelegate::new();
    delegate.expect_should_lock_process_to_site().returning(|_, _| false);
    delegate
        .expect_is_handled_url()
        .returning(|url| url.scheme() != "mailto");

    let policy = SecurityPolicy::builder(PolicyConfig::standard())
        .with_delegate(Arc::new(delegate))
        .build();
    let process = ProcessId::new(1);
    policy.add(process, PROFILE);
    lock_to(&policy, process, "https://a.test/");

    assert!(policy.process_lock(process).allows_any_site());
    assert!(policy.can_request_url(process, &url("mailto:someone@a.test")));
    assert!(!policy.can_request_url(process, &url("app://bundle/")));
}

#[test]
fn test_citadel_blocks_used_unlocked_process() {
    let policy = SecurityPolicy::new(PolicyConfig::partial().with_isolated_origin("https://bank.test"));
    let process = ProcessId::new(2);
    policy.add(process, PROFILE);
    lock_to(&policy, process, "https://news.test/");
    assert!(policy.process_lock(process).allows_any_site());

    assert!(policy.can_access_data_for_origin(process, &origin("https://bank.test")));
    policy.mark_process_used(process);
    assert!(!policy.can_access_data_for_origin(process, &origin("https://bank.test")));
    assert!(policy.can_access_data_for_origin(process, &origin("https://other.test")));
}

#[test]
fn test_origin_keyed_opt_in_is_sticky() {
    let policy = SecurityPolicy::new(PolicyConfig::standard());
    let context = IsolationContext::new(policy.create_browsing_group(), PROFILE);
    let foo = origin("https://foo.a.test");

    policy.update_origin_isolation_opt_in_list_if_necessary(Some(PROFILE), &foo);
    policy
        .add_origin_isolation_state_for_browsing_group(
            &context,
            &foo,
            binix_isolation::OacIsolationState::OriginKeyedProcess,
        )
        .unwrap();

    let lock = policy.process_lock_for(&context, &UrlInfo::new(url("https://foo.a.test/")));
    assert!(lock.is_origin_keyed_process());
    assert_eq!(lock.lock_url(), Some(&url("https://foo.a.test/")));

    let process = ProcessId::new(9);
    policy.add(process, PROFILE);
    policy.lock_process(&context, process, false, &lock);
    assert!(policy.can_access_data_for_origin(process, &foo));
    assert!(!policy.can_access_data_for_origin(process, &origin("https://bar.a.test")));
}

#[test]
fn test_config_from_json() {
    let config = PolicyConfig::from_json(
        r#"{ "site_per_process": false, "isolated_origins": ["https://bank.test"] }"#,
    )
    .unwrap();
    let policy = SecurityPolicy::new(config);
    assert!(policy.is_globally_isolated_origin(&origin("https://bank.test")));
    assert!(policy.is_isolated_site_from_source(&origin("https://bank.test"), IsolatedOriginSource::CommandLine));
    assert!(PolicyConfig::from_json("{ not json").is_err());
}

#[tokio::test(start_paused = true)]
async fn test_tokio_runner_purges_after_grace_period() {
    let registry = Arc::new(IsolatedFileSystemRegistry::new());
    let policy = SecurityPolicy::builder(PolicyConfig::standard())
        .with_task_runner(Arc::new(TokioTaskRunner::new()))
        .with_file_system_references(registry.clone())
        .build();
    let process = ProcessId::new(11);
    policy.add(process, PROFILE);
    policy.grant_read_file_system(process, "fs");
    policy.remove(process);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(registry.is_registered("fs"));

    tokio::time::sleep(policy.config().cleanup_delay()).await;
    tokio::task::yield_now().await;
    assert!(!registry.is_registered("fs"));
}

#[test]
fn test_unknown_process_fails_closed() {
    let policy = SecurityPolicy::default();
    let process = ProcessId::new(404);
    assert_eq!(policy.process_lock(process), ProcessLock::invalid());
    assert!(!policy.can_request_url(process, &url("app://bundle/")));
    assert!(!policy.can_commit_url(process, &url("https://a.test/")));
    assert!(!policy.can_access_data_for_origin(process, &origin("https://a.test")));
    assert!(policy.try_lock_process(&IsolationContext::global(), process, false, &ProcessLock::invalid()).is_err());
}

#[test]
fn test_ui_grants_race_io_handle_queries() {
    init_logging();
    const PROCESSES: u32 = 8;
    const ROUNDS: usize = 200;

    let config = PolicyConfig::standard().with_cleanup_delay(Duration::ZERO, Duration::ZERO);
    let policy = SecurityPolicy::new(config);
    let processes: Vec<ProcessId> = (1..=PROCESSES).map(ProcessId::new).collect();
    for &process in &processes {
        policy.add(process, PROFILE);
        lock_to(&policy, process, &format!("https://site{process}.test/"));
    }
    let start = Barrier::new(2);

    thread::scope(|scope| {
        scope.spawn(|| {
            let _ui = ExecutionContext::Ui.enter();
            start.wait();
            for round in 0..ROUNDS {
                for &process in &processes {
                    policy.grant_read_file(process, Path::new(&format!("/downloads/{round}")));
                    policy.grant_request_url(process, &url(&format!("https://site{process}.test/{round}")));
                    let _ = policy.can_commit_url(process, &url(&format!("https://site{process}.test/")));
                }
            }
            for &process in &processes {
                policy.remove(process);
            }
        });

        scope.spawn(|| {
            let _io = ExecutionContext::Io.enter();
            start.wait();
            let handles: Vec<_> = processes.iter().map(|&process| policy.create_handle(process)).collect();
            let mut readable = vec![false; handles.len()];
            for _ in 0..ROUNDS {
                for (i, handle) in handles.iter().enumerate() {
                    let Some(process) = handle.process_id() else { continue };
                    let own_site = origin(&format!("https://site{process}.test"));
                    assert!(handle.can_access_data_for_origin(&own_site));
                    assert!(!handle.can_access_data_for_origin(&origin("https://elsewhere.test")));

                    // Grants only accumulate while the handle keeps the state alive.
                    let can_read = handle.can_read_file(Path::new("/downloads/0"));
                    assert!(can_read || !readable[i]);
                    readable[i] = can_read;
                    let duplicate = handle.duplicate();
                    assert!(!can_read || duplicate.can_read_file(Path::new("/downloads/0")));
                }
            }
        });
    });

    // Both sides are done: every state is purged and the ids are free again.
    for &process in &processes {
        assert_eq!(policy.process_lock(process), ProcessLock::invalid());
        assert!(!policy.create_handle(process).is_valid());
        policy.add(process, PROFILE);
    }
}

proptest! {
    #[test]
    fn test_jail_allows_exactly_the_locked_site(label in "[a-z]{1,8}", same_site in any::<bool>()) {
        let policy = SecurityPolicy::new(PolicyConfig::standard());
        let process = ProcessId::new(1);
        policy.add(process, PROFILE);
        lock_to(&policy, process, "https://a.test/");

        let site = if same_site { "a.test" } else { "b.test" };
        let candidate = origin(&format!("https://{label}.{site}"));
        prop_assert_eq!(policy.can_access_data_for_origin(process, &candidate), same_site);
    }

    #[test]
    fn test_lock_never_changes_once_set(label in "[a-z]{1,8}") {
        let policy = SecurityPolicy::new(PolicyConfig::standard());
        let process = ProcessId::new(1);
        policy.add(process, PROFILE);
        let context = lock_to(&policy, process, "https://a.test/");
        let before = policy.process_lock(process);

        let other = policy.process_lock_for(&context, &UrlInfo::new(url(&format!("https://{label}.test/"))));
        prop_assert!(policy.try_lock_process(&context, process, true, &other).is_err());
        prop_assert_eq!(policy.process_lock(process), before);
    }

    #[test]
    fn test_repeated_grants_are_idempotent(times in 1usize..5, host in "[a-z]{1,8}") {
        let policy = SecurityPolicy::new(PolicyConfig::standard());
        let process = ProcessId::new(1);
        policy.add(process, PROFILE);
        let spec = format!("app://{host}/");
        lock_to(&policy, process, &spec);
        let app = url(&format!("{spec}index.html"));
        let file = Path::new("/data/file.txt");

        for _ in 0..times {
            policy.grant_commit_url(process, &app);
            policy.grant_request_url(process, &app);
            policy.grant_read_file(process, file);
        }
        prop_assert!(policy.can_commit_url(process, &app));
        prop_assert!(policy.can_request_url(process, &app));
        prop_assert!(policy.can_read_file(process, file));
        prop_assert!(!policy.can_create_read_write_file(process, file));
    }
}
