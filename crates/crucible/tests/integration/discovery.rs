use std::sync::Arc;
use std::time::Duration;

use crucible::config::RegistryConfig;
use crucible::{CompilerRegistry, RegistryError};

use super::{fake_gcc, gcc_candidate, write_script};

fn settings(strict_clash: bool) -> RegistryConfig {
    RegistryConfig {
        strict_clash,
        probe_timeout: 5.0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_probe_records_version_and_arguments() {
    let tools = tempfile::tempdir().unwrap();
    let exe = fake_gcc(tools.path(), "g++-12", "12.2.0");

    let registry = CompilerRegistry::new(settings(false), vec![gcc_candidate("gcc-12", exe.clone())]);
    let snapshot = registry.initialize(false).await.expect("discovery failed");

    assert_eq!(snapshot.len(), 1);
    let info = registry.find_compiler("c++", "gcc-12").expect("gcc-12 missing");
    assert_eq!(info.semver.as_deref(), Some("12.2.0"));
    assert_eq!(info.name, "gcc 12.2.0");
    assert_eq!(info.exe, exe);
    assert!(info.possible_arguments.iter().any(|arg| arg.name == "-Wall"));
}

#[tokio::test]
async fn test_unusable_candidates_are_skipped() {
    let tools = tempfile::tempdir().unwrap();
    let good = fake_gcc(tools.path(), "g++-12", "12.2.0");
    let broken = write_script(tools.path(), "g++-broken", "echo 'no license' >&2; exit 2");
    let not_executable = tools.path().join("g++-plain");
    std::fs::write(&not_executable, "not a program").unwrap();

    let registry = CompilerRegistry::new(
        settings(false),
        vec![
            gcc_candidate("missing", tools.path().join("g++-missing")),
            gcc_candidate("broken", broken),
            gcc_candidate("plain", not_executable),
            gcc_candidate("gcc-12", good),
        ],
    );
    let snapshot = registry.initialize(false).await.unwrap();

    assert_eq!(snapshot.len(), 1);
    assert!(registry.find_compiler("c++", "gcc-12").is_some());
    assert!(registry.find_compiler("c++", "broken").is_none());
}

#[tokio::test]
async fn test_hanging_probe_times_out() {
    let tools = tempfile::tempdir().unwrap();
    let hanging = write_script(tools.path(), "g++-hang", "sleep 5");

    let registry = CompilerRegistry::new(
        RegistryConfig {
            probe_timeout: 0.2,
            ..Default::default()
        },
        vec![gcc_candidate("hang", hanging)],
    );

    let started = std::time::Instant::now();
    let result = registry.initialize(false).await;
    assert!(matches!(result, Err(RegistryError::EmptySnapshot)));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_empty_discovery_allowed_on_workers() {
    let registry = CompilerRegistry::new(settings(false), Vec::new());
    assert!(matches!(
        registry.initialize(false).await,
        Err(RegistryError::EmptySnapshot)
    ));

    let snapshot = registry.initialize(true).await.unwrap();
    assert!(snapshot.is_empty());
}

#[tokio::test]
async fn test_clashing_ids() {
    let tools = tempfile::tempdir().unwrap();
    let first = fake_gcc(tools.path(), "g++-12", "12.2.0");
    let second = fake_gcc(tools.path(), "g++-12-other", "12.3.0");
    let candidates = vec![
        gcc_candidate("gcc-12", first.clone()),
        gcc_candidate("gcc-12", second),
    ];

    let strict = CompilerRegistry::new(settings(true), candidates.clone());
    match strict.initialize(false).await {
        Err(RegistryError::Clash(ids)) => assert_eq!(ids, vec!["gcc-12".to_owned()]),
        other => panic!("expected clash, got {other:?}"),
    }

    let permissive = CompilerRegistry::new(settings(false), candidates);
    let snapshot = permissive.initialize(false).await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(permissive.find_compiler("c++", "gcc-12").unwrap().exe, first);
}

#[tokio::test]
async fn test_rescan_publishes_only_changes() {
    let tools = tempfile::tempdir().unwrap();
    fake_gcc(tools.path(), "g++-12", "12.2.0");
    let candidates = vec![gcc_candidate("gcc-12", tools.path().join("g++-12"))];

    let registry = CompilerRegistry::new(settings(false), candidates);
    registry.initialize(false).await.unwrap();
    let mut changes = registry.subscribe();
    changes.borrow_and_update();

    assert!(registry.rescan().await.unwrap().is_none());
    assert!(!changes.has_changed().unwrap());

    // Upgrade the toolchain in place.
    fake_gcc(tools.path(), "g++-12", "12.3.0");
    let changed = registry.rescan().await.unwrap().expect("upgrade not noticed");
    assert_eq!(changed.len(), 1);
    assert!(changes.has_changed().unwrap());
    assert_eq!(
        registry.find_compiler("c++", "gcc-12").unwrap().semver.as_deref(),
        Some("12.3.0")
    );
}

#[tokio::test]
async fn test_prediscovered_snapshot_skips_probing() {
    let tools = tempfile::tempdir().unwrap();
    let exe = fake_gcc(tools.path(), "g++-12", "12.2.0");
    let snapshot_path = tools.path().join("compilers.json");

    let registry = CompilerRegistry::new(settings(false), vec![gcc_candidate("gcc-12", exe.clone())]);
    registry.initialize(false).await.unwrap();
    registry.export_to_file(&snapshot_path).await.unwrap();

    // The toolchain disappears, but the snapshot still describes it.
    std::fs::remove_file(&exe).unwrap();

    let restored = CompilerRegistry::new(settings(false), Vec::new());
    let snapshot = restored.load_prediscovered_file(&snapshot_path).await.unwrap();
    assert_eq!(snapshot.len(), 1);
    let info = restored.find_compiler("c++", "gcc-12").unwrap();
    assert_eq!(info.semver.as_deref(), Some("12.2.0"));
    assert!(!info.possible_arguments.is_empty());
}

#[tokio::test]
async fn test_concurrent_rescans_share_one_probe_pass() {
    let tools = tempfile::tempdir().unwrap();
    let log = tools.path().join("invocations");
    let version = tools.path().join("version");
    std::fs::write(&version, "12.2.0").unwrap();
    let exe = write_script(
        tools.path(),
        "g++-slow",
        &format!(
            r#"echo "$1" >> "{log}"
sleep 0.3
case "$1" in
  --version) echo "g++ (GCC) $(cat "{version}")"; exit 0 ;;
  --help=common) echo "  -Wall                       Enable most warning messages."; exit 0 ;;
esac
exit 1"#,
            log = log.display(),
            version = version.display(),
        ),
    );
    let invocations = || std::fs::read_to_string(&log).unwrap_or_default().lines().count();

    let registry = CompilerRegistry::new(settings(false), vec![gcc_candidate("gcc-12", exe)]);
    registry.initialize(false).await.unwrap();
    let per_pass = invocations();
    assert!(per_pass > 0);

    std::fs::write(&log, "").unwrap();
    std::fs::write(&version, "12.3.0").unwrap();

    let (first, second) = tokio::join!(registry.rescan(), registry.rescan());
    let first = first.unwrap().expect("upgrade not noticed");
    let second = second.unwrap().expect("joined rescan lost the result");

    assert_eq!(invocations(), per_pass);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(
        registry.find_compiler("c++", "gcc-12").unwrap().semver.as_deref(),
        Some("12.3.0")
    );
}
