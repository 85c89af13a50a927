#![cfg(unix)]

mod common;

use common::{build_log, test_env};
use vx_core::api::{
    install_with_driver, kb_keys, BubbleBuilder, BubbleRecord, CancelToken, InstallOptions,
};
use vx_domain::PackageSpec;

/// Two simultaneous requests for the same bubble: exactly one build runs,
/// both callers end up with the same committed record.
#[test]
fn concurrent_builds_for_one_bubble_coalesce() {
    let env = test_env();
    // The active version is newer, so w==3.2.1 is bubble material.
    install_with_driver(
        &env.ctx,
        &env.driver,
        &["w==4.0.0".to_string()],
        &InstallOptions::default(),
    );
    let stage_runs_before = build_log(&env).len();

    let spec = PackageSpec::parse("w==3.2.1").unwrap();
    let records: Vec<BubbleRecord> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let spec = spec.clone();
                let ctx = &env.ctx;
                let driver = &env.driver;
                let settings = &env.settings;
                scope.spawn(move || {
                    let builder = BubbleBuilder {
                        settings,
                        kb: ctx.kb(),
                        driver,
                        interpreter_exe: &ctx.interpreter().executable_path,
                    };
                    builder
                        .ensure_bubble(&spec, &CancelToken::new())
                        .map(|outcome| outcome.record().clone())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect()
    });

    assert_eq!(records.len(), 2);
    assert_eq!(records[0], records[1], "both callers see the same bubble");

    // Exactly one staging run happened for the bubble.
    let stage_runs = build_log(&env).len() - stage_runs_before;
    assert_eq!(stage_runs, 1, "expected a single coalesced build");

    // And the KB shows a single committed record with the claim cleared.
    let record: Option<BubbleRecord> = env
        .ctx
        .kb()
        .get_json(&kb_keys::bubble("w", "3.2.1"))
        .unwrap();
    assert!(record.is_some());
    assert!(env
        .ctx
        .kb()
        .get(&kb_keys::bubble_build("w", "3.2.1"))
        .unwrap()
        .is_none());
}

/// Parallel installs of independent packages never clobber each other's
/// KB entries.
#[test]
fn concurrent_builds_for_independent_packages_both_commit() {
    let env = test_env();
    install_with_driver(
        &env.ctx,
        &env.driver,
        &["left==2.0.0".to_string(), "right==2.0.0".to_string()],
        &InstallOptions::default(),
    );

    std::thread::scope(|scope| {
        for name in ["left", "right"] {
            let ctx = &env.ctx;
            let driver = &env.driver;
            let settings = &env.settings;
            scope.spawn(move || {
                let builder = BubbleBuilder {
                    settings,
                    kb: ctx.kb(),
                    driver,
                    interpreter_exe: &ctx.interpreter().executable_path,
                };
                let spec = PackageSpec::parse(&format!("{name}==1.0.0")).unwrap();
                builder.ensure_bubble(&spec, &CancelToken::new()).unwrap();
            });
        }
    });

    for name in ["left", "right"] {
        let record: Option<BubbleRecord> = env
            .ctx
            .kb()
            .get_json(&kb_keys::bubble(name, "1.0.0"))
            .unwrap();
        assert!(record.is_some(), "missing bubble record for {name}");
        let versions: Vec<String> = env
            .ctx
            .kb()
            .get_json(&kb_keys::pkg_versions(name))
            .unwrap()
            .unwrap();
        assert!(versions.contains(&"1.0.0".to_string()));
        assert!(versions.contains(&"2.0.0".to_string()));
    }
}
