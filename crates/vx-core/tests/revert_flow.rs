#![cfg(unix)]

mod common;

use std::collections::BTreeMap;

use common::test_env;
use vx_core::api::{
    create_snapshot, install_with_driver, list_snapshots, revert_with_driver, CommandStatus,
    InstallOptions, RevertOptions,
};
use vx_domain::package_map;

fn active_version(env: &common::TestEnv, name: &str) -> Option<String> {
    let map = package_map(&env.settings.install_root).unwrap();
    map.iter()
        .find(|(n, _)| n.as_str() == name)
        .map(|(_, v)| v.to_string())
}

#[test]
fn revert_fixes_an_external_downgrade() {
    let env = test_env();
    install_with_driver(
        &env.ctx,
        &env.driver,
        &["z==0.8.0".to_string()],
        &InstallOptions::default(),
    );
    let snapshot_outcome = create_snapshot(&env.ctx);
    assert_eq!(snapshot_outcome.status, CommandStatus::Ok);
    let snapshot_id = snapshot_outcome.details["id"].as_str().unwrap().to_string();

    // An external tool downgrades z behind the engine's back.
    let current = package_map(&env.settings.install_root).unwrap();
    env.driver
        .stage(
            &[vx_domain::PackageSpec::parse("z==0.7.0").unwrap()],
            &env.settings.install_root,
            &current,
            "external",
        )
        .unwrap();
    assert_eq!(active_version(&env, "z").as_deref(), Some("0.7.0"));

    // Plan first: exactly one corrective action.
    let plan_outcome = revert_with_driver(
        &env.ctx,
        &env.driver,
        Some(&snapshot_id),
        &RevertOptions {
            plan_only: true,
            ..RevertOptions::default()
        },
    );
    assert_eq!(plan_outcome.status, CommandStatus::Ok);
    let plan: Vec<String> = plan_outcome.details["plan"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(plan, vec!["fix z 0.7.0 -> 0.8.0".to_string()]);

    // Execute: z returns to 0.8.0, and no bubble appears for 0.7.0.
    let outcome = revert_with_driver(
        &env.ctx,
        &env.driver,
        Some(&snapshot_id),
        &RevertOptions::default(),
    );
    assert_eq!(outcome.status, CommandStatus::Ok, "{outcome:?}");
    assert_eq!(active_version(&env, "z").as_deref(), Some("0.8.0"));
    assert!(!env.settings.bubble_root.join("z-0.7.0").exists());
}

#[test]
fn revert_to_current_state_is_a_noop() {
    let env = test_env();
    install_with_driver(
        &env.ctx,
        &env.driver,
        &["z==0.8.0".to_string()],
        &InstallOptions::default(),
    );
    let snapshot_outcome = create_snapshot(&env.ctx);
    let snapshot_id = snapshot_outcome.details["id"].as_str().unwrap().to_string();

    let outcome = revert_with_driver(
        &env.ctx,
        &env.driver,
        Some(&snapshot_id),
        &RevertOptions::default(),
    );
    assert_eq!(outcome.status, CommandStatus::Ok);
    assert!(outcome.message.contains("already matches"));
}

#[test]
fn snapshot_mutate_revert_snapshot_round_trips_the_package_map() {
    let env = test_env();
    install_with_driver(
        &env.ctx,
        &env.driver,
        &["a==1.0.0".to_string()],
        &InstallOptions::default(),
    );
    let first = create_snapshot(&env.ctx);
    let first_id = first.details["id"].as_str().unwrap().to_string();

    install_with_driver(
        &env.ctx,
        &env.driver,
        &["b==2.0.0".to_string()],
        &InstallOptions::default(),
    );
    revert_with_driver(
        &env.ctx,
        &env.driver,
        Some(&first_id),
        &RevertOptions::default(),
    );

    let map: BTreeMap<String, String> = package_map(&env.settings.install_root)
        .unwrap()
        .into_iter()
        .map(|(name, version)| (name.as_str().to_string(), version.to_string()))
        .collect();
    let store = env.ctx.snapshot_store();
    let target = store.load(&first_id).unwrap().unwrap();
    assert_eq!(map, target.packages);

    let ids = list_snapshots(&env.ctx);
    assert_eq!(ids.status, CommandStatus::Ok);
}
