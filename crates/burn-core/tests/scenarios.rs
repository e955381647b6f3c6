//! End-to-end detect, plan and apply runs against recording services.

use std::sync::{Arc, Mutex};

use burn_core::apply::{CacheProvider, FileCache, RegistrationOp};
use burn_core::ba::{
    BaCommand, BaEvent, BaReply, BootstrapperApplication, EngineRequest, EngineResponse,
};
use burn_core::detect::{SnapshotState, SystemSnapshot};
use burn_core::engine::{EngineExit, LocalServices};
use burn_core::model::{ActionState, BundleAction, Restart};
use burn_core::plan::ExecuteAction;
use burn_core::{BundleModel, EngineContext, HResult, variables};
use burn_test_utils::bundle::payload_bytes;
use burn_test_utils::{
    MemoryCache, RecordingRegistrar, ScriptedBa, ScriptedExecutor, TestBundleBuilder,
    TestConfigBuilder, TestPackage,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

struct Harness {
    engine: EngineContext,
    ba: ScriptedBa,
    executor: Arc<ScriptedExecutor>,
    cache: Arc<MemoryCache>,
    registrar: Arc<RecordingRegistrar>,
    _dir: TempDir,
}

fn harness_with(
    bundle: TestBundleBuilder,
    executor: ScriptedExecutor,
    command: BaCommand,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = TestConfigBuilder::new(dir.path()).build();
    let executor = Arc::new(executor);
    let cache = Arc::new(MemoryCache::new(dir.path().join("cache")));
    let registrar = Arc::new(RecordingRegistrar::default());
    let services = LocalServices {
        probe: Arc::new(SystemSnapshot::new(SnapshotState::default())),
        executor: executor.clone(),
        cache: cache.clone(),
        registrar: registrar.clone(),
    };
    let engine = EngineContext::new(bundle.build(), config, command, services).unwrap();
    Harness {
        engine,
        ba: ScriptedBa::new(),
        executor,
        cache,
        registrar,
        _dir: dir,
    }
}

fn harness(bundle: TestBundleBuilder, executor: ScriptedExecutor) -> Harness {
    harness_with(bundle, executor, BaCommand::default())
}

impl Harness {
    async fn detect_and_plan(&mut self, action: BundleAction) {
        assert_eq!(self.engine.detect(&self.ba).await, HResult::S_OK);
        assert_eq!(self.engine.plan_action(&self.ba, action).await, HResult::S_OK);
    }

    /// `(package, action)` for every live package action, in execute order.
    fn planned_packages(&self) -> Vec<(String, ActionState)> {
        let plan = self.engine.plan().expect("no plan");
        plan.live_execute()
            .filter_map(|a| Some((a.package_id()?.to_string(), a.action_state()?)))
            .collect()
    }

    fn set_numeric(&self, name: &str, value: i64) {
        variables::lock(self.engine.variables())
            .unwrap()
            .set_numeric(name, value)
            .unwrap();
    }
}

fn two_msi_bundle() -> TestBundleBuilder {
    TestBundleBuilder::new("{B0B0}")
        .transaction_boundary("tx")
        .package(TestPackage::msi("A", "{AAAA}", "1.0.0").boundary("tx"))
        .package(TestPackage::msi("B", "{BBBB}", "1.0.0").boundary("tx"))
}

#[test_log::test(tokio::test)]
async fn test_single_exe_install_plans_one_install() {
    let mut h = harness(
        TestBundleBuilder::new("{B0B0}").package(TestPackage::exe("P")),
        ScriptedExecutor::new(),
    );
    h.detect_and_plan(BundleAction::Install).await;

    assert_eq!(
        h.planned_packages(),
        vec![("P".to_string(), ActionState::Install)]
    );
    let plan = h.engine.plan().unwrap();
    assert!(plan.live_execute().any(|a| matches!(
        a,
        ExecuteAction::ExePackage { package_id, action: ActionState::Install } if package_id == "P"
    )));
    assert!(!plan.live_execute().any(|a| matches!(
        a,
        ExecuteAction::ExePackage { action: ActionState::Uninstall, .. }
    )));

    assert_eq!(h.engine.apply(&h.ba).await, HResult::S_OK);
    assert_eq!(h.executor.trace(), vec!["P"]);
    assert_eq!(h.cache.cached_packages(), vec!["P"]);
    assert!(h.registrar.ops().iter().any(|op| matches!(
        op,
        RegistrationOp::RegisterBundle(reg) if reg.bundle_id == "{B0B0}"
    )));
    assert_eq!(h.ba.count("apply_complete"), 1);
}

#[test_log::test(tokio::test)]
async fn test_installed_packages_uninstall_in_reverse() {
    let mut h = harness(
        TestBundleBuilder::new("{B0B0}")
            .package(TestPackage::exe("First"))
            .package(TestPackage::exe("Second")),
        ScriptedExecutor::new(),
    );
    h.set_numeric("FirstInstalled", 1);
    h.set_numeric("SecondInstalled", 1);
    h.detect_and_plan(BundleAction::Uninstall).await;

    assert_eq!(
        h.planned_packages(),
        vec![
            ("Second".to_string(), ActionState::Uninstall),
            ("First".to_string(), ActionState::Uninstall),
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_replanning_after_detect_is_identical() {
    let mut h = harness(
        two_msi_bundle().package(TestPackage::exe("Tool").vital(false)),
        ScriptedExecutor::new(),
    );
    h.detect_and_plan(BundleAction::Install).await;
    let first = serde_json::to_value(h.engine.plan().unwrap()).unwrap();

    h.detect_and_plan(BundleAction::Install).await;
    let second = serde_json::to_value(h.engine.plan().unwrap()).unwrap();

    assert_eq!(first, second);
}

#[test_log::test(tokio::test)]
async fn test_failed_boundary_rolls_back_each_package() {
    let mut h = harness(
        two_msi_bundle(),
        ScriptedExecutor::new().always_fail("B", HResult::INSTALL_FAILURE),
    );
    h.detect_and_plan(BundleAction::Install).await;

    assert_eq!(h.engine.apply(&h.ba).await, HResult::INSTALL_FAILURE);
    let result = h.engine.last_apply().unwrap();
    assert!(result.rolled_back);
    assert_eq!(h.executor.rolled_back(), vec!["B", "A"]);
    assert!(h.executor.transaction_log().is_empty());
    assert!(h.registrar.ops().contains(&RegistrationOp::UnregisterBundle {
        bundle_id: "{B0B0}".into()
    }));
}

#[test_log::test(tokio::test)]
async fn test_failed_transaction_rolls_back_as_one() {
    let mut h = harness(
        two_msi_bundle(),
        ScriptedExecutor::new()
            .with_transactions()
            .always_fail("B", HResult::INSTALL_FAILURE),
    );
    h.detect_and_plan(BundleAction::Install).await;

    assert_eq!(h.engine.apply(&h.ba).await, HResult::INSTALL_FAILURE);
    assert_eq!(h.executor.trace(), vec!["A", "B"]);
    assert!(h.executor.rolled_back().is_empty());
    assert_eq!(h.executor.transaction_log(), vec!["begin tx", "rollback tx"]);
}

#[test_log::test(tokio::test)]
async fn test_rollback_stops_at_the_boundary() {
    let mut h = harness(
        TestBundleBuilder::new("{B0B0}")
            .boundary("rb1", true)
            .package(TestPackage::exe("Pre"))
            .package(TestPackage::exe("A").boundary("rb1"))
            .package(TestPackage::exe("B").boundary("rb1"))
            .package(TestPackage::exe("After")),
        ScriptedExecutor::new().always_fail("B", HResult::INSTALL_FAILURE),
    );
    h.detect_and_plan(BundleAction::Install).await;

    assert_eq!(h.engine.apply(&h.ba).await, HResult::INSTALL_FAILURE);
    assert_eq!(
        h.executor.trace(),
        vec!["Pre", "A", "B", "B (rollback)", "A (rollback)"]
    );
}

#[test_log::test(tokio::test)]
async fn test_committed_transaction_reports_success() {
    let mut h = harness(two_msi_bundle(), ScriptedExecutor::new().with_transactions());
    h.detect_and_plan(BundleAction::Install).await;

    assert_eq!(h.engine.apply(&h.ba).await, HResult::S_OK);
    assert_eq!(h.executor.transaction_log(), vec!["begin tx", "commit tx"]);
    assert_eq!(h.engine.last_apply().unwrap().restart, Restart::None);
}

#[test_log::test(tokio::test)]
async fn test_cancel_at_apply_begin_runs_nothing() {
    let mut h = harness(
        TestBundleBuilder::new("{B0B0}").package(TestPackage::exe("P")),
        ScriptedExecutor::new(),
    );
    h.ba = ScriptedBa::new().reply_once("apply_begin", BaReply::cancel());
    h.detect_and_plan(BundleAction::Install).await;

    assert_eq!(h.engine.apply(&h.ba).await, HResult::INSTALL_USEREXIT);
    assert!(h.executor.runs().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_layout_copies_payloads_without_executing() {
    let dir = tempfile::tempdir().unwrap();
    let layout = dir.path().join("layout");
    let mut h = harness_with(
        TestBundleBuilder::new("{B0B0}")
            .package(TestPackage::exe("P"))
            .package(TestPackage::msi("M", "{MMMM}", "1.0.0")),
        ScriptedExecutor::new(),
        BaCommand {
            arguments: vec!["-layout".into(), layout.display().to_string()],
            ..BaCommand::default()
        },
    );
    h.detect_and_plan(BundleAction::Layout).await;

    assert_eq!(h.engine.apply(&h.ba).await, HResult::S_OK);
    let laid_out = h.cache.laid_out();
    assert!(laid_out.contains(&"<bundle>".to_string()));
    assert!(laid_out.contains(&"P.bin".to_string()));
    assert!(laid_out.contains(&"M.bin".to_string()));
    assert!(h.executor.runs().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_application_is_busy_while_the_engine_works() {
    let mut h = harness(
        TestBundleBuilder::new("{B0B0}").package(TestPackage::exe("P")),
        ScriptedExecutor::new(),
    );
    let api = h.engine.api();
    let during = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&during);
    let ba = ScriptedBa::new()
        .driving(h.engine.queue(), BundleAction::Install)
        .respond_with(move |event| {
            if let BaEvent::ExecuteBegin { .. } = event {
                seen.lock().unwrap().push(api.handle(EngineRequest::SetVariableNumeric {
                    name: "Late".into(),
                    value: 1,
                }));
            }
            None
        });
    ba.on_event(BaEvent::Startup).await;

    assert_eq!(h.engine.run_loop(&ba).await, 0);
    assert_eq!(*during.lock().unwrap(), vec![Err(HResult::BUSY)]);
    for name in ["detect_complete", "plan_complete", "apply_complete"] {
        assert_eq!(ba.count(name), 1, "{name}");
    }

    let api = h.engine.api();
    assert_eq!(
        api.handle(EngineRequest::SetVariableNumeric {
            name: "Late".into(),
            value: 1,
        }),
        Ok(EngineResponse::Done)
    );
}

#[test_log::test(tokio::test)]
async fn test_hidden_values_reach_the_application_only_on_request() {
    let h = harness(
        TestBundleBuilder::new("{B0B0}").hidden_variable("Password", "s3cret"),
        ScriptedExecutor::new(),
    );
    let api = h.engine.api();
    assert_eq!(
        api.handle(EngineRequest::GetVariableString {
            name: "Password".into()
        }),
        Ok(EngineResponse::String {
            value: "s3cret".into()
        })
    );
    let masked = variables::lock(h.engine.variables())
        .unwrap()
        .format_obfuscated("key=[Password]")
        .unwrap();
    assert_eq!(masked, "key=*****");
}

#[test_log::test(tokio::test)]
async fn test_passive_run_caches_into_the_file_cache() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = TestBundleBuilder::new("{B0B0}")
        .package(TestPackage::exe("P"))
        .write_to(&dir.path().join("bundle"));
    let config = TestConfigBuilder::new(dir.path()).build();
    let model = BundleModel::load(&manifest).await.unwrap();
    let snapshot = Arc::new(SystemSnapshot::new(SnapshotState::default()));
    let executor = Arc::new(ScriptedExecutor::new());
    let cache = FileCache::new(&config.cache.root);
    let cached = cache.package_directory("P").join("P.bin");
    let services = LocalServices {
        probe: snapshot.clone(),
        executor: executor.clone(),
        cache: Arc::new(cache),
        registrar: snapshot.clone(),
    };
    let command = BaCommand {
        action: Some(BundleAction::Install),
        passive: true,
        ..BaCommand::default()
    };

    let exit = EngineContext::new(model, config, command, services)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(exit, EngineExit {
        exit_code: 0,
        restart: Restart::None,
    });
    assert_eq!(executor.trace(), vec!["P"]);
    assert_eq!(std::fs::read(cached).unwrap(), payload_bytes("P"));
    assert!(
        snapshot
            .state()
            .bundles
            .iter()
            .any(|b| b.bundle_id == "{B0B0}")
    );
}

#[test_log::test(tokio::test)]
async fn test_passive_run_reports_the_failure_code() {
    let dir = tempfile::tempdir().unwrap();
    let config = TestConfigBuilder::new(dir.path()).build();
    let snapshot = Arc::new(SystemSnapshot::new(SnapshotState::default()));
    let services = LocalServices {
        probe: snapshot.clone(),
        executor: Arc::new(ScriptedExecutor::new().always_fail("P", HResult::INSTALL_FAILURE)),
        cache: Arc::new(MemoryCache::default()),
        registrar: snapshot.clone(),
    };
    let command = BaCommand {
        action: Some(BundleAction::Install),
        passive: true,
        ..BaCommand::default()
    };
    let model = TestBundleBuilder::new("{B0B0}")
        .package(TestPackage::exe("P"))
        .build();

    let exit = EngineContext::new(model, config, command, services)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(exit.exit_code, 1603);
    assert!(snapshot.state().bundles.is_empty());
}
