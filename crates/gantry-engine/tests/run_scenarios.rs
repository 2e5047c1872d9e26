//! End-to-end run scenarios against a real workspace on disk
#![cfg(unix)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::watch;

use gantry_core::config::{
    CacheOpts, PackageManager, RunCacheOpts, RunOpts, RunSpec, RunSpecOpts,
};
use gantry_core::package::PackageInfo;
use gantry_core::pipeline::{Pipeline, TaskDefinition};
use gantry_engine::reporter::CacheStatusLine;
use gantry_engine::{
    CollectingReporter, ProcessManager, Run, RunEvent, RunOutcome, TaskOutcome,
};

/// Stand-in for `npm`: `fake-pm run <task>` writes an output file and a log
/// line; packages named `bad` fail with exit code 7.
const FAKE_PM: &str = r#"#!/bin/sh
case "$(basename "$PWD")" in
  bad)
    echo "boom" >&2
    exit 7
    ;;
esac
mkdir -p dist
echo "output of $2" > dist/out.txt
echo "ran $2"
"#;

struct Fixture {
    temp: TempDir,
    package_manager: PackageManager,
    packages: Vec<PackageInfo>,
    pipeline: Pipeline,
}

fn write_executable(path: &Path, contents: &str) {
    fs::write(path, contents).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

fn make_package(root: &Path, name: &str, deps: &[&str]) -> PackageInfo {
    let dir = PathBuf::from("packages").join(name);
    fs::create_dir_all(root.join(&dir).join("src")).unwrap();
    fs::write(
        root.join(&dir).join("src/index.ts"),
        format!("export const name = \"{}\"", name),
    )
    .unwrap();

    PackageInfo {
        name: name.to_string(),
        dir,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        scripts: HashMap::from([("build".to_string(), "compile".to_string())]),
        external_deps_hash: "deadbeefdeadbeef".to_string(),
        framework: String::new(),
    }
}

fn fixture(package_names: &[(&str, &[&str])]) -> Fixture {
    let temp = TempDir::new().unwrap();

    let pm_path = temp.path().join("fake-pm");
    write_executable(&pm_path, FAKE_PM);
    let package_manager = PackageManager {
        command: pm_path.to_string_lossy().into_owned(),
        arg_separator: vec!["--".to_string()],
        specfile: "package.json".to_string(),
        lockfile: "package-lock.json".to_string(),
    };

    let packages: Vec<PackageInfo> = package_names
        .iter()
        .map(|(name, deps)| make_package(temp.path(), name, deps))
        .collect();

    // Inputs are declared so task outputs never feed the next hash
    let pipeline: Pipeline = [(
        "build".to_string(),
        TaskDefinition::new()
            .with_inputs(vec!["src/**".to_string()])
            .with_outputs(vec!["dist/**".to_string()]),
    )]
    .into_iter()
    .collect();

    Fixture {
        temp,
        package_manager,
        packages,
        pipeline,
    }
}

impl Fixture {
    fn run(&self, filter: &[&str], env: &[(&str, &str)], run_opts: RunOpts) -> Run {
        let filtered_pkgs: HashSet<String> = filter.iter().map(|f| f.to_string()).collect();
        Run {
            repo_root: self.temp.path().to_path_buf(),
            spec: RunSpec {
                targets: vec!["build".to_string()],
                filtered_pkgs,
                pass_through_args: vec![],
                opts: RunSpecOpts {
                    run_opts,
                    cache_opts: CacheOpts::default(),
                    runcache_opts: RunCacheOpts::default(),
                },
            },
            packages: self.packages.clone(),
            pipeline: self.pipeline.clone(),
            package_manager: self.package_manager.clone(),
            global_file_dependencies: vec![],
            global_env_dependencies: vec![],
            workspace_ignores: vec![],
            root_external_deps_hash: "deadbeefdeadbeef".to_string(),
            lockfile_digest: Some("lockdigest".to_string()),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            remote_cache: None,
        }
    }
}

async fn execute(run: Run) -> (RunOutcome, Vec<RunEvent>) {
    let reporter = Arc::new(CollectingReporter::default());
    let processes = Arc::new(ProcessManager::new());
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let outcome = run
        .execute(processes, reporter.clone(), cancel_rx)
        .await
        .unwrap();
    let events = reporter.events();
    (outcome, events)
}

fn task_status(events: &[RunEvent]) -> Vec<(String, CacheStatusLine, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TaskStatus {
                prefix,
                status,
                hash,
                ..
            } => Some((prefix.clone(), *status, hash.clone())),
            _ => None,
        })
        .collect()
}

fn finished(events: &[RunEvent]) -> (usize, usize, usize, bool) {
    events
        .iter()
        .find_map(|e| match e {
            RunEvent::RunFinished {
                successful,
                cached,
                attempted,
                full_turbo,
                ..
            } => Some((*successful, *cached, *attempted, *full_turbo)),
            _ => None,
        })
        .expect("run finished event")
}

#[tokio::test]
async fn test_cold_miss_then_warm_hit() {
    let fx = fixture(&[("util", &[])]);

    // Cold: empty cache, the task executes
    let (outcome, events) = execute(fx.run(&["util"], &[], RunOpts::default())).await;
    assert_eq!(outcome.exit_code, 0);

    let statuses = task_status(&events);
    assert_eq!(statuses.len(), 1);
    let (prefix, status, h1) = &statuses[0];
    assert_eq!(prefix, "util:build");
    assert_eq!(*status, CacheStatusLine::Miss);
    assert_eq!(h1.len(), 16);

    let (successful, cached, attempted, full_turbo) = finished(&events);
    assert_eq!((successful, cached, attempted, full_turbo), (1, 0, 1, false));

    assert_eq!(outcome.summary.tasks.len(), 1);
    let task = &outcome.summary.tasks[0];
    assert_eq!(task.task_id, "util#build");
    assert_eq!(&task.hash, h1);
    assert_eq!(
        task.execution.as_ref().unwrap().outcome,
        TaskOutcome::Built
    );
    assert_eq!(
        task.expanded_outputs,
        vec!["packages/util/dist/out.txt".to_string()]
    );

    // Warm: same inputs, same hash, restored from cache
    fs::remove_dir_all(fx.temp.path().join("packages/util/dist")).unwrap();
    let (outcome, events) = execute(fx.run(&["util"], &[], RunOpts::default())).await;
    assert_eq!(outcome.exit_code, 0);

    let statuses = task_status(&events);
    let (_, status, h_warm) = &statuses[0];
    assert_eq!(*status, CacheStatusLine::HitSuppressed);
    assert_eq!(h_warm, h1);

    let (_, cached, attempted, full_turbo) = finished(&events);
    assert_eq!((cached, attempted, full_turbo), (1, 1, true));

    // Outputs were restored into the workspace
    let restored =
        fs::read_to_string(fx.temp.path().join("packages/util/dist/out.txt")).unwrap();
    assert_eq!(restored, "output of build\n");
}

#[tokio::test]
async fn test_undeclared_env_var_still_hits() {
    let fx = fixture(&[("util", &[])]);

    let (_, events) = execute(fx.run(&["util"], &[], RunOpts::default())).await;
    let h1 = task_status(&events)[0].2.clone();

    let (_, events) = execute(
        fx.run(&["util"], &[("SOME_ENV_VAR", "hi")], RunOpts::default()),
    )
    .await;
    let (_, status, hash) = &task_status(&events)[0];

    assert_eq!(*status, CacheStatusLine::HitSuppressed);
    assert_eq!(hash, &h1);
}

#[tokio::test]
async fn test_thash_wildcard_invalidates() {
    let fx = fixture(&[("util", &[])]);

    let (_, events) = execute(fx.run(&["util"], &[], RunOpts::default())).await;
    let h1 = task_status(&events)[0].2.clone();

    let (_, events) = execute(
        fx.run(
            &["util"],
            &[("SOMETHING_THASH_YES", "hi")],
            RunOpts::default(),
        ),
    )
    .await;
    let (_, status, h2) = &task_status(&events)[0];

    assert_eq!(*status, CacheStatusLine::Miss);
    assert_ne!(h2, &h1);
}

#[tokio::test]
async fn test_default_allowlist_env_invalidates() {
    let fx = fixture(&[("util", &[])]);

    let (_, events) = execute(fx.run(&["util"], &[], RunOpts::default())).await;
    let h1 = task_status(&events)[0].2.clone();

    let (_, events) = execute(
        fx.run(
            &["util"],
            &[("SOMETHING_THASH_YES", "hi")],
            RunOpts::default(),
        ),
    )
    .await;
    let h2 = task_status(&events)[0].2.clone();

    let (_, events) = execute(
        fx.run(
            &["util"],
            &[("VERCEL_ANALYTICS_ID", "hi")],
            RunOpts::default(),
        ),
    )
    .await;
    let (_, status, h3) = &task_status(&events)[0];

    assert_eq!(*status, CacheStatusLine::Miss);
    assert_ne!(h3, &h1);
    assert_ne!(h3, &h2);
}

#[tokio::test]
async fn test_failure_with_continue_on_error() {
    // `bad` fails; `dep` depends on it; `good` is an unrelated sibling
    let mut fx = fixture(&[("bad", &[]), ("dep", &["bad"]), ("good", &[])]);
    fx.pipeline
        .0
        .get_mut("build")
        .unwrap()
        .depends_on
        .push("^build".to_string());

    let (outcome, events) = execute(fx.run(
        &["bad", "dep", "good"],
        &[],
        RunOpts {
            continue_on_error: true,
            ..RunOpts::default()
        },
    ))
    .await;

    // The child's exit code wins
    assert_eq!(outcome.exit_code, 7);

    let by_id: HashMap<String, &gantry_engine::TaskSummary> = outcome
        .summary
        .tasks
        .iter()
        .map(|t| (t.task_id.clone(), t))
        .collect();

    // The sibling subtree completed
    assert_eq!(
        by_id["good#build"].execution.as_ref().unwrap().outcome,
        TaskOutcome::Built
    );
    assert_eq!(
        by_id["bad#build"].execution.as_ref().unwrap().outcome,
        TaskOutcome::BuildFailed
    );
    // The descendant of the failure never executed
    assert!(!by_id.contains_key("dep#build"));

    // The failure was surfaced as a warning, not a halt
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::Warning { message } if message.contains("continuing")
    )));
}

#[tokio::test]
async fn test_failure_halts_without_continue_on_error() {
    let mut fx = fixture(&[("bad", &[]), ("dep", &["bad"])]);
    fx.pipeline
        .0
        .get_mut("build")
        .unwrap()
        .depends_on
        .push("^build".to_string());

    let (outcome, _) = execute(fx.run(&["bad", "dep"], &[], RunOpts::default())).await;

    assert_eq!(outcome.exit_code, 7);
    assert_eq!(outcome.summary.tasks.len(), 1);
    assert_eq!(outcome.summary.tasks[0].task_id, "bad#build");
}

#[tokio::test]
async fn test_missing_script_is_skipped() {
    let mut fx = fixture(&[("util", &[])]);
    fx.packages[0].scripts.clear();

    let (outcome, events) = execute(fx.run(&["util"], &[], RunOpts::default())).await;

    assert_eq!(outcome.exit_code, 0);
    let task = &outcome.summary.tasks[0];
    assert_eq!(
        task.execution.as_ref().unwrap().outcome,
        TaskOutcome::Skipped
    );
    assert_eq!(task.command, "<NONEXISTENT>");

    // Skipped tasks never probe restore, so no status line was printed
    assert!(task_status(&events).is_empty());
}

#[tokio::test]
async fn test_dependency_order_and_upstream_hash_flow() {
    let fx = fixture(&[("core", &[]), ("app", &["core"])]);
    let mut pipeline_with_topo = fx.pipeline.clone();
    pipeline_with_topo
        .0
        .get_mut("build")
        .unwrap()
        .depends_on
        .push("^build".to_string());

    let mut run = fx.run(&["app", "core"], &[], RunOpts::default());
    run.pipeline = pipeline_with_topo;
    let (outcome, _) = execute(run).await;

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.summary.tasks.len(), 2);

    let app = outcome
        .summary
        .tasks
        .iter()
        .find(|t| t.task_id == "app#build")
        .unwrap();
    assert_eq!(app.dependencies, vec!["core#build".to_string()]);

    let core = outcome
        .summary
        .tasks
        .iter()
        .find(|t| t.task_id == "core#build")
        .unwrap();
    assert_eq!(core.dependents, vec!["app#build".to_string()]);
}

#[tokio::test]
async fn test_run_summary_json_contract() {
    let fx = fixture(&[("util", &[])]);
    let (outcome, _) = execute(fx.run(&["util"], &[], RunOpts::default())).await;

    let json = serde_json::to_value(&outcome.summary).unwrap();
    assert_eq!(json["exitCode"], 0);
    let task = &json["tasks"][0];
    assert_eq!(task["taskId"], "util#build");
    assert_eq!(task["package"], "util");
    assert_eq!(task["hash"].as_str().unwrap().len(), 16);
    assert_eq!(task["cacheState"]["local"], false);
    assert_eq!(task["execution"]["outcome"], "built");
}
