//! Staged runs over built-in tasks against a real project tree.

use std::path::Path;
use std::sync::Arc;

use kiln_bundle::{BundleDescriptor, PipelineRegistry};
use kiln_tasks::builtin::{BundlesTask, CleanTask, CopyRule, CopyTask, MkdirTask};
use kiln_tasks::{action_fn, Stage, StageExecutor, TaskRegistry, TaskStatus};
use kiln_types::{EventEmitter, KilnError};

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

#[tokio::test]
async fn output_root_exists_before_second_stage_writes() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let build = root.join("build");
    write(&root, "build/stale.txt", "old");

    let mut tasks = TaskRegistry::new();
    tasks.register("clean", CleanTask::new(&build)).unwrap();
    tasks
        .register("mkdir", MkdirTask::new(vec![build.join("public")]))
        .unwrap();
    let build_dir = build.clone();
    tasks
        .register(
            "write",
            action_fn(move || {
                let build_dir = build_dir.clone();
                async move {
                    if !build_dir.join("public").is_dir() {
                        return Err(KilnError::TaskFailed {
                            task: "write".into(),
                            message: "output root missing".into(),
                        });
                    }
                    tokio::fs::write(build_dir.join("public/index.html"), "<html>").await?;
                    Ok(())
                }
            }),
        )
        .unwrap();

    let executor = StageExecutor::new(Arc::new(tasks), EventEmitter::default());
    let report = executor
        .run(&[
            Stage::new(["clean"]),
            Stage::new(["mkdir"]),
            Stage::new(["write"]),
        ])
        .await
        .unwrap();

    assert!(report.is_success(), "{:?}", report.failed_tasks());
    assert!(!build.join("stale.txt").exists());
    assert!(build.join("public/index.html").exists());
}

#[tokio::test]
async fn serve_recipe_skips_gated_stage_when_a_bundle_fails() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let build = root.join("build");
    write(&root, "src/main/index.js", "require('./missing');\n");
    write(&root, "server/robots.txt", "User-agent: *\n");

    let mut registry = PipelineRegistry::new(&root, &build, EventEmitter::default());
    registry
        .register(BundleDescriptor::new(
            "js/main.js",
            vec!["src/main/index.js".into()],
        ))
        .unwrap();

    let mut tasks = TaskRegistry::new();
    tasks.register("clean", CleanTask::new(&build)).unwrap();
    tasks
        .register("js:browser", BundlesTask::new("js:browser", Arc::new(registry)))
        .unwrap();
    tasks
        .register(
            "copy",
            CopyTask::new(
                &root,
                vec![CopyRule::new("server/*.txt", build.join("server")).unwrap()],
            ),
        )
        .unwrap();
    tasks.register("server", action_fn(|| async { Ok(()) })).unwrap();

    let executor = StageExecutor::new(Arc::new(tasks), EventEmitter::default());
    let report = executor
        .run(&[
            Stage::new(["clean"]),
            Stage::new(["js:browser", "copy"]),
            Stage::new(["server"]).gated(),
        ])
        .await
        .unwrap();

    match report.status_of("js:browser") {
        Some(TaskStatus::Failed(reason)) => assert!(reason.contains("js/main.js"), "{reason}"),
        other => panic!("unexpected status: {other:?}"),
    }
    assert_eq!(report.status_of("copy"), Some(&TaskStatus::Succeeded));
    assert_eq!(report.status_of("server"), Some(&TaskStatus::Skipped));
    assert!(build.join("server/robots.txt").exists());
}
