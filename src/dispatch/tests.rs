//! Dispatch tests.

use std::{
    fs,
    sync::{mpsc, Arc, Mutex},
    thread,
    time::Duration,
};

use chrono::Duration as Days;
use tempfile::TempDir;

use super::{
    executor::{Executor, Work, WorkerPool},
    ScanRequest, Scheduler,
};
use crate::{
    config::Config,
    error::{kind_of, Kind},
    observer::{Observer, StatusBoard},
    plugin::{Plugin, ScannerTask, TaskContext},
    registry::PluginRegistry,
    severity::Severity,
    store::{today, Finding, FindingTemplate, Scan, ScanStatus, Store, TaskState, UploadedFile},
    tools::{tests::FakeTools, ToolOutput, ToolRunner},
    upload::store_upload,
    Result,
};

/// Executor holding every unit until released.
#[derive(Default)]
struct GatedExecutor {
    queued: Mutex<Vec<Work>>,
}

impl GatedExecutor {
    fn len(&self) -> usize {
        self.queued.lock().unwrap().len()
    }

    fn release(&self) {
        let queued: Vec<Work> = self.queued.lock().unwrap().drain(..).collect();
        for work in queued {
            work.run();
        }
    }
}

impl Executor for GatedExecutor {
    fn execute(&self, work: Work) {
        self.queued.lock().unwrap().push(work);
    }
}

/// Scanner waiting for a signal before finishing.
struct Blocking {
    release: Mutex<mpsc::Receiver<()>>,
}

impl ScannerTask for Blocking {
    fn run(&self, _: &TaskContext<'_>, _: &Observer) -> Result<()> {
        let _ = self
            .release
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(10));
        Ok(())
    }
}

fn noop(_: &TaskContext<'_>, observer: &Observer) -> Result<()> {
    let _ = observer.update("scanning");
    Ok(())
}

fn broken(_: &TaskContext<'_>, _: &Observer) -> Result<()> {
    Err(failure::err_msg("could not parse the manifest"))
}

fn panicking(_: &TaskContext<'_>, _: &Observer) -> Result<()> {
    panic!("index out of bounds")
}

fn hardcoded_secret(ctx: &TaskContext<'_>, _: &Observer) -> Result<()> {
    let template = ctx
        .store
        .get_or_create_template(FindingTemplate::new("Hardcoded secret", Severity::High))?;
    let _ = ctx.store.add_finding(Finding::new(
        ctx.scan.id,
        ctx.scanner.id,
        Some(template.id),
        Severity::High,
    ))?;
    Ok(())
}

fn registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    for plugin in vec![
        Plugin::builder("Android Manifest", noop).build(),
        Plugin::builder("YARA", noop).build(),
        Plugin::builder("Broken", broken).build(),
        Plugin::builder("Panicking", panicking).build(),
        Plugin::builder("Secrets", hardcoded_secret).build(),
    ] {
        registry.register(plugin).unwrap();
    }
    registry
}

fn passing_tools() -> Arc<dyn ToolRunner> {
    Arc::new(FakeTools::new(|_| Ok(ToolOutput::default())))
}

struct Harness {
    dir: TempDir,
    store: Arc<Store>,
    scheduler: Scheduler,
}

impl Harness {
    fn new<C>(
        registry: PluginRegistry,
        executor: Arc<dyn Executor>,
        tools: Arc<dyn ToolRunner>,
        configure: C,
    ) -> Self
    where
        C: FnOnce(&mut Config),
    {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.set_projects_folder(dir.path().join("projects"));
        configure(&mut config);

        let store = Arc::new(Store::new());
        let scheduler = Scheduler::new(
            Arc::new(registry),
            Arc::clone(&store),
            Arc::new(StatusBoard::new()),
            executor,
            Arc::new(config),
            tools,
        );
        Self {
            dir,
            store,
            scheduler,
        }
    }

    fn upload(&self, name: &str) -> (Scan, UploadedFile) {
        let project = self.store.create_project("demo");
        let source = self.dir.path().join(name);
        fs::write(&source, b"PK fake package").unwrap();
        let mut config = Config::default();
        config.set_projects_folder(self.dir.path().join("projects"));
        let file = store_upload(&config, &self.store, project.id, &source, name).unwrap();
        let scan = self
            .store
            .create_scan(Scan::new(project.id, file.id, "android"))
            .unwrap();
        (scan, file)
    }
}

#[test]
fn it_creates_every_task_before_running_units() {
    let executor = Arc::new(GatedExecutor::default());
    let harness = Harness::new(registry(), executor.clone(), passing_tools(), |_| {});
    let (scan, file) = harness.upload("app.apk");

    let dispatch = harness
        .scheduler
        .schedule(&scan, &file, &["android-manifest", "yara"])
        .unwrap();

    let tasks = harness.store.tasks_for_scan(scan.id);
    assert_eq!(tasks.len(), 3);
    let coordination = harness.store.coordination_task(scan.id).unwrap();
    assert!(coordination.active);
    assert_eq!(
        coordination.execution_id.as_ref().map(String::as_str),
        dispatch.execution_id()
    );
    for task in tasks.iter().filter(|t| t.scanner.is_some()) {
        assert!(task.active);
        assert!(task.execution_id.is_none());
        assert_eq!(task.state, TaskState::Pending);
    }
    assert_eq!(executor.len(), 2);
    let running = harness.store.scan(scan.id).unwrap();
    assert_eq!(running.status, ScanStatus::Active);
    assert_eq!(running.start_date, Some(today()));

    executor.release();
    let report = dispatch.wait().unwrap();
    assert_eq!(report.succeeded.len(), 2);
    assert!(report.is_success());

    for task in harness.store.tasks_for_scan(scan.id) {
        assert!(!task.active);
        assert!(task.execution_id.is_none());
        assert_eq!(task.state, TaskState::Success);
    }
    let finished = harness.store.scan(scan.id).unwrap();
    assert_eq!(finished.status, ScanStatus::Finished);
    assert!(finished.finished);
    assert!(!finished.is_active);
    assert_eq!(finished.end_date, Some(today()));
}

#[test]
fn it_schedules_a_scan_once() {
    let executor = Arc::new(GatedExecutor::default());
    let harness = Harness::new(registry(), executor.clone(), passing_tools(), |_| {});
    let (scan, file) = harness.upload("app.apk");

    let dispatch = harness.scheduler.schedule(&scan, &file, &["yara"]).unwrap();
    let shown = format!("{:?}", dispatch);
    assert!(shown.starts_with("Dispatch {"));
    assert!(shown.contains(&format!("scan: {}", scan.id)));
    assert!(shown.contains("deferred: false"));
    let error = harness
        .scheduler
        .schedule(&scan, &file, &["yara"])
        .unwrap_err();
    match kind_of(&error) {
        Some(Kind::Constraint { .. }) => {}
        k => panic!("unexpected kind: {:?}", k),
    }
    assert_eq!(harness.store.tasks_for_scan(scan.id).len(), 2);
    assert_eq!(executor.len(), 1);

    executor.release();
    assert!(dispatch.wait().unwrap().is_success());
    assert!(harness
        .scheduler
        .schedule(&scan, &file, &["android-manifest"])
        .is_err());
    assert_eq!(harness.store.tasks_for_scan(scan.id).len(), 2);
}

#[test]
fn it_records_selections_in_order() {
    let executor = Arc::new(GatedExecutor::default());
    let harness = Harness::new(registry(), executor.clone(), passing_tools(), |_| {});
    let (scan, file) = harness.upload("app.apk");

    let dispatch = harness
        .scheduler
        .schedule(&scan, &file, &["YARA", "Android Manifest", "yara"])
        .unwrap();
    executor.release();
    let _ = dispatch.wait().unwrap();

    let names: Vec<_> = harness
        .store
        .selections_for(scan.project)
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["yara", "android-manifest"]);
    assert_eq!(harness.store.tasks_for_scan(scan.id).len(), 3);
}

#[test]
fn it_rejects_empty_selection() {
    let harness = Harness::new(
        registry(),
        Arc::new(GatedExecutor::default()),
        passing_tools(),
        |_| {},
    );
    let (scan, file) = harness.upload("app.apk");
    let none: &[&str] = &[];

    let error = harness.scheduler.schedule(&scan, &file, none).unwrap_err();
    match kind_of(&error) {
        Some(Kind::EmptySelection) => {}
        k => panic!("unexpected kind: {:?}", k),
    }
    assert!(harness.store.tasks_for_scan(scan.id).is_empty());
    assert!(harness.store.selections_for(scan.project).is_empty());
    assert_eq!(
        harness.store.scan(scan.id).unwrap().status,
        ScanStatus::Pending
    );
}

#[test]
fn it_rejects_unknown_scanners() {
    let harness = Harness::new(
        registry(),
        Arc::new(GatedExecutor::default()),
        passing_tools(),
        |_| {},
    );
    let (scan, file) = harness.upload("app.apk");

    let error = harness
        .scheduler
        .schedule(&scan, &file, &["yara", "semgrep"])
        .unwrap_err();
    match kind_of(&error) {
        Some(Kind::UnknownScanner { name }) => assert_eq!(name, "semgrep"),
        k => panic!("unexpected kind: {:?}", k),
    }
    assert!(harness.store.tasks_for_scan(scan.id).is_empty());
    assert!(harness.store.selections_for(scan.project).is_empty());
}

#[test]
fn it_isolates_failing_scanners() {
    let harness = Harness::new(
        registry(),
        Arc::new(WorkerPool::new(2)),
        passing_tools(),
        |_| {},
    );
    let (scan, file) = harness.upload("app.apk");

    let dispatch = harness
        .scheduler
        .schedule(&scan, &file, &["broken", "yara", "panicking"])
        .unwrap();
    let report = dispatch.wait().unwrap();

    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].scanner, "yara");
    let mut failed: Vec<_> = report.failed.iter().map(|f| f.scanner.as_str()).collect();
    failed.sort();
    assert_eq!(failed, vec!["broken", "panicking"]);

    for name in &["broken", "panicking", "yara"] {
        let selection = harness.store.find_selection(scan.project, name).unwrap();
        let task = harness.store.task_for_scanner(scan.id, selection.id).unwrap();
        assert!(!task.active);
        assert!(task.execution_id.is_none());
        let expected = if *name == "yara" {
            TaskState::Success
        } else {
            TaskState::Failure
        };
        assert_eq!(task.state, expected);

        let status = harness.scheduler.status(task.id).unwrap();
        assert_eq!(status["status"]["complete"], true);
    }
    assert_eq!(
        harness.store.scan(scan.id).unwrap().status,
        ScanStatus::Finished
    );
}

#[test]
fn it_fails_scan_when_preparation_fails() {
    let tools: Arc<dyn ToolRunner> = Arc::new(FakeTools::new(|invocation| {
        Err(Kind::ExternalTool {
            tool: invocation.program().to_owned(),
            stderr: String::from("not a valid zip file"),
        }
        .into())
    }));
    let executor = Arc::new(GatedExecutor::default());
    let harness = Harness::new(registry(), executor.clone(), tools, |_| {});
    let (scan, file) = harness.upload("app.apk");

    let error = harness
        .scheduler
        .schedule(&scan, &file, &["android-manifest", "yara"])
        .unwrap_err();
    match kind_of(&error) {
        Some(Kind::ExternalTool { tool, .. }) => assert_eq!(tool, "apktool"),
        k => panic!("unexpected kind: {:?}", k),
    }

    let tasks = harness.store.tasks_for_scan(scan.id);
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].scanner.is_none());
    assert!(!tasks[0].active);
    assert!(tasks[0].execution_id.is_none());
    assert_eq!(tasks[0].state, TaskState::Failure);
    assert_eq!(executor.len(), 0);

    let failed = harness.store.scan(scan.id).unwrap();
    assert_eq!(failed.status, ScanStatus::Failed);
    assert!(!failed.is_active);
}

#[test]
fn it_defers_future_scans() {
    let executor = Arc::new(GatedExecutor::default());
    let harness = Harness::new(registry(), executor.clone(), passing_tools(), |_| {});
    let (scan, file) = harness.upload("app.apk");
    let start = today() + Days::days(3);
    let scan = harness
        .store
        .update_scan(scan.id, |s| s.start_date = Some(start))
        .unwrap();

    let dispatch = harness.scheduler.schedule(&scan, &file, &["yara"]).unwrap();

    assert!(dispatch.is_deferred());
    assert!(dispatch.execution_id().is_none());
    assert!(harness.store.tasks_for_scan(scan.id).is_empty());
    assert_eq!(harness.store.selections_for(scan.project).len(), 1);
    let deferred = harness.store.scan(scan.id).unwrap();
    assert_eq!(deferred.status, ScanStatus::Pending);
    assert_eq!(deferred.start_date, Some(start));
    assert!(dispatch.wait().unwrap().succeeded.is_empty());
}

#[test]
fn it_times_out_hung_scanners() {
    let (release, wait) = mpsc::channel();
    let mut registry = registry();
    registry
        .register(
            Plugin::builder(
                "Hung",
                Blocking {
                    release: Mutex::new(wait),
                },
            )
            .build(),
        )
        .unwrap();
    let harness = Harness::new(
        registry,
        Arc::new(WorkerPool::new(2)),
        passing_tools(),
        |config| config.set_unit_timeout(1),
    );
    let (scan, file) = harness.upload("app.apk");

    let report = harness
        .scheduler
        .schedule(&scan, &file, &["hung", "yara"])
        .unwrap()
        .wait()
        .unwrap();

    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.failed.len(), 1);
    match kind_of(&report.failed[0].error) {
        Some(Kind::Timeout { seconds, .. }) => assert_eq!(*seconds, 1),
        k => panic!("unexpected kind: {:?}", k),
    }

    let selection = harness.store.find_selection(scan.project, "hung").unwrap();
    let task = harness.store.task_for_scanner(scan.id, selection.id).unwrap();
    assert!(!task.active);
    assert!(task.execution_id.is_none());
    assert_eq!(task.state, TaskState::Failure);

    release.send(()).unwrap();
    thread::sleep(Duration::from_millis(200));
    let task = harness.store.task(task.id).unwrap();
    assert_eq!(task.state, TaskState::Failure);
    assert!(!task.active);
}

#[test]
fn it_recomputes_risk_level() {
    let harness = Harness::new(
        registry(),
        Arc::new(WorkerPool::new(2)),
        passing_tools(),
        |_| {},
    );
    let (scan, file) = harness.upload("app.apk");

    let _ = harness
        .scheduler
        .schedule(&scan, &file, &["secrets", "yara"])
        .unwrap()
        .wait()
        .unwrap();

    assert_eq!(
        harness.store.scan(scan.id).unwrap().risk_level,
        Severity::High
    );
}

#[test]
fn it_submits_requests() {
    let harness = Harness::new(
        registry(),
        Arc::new(WorkerPool::new(2)),
        passing_tools(),
        |config| config.set_wait_for_completion(true),
    );
    let project = harness.store.create_project("demo");
    let source = harness.dir.path().join("upload.bin");
    fs::write(&source, b"PK fake package").unwrap();

    let dispatch = harness
        .scheduler
        .submit(ScanRequest {
            project: project.id,
            file_path: source,
            file_name: String::from("app.apk"),
            scan_type: String::from("android"),
            scanners: vec![String::from("android-manifest"), String::from("yara")],
            start_date: None,
        })
        .unwrap();

    let scan = harness.store.scan(dispatch.scan()).unwrap();
    assert_eq!(scan.status, ScanStatus::Finished);
    let file = harness.store.file(scan.file).unwrap();
    assert_eq!(file.file_name, "app.apk");
    assert!(file.file_path.is_file());

    let coordination = harness.store.coordination_task(scan.id).unwrap();
    let status = harness.scheduler.status(coordination.id).unwrap();
    assert_eq!(status["state"], "SUCCESS");
    assert_eq!(status["status"]["current"], 100);
    assert_eq!(dispatch.wait().unwrap().succeeded.len(), 2);
}

#[test]
fn it_validates_requests_before_storing() {
    let harness = Harness::new(
        registry(),
        Arc::new(GatedExecutor::default()),
        passing_tools(),
        |_| {},
    );
    let project = harness.store.create_project("demo");
    let source = harness.dir.path().join("upload.bin");
    fs::write(&source, b"PK").unwrap();

    let error = harness
        .scheduler
        .submit(ScanRequest {
            project: project.id,
            file_path: source,
            file_name: String::from("app.apk"),
            scan_type: String::from("android"),
            scanners: Vec::new(),
            start_date: None,
        })
        .unwrap_err();

    match kind_of(&error) {
        Some(Kind::EmptySelection) => {}
        k => panic!("unexpected kind: {:?}", k),
    }
    assert!(harness
        .store
        .file_by_internal_name(project.id, &crate::upload::internal_name("app.apk"))
        .is_none());
    assert!(!harness.dir.path().join("projects").exists());
}
