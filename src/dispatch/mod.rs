//! Scan dispatch.
//!
//! The [`Scheduler`] turns a scan and a scanner selection into task rows, prepares the scan
//! target and fans one unit per scanner out to an [`Executor`]. A coordinator thread joins
//! the units and finalizes the scan, so [`Scheduler::schedule`] returns as soon as every
//! unit is queued.

pub mod executor;
pub mod task;
#[cfg(test)]
mod tests;

use std::{
    fmt,
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
};

use chrono::NaiveDate;
use failure::{err_msg, ResultExt};
use serde_json::Value;
use uuid::Uuid;

use self::{
    executor::{submit_group, Executor, Group, Job, UnitInfo},
    task::{Environment, UnitFailure, UnitSpec, UnitSuccess},
};
use crate::{
    config::Config,
    error::Kind,
    observer::{status_report, Observer, Progress, StatusBoard},
    preparation,
    registry::PluginRegistry,
    store::{today, Id, Record, Scan, ScanStatus, Store, TaskState, UploadedFile},
    tools::ToolRunner,
    upload, Result,
};

/// Request to scan a new upload.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Project the scan is filed under.
    pub project: Id,
    /// File to upload and scan.
    pub file_path: PathBuf,
    /// Name the file was uploaded with.
    pub file_name: String,
    /// Scan type, `android` for packages.
    pub scan_type: String,
    /// Names of the selected scanners, in selection order.
    pub scanners: Vec<String>,
    /// Day the scan starts. Missing or past dates mean today.
    pub start_date: Option<NaiveDate>,
}

/// Outcome of every unit of a dispatched scan.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub succeeded: Vec<UnitSuccess>,
    pub failed: Vec<UnitFailure>,
}

impl DispatchReport {
    /// Whether every unit succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

enum DispatchState {
    Deferred,
    Running(JoinHandle<DispatchReport>),
    Done(DispatchReport),
}

/// Handle of a dispatched scan.
pub struct Dispatch {
    scan: Id,
    execution_id: Option<String>,
    state: DispatchState,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("scan", &self.scan)
            .field("execution_id", &self.execution_id)
            .field("deferred", &self.is_deferred())
            .finish()
    }
}

impl Dispatch {
    /// Scan the dispatch belongs to.
    pub fn scan(&self) -> Id {
        self.scan
    }

    /// Execution id of the coordination task, if the scan started.
    pub fn execution_id(&self) -> Option<&str> {
        self.execution_id.as_ref().map(String::as_str)
    }

    /// Whether the scan was deferred to a later start date.
    pub fn is_deferred(&self) -> bool {
        match self.state {
            DispatchState::Deferred => true,
            _ => false,
        }
    }

    /// Waits until every unit finished and the scan is finalized.
    ///
    /// A deferred scan yields an empty report.
    pub fn wait(self) -> Result<DispatchReport> {
        let scan = self.scan;
        match self.state {
            DispatchState::Deferred => Ok(DispatchReport::default()),
            DispatchState::Done(report) => Ok(report),
            DispatchState::Running(handle) => handle
                .join()
                .map_err(|_| err_msg(format!("the coordinator of scan {} panicked", scan))),
        }
    }
}

/// Schedules scans on an executor.
pub struct Scheduler {
    env: Environment,
    executor: Arc<dyn Executor>,
}

impl Scheduler {
    /// Creates a scheduler.
    pub fn new(
        registry: Arc<PluginRegistry>,
        store: Arc<Store>,
        board: Arc<StatusBoard>,
        executor: Arc<dyn Executor>,
        config: Arc<Config>,
        tools: Arc<dyn ToolRunner>,
    ) -> Self {
        Self {
            env: Environment {
                registry,
                store,
                board,
                config,
                tools,
            },
            executor,
        }
    }

    /// Store the scheduler writes to.
    pub fn store(&self) -> &Arc<Store> {
        &self.env.store
    }

    /// Board receiving the progress of every task.
    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.env.board
    }

    /// Registered plugins.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.env.registry
    }

    /// Stores the upload of a request, creates its scan and schedules it.
    ///
    /// The request is validated before anything is stored.
    pub fn submit(&self, request: ScanRequest) -> Result<Dispatch> {
        let _ = self.validate(&request.scanners)?;
        let project = self.env.store.project(request.project)?;
        if !request.file_path.is_file() {
            return Err(Kind::NotFound {
                entity: "upload",
                id: request.file_path.display().to_string(),
            }
            .into());
        }

        let file = upload::store_upload(
            &self.env.config,
            &self.env.store,
            project.id,
            &request.file_path,
            &request.file_name,
        )?;
        let mut scan = Scan::new(project.id, file.id, request.scan_type);
        scan.start_date = request.start_date;
        let scan = self.env.store.create_scan(scan)?;
        info!(
            "created scan {} of `{}` in project {}",
            scan.id, file.file_name, project.name
        );

        self.schedule(&scan, &file, &request.scanners)
    }

    /// Schedules the given scanners over a scan.
    ///
    /// A scan is scheduled at most once: an active, finished or already coordinated scan
    /// is rejected with `Kind::Constraint`. Scanner tasks exist before any unit is submitted. Preparation runs on the calling
    /// thread; if it fails, the scan is marked as failed and no scanner runs.
    pub fn schedule<S: AsRef<str>>(
        &self,
        scan: &Scan,
        file: &UploadedFile,
        scanners: &[S],
    ) -> Result<Dispatch> {
        let names = self.validate(scanners)?;
        let store = &self.env.store;

        let current = store.scan(scan.id)?;
        let started = match current.status {
            ScanStatus::Active | ScanStatus::Finished => true,
            _ => store.coordination_task(scan.id).is_some(),
        };
        if started {
            return Err(Kind::Constraint {
                entity: Scan::ENTITY,
                key: format!("{} already scheduled ({:?})", current.uuid, current.status),
            }
            .into());
        }

        let mut selections = Vec::with_capacity(names.len());
        for name in &names {
            selections.push(store.get_or_create_selection(scan.project, name)?);
        }

        let now = today();
        let start = scan.start_date.unwrap_or(now);
        if start > now {
            let _ = store.update_scan(scan.id, |s| s.start_date = Some(start))?;
            info!("scan {} deferred to {}", scan.id, start);
            return Ok(Dispatch {
                scan: scan.id,
                execution_id: None,
                state: DispatchState::Deferred,
            });
        }

        let scan = store.update_scan(scan.id, |s| {
            s.start_date = Some(start);
            s.status = ScanStatus::Active;
            s.is_active = true;
        })?;
        let execution_id = Uuid::new_v4().to_string();
        let coordination = store.create_task(scan.id, None, Some(execution_id.clone()))?;
        let observer = Observer::new(Arc::clone(&self.env.board), execution_id.clone());
        let _ = observer.update_with("preparing the scan target", Progress::at(0, 100));

        if let Err(e) = preparation::prepare(&self.env.config, &*self.env.tools, &scan, file) {
            error!("could not prepare scan {}: {}", scan.id, e);
            let _ = observer.exception(&e, "could not prepare the scan target");
            let _ = store.update_task(coordination.id, |t| {
                t.active = false;
                t.execution_id = None;
                t.state = TaskState::Failure;
            })?;
            let _ = store.update_scan(scan.id, |s| {
                s.status = ScanStatus::Failed;
                s.is_active = false;
                s.end_date = Some(today());
            })?;
            return Err(e);
        }

        let mut units = Vec::with_capacity(selections.len());
        for selection in &selections {
            let _ = store.create_task(scan.id, Some(selection.id), None)?;
            units.push(UnitSpec {
                execution_id: Uuid::new_v4().to_string(),
                scan: scan.id,
                scanner: selection.name.clone(),
            });
        }

        let group = Group::new(
            units
                .iter()
                .map(|u| UnitInfo {
                    execution_id: u.execution_id.clone(),
                    scanner: u.scanner.clone(),
                })
                .collect(),
            self.env.config.unit_timeout(),
        );
        let jobs = units
            .into_iter()
            .map(|unit| {
                let env = self.env.clone();
                Box::new(move || task::execute(&env, &unit)) as Job
            })
            .collect();

        let _ = observer.update_with(
            format!("running {} scanners", selections.len()),
            Progress::at(10, 100),
        );
        submit_group(&*self.executor, &group, jobs);
        info!(
            "dispatched {} scanners for scan {}",
            selections.len(),
            scan.id
        );

        let env = self.env.clone();
        let coordinator_id = execution_id.clone();
        let scan_id = scan.id;
        let handle = thread::Builder::new()
            .name(format!("mastf-scan-{}", scan.id))
            .spawn(move || coordinate(&env, scan_id, coordination.id, &coordinator_id, &group))
            .context("could not start the scan coordinator")?;

        let dispatch = Dispatch {
            scan: scan.id,
            execution_id: Some(execution_id.clone()),
            state: DispatchState::Running(handle),
        };
        if self.env.config.wait_for_completion() {
            let report = dispatch.wait()?;
            return Ok(Dispatch {
                scan: scan_id,
                execution_id: Some(execution_id),
                state: DispatchState::Done(report),
            });
        }
        Ok(dispatch)
    }

    /// Status of a task.
    pub fn status(&self, task: Id) -> Result<Value> {
        let task = self.env.store.task(task)?;
        Ok(status_report(&self.env.board, &task))
    }

    /// Checks a scanner selection and returns the internal names, without duplicates.
    fn validate<S: AsRef<str>>(&self, scanners: &[S]) -> Result<Vec<String>> {
        if scanners.is_empty() {
            return Err(Kind::EmptySelection.into());
        }
        let mut names = Vec::with_capacity(scanners.len());
        for name in scanners {
            let plugin = self
                .env
                .registry
                .lookup(name.as_ref())
                .map_err(|_| Kind::UnknownScanner {
                    name: name.as_ref().to_owned(),
                })?;
            let key = plugin.internal_name().to_owned();
            if !names.contains(&key) {
                names.push(key);
            }
        }
        Ok(names)
    }
}

/// Joins the units of a scan and finalizes it.
fn coordinate(
    env: &Environment,
    scan: Id,
    coordination: Id,
    execution_id: &str,
    group: &Group,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    for result in group.join() {
        match result {
            Ok(success) => report.succeeded.push(success),
            Err(failure) => {
                error!(
                    "scanner `{}` failed on scan {}: {}",
                    failure.scanner, scan, failure.error
                );
                // Units that did not finalize their task (timeouts) are closed here.
                if let Some(task) = env.store.task_by_execution_id(&failure.execution_id) {
                    let observer = Observer::new(Arc::clone(&env.board), failure.execution_id.clone());
                    let _ = observer.exception(&failure.error, "scanner did not finish");
                    task::finalize(env, task.id, &failure.execution_id, TaskState::Failure);
                }
                report.failed.push(failure);
            }
        }
    }

    let observer = Observer::new(Arc::clone(&env.board), execution_id);
    let _ = observer.success(format!(
        "{} scanners finished, {} failed",
        report.succeeded.len() + report.failed.len(),
        report.failed.len()
    ));
    let coordinator = execution_id.to_owned();
    if let Err(e) = env.store.update_task(coordination, move |t| {
        if t.execution_id.as_ref() == Some(&coordinator) {
            t.active = false;
            t.execution_id = None;
            t.state = TaskState::Success;
        }
    }) {
        error!("could not finalize the coordination task of scan {}: {}", scan, e);
    }

    let risk_level = env.store.risk_level(scan);
    match env.store.update_scan(scan, |s| {
        s.status = ScanStatus::Finished;
        s.finished = true;
        s.is_active = false;
        s.end_date = Some(today());
        s.risk_level = risk_level;
    }) {
        Ok(_) => info!(
            "scan {} finished with risk level {} ({} scanners failed)",
            scan,
            risk_level,
            report.failed.len()
        ),
        Err(e) => error!("could not finalize scan {}: {}", scan, e),
    }
    report
}
