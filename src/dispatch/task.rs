//! Execution of one scanner unit.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use failure::{err_msg, Error};

use super::executor::panic_message;
use crate::{
    config::Config,
    error::Kind,
    observer::{Observer, StatusBoard},
    plugin::{Plugin, TaskContext},
    preparation::PreparedTree,
    registry::PluginRegistry,
    store::{Id, Store, TaskState},
    tools::ToolRunner,
    Result,
};

/// Successful outcome of a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSuccess {
    pub execution_id: String,
    pub scanner: String,
    pub state: TaskState,
}

/// Failed outcome of a unit.
#[derive(Debug)]
pub struct UnitFailure {
    pub execution_id: String,
    pub scanner: String,
    pub error: Error,
}

/// Outcome of a unit.
pub type UnitResult = std::result::Result<UnitSuccess, UnitFailure>;

/// Shared services every unit runs with.
#[derive(Clone)]
pub struct Environment {
    pub registry: Arc<PluginRegistry>,
    pub store: Arc<Store>,
    pub board: Arc<StatusBoard>,
    pub config: Arc<Config>,
    pub tools: Arc<dyn ToolRunner>,
}

/// Unit to run: one scanner over one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub execution_id: String,
    pub scan: Id,
    pub scanner: String,
}

/// Runs one unit and finalizes its task.
///
/// Errors and panics of the scanner body are reported through the observer and returned
/// as a [`UnitFailure`]; they never propagate to the caller.
pub fn execute(env: &Environment, unit: &UnitSpec) -> UnitResult {
    let observer = Observer::new(Arc::clone(&env.board), unit.execution_id.clone());
    let failure = |error: Error| UnitFailure {
        execution_id: unit.execution_id.clone(),
        scanner: unit.scanner.clone(),
        error,
    };

    let plugin = match env.registry.lookup(&unit.scanner) {
        Ok(plugin) => plugin,
        Err(e) => {
            error!("could not run scanner `{}`: {}", unit.scanner, e);
            let _ = observer.exception(&e, "scanner not found");
            return Err(failure(e));
        }
    };

    let task_id = match bind_task(env, unit) {
        Ok(task_id) => task_id,
        Err(e) => {
            let _ = observer.exception(&e, "could not load the scan task");
            return Err(failure(e));
        }
    };

    let body = || run_body(env, unit, &plugin, task_id, &observer);
    let outcome = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(outcome) => outcome,
        Err(payload) => Err(err_msg(format!(
            "scanner `{}` panicked: {}",
            unit.scanner,
            panic_message(&*payload)
        ))),
    };

    let state = match outcome {
        Ok(()) => {
            let record = env.board.get(&unit.execution_id);
            match record {
                Some(ref r) if r.state.is_terminal() => r.state,
                _ => observer.success(format!("{} finished", plugin.title())).state,
            }
        }
        Err(ref e) => {
            warn!("scanner `{}` failed: {}", unit.scanner, e);
            observer
                .exception(e, format!("{} failed", plugin.title()))
                .state
        }
    };

    finalize(env, task_id, &unit.execution_id, state);

    match outcome {
        Ok(()) if state == TaskState::Success => Ok(UnitSuccess {
            execution_id: unit.execution_id.clone(),
            scanner: unit.scanner.clone(),
            state,
        }),
        Ok(()) => Err(failure(err_msg(format!(
            "scanner `{}` reported a failure",
            unit.scanner
        )))),
        Err(e) => Err(failure(e)),
    }
}

/// Binds the unit's execution id to its task before the body runs.
fn bind_task(env: &Environment, unit: &UnitSpec) -> Result<Id> {
    let scan = env.store.scan(unit.scan)?;
    let selection = env
        .store
        .find_selection(scan.project, &unit.scanner)
        .ok_or_else(|| not_found("scanner", &unit.scanner))?;
    let task = env
        .store
        .task_for_scanner(scan.id, selection.id)
        .ok_or_else(|| not_found("task", &format!("{}/{}", scan.id, unit.scanner)))?;
    let execution_id = unit.execution_id.clone();
    let task = env.store.update_task(task.id, move |t| {
        t.execution_id = Some(execution_id);
        t.state = TaskState::Progress;
    })?;
    Ok(task.id)
}

fn run_body(
    env: &Environment,
    unit: &UnitSpec,
    plugin: &Plugin,
    task_id: Id,
    observer: &Observer,
) -> Result<()> {
    let scan = env.store.scan(unit.scan)?;
    let file = env.store.file(scan.file)?;
    let task = env.store.task(task_id)?;
    let scanner = match task.scanner {
        Some(selection) => env.store.selection(selection)?,
        None => return Err(not_found("scanner", &unit.scanner)),
    };
    let tree = PreparedTree::for_file(&env.config, &scan, &file);

    let ctx = TaskContext {
        scan: &scan,
        task: &task,
        scanner: &scanner,
        file: &file,
        tree: &tree,
        store: &env.store,
        config: &env.config,
        tools: &*env.tools,
    };
    debug!(
        "running scanner `{}` on scan {}",
        plugin.internal_name(),
        scan.id
    );
    plugin.task().run(&ctx, observer)
}

fn not_found(entity: &'static str, id: &str) -> Error {
    Kind::NotFound {
        entity,
        id: id.to_owned(),
    }
    .into()
}

/// Marks the task of the unit as finished.
///
/// Nothing happens if the task is no longer bound to the given execution id, which is the
/// case of a unit finishing after its timeout.
pub(crate) fn finalize(env: &Environment, task_id: Id, execution_id: &str, state: TaskState) {
    let execution_id = execution_id.to_owned();
    let result = env.store.update_task(task_id, move |task| {
        if task.execution_id.as_ref() == Some(&execution_id) {
            task.active = false;
            task.execution_id = None;
            task.state = state;
        }
    });
    if let Err(e) = result {
        error!("could not finalize task {}: {}", task_id, e);
    }
}
