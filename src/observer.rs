//! Progress reporting of running tasks.
//!
//! Every running unit gets an [`Observer`] bound to its execution id. Updates are pushed to
//! the shared [`StatusBoard`], which status queries read by execution id.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use failure::Error;
use serde_json::{json, Value};

pub use crate::store::TaskState;
use crate::store::ScanTask;

/// Last status pushed by a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRecord {
    pub state: TaskState,
    pub description: String,
    pub current: u64,
    pub total: u64,
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exc_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exc_message: Option<String>,
}

/// Status records addressable by execution id.
#[derive(Debug, Default)]
pub struct StatusBoard {
    records: RwLock<HashMap<String, StatusRecord>>,
}

impl StatusBoard {
    /// Creates an empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the record of the given execution, replacing the previous one.
    pub fn push<S: Into<String>>(&self, execution_id: S, record: StatusRecord) {
        let _ = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(execution_id.into(), record);
    }

    /// Gets the last record of the given execution.
    pub fn get(&self, execution_id: &str) -> Option<StatusRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned()
    }
}

/// Progress position of an update.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    /// Explicit position. When absent, the internal counter is used.
    pub current: Option<u64>,
    /// Position meaning completion.
    pub total: u64,
    /// Whether the internal counter advances before being used.
    pub increment: bool,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            current: None,
            total: 100,
            increment: true,
        }
    }
}

impl Progress {
    /// Progress at the given position out of `total`.
    pub fn at(current: u64, total: u64) -> Self {
        Self {
            current: Some(current),
            total,
            increment: false,
        }
    }
}

/// Status reporting handle of one running task.
#[derive(Debug)]
pub struct Observer {
    board: Arc<StatusBoard>,
    execution_id: String,
    position: Mutex<u64>,
}

impl Observer {
    /// Creates an observer reporting to the board under the given execution id.
    pub fn new<S: Into<String>>(board: Arc<StatusBoard>, execution_id: S) -> Self {
        Self {
            board,
            execution_id: execution_id.into(),
            position: Mutex::new(0),
        }
    }

    /// Gets the execution id the observer reports for.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Reports progress with the internal counter.
    pub fn update<S: Into<String>>(&self, message: S) -> StatusRecord {
        self.update_with(message, Progress::default())
    }

    /// Reports progress at the given position.
    pub fn update_with<S: Into<String>>(&self, message: S, progress: Progress) -> StatusRecord {
        self.push(TaskState::Progress, message.into(), progress, None)
    }

    /// Marks the task as successful.
    pub fn success<S: Into<String>>(&self, message: S) -> StatusRecord {
        self.push(
            TaskState::Success,
            message.into(),
            Progress::at(100, 100),
            None,
        )
    }

    /// Marks the task as failed with a generic error.
    pub fn fail<S: Into<String>>(&self, message: S) -> StatusRecord {
        let message = message.into();
        let exc = (String::from("RuntimeError"), message.clone());
        self.push(TaskState::Failure, message, Progress::at(100, 100), Some(exc))
    }

    /// Marks the task as failed because of the given error.
    pub fn exception<S: Into<String>>(&self, error: &Error, message: S) -> StatusRecord {
        let exc = (error_type_name(error), error.to_string());
        self.push(
            TaskState::Failure,
            message.into(),
            Progress::at(100, 100),
            Some(exc),
        )
    }

    fn push(
        &self,
        state: TaskState,
        description: String,
        progress: Progress,
        exc: Option<(String, String)>,
    ) -> StatusRecord {
        let total = if progress.total == 0 {
            100
        } else {
            progress.total
        };

        let current = {
            let mut position = self.position.lock().unwrap_or_else(PoisonError::into_inner);
            match progress.current {
                Some(current) => {
                    *position = current % total;
                    current
                }
                None => {
                    if progress.increment {
                        *position = (*position + 1) % total;
                    }
                    *position
                }
            }
        };

        let percent = (current as f64 / total as f64 * 10_000.0).round() / 100.0;
        let (exc_type, exc_message) = match exc {
            Some((t, m)) => (Some(t), Some(m)),
            None => (None, None),
        };
        let record = StatusRecord {
            state,
            description,
            current,
            total,
            percent,
            exc_type,
            exc_message,
        };

        trace!(
            "[{}] {} {}% {}",
            self.execution_id,
            record.state,
            record.percent,
            record.description
        );
        self.board.push(self.execution_id.clone(), record.clone());
        record
    }
}

/// Name of the error kind found in the error, or of its root cause.
fn error_type_name(error: &Error) -> String {
    match crate::error::kind_of(error) {
        Some(kind) => {
            let debug = format!("{:?}", kind);
            debug
                .split(|c: char| !c.is_alphanumeric())
                .next()
                .unwrap_or("Error")
                .to_owned()
        }
        None => String::from("Error"),
    }
}

impl fmt::Display for StatusRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} ({}%): {}",
            self.state, self.current, self.total, self.percent, self.description
        )
    }
}

/// Renders the status of a task as `{id, state, status: {pending, current, total, detail,
/// complete}}`.
///
/// Finished tasks no longer carry an execution id; their stored state is reported instead.
pub fn status_report(board: &StatusBoard, task: &ScanTask) -> Value {
    let id = task
        .execution_id
        .clone()
        .unwrap_or_else(|| task.id.to_string());
    let record = task.execution_id.as_ref().and_then(|e| board.get(e));

    match record {
        Some(record) => json!({
            "id": id,
            "state": record.state,
            "status": {
                "pending": false,
                "current": record.current,
                "total": record.total,
                "detail": record.description,
                "complete": record.state.is_terminal(),
            },
        }),
        None if task.active && !task.state.is_terminal() => json!({
            "id": id,
            "state": TaskState::Pending,
            "status": {
                "pending": true,
                "current": 0,
                "total": 100,
                "detail": Value::Null,
                "complete": false,
            },
        }),
        None => json!({
            "id": id,
            "state": task.state,
            "status": {
                "pending": false,
                "current": 100,
                "total": 100,
                "detail": format!("Task with id={} finished!", id),
                "complete": true,
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{status_report, Observer, Progress, StatusBoard, TaskState};
    use crate::{error::Kind, store::ScanTask};
    use failure::Error;
    use std::sync::Arc;

    fn observer() -> (Arc<StatusBoard>, Observer) {
        let board = Arc::new(StatusBoard::new());
        let observer = Observer::new(Arc::clone(&board), "exec-1");
        (board, observer)
    }

    #[test]
    fn it_reports_percent() {
        let (board, observer) = observer();

        let record = observer.update_with("Scanning 1 of 3", Progress::at(1, 3));
        assert_eq!(record.state, TaskState::Progress);
        assert_eq!(record.current, 1);
        assert_eq!(record.total, 3);
        assert!((record.percent - 33.33).abs() < f64::EPSILON);
        assert_eq!(board.get("exec-1"), Some(record));
    }

    #[test]
    fn it_auto_increments_and_wraps() {
        let (_, observer) = observer();

        let progress = Progress {
            current: None,
            total: 3,
            increment: true,
        };
        let positions: Vec<_> = (0..4)
            .map(|_| observer.update_with("tick", progress).current)
            .collect();
        assert_eq!(positions, vec![1, 2, 0, 1]);

        let still = Progress {
            increment: false,
            ..progress
        };
        assert_eq!(observer.update_with("tick", still).current, 1);
    }

    #[test]
    fn it_is_monotonic_until_success() {
        let (board, observer) = observer();

        let mut last = 0.0;
        for i in 0..=10 {
            let record = observer.update_with("step", Progress::at(i, 10));
            assert!(record.percent >= last);
            last = record.percent;
        }
        let record = observer.success("done");
        assert!(record.percent >= last);
        assert_eq!(record.state, TaskState::Success);
        assert_eq!(record.current, 100);
        assert!((record.percent - 100.0).abs() < f64::EPSILON);
        assert_eq!(board.get("exec-1").map(|r| r.state), Some(TaskState::Success));
    }

    #[test]
    fn it_reports_failures() {
        let (_, observer) = observer();

        let record = observer.fail("tool missing");
        assert_eq!(record.state, TaskState::Failure);
        assert_eq!(record.exc_type.as_ref().map(String::as_str), Some("RuntimeError"));
        assert_eq!(record.exc_message.as_ref().map(String::as_str), Some("tool missing"));

        let error: Error = Kind::Extraction {
            message: String::from("not a zip"),
        }
        .into();
        let record = observer.exception(&error, "extraction failed");
        assert_eq!(record.exc_type.as_ref().map(String::as_str), Some("Extraction"));
        assert_eq!(
            record.exc_message.as_ref().map(String::as_str),
            Some("could not extract the scan target: not a zip")
        );
    }

    #[test]
    fn it_renders_status_report() {
        let (board, observer) = observer();
        let mut task = ScanTask {
            id: 7,
            scan: 1,
            scanner: Some(2),
            execution_id: Some(String::from("exec-1")),
            active: true,
            state: TaskState::Pending,
        };

        let pending = status_report(&board, &task);
        assert_eq!(pending["state"], "PENDING");
        assert_eq!(pending["status"]["pending"], true);

        let _ = observer.update_with("half way", Progress::at(50, 100));
        let running = status_report(&board, &task);
        assert_eq!(running["id"], "exec-1");
        assert_eq!(running["state"], "PROGRESS");
        assert_eq!(running["status"]["current"], 50);
        assert_eq!(running["status"]["detail"], "half way");
        assert_eq!(running["status"]["complete"], false);

        task.execution_id = None;
        task.active = false;
        task.state = TaskState::Success;
        let finished = status_report(&board, &task);
        assert_eq!(finished["state"], "SUCCESS");
        assert_eq!(finished["status"]["complete"], true);
    }
}
