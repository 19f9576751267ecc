//! In-process store holding every record produced by the scan pipeline.
//!
//! The store is a set of tables guarded by a single mutex. Each call takes the lock once, so
//! a read followed by a write from the same caller is not atomic; the catalog helpers
//! (`get_or_create_template`, `get_or_create_permission`) rely on the uniqueness constraints
//! to resolve concurrent creation.

pub mod models;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{Local, NaiveDate, Utc};
use failure::Error;

use crate::{error::kind_of, error::Kind, severity::Severity, Result};

pub use self::models::*;

/// Table of records indexed by identifier.
#[derive(Debug)]
struct Table<T> {
    rows: BTreeMap<Id, T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<T: Record> Table<T> {
    fn insert(&mut self, id: Id, mut record: T) -> T {
        record.set_id(id);
        let _ = self.rows.insert(id, record.clone());
        record
    }

    fn get(&self, id: Id) -> Result<T> {
        self.rows.get(&id).cloned().ok_or_else(|| {
            Kind::NotFound {
                entity: T::ENTITY,
                id: id.to_string(),
            }
            .into()
        })
    }

    fn update<F: FnOnce(&mut T)>(&mut self, id: Id, f: F) -> Result<T> {
        let record = self.rows.get_mut(&id).ok_or_else(|| Kind::NotFound {
            entity: T::ENTITY,
            id: id.to_string(),
        })?;
        f(record);
        record.set_id(id);
        Ok(record.clone())
    }

    fn find<P: Fn(&T) -> bool>(&self, predicate: P) -> Option<T> {
        self.rows.values().find(|r| predicate(r)).cloned()
    }

    fn filter<P: Fn(&T) -> bool>(&self, predicate: P) -> Vec<T> {
        self.rows.values().filter(|r| predicate(r)).cloned().collect()
    }
}

#[derive(Debug, Default)]
struct Tables {
    next_id: Id,
    projects: Table<Project>,
    files: Table<UploadedFile>,
    scans: Table<Scan>,
    selections: Table<ScannerSelection>,
    tasks: Table<ScanTask>,
    templates: Table<FindingTemplate>,
    snippets: Table<Snippet>,
    findings: Table<Finding>,
    vulnerabilities: Table<Vulnerability>,
    hosts: Table<Host>,
    components: Table<Component>,
    permissions: Table<AppPermission>,
    permission_findings: Table<PermissionFinding>,
    dependencies: Table<Dependency>,
    details: BTreeMap<(Id, Id), Details>,
}

impl Tables {
    fn next_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }
}

/// Generates the insert and per scanner listing operations of a result table.
macro_rules! scan_results {
    ($($table:ident: $ty:ident => $insert:ident, $list:ident;)+) => {
        $(
            #[doc = concat!("Stores a new `", stringify!($ty), "` record.")]
            pub fn $insert(&self, record: $ty) -> Result<$ty> {
                let mut tables = self.lock();
                let _ = tables.scans.get(record.scan)?;
                let _ = tables.selections.get(record.scanner)?;
                let id = tables.next_id();
                Ok(tables.$table.insert(id, record))
            }

            #[doc = concat!(
                "Lists the `", stringify!($ty), "` records of a scan, optionally restricted to one scanner."
            )]
            pub fn $list(&self, scan: Id, scanner: Option<Id>) -> Vec<$ty> {
                self.lock().$table.filter(|r| {
                    r.scan == scan && scanner.map_or(true, |s| r.scanner == s)
                })
            }
        )+
    };
}

/// In-process store.
#[derive(Debug, Default)]
pub struct Store {
    tables: Mutex<Tables>,
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a project.
    pub fn create_project<S: Into<String>>(&self, name: S) -> Project {
        let mut tables = self.lock();
        let id = tables.next_id();
        tables.projects.insert(
            id,
            Project {
                id,
                name: name.into(),
                created: Utc::now(),
            },
        )
    }

    /// Gets a project.
    pub fn project(&self, id: Id) -> Result<Project> {
        self.lock().projects.get(id)
    }

    /// Finds a project by name.
    pub fn project_by_name(&self, name: &str) -> Option<Project> {
        self.lock().projects.find(|p| p.name == name)
    }

    /// Stores an uploaded file record.
    pub fn insert_file(&self, file: UploadedFile) -> Result<UploadedFile> {
        let mut tables = self.lock();
        let _ = tables.projects.get(file.project)?;
        let id = tables.next_id();
        Ok(tables.files.insert(id, file))
    }

    /// Gets an uploaded file.
    pub fn file(&self, id: Id) -> Result<UploadedFile> {
        self.lock().files.get(id)
    }

    /// Modifies an uploaded file record in place.
    pub fn update_file<F: FnOnce(&mut UploadedFile)>(&self, id: Id, f: F) -> Result<UploadedFile> {
        self.lock().files.update(id, f)
    }

    /// Finds an upload of a project by its internal name.
    pub fn file_by_internal_name(&self, project: Id, internal_name: &str) -> Option<UploadedFile> {
        self.lock()
            .files
            .find(|f| f.project == project && f.internal_name == internal_name)
    }

    /// Stores a new scan.
    pub fn create_scan(&self, scan: Scan) -> Result<Scan> {
        let mut tables = self.lock();
        let _ = tables.projects.get(scan.project)?;
        let _ = tables.files.get(scan.file)?;
        let id = tables.next_id();
        Ok(tables.scans.insert(id, scan))
    }

    /// Gets a scan.
    pub fn scan(&self, id: Id) -> Result<Scan> {
        self.lock().scans.get(id)
    }

    /// Modifies a scan in place.
    pub fn update_scan<F: FnOnce(&mut Scan)>(&self, id: Id, f: F) -> Result<Scan> {
        self.lock().scans.update(id, f)
    }

    /// Gets the selection of the given scanner for the project, creating it if needed.
    pub fn get_or_create_selection(&self, project: Id, name: &str) -> Result<ScannerSelection> {
        let mut tables = self.lock();
        let _ = tables.projects.get(project)?;
        if let Some(selection) = tables
            .selections
            .find(|s| s.project == project && s.name == name)
        {
            return Ok(selection);
        }
        let id = tables.next_id();
        Ok(tables.selections.insert(
            id,
            ScannerSelection {
                id,
                project,
                name: name.to_owned(),
            },
        ))
    }

    /// Gets a scanner selection.
    pub fn selection(&self, id: Id) -> Result<ScannerSelection> {
        self.lock().selections.get(id)
    }

    /// Finds the selection of a scanner in a project.
    pub fn find_selection(&self, project: Id, name: &str) -> Option<ScannerSelection> {
        self.lock()
            .selections
            .find(|s| s.project == project && s.name == name)
    }

    /// Lists the scanners selected for a project, in selection order.
    pub fn selections_for(&self, project: Id) -> Vec<ScannerSelection> {
        self.lock().selections.filter(|s| s.project == project)
    }

    /// Creates a task of the given scan. Without scanner, it is the coordination task.
    pub fn create_task(
        &self,
        scan: Id,
        scanner: Option<Id>,
        execution_id: Option<String>,
    ) -> Result<ScanTask> {
        let mut tables = self.lock();
        let _ = tables.scans.get(scan)?;
        if let Some(selection) = scanner {
            let _ = tables.selections.get(selection)?;
        }
        if tables
            .tasks
            .find(|t| t.scan == scan && t.scanner == scanner)
            .is_some()
        {
            return Err(Kind::Constraint {
                entity: ScanTask::ENTITY,
                key: match scanner {
                    Some(selection) => format!("scan {} scanner {}", scan, selection),
                    None => format!("scan {} coordination", scan),
                },
            }
            .into());
        }
        let id = tables.next_id();
        Ok(tables.tasks.insert(
            id,
            ScanTask {
                id,
                scan,
                scanner,
                execution_id,
                active: true,
                state: TaskState::Pending,
            },
        ))
    }

    /// Gets a task.
    pub fn task(&self, id: Id) -> Result<ScanTask> {
        self.lock().tasks.get(id)
    }

    /// Modifies a task in place.
    pub fn update_task<F: FnOnce(&mut ScanTask)>(&self, id: Id, f: F) -> Result<ScanTask> {
        self.lock().tasks.update(id, f)
    }

    /// Lists every task of a scan, coordination task included.
    pub fn tasks_for_scan(&self, scan: Id) -> Vec<ScanTask> {
        self.lock().tasks.filter(|t| t.scan == scan)
    }

    /// Gets the task of one scanner in a scan.
    pub fn task_for_scanner(&self, scan: Id, scanner: Id) -> Option<ScanTask> {
        self.lock()
            .tasks
            .find(|t| t.scan == scan && t.scanner == Some(scanner))
    }

    /// Gets the coordination task of a scan.
    pub fn coordination_task(&self, scan: Id) -> Option<ScanTask> {
        self.lock()
            .tasks
            .find(|t| t.scan == scan && t.scanner.is_none())
    }

    /// Finds the task currently bound to the given execution id.
    pub fn task_by_execution_id(&self, execution_id: &str) -> Option<ScanTask> {
        self.lock()
            .tasks
            .find(|t| t.execution_id.as_ref().map(String::as_str) == Some(execution_id))
    }

    /// Stores a new finding template. Fails if the internal id is already in use.
    pub fn create_template(&self, template: FindingTemplate) -> Result<FindingTemplate> {
        let mut tables = self.lock();
        if tables
            .templates
            .find(|t| t.internal_id == template.internal_id)
            .is_some()
        {
            return Err(Kind::Constraint {
                entity: FindingTemplate::ENTITY,
                key: template.internal_id,
            }
            .into());
        }
        let id = tables.next_id();
        Ok(tables.templates.insert(id, template))
    }

    /// Gets a finding template.
    pub fn template(&self, id: Id) -> Result<FindingTemplate> {
        self.lock().templates.get(id)
    }

    /// Finds a finding template by its internal id.
    pub fn template_by_internal_id(&self, internal_id: &str) -> Option<FindingTemplate> {
        self.lock()
            .templates
            .find(|t| t.internal_id == internal_id)
    }

    /// Finds the first template whose internal id contains the given text.
    pub fn template_containing(&self, text: &str) -> Option<FindingTemplate> {
        let text = text.to_lowercase();
        self.lock()
            .templates
            .find(|t| t.internal_id.contains(text.as_str()))
    }

    /// Gets the template with the internal id of the given one, storing it if missing.
    pub fn get_or_create_template(&self, template: FindingTemplate) -> Result<FindingTemplate> {
        if let Some(existing) = self.template_by_internal_id(&template.internal_id) {
            return Ok(existing);
        }
        let internal_id = template.internal_id.clone();
        self.create_template(template)
            .or_else(|e| self.refetch_on_constraint(e, || self.template_by_internal_id(&internal_id)))
    }

    /// Stores a new permission. Fails if the identifier is already in use.
    pub fn create_permission(&self, permission: AppPermission) -> Result<AppPermission> {
        let mut tables = self.lock();
        if tables
            .permissions
            .find(|p| p.identifier == permission.identifier)
            .is_some()
        {
            return Err(Kind::Constraint {
                entity: AppPermission::ENTITY,
                key: permission.identifier,
            }
            .into());
        }
        let id = tables.next_id();
        Ok(tables.permissions.insert(id, permission))
    }

    /// Gets a permission.
    pub fn permission(&self, id: Id) -> Result<AppPermission> {
        self.lock().permissions.get(id)
    }

    /// Finds a permission by identifier.
    pub fn permission_by_identifier(&self, identifier: &str) -> Option<AppPermission> {
        self.lock()
            .permissions
            .find(|p| p.identifier == identifier)
    }

    /// Gets the permission with the identifier of the given one, storing it if missing.
    pub fn get_or_create_permission(&self, permission: AppPermission) -> Result<AppPermission> {
        if let Some(existing) = self.permission_by_identifier(&permission.identifier) {
            return Ok(existing);
        }
        let identifier = permission.identifier.clone();
        self.create_permission(permission)
            .or_else(|e| self.refetch_on_constraint(e, || self.permission_by_identifier(&identifier)))
    }

    fn refetch_on_constraint<T, F>(&self, error: Error, refetch: F) -> Result<T>
    where
        F: FnOnce() -> Option<T>,
    {
        match kind_of(&error) {
            Some(Kind::Constraint { .. }) => refetch().ok_or(error),
            _ => Err(error),
        }
    }

    /// Stores a code snippet.
    pub fn create_snippet(&self, snippet: Snippet) -> Snippet {
        let mut tables = self.lock();
        let id = tables.next_id();
        tables.snippets.insert(id, snippet)
    }

    /// Gets a code snippet.
    pub fn snippet(&self, id: Id) -> Result<Snippet> {
        self.lock().snippets.get(id)
    }

    scan_results! {
        findings: Finding => add_finding, findings;
        vulnerabilities: Vulnerability => add_vulnerability, vulnerabilities;
        hosts: Host => add_host, hosts;
        components: Component => add_component, components;
        permission_findings: PermissionFinding => add_permission_finding, permission_findings;
        dependencies: Dependency => add_dependency, dependencies;
    }

    /// Stores the application details of a scanned file, replacing previous ones.
    pub fn set_details(&self, details: Details) -> Result<Details> {
        let mut tables = self.lock();
        let _ = tables.scans.get(details.scan)?;
        let _ = tables
            .details
            .insert((details.scan, details.file), details.clone());
        Ok(details)
    }

    /// Gets the application details of a scanned file.
    pub fn details(&self, scan: Id, file: Id) -> Option<Details> {
        self.lock().details.get(&(scan, file)).cloned()
    }

    /// Computes the risk level of a scan: the highest severity among its findings and
    /// vulnerabilities.
    pub fn risk_level(&self, scan: Id) -> Severity {
        let tables = self.lock();
        let findings = tables
            .findings
            .rows
            .values()
            .filter(|f| f.scan == scan)
            .map(|f| f.severity);
        let vulnerabilities = tables
            .vulnerabilities
            .rows
            .values()
            .filter(|v| v.scan == scan)
            .map(|v| v.severity);
        Severity::highest(findings.chain(vulnerabilities))
    }
}

/// Directory of the given project below the projects folder.
pub fn project_dir(projects_folder: &Path, project: Id) -> PathBuf {
    projects_folder.join(project.to_string())
}

/// Today, in local time.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}
