//! Records kept by the store.

use std::{fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Local, NaiveDate, Utc};

use crate::{error::Kind, severity::Severity, utils::make_internal_id};

/// Identifier of a stored record.
pub type Id = u64;

/// Record with a store assigned identifier.
pub trait Record: Clone {
    /// Name of the entity, used in error messages.
    const ENTITY: &'static str;

    /// Gets the identifier of the record.
    fn id(&self) -> Id;

    /// Sets the identifier of the record.
    fn set_id(&mut self, id: Id);
}

macro_rules! record {
    ($($ty:ident => $entity:expr),+ $(,)*) => {
        $(
            impl Record for $ty {
                const ENTITY: &'static str = $entity;

                fn id(&self) -> Id {
                    self.id
                }

                fn set_id(&mut self, id: Id) {
                    self.id = id;
                }
            }
        )+
    };
}

record! {
    Project => "project",
    UploadedFile => "uploaded file",
    Scan => "scan",
    ScannerSelection => "scanner",
    ScanTask => "scan task",
    FindingTemplate => "finding template",
    Snippet => "snippet",
    Finding => "finding",
    Vulnerability => "vulnerability",
    Host => "host",
    Component => "component",
    AppPermission => "app permission",
    PermissionFinding => "permission finding",
    Dependency => "dependency",
}

/// Project owning uploads and scans.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: Id,
    pub name: String,
    pub created: DateTime<Utc>,
}

/// Uploaded application package.
#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub id: Id,
    pub project: Id,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_path: PathBuf,
    pub internal_name: String,
}

/// Lifecycle status of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanStatus {
    Pending,
    Active,
    Finished,
    Failed,
}

/// Scan of one uploaded file.
#[derive(Debug, Clone, Serialize)]
pub struct Scan {
    pub id: Id,
    pub uuid: String,
    pub project: Id,
    pub file: Id,
    pub scan_type: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub status: ScanStatus,
    pub risk_level: Severity,
    pub is_active: bool,
    pub finished: bool,
}

impl Scan {
    /// Creates a pending scan without start date.
    pub fn new<S: Into<String>>(project: Id, file: Id, scan_type: S) -> Self {
        Self {
            id: 0,
            uuid: uuid::Uuid::new_v4().to_string(),
            project,
            file,
            scan_type: scan_type.into(),
            start_date: None,
            end_date: None,
            status: ScanStatus::Pending,
            risk_level: Severity::None,
            is_active: false,
            finished: false,
        }
    }
}

/// A scanner selected for a project.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScannerSelection {
    pub id: Id,
    pub project: Id,
    pub name: String,
}

/// State of a task as reported by its progress observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Pending,
    Progress,
    Success,
    Failure,
}

impl TaskState {
    /// Whether no further updates are expected.
    pub fn is_terminal(self) -> bool {
        match self {
            TaskState::Success | TaskState::Failure => true,
            TaskState::Pending | TaskState::Progress => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self {
            TaskState::Pending => "PENDING",
            TaskState::Progress => "PROGRESS",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
        };
        f.write_str(state)
    }
}

/// Unit of work of a scan. Without scanner it is the coordination task of the scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanTask {
    pub id: Id,
    pub scan: Id,
    pub scanner: Option<Id>,
    pub execution_id: Option<String>,
    pub active: bool,
    pub state: TaskState,
}

/// Catalog entry describing a kind of finding.
#[derive(Debug, Clone, Serialize)]
pub struct FindingTemplate {
    pub id: Id,
    pub template_id: String,
    pub internal_id: String,
    pub title: String,
    pub description: String,
    pub risk: String,
    pub mitigation: String,
    pub article: String,
    pub default_severity: Severity,
    pub is_contextual: bool,
}

impl FindingTemplate {
    /// Creates a template, deriving the internal identifier from the title.
    pub fn new<S: Into<String>>(title: S, default_severity: Severity) -> Self {
        let title = title.into();
        Self {
            id: 0,
            template_id: uuid::Uuid::new_v4().to_string(),
            internal_id: make_internal_id(&title),
            title,
            description: String::new(),
            risk: String::new(),
            mitigation: String::new(),
            article: String::new(),
            default_severity,
            is_contextual: false,
        }
    }

    /// Sets the description.
    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the risk text.
    pub fn with_risk<S: Into<String>>(mut self, risk: S) -> Self {
        self.risk = risk.into();
        self
    }

    /// Sets the mitigation text.
    pub fn with_mitigation<S: Into<String>>(mut self, mitigation: S) -> Self {
        self.mitigation = mitigation.into();
        self
    }

    /// Sets the reference article.
    pub fn with_article<S: Into<String>>(mut self, article: S) -> Self {
        self.article = article.into();
        self
    }

    /// Overrides the internal identifier.
    pub fn with_internal_id<S: Into<String>>(mut self, internal_id: S) -> Self {
        self.internal_id = internal_id.into();
        self
    }
}

/// Source location of a result.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Snippet {
    pub id: Id,
    pub lines: String,
    pub sys_path: PathBuf,
    pub language: String,
    pub file_name: String,
    pub file_size: u64,
}

impl Snippet {
    /// Creates a snippet for the given file, reading its size from disk when possible.
    pub fn for_file<S: Into<String>>(path: PathBuf, lines: S) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let language = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let file_size = path.metadata().map(|m| m.len()).unwrap_or(0);
        Self {
            id: 0,
            lines: lines.into(),
            sys_path: path,
            language,
            file_name,
            file_size,
        }
    }
}

/// A finding reported by a scanner.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub id: Id,
    pub scan: Id,
    pub scanner: Id,
    pub template: Option<Id>,
    pub snippet: Option<Id>,
    pub severity: Severity,
    pub discovery_date: NaiveDate,
    pub custom_text: String,
}

impl Finding {
    /// Creates a finding discovered today.
    pub fn new(scan: Id, scanner: Id, template: Option<Id>, severity: Severity) -> Self {
        Self {
            id: 0,
            scan,
            scanner,
            template,
            snippet: None,
            severity,
            discovery_date: Local::now().date_naive(),
            custom_text: String::new(),
        }
    }
}

/// Triage state of a vulnerability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VulnerabilityState {
    #[serde(rename = "To Verify")]
    ToVerify,
    Confirmed,
    Urgent,
    #[serde(rename = "Not Exploitable")]
    NotExploitable,
    #[serde(rename = "Proposed not exploitable")]
    ProposedNotExploitable,
}

impl FromStr for VulnerabilityState {
    type Err = Kind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "to verify" => Ok(VulnerabilityState::ToVerify),
            "confirmed" => Ok(VulnerabilityState::Confirmed),
            "urgent" => Ok(VulnerabilityState::Urgent),
            "not exploitable" => Ok(VulnerabilityState::NotExploitable),
            "proposed not exploitable" => Ok(VulnerabilityState::ProposedNotExploitable),
            _ => Err(Kind::Parse {
                message: format!("invalid vulnerability state `{}`", s),
            }),
        }
    }
}

/// Triage status of a vulnerability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VulnerabilityStatus {
    Open,
    Closed,
}

/// A vulnerability reported by a scanner.
#[derive(Debug, Clone, Serialize)]
pub struct Vulnerability {
    pub id: Id,
    pub scan: Id,
    pub scanner: Id,
    pub template: Option<Id>,
    pub snippet: Option<Id>,
    pub severity: Severity,
    pub discovery_date: NaiveDate,
    pub custom_text: String,
    pub language: String,
    pub state: VulnerabilityState,
    pub status: VulnerabilityStatus,
}

impl Vulnerability {
    /// Creates an open vulnerability waiting for verification.
    pub fn new<S: Into<String>>(
        scan: Id,
        scanner: Id,
        template: Option<Id>,
        severity: Severity,
        language: S,
    ) -> Self {
        Self {
            id: 0,
            scan,
            scanner,
            template,
            snippet: None,
            severity,
            discovery_date: Local::now().date_naive(),
            custom_text: String::new(),
            language: language.into(),
            state: VulnerabilityState::ToVerify,
            status: VulnerabilityStatus::Open,
        }
    }
}

/// Remote host referenced by the application.
#[derive(Debug, Clone, Serialize)]
pub struct Host {
    pub id: Id,
    pub scan: Id,
    pub scanner: Id,
    pub classification: String,
    pub url: String,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub protocol: String,
    pub snippet: Option<Id>,
}

/// Category of an Android application component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ComponentCategory {
    Activity,
    Service,
    Receiver,
    Provider,
}

impl fmt::Display for ComponentCategory {
    #[allow(clippy::use_debug)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Application component declared in the manifest.
#[derive(Debug, Clone, Serialize)]
pub struct Component {
    pub id: Id,
    pub scan: Id,
    pub scanner: Id,
    pub name: String,
    pub category: ComponentCategory,
    pub is_exported: bool,
    pub is_protected: bool,
    pub is_launcher: bool,
    pub is_main: bool,
    pub intent_filters: Vec<String>,
}

/// Catalog entry of an Android permission.
#[derive(Debug, Clone, Serialize)]
pub struct AppPermission {
    pub id: Id,
    pub identifier: String,
    pub name: String,
    pub protection_level: String,
    pub dangerous: bool,
    pub short_description: String,
}

impl AppPermission {
    /// Creates the catalog entry of a permission with no further information.
    pub fn unknown<S: Into<String>>(identifier: S) -> Self {
        let identifier = identifier.into();
        let name = identifier
            .rsplit('.')
            .next()
            .unwrap_or(identifier.as_str())
            .to_owned();
        Self {
            id: 0,
            identifier,
            name,
            protection_level: String::from("Unknown"),
            dangerous: false,
            short_description: String::new(),
        }
    }
}

/// Permission requested by the scanned application.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionFinding {
    pub id: Id,
    pub scan: Id,
    pub scanner: Id,
    pub permission: Id,
    pub snippet: Option<Id>,
    pub severity: Severity,
}

/// Third party library identified in the application.
#[derive(Debug, Clone, Serialize)]
pub struct Dependency {
    pub id: Id,
    pub scan: Id,
    pub scanner: Id,
    pub group_id: String,
    pub artifact_id: String,
    pub name: String,
    pub version: String,
}

/// Application metadata of a scanned file.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Details {
    pub scan: Id,
    pub file: Id,
    pub app_package: String,
    pub app_name: String,
    pub app_version: String,
    pub min_sdk: Option<u32>,
    pub target_sdk: Option<u32>,
}
