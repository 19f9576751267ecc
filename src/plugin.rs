//! Scanner plugin descriptors.
//!
//! A plugin couples a scanner task with the result categories ("extensions") it can serve.
//! Each declared extension maps to an explicit handler building its result view.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use serde_json::{json, Value};

use crate::{
    config::Config,
    error::Kind,
    observer::Observer,
    preparation::PreparedTree,
    store::{Id, Scan, ScanTask, ScannerSelection, Store, UploadedFile},
    tools::ToolRunner,
    Result,
};

/// Result category a plugin can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Extension {
    /// Application details such as package name and SDK versions.
    Details,
    /// Requested permissions, grouped by protection level.
    Permissions,
    /// Hosts referenced by the application.
    Hosts,
    /// Code vulnerabilities, grouped by language.
    Vulnerabilities,
    /// Findings, grouped by template.
    Findings,
    /// Application components with their export state.
    Components,
    /// Third party libraries.
    Dependencies,
    /// Files of the prepared scan tree.
    Explorer,
}

impl Extension {
    /// Name of the extension in result queries.
    pub fn as_str(self) -> &'static str {
        match self {
            Extension::Details => "details",
            Extension::Permissions => "permissions",
            Extension::Hosts => "hosts",
            Extension::Vulnerabilities => "vulnerabilities",
            Extension::Findings => "findings",
            Extension::Components => "components",
            Extension::Dependencies => "dependencies",
            Extension::Explorer => "explorer",
        }
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Extension {
    type Err = Kind;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "details" => Ok(Extension::Details),
            "permissions" => Ok(Extension::Permissions),
            "hosts" => Ok(Extension::Hosts),
            "vulnerabilities" => Ok(Extension::Vulnerabilities),
            "findings" => Ok(Extension::Findings),
            "components" => Ok(Extension::Components),
            "dependencies" => Ok(Extension::Dependencies),
            "explorer" => Ok(Extension::Explorer),
            _ => Err(Kind::Parse {
                message: format!("unknown extension `{}`", s),
            }),
        }
    }
}

/// Scan and scanner a result view is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    /// Scan the results belong to.
    pub scan: Id,
    /// Selection row of the scanner that produced them.
    pub scanner: Id,
}

/// Builds the result view of one extension.
pub type ExtensionHandler = fn(&Scope, &Store) -> Result<Value>;

/// Everything a running scanner task can access.
pub struct TaskContext<'a> {
    /// Scan being run.
    pub scan: &'a Scan,
    /// Task row of this unit.
    pub task: &'a ScanTask,
    /// Scanner the unit runs for.
    pub scanner: &'a ScannerSelection,
    /// Uploaded scan target.
    pub file: &'a UploadedFile,
    /// Extracted and decompiled files of the target.
    pub tree: &'a PreparedTree,
    pub store: &'a Store,
    pub config: &'a Config,
    /// Runner for the external tools.
    pub tools: &'a dyn ToolRunner,
}

impl<'a> TaskContext<'a> {
    /// Scope of the results produced by the task.
    pub fn scope(&self) -> Scope {
        Scope {
            scan: self.scan.id,
            scanner: self.scanner.id,
        }
    }
}

impl<'a> fmt::Debug for TaskContext<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("scan", &self.scan.id)
            .field("task", &self.task.id)
            .field("scanner", &self.scanner.name)
            .field("tree", &self.tree)
            .finish()
    }
}

/// Entry point of a scanner.
pub trait ScannerTask: Send + Sync {
    /// Runs the scanner, reporting progress through the observer.
    fn run(&self, ctx: &TaskContext<'_>, observer: &Observer) -> Result<()>;
}

impl<F> ScannerTask for F
where
    F: Fn(&TaskContext<'_>, &Observer) -> Result<()> + Send + Sync,
{
    fn run(&self, ctx: &TaskContext<'_>, observer: &Observer) -> Result<()> {
        self(ctx, observer)
    }
}

/// Normalizes a scanner name: lowercase, spaces as hyphens and no double hyphens.
pub fn internal_name<S: AsRef<str>>(name: S) -> String {
    name.as_ref()
        .trim()
        .to_lowercase()
        .replace(' ', "-")
        .replace("--", "-")
}

/// Scanner plugin descriptor.
pub struct Plugin {
    name: String,
    internal_name: String,
    title: String,
    help: String,
    extensions: Vec<Extension>,
    handlers: HashMap<Extension, ExtensionHandler>,
    task: Arc<dyn ScannerTask>,
}

impl Plugin {
    /// Starts building a plugin with the given name and task.
    pub fn builder<S, T>(name: S, task: T) -> PluginBuilder
    where
        S: Into<String>,
        T: ScannerTask + 'static,
    {
        let name = name.into();
        PluginBuilder {
            plugin: Plugin {
                internal_name: internal_name(&name),
                title: name.clone(),
                name,
                help: String::new(),
                extensions: Vec::new(),
                handlers: HashMap::new(),
                task: Arc::new(task),
            },
        }
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique key of the plugin.
    pub fn internal_name(&self) -> &str {
        &self.internal_name
    }

    /// Title shown to users.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Help text.
    pub fn help(&self) -> &str {
        &self.help
    }

    /// Declared extensions, in declaration order.
    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    /// Whether the plugin declares the extension.
    pub fn supports(&self, extension: Extension) -> bool {
        self.extensions.contains(&extension)
    }

    /// Task entry point.
    pub fn task(&self) -> Arc<dyn ScannerTask> {
        Arc::clone(&self.task)
    }

    /// Builds the result view of the given extension.
    ///
    /// An undeclared extension is a `Kind::ExtensionNotSupported` error. A declared
    /// extension without handler yields an empty object.
    pub fn context(&self, extension: Extension, scope: &Scope, store: &Store) -> Result<Value> {
        if !self.supports(extension) {
            return Err(Kind::ExtensionNotSupported {
                scanner: self.internal_name.clone(),
                extension: extension.to_string(),
            }
            .into());
        }
        match self.handlers.get(&extension) {
            Some(handler) => handler(scope, store),
            None => Ok(json!({})),
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("internal_name", &self.internal_name)
            .field("extensions", &self.extensions)
            .finish()
    }
}

/// Builder of plugin descriptors.
pub struct PluginBuilder {
    plugin: Plugin,
}

impl PluginBuilder {
    /// Sets the title.
    pub fn title<S: Into<String>>(mut self, title: S) -> Self {
        self.plugin.title = title.into();
        self
    }

    /// Sets the help text.
    pub fn help<S: Into<String>>(mut self, help: S) -> Self {
        self.plugin.help = help.into();
        self
    }

    /// Declares an extension served by the given handler.
    pub fn extension(mut self, extension: Extension, handler: ExtensionHandler) -> Self {
        self.declare(extension);
        let _ = self.plugin.handlers.insert(extension, handler);
        self
    }

    /// Declares an extension without result handler.
    pub fn declare_extension(mut self, extension: Extension) -> Self {
        self.declare(extension);
        self
    }

    fn declare(&mut self, extension: Extension) {
        if !self.plugin.extensions.contains(&extension) {
            self.plugin.extensions.push(extension);
        }
    }

    /// Finishes the descriptor.
    pub fn build(self) -> Plugin {
        self.plugin
    }
}
