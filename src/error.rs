//! Module containing the definition of error types.

use failure::Error;

/// Enumeration of the different error kinds.
#[derive(Debug, Fail)]
pub enum Kind {
    /// Configuration error.
    #[fail(display = "there was an error in the configuration: {}", message)]
    Config {
        /// Error message.
        message: String,
    },
    /// Parsing error.
    #[fail(display = "there was an error in the parsing process: {}", message)]
    Parse {
        /// Error message.
        message: String,
    },
    /// A plugin with the same internal name was already registered.
    #[fail(display = "a scanner named `{}` is already registered", name)]
    DuplicateName {
        /// Internal name of the plugin.
        name: String,
    },
    /// The plugin could not be found in the registry.
    #[fail(display = "no scanner plugin named `{}` is registered", name)]
    PluginNotFound {
        /// Requested plugin name.
        name: String,
    },
    /// A scan request referenced a scanner that does not exist.
    #[fail(display = "unknown scanner selected: `{}`", name)]
    UnknownScanner {
        /// Requested scanner name.
        name: String,
    },
    /// No scanner was selected for a scan.
    #[fail(display = "at least one scanner must be selected")]
    EmptySelection,
    /// The checksums of a file could not be computed or did not match.
    #[fail(display = "checksum error for `{}`: {}", path, message)]
    Checksum {
        /// Path of the file.
        path: String,
        /// Error message.
        message: String,
    },
    /// The uploaded file could not be extracted.
    #[fail(display = "could not extract the scan target: {}", message)]
    Extraction {
        /// Error message.
        message: String,
    },
    /// An external tool returned an error.
    #[fail(display = "the external tool `{}` failed: {}", tool, stderr)]
    ExternalTool {
        /// Name of the tool.
        tool: String,
        /// Standard error of the tool.
        stderr: String,
    },
    /// A unit of work or tool exceeded its time budget.
    #[fail(display = "`{}` did not finish within {} seconds", what, seconds)]
    Timeout {
        /// What timed out.
        what: String,
        /// Timeout in seconds.
        seconds: u64,
    },
    /// The plugin does not declare the requested extension.
    #[fail(display = "the scanner `{}` does not implement the `{}` extension", scanner, extension)]
    ExtensionNotSupported {
        /// Internal name of the plugin.
        scanner: String,
        /// Requested extension.
        extension: String,
    },
    /// A record was not found in the store.
    #[fail(display = "{} not found: {}", entity, id)]
    NotFound {
        /// Entity type.
        entity: &'static str,
        /// Requested identifier.
        id: String,
    },
    /// A uniqueness constraint of the store was violated.
    #[fail(display = "unique constraint violated on {}: {}", entity, key)]
    Constraint {
        /// Entity type.
        entity: &'static str,
        /// Duplicated key.
        key: String,
    },
}

impl Kind {
    /// Gets the response status code a request-level caller should report for this error.
    pub fn status_code(&self) -> u16 {
        match *self {
            Kind::EmptySelection | Kind::UnknownScanner { .. } | Kind::Parse { .. } => 400,
            Kind::PluginNotFound { .. } | Kind::NotFound { .. } => 404,
            Kind::Constraint { .. } => 409,
            Kind::ExtensionNotSupported { .. } => 501,
            _ => 500,
        }
    }
}

/// Finds the first error kind in the cause chain of the given error.
pub fn kind_of(error: &Error) -> Option<&Kind> {
    error.iter_chain().filter_map(|c| c.downcast_ref::<Kind>()).next()
}

/// Gets the status code of the given error, 500 if it has no known kind.
pub fn status_code(error: &Error) -> u16 {
    kind_of(error).map_or(500, Kind::status_code)
}
