//! Configuration module.
//!
//! Handles and configures the initial settings and variables needed to run the scan
//! pipeline. The configuration is loaded from a TOML file and then decorated with the
//! options given in the command line.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
    u64,
};

use clap::ArgMatches;
use failure::{Error, ResultExt};

use crate::{error::Kind, severity::Severity, Result};

/// Largest number of worker threads accepted from the configuration.
const MAX_THREADS: usize = u8::MAX as usize;

/// Configuration of the scan pipeline.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Boolean to represent `--verbose` mode.
    verbose: bool,
    /// Boolean to represent `--quiet` mode.
    quiet: bool,
    /// Number of worker threads executing scanner units.
    threads: usize,
    /// Folder where project directories and uploads are stored.
    projects_folder: PathBuf,
    /// Maximum run time of a single scanner unit, in seconds.
    unit_timeout: u64,
    /// Maximum run time of a single external tool invocation, in seconds.
    tool_timeout: u64,
    /// Minimum severity reported by the rule based scanners.
    min_severity: Severity,
    /// Dispatch settings.
    dispatch: DispatchConfig,
    /// External tool commands.
    tools: ToolsConfig,
    /// Rule locations.
    rules: RulesConfig,
    /// LibScout settings.
    libscout: LibScoutConfig,
    /// Files the configuration was loaded from.
    #[serde(skip)]
    loaded_files: Vec<PathBuf>,
}

/// Dispatch settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Whether callers wait for the whole scan to finish.
    wait: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { wait: false }
    }
}

/// External tool commands.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    apktool: String,
    dex2smali: String,
    jadx: String,
    semgrep: String,
    java: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            apktool: String::from("apktool"),
            dex2smali: if cfg!(target_family = "windows") {
                String::from("d2j-dex2smali.bat")
            } else {
                String::from("d2j-dex2smali.sh")
            },
            jadx: String::from("jadx"),
            semgrep: String::from("semgrep"),
            java: String::from("java"),
        }
    }
}

/// Rule locations.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    sast: PathBuf,
    yara: PathBuf,
    semgrep: PathBuf,
}

impl Default for RulesConfig {
    fn default() -> Self {
        let base = if cfg!(target_family = "unix") && Path::new("/usr/share/mastf").exists() {
            PathBuf::from("/usr/share/mastf/rules")
        } else {
            PathBuf::from("rules")
        };
        Self {
            sast: base.join("sast.json"),
            yara: base.join("yara"),
            semgrep: base.join("semgrep"),
        }
    }
}

/// LibScout settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LibScoutConfig {
    jar: PathBuf,
    profiles: PathBuf,
    android_jar: PathBuf,
}

impl Default for LibScoutConfig {
    fn default() -> Self {
        Self {
            jar: PathBuf::from("vendor/LibScout.jar"),
            profiles: PathBuf::from("vendor/libscout-profiles"),
            android_jar: PathBuf::from("vendor/android.jar"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: false,
            quiet: false,
            threads: num_cpus::get().max(1),
            projects_folder: PathBuf::from("projects"),
            unit_timeout: 3600,
            tool_timeout: 1800,
            min_severity: Severity::Info,
            dispatch: DispatchConfig::default(),
            tools: ToolsConfig::default(),
            rules: RulesConfig::default(),
            libscout: LibScoutConfig::default(),
            loaded_files: Vec::new(),
        }
    }
}

impl Config {
    /// Loads a configuration from the given TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).with_context(|_| {
            format!(
                "could not read the configuration file `{}`",
                path.as_ref().display()
            )
        })?;
        let mut config: Self = toml::from_str(&contents).map_err(|e| {
            Error::from(Kind::Config {
                message: format!("{}: {}", path.as_ref().display(), e),
            })
        })?;

        if config.threads == 0 || config.threads > MAX_THREADS {
            warn!(
                "the `threads` option must be an integer between 1 and {}, using default",
                MAX_THREADS
            );
            config.threads = Self::default().threads;
        }
        config.loaded_files.push(path.as_ref().to_path_buf());
        Ok(config)
    }

    /// Decorates the loaded configuration with the given command line options.
    pub fn decorate_with_cli(&mut self, cli: &ArgMatches<'_>) -> Result<()> {
        self.verbose = self.verbose || cli.is_present("verbose");
        self.quiet = !self.verbose && (self.quiet || cli.is_present("quiet"));

        if let Some(threads) = cli.value_of("threads") {
            match threads.parse::<usize>() {
                Ok(t) if t > 0 && t <= MAX_THREADS => self.threads = t,
                _ => {
                    return Err(Kind::Config {
                        message: format!(
                            "the threads option must be an integer between 1 and {}",
                            MAX_THREADS
                        ),
                    }
                    .into());
                }
            }
        }
        if let Some(timeout) = cli.value_of("timeout") {
            self.unit_timeout = timeout.parse().map_err(|_| Kind::Config {
                message: format!("invalid timeout `{}`", timeout),
            })?;
        }
        if let Some(folder) = cli.value_of("projects") {
            self.projects_folder = PathBuf::from(folder);
        }
        if cli.is_present("wait") {
            self.dispatch.wait = true;
        }
        Ok(())
    }

    /// Returns the list of problems found in the configuration. Empty if it is usable.
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.unit_timeout == 0 {
            errors.push(String::from("the unit timeout must be greater than zero"));
        }
        if !self.rules.sast.exists() {
            errors.push(format!(
                "the SAST rule file `{}` does not exist",
                self.rules.sast.display()
            ));
        }
        if !self.rules.yara.exists() {
            errors.push(format!(
                "the YARA rule folder `{}` does not exist",
                self.rules.yara.display()
            ));
        }
        if !self.rules.semgrep.exists() {
            errors.push(format!(
                "the Semgrep rule folder `{}` does not exist",
                self.rules.semgrep.display()
            ));
        }
        errors
    }

    /// Gets the files the configuration was loaded from.
    pub fn loaded_config_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.loaded_files.iter()
    }

    /// Returns whether the pipeline runs in verbose mode.
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Sets the verbose mode.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Returns whether the pipeline runs in quiet mode.
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Sets the quiet mode.
    pub fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Sets the number of worker threads.
    pub fn set_threads(&mut self, threads: usize) {
        self.threads = threads.max(1).min(MAX_THREADS);
    }

    /// Folder containing all project directories.
    pub fn projects_folder(&self) -> &Path {
        &self.projects_folder
    }

    /// Sets the projects folder.
    pub fn set_projects_folder<P: Into<PathBuf>>(&mut self, folder: P) {
        self.projects_folder = folder.into();
    }

    /// Maximum run time of a scanner unit.
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout)
    }

    /// Sets the unit timeout, in seconds.
    pub fn set_unit_timeout(&mut self, seconds: u64) {
        self.unit_timeout = seconds;
    }

    /// Maximum run time of an external tool.
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout)
    }

    /// Minimum severity of reported rule matches.
    pub fn min_severity(&self) -> Severity {
        self.min_severity
    }

    /// Whether dispatching waits for every unit.
    pub fn wait_for_completion(&self) -> bool {
        self.dispatch.wait
    }

    /// Sets whether dispatching waits for every unit.
    pub fn set_wait_for_completion(&mut self, wait: bool) {
        self.dispatch.wait = wait;
    }

    /// Command of apktool.
    pub fn apktool(&self) -> &str {
        &self.tools.apktool
    }

    /// Command of the dex to smali converter.
    pub fn dex2smali(&self) -> &str {
        &self.tools.dex2smali
    }

    /// Command of jadx.
    pub fn jadx(&self) -> &str {
        &self.tools.jadx
    }

    /// Command of semgrep.
    pub fn semgrep(&self) -> &str {
        &self.tools.semgrep
    }

    /// Command of the Java runtime.
    pub fn java(&self) -> &str {
        &self.tools.java
    }

    /// File with the SAST rules.
    pub fn sast_rules(&self) -> &Path {
        &self.rules.sast
    }

    /// Sets the file with the SAST rules.
    pub fn set_sast_rules<P: Into<PathBuf>>(&mut self, path: P) {
        self.rules.sast = path.into();
    }

    /// Folder with the YARA rules.
    pub fn yara_rules(&self) -> &Path {
        &self.rules.yara
    }

    /// Sets the folder with the YARA rules.
    pub fn set_yara_rules<P: Into<PathBuf>>(&mut self, path: P) {
        self.rules.yara = path.into();
    }

    /// Folder with the Semgrep rules.
    pub fn semgrep_rules(&self) -> &Path {
        &self.rules.semgrep
    }

    /// Sets the folder with the Semgrep rules.
    pub fn set_semgrep_rules<P: Into<PathBuf>>(&mut self, path: P) {
        self.rules.semgrep = path.into();
    }

    /// LibScout JAR file.
    pub fn libscout_jar(&self) -> &Path {
        &self.libscout.jar
    }

    /// Folder with the LibScout library profiles.
    pub fn libscout_profiles(&self) -> &Path {
        &self.libscout.profiles
    }

    /// Android SDK `android.jar` used by LibScout.
    pub fn android_jar(&self) -> &Path {
        &self.libscout.android_jar
    }

    /// Sets the Android SDK `android.jar` used by LibScout.
    pub fn set_android_jar<P: Into<PathBuf>>(&mut self, path: P) {
        self.libscout.android_jar = path.into();
    }
}
