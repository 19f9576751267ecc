//! Scanner plugins shipped with the framework.

pub mod libscout;
pub mod manifest;
pub mod rule;
pub mod sast;
pub mod semgrep;
pub mod yara;

use crate::{
    aggregate,
    config::Config,
    plugin::{Extension, Plugin},
    registry::PluginRegistry,
    Result,
};

/// Builds the registry with every built-in scanner.
pub fn default_registry(config: &Config) -> Result<PluginRegistry> {
    let mut registry = PluginRegistry::new();

    registry.register(
        Plugin::builder("Android Manifest", manifest::run)
            .title("Android Manifest")
            .help("Extracts the application details, permissions and components from the manifest.")
            .extension(Extension::Details, aggregate::details)
            .extension(Extension::Permissions, aggregate::permissions)
            .extension(Extension::Components, aggregate::components)
            .extension(Extension::Findings, aggregate::findings)
            .extension(Extension::Explorer, aggregate::explorer)
            .build(),
    )?;
    registry.register(
        Plugin::builder("SAST", sast::run)
            .title("Static code analysis")
            .help(format!(
                "Applies the regex rules of `{}` to the decompiled sources.",
                config.sast_rules().display()
            ))
            .extension(Extension::Vulnerabilities, aggregate::vulnerabilities)
            .extension(Extension::Hosts, aggregate::hosts)
            .build(),
    )?;
    registry.register(
        Plugin::builder("YARA", yara::run)
            .title("YARA Scanner")
            .help(format!(
                "Matches the extracted files against the YARA rules in `{}`.",
                config.yara_rules().display()
            ))
            .extension(Extension::Findings, aggregate::findings)
            .build(),
    )?;
    registry.register(
        Plugin::builder("Semgrep", semgrep::run)
            .title("Semgrep Scanner")
            .help(format!(
                "Runs semgrep with the rules in `{}` over the decompiled sources.",
                config.semgrep_rules().display()
            ))
            .extension(Extension::Findings, aggregate::findings)
            .build(),
    )?;
    registry.register(
        Plugin::builder("LibScout", libscout::run)
            .title("LibScout")
            .help("Identifies third party libraries with LibScout profiles.")
            .extension(Extension::Dependencies, aggregate::dependencies)
            .build(),
    )?;

    Ok(registry)
}
