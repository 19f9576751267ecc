//! Third party library identification with LibScout.

use std::{collections::BTreeMap, fs};

use failure::ResultExt;

use crate::{
    error::Kind,
    observer::{Observer, Progress},
    plugin::TaskContext,
    store::{project_dir, Dependency},
    tools::Invocation,
    utils::collect_files,
    Result,
};

#[derive(Debug, Default, Deserialize)]
struct Stats {
    #[serde(default)]
    lib_matches: Vec<LibMatch>,
    #[serde(default)]
    lib_packageonly_matches: Vec<LibMatch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibMatch {
    lib_name: String,
    #[serde(default)]
    lib_version: Option<String>,
}

/// Library identified in the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub group_id: String,
    pub artifact_id: String,
    pub name: String,
    pub version: String,
}

impl Library {
    /// Splits a profile name on `::` into group and artifact ids.
    fn from_profile(name: &str, version: Option<String>) -> Self {
        let (group_id, artifact_id) = match name.find("::") {
            Some(index) => (&name[..index], &name[index + 2..]),
            None => (name, ""),
        };
        Self {
            group_id: group_id.to_owned(),
            artifact_id: artifact_id.to_owned(),
            name: name.to_owned(),
            version: version.unwrap_or_default(),
        }
    }
}

/// Parses a LibScout JSON report into the identified libraries.
///
/// Full and partial matches carry a version; package-only matches do not. A library found
/// more than once keeps the highest version.
pub fn parse_report(json: &str) -> Result<Vec<Library>> {
    let stats: Stats = serde_json::from_str(json).map_err(|e| Kind::Parse {
        message: format!("invalid LibScout report: {}", e),
    })?;

    let mut libraries: BTreeMap<(String, String), Library> = BTreeMap::new();
    let found = stats
        .lib_packageonly_matches
        .into_iter()
        .map(|m| Library::from_profile(&m.lib_name, None))
        .chain(
            stats
                .lib_matches
                .into_iter()
                .map(|m| Library::from_profile(&m.lib_name, m.lib_version)),
        );
    for library in found {
        let key = (library.group_id.clone(), library.artifact_id.clone());
        match libraries.get_mut(&key) {
            Some(known) => {
                if known.version < library.version {
                    known.version = library.version;
                }
            }
            None => {
                let _ = libraries.insert(key, library);
            }
        }
    }
    Ok(libraries.into_iter().map(|(_, l)| l).collect())
}

/// Runs LibScout on the uploaded package.
pub fn run(ctx: &TaskContext<'_>, observer: &Observer) -> Result<()> {
    let _ = observer.update("setting up LibScout");
    if !ctx.config.android_jar().is_file() {
        let _ = observer.fail(format!(
            "could not find `{}`, quitting the LibScout scan",
            ctx.config.android_jar().display()
        ));
        return Ok(());
    }

    let out_dir = project_dir(ctx.config.projects_folder(), ctx.scan.project)
        .join(format!("libscout-{}", ctx.file.internal_name));
    if out_dir.exists() {
        fs::remove_dir_all(&out_dir)
            .with_context(|_| format!("could not clean `{}`", out_dir.display()))?;
    }
    fs::create_dir_all(&out_dir)
        .with_context(|_| format!("could not create `{}`", out_dir.display()))?;

    let _ = observer.update_with("running LibScout", Progress::at(20, 100));
    let _ = ctx.tools.run(
        &Invocation::new(ctx.config.java())
            .arg("-jar")
            .path_arg(ctx.config.libscout_jar())
            .arg("-o")
            .arg("match")
            .arg("-a")
            .path_arg(ctx.config.android_jar())
            .arg("-p")
            .path_arg(ctx.config.libscout_profiles())
            .arg("-j")
            .path_arg(&out_dir)
            .path_arg(&ctx.file.file_path),
    )?;

    let _ = observer.update_with("saving the identified libraries", Progress::at(80, 100));
    let mut count = 0;
    for report in collect_files(&out_dir)?
        .into_iter()
        .filter(|f| f.extension().map_or(false, |e| e == "json"))
    {
        let json = fs::read_to_string(&report)
            .with_context(|_| format!("could not read `{}`", report.display()))?;
        for library in parse_report(&json)? {
            debug!("identified {} {}", library.name, library.version);
            let _ = ctx.store.add_dependency(Dependency {
                id: 0,
                scan: ctx.scan.id,
                scanner: ctx.scanner.id,
                group_id: library.group_id,
                artifact_id: library.artifact_id,
                name: library.name,
                version: library.version,
            })?;
            count += 1;
        }
    }

    let _ = observer.success(format!("{} libraries identified", count));
    Ok(())
}
