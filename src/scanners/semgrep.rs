//! Semgrep scanning of the decompiled sources.

use std::{fs, path::PathBuf};

use failure::ResultExt;

use crate::{
    error::Kind,
    observer::{Observer, Progress},
    plugin::TaskContext,
    severity::Severity,
    store::{project_dir, Finding, FindingTemplate, Snippet, Store},
    tools::Invocation,
    Result,
};

#[derive(Debug, Deserialize)]
struct Report {
    #[serde(default)]
    results: Vec<CheckResult>,
}

/// One result of a Semgrep JSON report.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckResult {
    pub check_id: String,
    pub path: PathBuf,
    pub start: Position,
    pub end: Position,
    #[serde(default)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Position {
    pub line: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Extra {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub area: String,
    #[serde(default)]
    pub category: String,
}

impl CheckResult {
    /// Check id without the rule folder prefix, e.g. `MSTG-STORAGE-7.2` for
    /// `rules.storage.MSTG-STORAGE-7.2`.
    pub fn check_name(&self) -> &str {
        self.check_id.splitn(3, '.').last().unwrap_or(self.check_id.as_str())
    }

    /// Internal id of the template describing this result.
    pub fn internal_name(&self) -> String {
        format!(
            "{}-{}-({})",
            self.extra.metadata.area,
            self.extra.metadata.category,
            self.check_name()
        )
        .to_lowercase()
    }

    /// Lines of the result: a `start-end` range, or the single lines separated by commas.
    pub fn lines(&self) -> String {
        let (start, end) = (self.start.line, self.end.line.max(self.start.line));
        if end - start > 1 {
            format!("{}-{}", start, end)
        } else {
            (start..=end)
                .map(|l| l.to_string())
                .collect::<Vec<_>>()
                .join(",")
        }
    }

    fn template(&self, store: &Store) -> Result<FindingTemplate> {
        let internal_name = self.internal_name();
        if let Some(template) = store.template_containing(&internal_name) {
            return Ok(template);
        }
        warn!(
            "no finding template for `{}`, creating one from the check",
            internal_name
        );
        store.get_or_create_template(
            FindingTemplate::new(self.check_name(), Severity::Info)
                .with_description(self.extra.message.as_str())
                .with_internal_id(internal_name),
        )
    }
}

/// Parses a Semgrep JSON report.
pub fn parse_report(json: &str) -> Result<Vec<CheckResult>> {
    let report: Report = serde_json::from_str(json).map_err(|e| Kind::Parse {
        message: format!("invalid Semgrep report: {}", e),
    })?;
    Ok(report.results)
}

/// Runs Semgrep with the configured rules over the decompiled sources.
pub fn run(ctx: &TaskContext<'_>, observer: &Observer) -> Result<()> {
    let rules = ctx.config.semgrep_rules();
    let out_file = project_dir(ctx.config.projects_folder(), ctx.scan.project)
        .join(format!("semgrep-{}.json", ctx.file.internal_name));
    if out_file.exists() {
        fs::remove_file(&out_file)
            .with_context(|_| format!("could not remove `{}`", out_file.display()))?;
    }

    let _ = observer.update_with("running semgrep", Progress::at(10, 100));
    // .semgrepignore is read from the working directory.
    let _ = ctx.tools.run(
        &Invocation::new(ctx.config.semgrep())
            .arg("scan")
            .arg("-c")
            .path_arg(rules)
            .arg("--json")
            .arg("--output")
            .path_arg(&out_file)
            .path_arg(ctx.tree.src())
            .current_dir(rules),
    )?;

    let _ = observer.update_with("inspecting the semgrep results", Progress::at(60, 100));
    let json = fs::read_to_string(&out_file)
        .with_context(|_| format!("could not read `{}`", out_file.display()))?;
    let results = parse_report(&json)?;

    for result in &results {
        let template = result.template(ctx.store)?;
        let snippet = ctx
            .store
            .create_snippet(Snippet::for_file(result.path.clone(), result.lines()));
        let mut finding = Finding::new(
            ctx.scan.id,
            ctx.scanner.id,
            Some(template.id),
            template.default_severity,
        );
        finding.snippet = Some(snippet.id);
        if template.is_contextual {
            finding.custom_text = result.extra.message.clone();
        }
        let _ = ctx.store.add_finding(finding)?;
    }

    let _ = observer.success(format!("{} semgrep results", results.len()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_report;
    use crate::{
        severity::Severity,
        store::{FindingTemplate, Store},
    };

    const REPORT: &str = r#"{
        "errors": [],
        "results": [
            {
                "check_id": "rules.storage.MSTG-STORAGE-7.2",
                "path": "/tmp/src/com/demo/Prefs.java",
                "start": {"line": 12, "col": 5},
                "end": {"line": 12, "col": 40},
                "extra": {
                    "message": "Sensitive data in shared preferences",
                    "metadata": {"area": "Storage", "category": "Data"}
                }
            },
            {
                "check_id": "rules.crypto.MSTG-CRYPTO-4",
                "path": "/tmp/src/com/demo/Crypto.java",
                "start": {"line": 3},
                "end": {"line": 9},
                "extra": {"message": "Weak cipher", "metadata": {"area": "Crypto", "category": "Cipher"}}
            }
        ]
    }"#;

    #[test]
    fn it_parses_reports() {
        let results = parse_report(REPORT).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].check_name(), "MSTG-STORAGE-7.2");
        assert_eq!(results[0].internal_name(), "storage-data-(mstg-storage-7.2)");
        assert_eq!(results[0].lines(), "12");
        assert_eq!(results[1].lines(), "3-9");

        assert!(parse_report("{\"results\": 3}").is_err());
    }

    #[test]
    fn it_prefers_existing_templates() {
        let store = Store::new();
        let existing = store
            .create_template(
                FindingTemplate::new("Shared preferences", Severity::High)
                    .with_internal_id("storage-data-(mstg-storage-7.2)-prefs"),
            )
            .unwrap();
        let results = parse_report(REPORT).unwrap();

        assert_eq!(results[0].template(&store).unwrap().id, existing.id);

        let created = results[1].template(&store).unwrap();
        assert_eq!(created.internal_id, "crypto-cipher-(mstg-crypto-4)");
        assert_eq!(created.description, "Weak cipher");
    }
}
