//! YARA pattern scanning of the extracted contents.
//!
//! Rules are compiled in process with YARA-X and every extracted file is scanned on its
//! own. Rule metadata drives the finding template: `severity`, `ft_internal_id` and the
//! `ft_fallback_*` keys.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use failure::ResultExt;
use yara_x::{Compiler, MetaValue, Rules, Scanner};

use crate::{
    error::Kind,
    observer::{Observer, Progress},
    plugin::TaskContext,
    severity::Severity,
    store::{Finding, FindingTemplate, Snippet, Store},
    utils::collect_files,
    Result,
};

/// One rule matching one file.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule: String,
    pub path: PathBuf,
    pub meta: HashMap<String, String>,
}

impl RuleMatch {
    fn meta(&self, key: &str) -> Option<&str> {
        self.meta
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Severity declared in the rule metadata, `Info` if missing or invalid.
    pub fn severity(&self) -> Severity {
        self.meta("severity")
            .and_then(|s| s.parse().ok())
            .unwrap_or(Severity::Info)
    }

    /// Template of the finding.
    ///
    /// A template referenced by `ft_internal_id` is used as is. Otherwise one is built
    /// from the `ft_fallback_*` metadata, or from the rule name as a last resort.
    pub fn template(&self, store: &Store) -> Result<FindingTemplate> {
        if let Some(existing) = self
            .meta("ft_internal_id")
            .and_then(|id| store.template_by_internal_id(id))
        {
            return Ok(existing);
        }

        let title = self.meta("ft_fallback_title").unwrap_or(self.rule.as_str());
        let mut template = FindingTemplate::new(title, self.severity())
            .with_description(self.meta("ft_fallback_description").unwrap_or_default())
            .with_risk(self.meta("ft_fallback_risk").unwrap_or_default())
            .with_mitigation(self.meta("ft_fallback_mitigation").unwrap_or_default())
            .with_article(self.meta("ft_fallback_article").unwrap_or_default());
        if let Some(internal_id) = self.meta("ft_internal_id") {
            template = template.with_internal_id(internal_id);
        }
        store.get_or_create_template(template)
    }
}

fn meta_text(value: MetaValue<'_>) -> String {
    match value {
        MetaValue::Integer(i) => i.to_string(),
        MetaValue::Float(f) => f.to_string(),
        MetaValue::Bool(b) => b.to_string(),
        MetaValue::String(s) => s.to_owned(),
        MetaValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

/// Compiles YARA rules from source. Errors carry the compiler diagnostics.
pub fn compile(sources: &[(PathBuf, String)]) -> Result<Rules> {
    let mut compiler = Compiler::new();
    for (origin, source) in sources {
        let _ = compiler
            .add_source(source.as_str())
            .map_err(|e| Kind::Parse {
                message: format!("invalid YARA rules in `{}`: {}", origin.display(), e),
            })?;
        debug!("loaded YARA rules from `{}`", origin.display());
    }
    Ok(compiler.build())
}

/// Scans the given bytes, reporting matches against `path`.
pub fn scan_bytes(scanner: &mut Scanner<'_>, path: &Path, data: &[u8]) -> Result<Vec<RuleMatch>> {
    let results = scanner.scan(data).map_err(|e| Kind::ExternalTool {
        tool: String::from("yara-x"),
        stderr: format!("could not scan `{}`: {}", path.display(), e),
    })?;
    Ok(results
        .matching_rules()
        .map(|rule| RuleMatch {
            rule: rule.identifier().to_owned(),
            path: path.to_path_buf(),
            meta: rule
                .metadata()
                .map(|(key, value)| (key.to_owned(), meta_text(value)))
                .collect(),
        })
        .collect())
}

fn rule_sources(rules: &Path) -> Result<Vec<(PathBuf, String)>> {
    let files = if rules.is_file() {
        vec![rules.to_path_buf()]
    } else {
        collect_files(rules)?
            .into_iter()
            .filter(|f| {
                f.extension()
                    .and_then(|e| e.to_str())
                    .map_or(false, |e| e == "yar" || e == "yara")
            })
            .collect()
    };

    let mut sources = Vec::with_capacity(files.len());
    for file in files {
        let source = fs::read_to_string(&file)
            .with_context(|_| format!("could not read the YARA rules at `{}`", file.display()))?;
        sources.push((file, source));
    }
    Ok(sources)
}

/// Scans the extracted contents with the configured YARA rules.
pub fn run(ctx: &TaskContext<'_>, observer: &Observer) -> Result<()> {
    let files = collect_files(ctx.tree.contents())?;
    if files.is_empty() {
        let _ = observer.success("nothing to scan");
        return Ok(());
    }

    let sources = rule_sources(ctx.config.yara_rules())?;
    if sources.is_empty() {
        let _ = observer.fail(format!(
            "no YARA rules found at `{}`",
            ctx.config.yara_rules().display()
        ));
        return Ok(());
    }

    let _ = observer.update_with(
        format!("compiling {} rule files", sources.len()),
        Progress::at(5, 100),
    );
    let rules = compile(&sources)?;
    let mut scanner = Scanner::new(&rules);
    let _ = scanner.set_timeout(ctx.config.tool_timeout());

    let total = files.len() as u64;
    let mut count = 0;
    for (i, file) in files.iter().enumerate() {
        let _ = observer.update_with(
            format!("scanning `{}`", file.display()),
            Progress::at(10 + (i as u64 * 90) / total, 100),
        );
        let data =
            fs::read(file).with_context(|_| format!("could not read `{}`", file.display()))?;

        for rule_match in scan_bytes(&mut scanner, file, &data)? {
            debug!("`{}` matched {}", rule_match.rule, file.display());
            let template = rule_match.template(ctx.store)?;
            let mut finding = Finding::new(
                ctx.scan.id,
                ctx.scanner.id,
                Some(template.id),
                rule_match.severity(),
            );
            finding.snippet = Some(
                ctx.store
                    .create_snippet(Snippet::for_file(rule_match.path.clone(), ""))
                    .id,
            );
            let _ = ctx.store.add_finding(finding)?;
            count += 1;
        }
    }

    let _ = observer.success(format!("{} YARA matches", count));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{compile, scan_bytes};
    use crate::{error::kind_of, error::Kind, severity::Severity, store::Store};
    use std::path::{Path, PathBuf};
    use yara_x::Scanner;

    const RULES: &str = r#"
rule SharedPrefsPlain {
    meta:
        severity = "medium"
        ft_fallback_title = "Plain shared preferences"
        ft_internal_id = "plain-prefs"
        ft_fallback_description = "Values such as [token], \"secret\" and keys, stored in clear"
        weight = 3
        enabled = true
    strings:
        $prefs = "<map>"
    condition:
        $prefs
}

rule DebugCert {
    strings:
        $cn = "CN=Android Debug"
    condition:
        $cn
}
"#;

    fn sources() -> Vec<(PathBuf, String)> {
        vec![(PathBuf::from("android.yar"), RULES.to_owned())]
    }

    #[test]
    fn it_reports_matches_with_metadata() {
        let rules = compile(&sources()).unwrap();
        let mut scanner = Scanner::new(&rules);
        let path = Path::new("contents/res/prefs.xml");

        let matches = scan_bytes(&mut scanner, path, b"<?xml?><map><string/></map>").unwrap();
        assert_eq!(matches.len(), 1);
        let prefs = &matches[0];
        assert_eq!(prefs.rule, "SharedPrefsPlain");
        assert_eq!(prefs.path, path);
        assert_eq!(prefs.severity(), Severity::Medium);
        assert_eq!(prefs.meta["weight"], "3");
        assert_eq!(prefs.meta["enabled"], "true");
        assert_eq!(
            prefs.meta["ft_fallback_description"],
            "Values such as [token], \"secret\" and keys, stored in clear"
        );

        let none = scan_bytes(&mut scanner, path, b"plain text").unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn it_builds_templates_from_metadata() {
        let store = Store::new();
        let rules = compile(&sources()).unwrap();
        let mut scanner = Scanner::new(&rules);
        let data: &[u8] = b"<map/> Subject: CN=Android Debug";

        let matches = scan_bytes(&mut scanner, Path::new("mixed.bin"), data).unwrap();
        assert_eq!(matches.len(), 2);
        let prefs = matches.iter().find(|m| m.rule == "SharedPrefsPlain").unwrap();
        let cert = matches.iter().find(|m| m.rule == "DebugCert").unwrap();

        let template = prefs.template(&store).unwrap();
        assert_eq!(template.title, "Plain shared preferences");
        assert_eq!(template.internal_id, "plain-prefs");
        assert_eq!(template.default_severity, Severity::Medium);
        assert_eq!(prefs.template(&store).unwrap().id, template.id);

        assert!(cert.meta.is_empty());
        assert_eq!(cert.severity(), Severity::Info);
        assert_eq!(cert.template(&store).unwrap().title, "DebugCert");
    }

    #[test]
    fn it_rejects_invalid_rules() {
        let broken = vec![(PathBuf::from("broken.yar"), String::from("rule { condition: }"))];
        let error = compile(&broken).err().unwrap();
        match kind_of(&error) {
            Some(Kind::Parse { message }) => assert!(message.contains("broken.yar")),
            k => panic!("unexpected kind: {:?}", k),
        }
    }
}
