//! Result views of the scanner extensions.
//!
//! Every handler has the [`ExtensionHandler`](crate::plugin::ExtensionHandler) signature and
//! renders the results of one scanner in one scan. Grouped views share [`breakdown`], which
//! counts items per category and per severity.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::{
    filetree,
    plugin::Scope,
    preparation::PreparedTree,
    severity::Severity,
    store::{ComponentCategory, Id, Store},
    Result,
};

/// Statistics of one category of results.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategoryStats {
    /// Category name, the grouping key of the results.
    pub category: String,
    /// Number of results in the category.
    pub count: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    /// Results with any other severity.
    pub other: usize,
    /// Share of the category in the whole result set, in percent.
    pub percent: f64,
    /// Extra ratios of the category, in percent of the whole result set.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, f64>,
}

/// Statistics of a result set, split by category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breakdown {
    pub count: usize,
    /// `count`, or 1 for an empty set, so ratios never divide by zero.
    pub rel_count: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub other: usize,
    pub categories: Vec<CategoryStats>,
}

impl Default for Breakdown {
    fn default() -> Self {
        Self {
            count: 0,
            rel_count: 1,
            critical: 0,
            high: 0,
            medium: 0,
            low: 0,
            other: 0,
            categories: Vec::new(),
        }
    }
}

fn ratio(part: usize, rel_count: usize) -> f64 {
    (part as f64 / rel_count as f64 * 10_000.0).round() / 100.0
}

/// Tallies one item in the severity counters.
macro_rules! tally {
    ($stats:expr, $severity:expr) => {{
        $stats.count += 1;
        match $severity {
            Some(Severity::Critical) => $stats.critical += 1,
            Some(Severity::High) => $stats.high += 1,
            Some(Severity::Medium) => $stats.medium += 1,
            Some(Severity::Low) => $stats.low += 1,
            _ => $stats.other += 1,
        }
    }};
}

/// Groups items by category and counts them per severity.
///
/// Categories are listed in first appearance order.
pub fn breakdown<T, K, S>(items: &[T], category: K, severity: S) -> Breakdown
where
    K: Fn(&T) -> String,
    S: Fn(&T) -> Option<Severity>,
{
    let mut result = Breakdown::default();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();

    for item in items {
        let key = category(item);
        let position = match index.get(&key) {
            Some(&position) => position,
            None => {
                result.categories.push(CategoryStats {
                    category: key.clone(),
                    ..CategoryStats::default()
                });
                let _ = index.insert(key, result.categories.len() - 1);
                result.categories.len() - 1
            }
        };
        let level = severity(item);
        tally!(result, level);
        tally!(result.categories[position], level);
    }

    result.rel_count = result.count.max(1);
    for stats in &mut result.categories {
        stats.percent = ratio(stats.count, result.rel_count);
    }
    result
}

fn template_title(store: &Store, template: Option<Id>) -> String {
    template
        .and_then(|t| store.template(t).ok())
        .map_or_else(|| String::from("Untitled"), |t| t.title)
}

/// Application details of the scanned file.
pub fn details(scope: &Scope, store: &Store) -> Result<Value> {
    let scan = store.scan(scope.scan)?;
    let file = store.file(scan.file)?;
    Ok(json!({
        "details": store.details(scan.id, file.id),
        "file": file,
        "risk_level": scan.risk_level,
        "charts": true,
    }))
}

/// Findings grouped by template.
pub fn findings(scope: &Scope, store: &Store) -> Result<Value> {
    let findings = store.findings(scope.scan, Some(scope.scanner));
    let stats = breakdown(
        &findings,
        |f| template_title(store, f.template),
        |f| Some(f.severity),
    );
    let items: Vec<Value> = findings
        .iter()
        .map(|f| {
            json!({
                "finding": f,
                "title": template_title(store, f.template),
                "snippet": f.snippet.and_then(|s| store.snippet(s).ok()),
            })
        })
        .collect();
    Ok(json!({ "stats": stats, "findings": items }))
}

/// Vulnerabilities grouped by language, then by template.
pub fn vulnerabilities(scope: &Scope, store: &Store) -> Result<Value> {
    let vulnerabilities = store.vulnerabilities(scope.scan, Some(scope.scanner));
    let stats = breakdown(&vulnerabilities, |v| v.language.clone(), |v| Some(v.severity));

    let languages: Vec<Value> = stats
        .categories
        .iter()
        .map(|language| {
            let subset: Vec<_> = vulnerabilities
                .iter()
                .filter(|v| v.language == language.category)
                .cloned()
                .collect();
            let templates = breakdown(
                &subset,
                |v| template_title(store, v.template),
                |v| Some(v.severity),
            );
            let categories: Vec<Value> = templates
                .categories
                .iter()
                .map(|t| {
                    let items: Vec<_> = subset
                        .iter()
                        .filter(|v| template_title(store, v.template) == t.category)
                        .collect();
                    json!({ "name": t.category, "count": t.count, "stats": t, "vuln_data": items })
                })
                .collect();
            json!({ "name": language.category, "count": language.count, "categories": categories })
        })
        .collect();

    Ok(json!({ "stats": stats, "languages": languages }))
}

/// Hosts grouped by classification.
pub fn hosts(scope: &Scope, store: &Store) -> Result<Value> {
    let hosts = store.hosts(scope.scan, Some(scope.scanner));
    let stats = breakdown(&hosts, |h| h.classification.clone(), |_| None);
    Ok(json!({ "stats": stats, "hosts": hosts }))
}

/// Components grouped by category, with exported and protected ratios.
pub fn components(scope: &Scope, store: &Store) -> Result<Value> {
    let components = store.components(scope.scan, Some(scope.scanner));
    let mut stats = breakdown(&components, |c| c.category.to_string(), |_| None);

    let rel_count = stats.rel_count;
    for category in &mut stats.categories {
        let members = components
            .iter()
            .filter(|c| c.category.to_string() == category.category);
        let (exported, protected) = members.fold((0, 0), |(e, p), c| {
            (
                e + usize::from(c.is_exported),
                p + usize::from(c.is_protected),
            )
        });
        let flags = &mut category.flags;
        let _ = flags.insert(String::from("exported"), exported as f64);
        let _ = flags.insert(String::from("exported_rel"), ratio(exported, rel_count));
        let _ = flags.insert(String::from("protected"), protected as f64);
        let _ = flags.insert(String::from("protected_rel"), ratio(protected, rel_count));
    }

    let launchers: Vec<_> = components
        .iter()
        .filter(|c| c.is_launcher && c.category == ComponentCategory::Activity)
        .map(|c| c.name.as_str())
        .collect();
    Ok(json!({ "stats": stats, "components": components, "launchers": launchers }))
}

/// Requested permissions grouped by protection level.
pub fn permissions(scope: &Scope, store: &Store) -> Result<Value> {
    let findings = store.permission_findings(scope.scan, Some(scope.scanner));
    let mut rows = Vec::with_capacity(findings.len());
    for finding in findings {
        let permission = store.permission(finding.permission)?;
        rows.push((finding, permission));
    }

    let stats = breakdown(
        &rows,
        |(_, p)| p.protection_level.clone(),
        |(f, _)| Some(f.severity),
    );
    let dangerous = rows.iter().filter(|(_, p)| p.dangerous).count();
    let items: Vec<Value> = rows
        .iter()
        .map(|(f, p)| {
            json!({
                "identifier": p.identifier,
                "name": p.name,
                "protection_level": p.protection_level,
                "dangerous": p.dangerous,
                "description": p.short_description,
                "severity": f.severity,
            })
        })
        .collect();
    Ok(json!({ "stats": stats, "dangerous": dangerous, "permissions": items }))
}

/// Identified third party libraries grouped by group id.
pub fn dependencies(scope: &Scope, store: &Store) -> Result<Value> {
    let dependencies = store.dependencies(scope.scan, Some(scope.scanner));
    let stats = breakdown(&dependencies, |d| d.group_id.clone(), |_| None);
    Ok(json!({ "stats": stats, "dependencies": dependencies }))
}

/// Files of the prepared scan tree. Empty before the scan was prepared.
pub fn explorer(scope: &Scope, store: &Store) -> Result<Value> {
    let scan = store.scan(scope.scan)?;
    let file = store.file(scan.file)?;
    let tree = PreparedTree::of_upload(&file);
    if !tree.root().is_dir() {
        return Ok(json!({}));
    }
    Ok(serde_json::to_value(filetree::apply_rules(tree.root())?)?)
}

#[cfg(test)]
mod tests {
    use super::{breakdown, components, explorer, findings, permissions, vulnerabilities};
    use crate::{
        plugin::Scope,
        severity::Severity,
        store::{
            tests::store_with_scan, AppPermission, Component, ComponentCategory, Finding,
            FindingTemplate, PermissionFinding, Scan, UploadedFile, Vulnerability,
        },
    };
    use std::fs;

    #[test]
    fn it_breaks_down_empty_sets() {
        let items: Vec<(String, Severity)> = Vec::new();
        let stats = breakdown(&items, |i| i.0.clone(), |i| Some(i.1));

        assert_eq!(stats.count, 0);
        assert_eq!(stats.rel_count, 1);
        assert!(stats.categories.is_empty());
    }

    #[test]
    fn it_breaks_down_by_category() {
        let items = vec![
            ("java", Severity::High),
            ("kotlin", Severity::Critical),
            ("java", Severity::Info),
            ("java", Severity::Low),
        ];
        let stats = breakdown(&items, |i| i.0.to_owned(), |i| Some(i.1));

        assert_eq!(stats.count, 4);
        assert_eq!(stats.rel_count, 4);
        assert_eq!((stats.critical, stats.high, stats.low, stats.other), (1, 1, 1, 1));
        assert_eq!(stats.categories.len(), 2);
        let java = &stats.categories[0];
        assert_eq!(java.category, "java");
        assert_eq!(java.count, 3);
        assert_eq!(java.percent, 75.0);
        assert_eq!(java.other, 1);
        assert_eq!(stats.categories[1].percent, 25.0);
    }

    #[test]
    fn it_renders_empty_findings() {
        let (store, scan) = store_with_scan();
        let scanner = store.get_or_create_selection(scan.project, "yara").unwrap();
        let scope = Scope {
            scan: scan.id,
            scanner: scanner.id,
        };

        let view = findings(&scope, &store).unwrap();
        assert_eq!(view["stats"]["count"], 0);
        assert_eq!(view["stats"]["rel_count"], 1);
        assert_eq!(view["findings"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn it_renders_findings_by_template() {
        let (store, scan) = store_with_scan();
        let scanner = store.get_or_create_selection(scan.project, "yara").unwrap();
        let other = store.get_or_create_selection(scan.project, "sast").unwrap();
        let template = store
            .get_or_create_template(FindingTemplate::new("Debug certificate", Severity::Medium))
            .unwrap();
        for _ in 0..2 {
            let _ = store
                .add_finding(Finding::new(
                    scan.id,
                    scanner.id,
                    Some(template.id),
                    Severity::Medium,
                ))
                .unwrap();
        }
        let _ = store
            .add_finding(Finding::new(scan.id, other.id, None, Severity::High))
            .unwrap();

        let view = findings(
            &Scope {
                scan: scan.id,
                scanner: scanner.id,
            },
            &store,
        )
        .unwrap();
        assert_eq!(view["stats"]["count"], 2);
        assert_eq!(view["stats"]["medium"], 2);
        assert_eq!(view["stats"]["categories"][0]["category"], "Debug certificate");
        assert_eq!(view["findings"][0]["title"], "Debug certificate");
    }

    #[test]
    fn it_groups_vulnerabilities_by_language() {
        let (store, scan) = store_with_scan();
        let scanner = store.get_or_create_selection(scan.project, "sast").unwrap();
        let template = store
            .get_or_create_template(FindingTemplate::new("Weak hash", Severity::High))
            .unwrap();
        for language in &["java", "java", "kotlin"] {
            let _ = store
                .add_vulnerability(Vulnerability::new(
                    scan.id,
                    scanner.id,
                    Some(template.id),
                    Severity::High,
                    *language,
                ))
                .unwrap();
        }

        let view = vulnerabilities(
            &Scope {
                scan: scan.id,
                scanner: scanner.id,
            },
            &store,
        )
        .unwrap();
        assert_eq!(view["languages"][0]["name"], "java");
        assert_eq!(view["languages"][0]["count"], 2);
        assert_eq!(view["languages"][0]["categories"][0]["name"], "Weak hash");
        assert_eq!(view["languages"][1]["count"], 1);
        assert_eq!(view["stats"]["high"], 3);
    }

    #[test]
    fn it_computes_component_ratios() {
        let (store, scan) = store_with_scan();
        let scanner = store
            .get_or_create_selection(scan.project, "android-manifest")
            .unwrap();
        let component = |name: &str, category, exported, protected| Component {
            id: 0,
            scan: scan.id,
            scanner: scanner.id,
            name: name.to_owned(),
            category,
            is_exported: exported,
            is_protected: protected,
            is_launcher: name == "MainActivity",
            is_main: name == "MainActivity",
            intent_filters: Vec::new(),
        };
        for c in vec![
            component("MainActivity", ComponentCategory::Activity, true, false),
            component("Settings", ComponentCategory::Activity, false, false),
            component("Sync", ComponentCategory::Service, true, true),
            component("Boot", ComponentCategory::Receiver, true, false),
        ] {
            let _ = store.add_component(c).unwrap();
        }

        let view = components(
            &Scope {
                scan: scan.id,
                scanner: scanner.id,
            },
            &store,
        )
        .unwrap();
        let activity = &view["stats"]["categories"][0];
        assert_eq!(activity["category"], "Activity");
        assert_eq!(activity["count"], 2);
        assert_eq!(activity["flags"]["exported"], 1.0);
        assert_eq!(activity["flags"]["exported_rel"], 25.0);
        assert_eq!(view["stats"]["categories"][1]["flags"]["protected_rel"], 25.0);
        assert_eq!(view["launchers"][0], "MainActivity");
    }

    #[test]
    fn it_groups_permissions_by_protection_level() {
        let (store, scan) = store_with_scan();
        let scanner = store
            .get_or_create_selection(scan.project, "android-manifest")
            .unwrap();
        let mut camera = AppPermission::unknown("android.permission.CAMERA");
        camera.protection_level = String::from("dangerous");
        camera.dangerous = true;
        let camera = store.get_or_create_permission(camera).unwrap();
        let custom = store
            .get_or_create_permission(AppPermission::unknown("com.example.CUSTOM"))
            .unwrap();
        for (permission, severity) in vec![(camera.id, Severity::High), (custom.id, Severity::Info)] {
            let _ = store
                .add_permission_finding(PermissionFinding {
                    id: 0,
                    scan: scan.id,
                    scanner: scanner.id,
                    permission,
                    snippet: None,
                    severity,
                })
                .unwrap();
        }

        let view = permissions(
            &Scope {
                scan: scan.id,
                scanner: scanner.id,
            },
            &store,
        )
        .unwrap();
        assert_eq!(view["dangerous"], 1);
        assert_eq!(view["stats"]["categories"][0]["category"], "dangerous");
        assert_eq!(view["stats"]["categories"][1]["category"], "Unknown");
        assert_eq!(view["permissions"][0]["name"], "CAMERA");
    }

    #[test]
    fn it_renders_the_prepared_tree() {
        let dir = tempfile::tempdir().unwrap();
        let (store, scan) = store_with_scan();
        let file = store
            .insert_file(UploadedFile {
                id: 0,
                project: scan.project,
                md5: String::from("feed"),
                sha1: String::new(),
                sha256: String::new(),
                file_name: String::from("demo.apk"),
                file_size: 0,
                file_path: dir.path().join("0a1b.apk"),
                internal_name: String::from("0a1b"),
            })
            .unwrap();
        let prepared = store
            .create_scan(Scan::new(scan.project, file.id, "android"))
            .unwrap();
        let scanner = store
            .get_or_create_selection(scan.project, "android-manifest")
            .unwrap();
        let scope = Scope {
            scan: prepared.id,
            scanner: scanner.id,
        };

        assert_eq!(explorer(&scope, &store).unwrap(), serde_json::json!({}));

        fs::create_dir_all(dir.path().join("feed/contents")).unwrap();
        fs::write(dir.path().join("feed/contents/AndroidManifest.xml"), "<manifest/>").unwrap();
        let view = explorer(&scope, &store).unwrap();
        assert_eq!(view["text"], "feed");
        assert_eq!(view["type"], "folder");
        let manifest = &view["children"][0]["children"][0];
        assert_eq!(manifest["text"], "AndroidManifest.xml");
        assert_eq!(manifest["li_attr"]["path"], "feed/contents/AndroidManifest.xml");
        assert_eq!(manifest["li_attr"]["language"], "xml");
    }
}
