//! Regex based static analysis of the decompiled sources.

use std::{
    collections::BTreeSet,
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use regex::Regex;

use super::rule::{load_rules, Rule};
use crate::{
    observer::{Observer, Progress},
    plugin::TaskContext,
    store::{FindingTemplate, Host, Snippet, Vulnerability},
    utils::{collect_files, get_line, get_line_for},
    Result,
};

lazy_static! {
    static ref URL: Regex =
        Regex::new(r#"(?P<scheme>https?)://(?P<host>[A-Za-z0-9.\-]+)(:(?P<port>\d{1,5}))?[^\s"'<>]*"#)
            .expect("invalid URL regex");
    static ref FRAMEWORK_PATH: Regex =
        Regex::new(r"(^|/)(android|androidx|kotlin|kotlinx)/").expect("invalid framework regex");
}

const SOURCE_EXTENSIONS: &[&str] = &["java", "kt", "smali", "xml"];

/// A match of a rule in a source file.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub start_line: usize,
    pub end_line: usize,
}

impl Match {
    /// One based line range, as stored in snippets.
    pub fn lines(&self) -> String {
        if self.end_line > self.start_line {
            format!("{}-{}", self.start_line + 1, self.end_line + 1)
        } else {
            (self.start_line + 1).to_string()
        }
    }
}

/// Applies a rule to the code of one file.
pub fn apply_rule(rule: &Rule, code: &str) -> Vec<Match> {
    let mut matches = Vec::new();
    'rule: for m in rule.regex().find_iter(code) {
        for white in rule.whitelist() {
            if white.is_match(m.as_str()) {
                continue 'rule;
            }
        }
        match rule.forward_check() {
            Some(check) => {
                let caps = match rule.regex().captures(m.as_str()) {
                    Some(caps) => caps,
                    None => continue,
                };
                let mut r = check.to_owned();
                if let Some(fc1) = caps.name("fc1") {
                    r = r.replace("{fc1}", &regex::escape(fc1.as_str()));
                }
                if let Some(fc2) = caps.name("fc2") {
                    r = r.replace("{fc2}", &regex::escape(fc2.as_str()));
                }
                let regex = match Regex::new(&r) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(
                            "there was an error creating the forward check `{}`, the rule `{}` \
                             will be skipped: {}",
                            r,
                            rule.label(),
                            e
                        );
                        break 'rule;
                    }
                };
                for fm in regex.find_iter(code) {
                    matches.push(Match {
                        start_line: get_line_for(fm.start(), code),
                        end_line: get_line_for(fm.end(), code),
                    });
                }
            }
            None => matches.push(Match {
                start_line: get_line_for(m.start(), code),
                end_line: get_line_for(m.end(), code),
            }),
        }
    }
    matches
}

/// Remote host referenced in source code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostRef {
    pub url: String,
    pub host: String,
    pub port: Option<u16>,
    pub protocol: String,
}

/// Extracts every HTTP(S) URL of the code.
pub fn extract_hosts(code: &str) -> Vec<HostRef> {
    URL.captures_iter(code)
        .filter_map(|caps| {
            Some(HostRef {
                url: caps.get(0)?.as_str().to_owned(),
                host: caps.name("host")?.as_str().to_owned(),
                port: caps.name("port").and_then(|p| p.as_str().parse().ok()),
                protocol: caps.name("scheme")?.as_str().to_lowercase(),
            })
        })
        .collect()
}

fn is_scanned(path: &Path, root: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let relative = relative.to_string_lossy().replace('\\', "/");
    if FRAMEWORK_PATH.is_match(&relative) {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| SOURCE_EXTENSIONS.contains(&e))
}

/// Runs the SAST rules over the decompiled sources of the scan.
pub fn run(ctx: &TaskContext<'_>, observer: &Observer) -> Result<()> {
    let rules = load_rules(ctx.config.sast_rules(), ctx.config.min_severity())?;
    let src = ctx.tree.src();
    let files: Vec<PathBuf> = collect_files(&src)?
        .into_iter()
        .filter(|f| is_scanned(f, &src))
        .collect();
    let min_sdk = ctx
        .store
        .details(ctx.scan.id, ctx.file.id)
        .and_then(|d| d.min_sdk);
    info!(
        "applying {} rules to {} files of scan {}",
        rules.len(),
        files.len(),
        ctx.scan.id
    );

    let total = files.len() as u64;
    let mut templates = Vec::with_capacity(rules.len());
    for rule in &rules {
        templates.push(
            ctx.store.get_or_create_template(
                FindingTemplate::new(rule.label(), rule.severity())
                    .with_description(rule.description())
                    .with_risk(rule.risk())
                    .with_mitigation(rule.mitigation()),
            )?,
        );
    }

    let mut found = 0;
    let mut hosts = BTreeSet::new();
    for (i, path) in files.iter().enumerate() {
        let _ = observer.update_with(
            format!("analyzing {}", path.display()),
            Progress::at(i as u64, total),
        );
        let code = match fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!("could not read `{}`: {}", path.display(), e);
                continue;
            }
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        for (rule, template) in rules.iter().zip(&templates) {
            if let (Some(max_sdk), Some(min_sdk)) = (rule.max_sdk(), min_sdk) {
                if max_sdk < min_sdk {
                    continue;
                }
            }
            if !rule.has_to_check(&file_name) {
                continue;
            }
            for m in apply_rule(rule, &code) {
                let snippet = ctx
                    .store
                    .create_snippet(Snippet::for_file(path.clone(), m.lines()));
                let language = rule
                    .language()
                    .map(str::to_owned)
                    .unwrap_or_else(|| snippet.language.clone());
                let mut vulnerability = Vulnerability::new(
                    ctx.scan.id,
                    ctx.scanner.id,
                    Some(template.id),
                    rule.severity(),
                    language,
                );
                vulnerability.snippet = Some(snippet.id);
                let _ = ctx.store.add_vulnerability(vulnerability)?;
                found += 1;
            }
        }

        for host in extract_hosts(&code) {
            if hosts.insert(host.url.clone()) {
                let snippet = get_line(&code, &host.url).map(|line| {
                    ctx.store
                        .create_snippet(Snippet::for_file(path.clone(), (line + 1).to_string()))
                });
                let _ = ctx.store.add_host(Host {
                    id: 0,
                    scan: ctx.scan.id,
                    scanner: ctx.scanner.id,
                    classification: String::from("Not Set"),
                    ip: host.host.parse::<Ipv4Addr>().ok().map(|ip| ip.to_string()),
                    port: host.port,
                    protocol: host.protocol,
                    url: host.url,
                    snippet: snippet.map(|s| s.id),
                })?;
            }
        }
    }

    let _ = observer.success(format!(
        "{} vulnerabilities and {} hosts found in {} files",
        found,
        hosts.len(),
        files.len()
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{apply_rule, extract_hosts, is_scanned};
    use crate::{scanners::rule::parse_rules, severity::Severity};
    use std::path::Path;

    const CODE: &str = "package com.demo;\n\
                        class Crypto {\n\
                        \x20   String key = \"s3cr3t\";\n\
                        \x20   Cipher c = Cipher.getInstance(\"DES\");\n\
                        \x20   SecretKeySpec spec = new SecretKeySpec(key.getBytes(), \"DES\");\n\
                        \x20   String url = \"http://api.demo.com:8080/v1\";\n\
                        }\n";

    #[test]
    fn it_applies_rules() {
        let rules = parse_rules(
            r#"[{
                "label": "DES cipher",
                "description": "DES is broken.",
                "severity": "high",
                "regex": "Cipher\\.getInstance\\(\"(DES|RC4)\"\\)"
            }]"#,
            Severity::Info,
        )
        .unwrap();
        let matches = apply_rule(&rules[0], CODE);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].start_line, 3);
        assert_eq!(matches[0].lines(), "4");
    }

    #[test]
    fn it_follows_forward_checks() {
        let rules = parse_rules(
            r#"[{
                "label": "Hardcoded key",
                "description": "A string literal is used as key.",
                "severity": "high",
                "regex": "String (?P<fc1>\\w+) = \"",
                "forward_check": "SecretKeySpec\\({fc1}\\.getBytes"
            }]"#,
            Severity::Info,
        )
        .unwrap();
        let matches = apply_rule(&rules[0], CODE);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].start_line, 4);
    }

    #[test]
    fn it_honours_whitelists() {
        let rules = parse_rules(
            r#"[{
                "label": "Cipher",
                "description": "Cipher usage.",
                "severity": "low",
                "regex": "Cipher\\.getInstance\\(\"\\w+\"\\)",
                "whitelist": ["DES"]
            }]"#,
            Severity::Info,
        )
        .unwrap();
        assert!(apply_rule(&rules[0], CODE).is_empty());
    }

    #[test]
    fn it_extracts_hosts() {
        let hosts = extract_hosts(CODE);
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].host, "api.demo.com");
        assert_eq!(hosts[0].port, Some(8080));
        assert_eq!(hosts[0].protocol, "http");
        assert_eq!(hosts[0].url, "http://api.demo.com:8080/v1");
    }

    #[test]
    fn it_skips_framework_sources() {
        let root = Path::new("/tmp/src");
        assert!(is_scanned(&root.join("com/demo/Main.java"), root));
        assert!(!is_scanned(&root.join("androidx/core/App.java"), root));
        assert!(!is_scanned(&root.join("com/demo/logo.png"), root));
    }
}
