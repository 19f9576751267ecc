//! Browsable tree of a prepared scan.
//!
//! Nodes are shaped for tree widgets: `text`, `type`, `li_attr` with the path relative to
//! the parent of the tree root, and `children` for folders. File types and languages come
//! from a fixed rule table matched against the file name.

use std::{
    fs,
    path::{Component, Path},
};

use failure::ResultExt;
use regex::Regex;

use crate::Result;

/// Type of a folder without a more specific rule.
pub const FOLDER: &str = "folder";
/// Type of a file without a more specific rule.
pub const ANY_TYPE: &str = "any_type";

struct FileRule {
    file_type: &'static str,
    is_dir: bool,
    pattern: Regex,
    language: &'static str,
}

impl FileRule {
    fn new(file_type: &'static str, is_dir: bool, pattern: &str, language: &'static str) -> Self {
        Self {
            file_type,
            is_dir,
            pattern: Regex::new(pattern).expect("invalid file rule regex"),
            language,
        }
    }
}

lazy_static! {
    static ref FILE_RULES: Vec<FileRule> = vec![
        FileRule::new("source_folder", true, r"^(src|smali|smali_classes\d+|java|sources)$", "text"),
        FileRule::new("resource_folder", true, r"^(res|assets)$", "text"),
        FileRule::new("java", false, r"(?i)\.java$", "java"),
        FileRule::new("kotlin", false, r"(?i)\.kts?$", "kotlin"),
        FileRule::new("smali", false, r"(?i)\.smali$", "smali"),
        FileRule::new("xml", false, r"(?i)\.xml$", "xml"),
        FileRule::new("json", false, r"(?i)\.json$", "json"),
        FileRule::new("properties", false, r"(?i)\.(properties|ya?ml|toml)$", "properties"),
        FileRule::new("dex", false, r"(?i)\.dex$", "text"),
        FileRule::new("library", false, r"(?i)\.so$", "text"),
        FileRule::new("image", false, r"(?i)\.(png|jpe?g|gif|webp|svg)$", "text"),
    ];
}

/// Attributes of a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeAttributes {
    /// Path from the folder containing the tree root, with `/` separators.
    pub path: String,
    #[serde(rename = "is-dir")]
    pub is_dir: bool,
    /// Language used to highlight the file.
    pub language: String,
}

/// One file or folder of the tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileNode {
    pub text: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub li_attr: NodeAttributes,
    /// Entries of a folder, ordered by name. Files have none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

/// Builds the tree rooted at `root`.
///
/// Symbolic links are listed but never followed.
pub fn apply_rules(root: &Path) -> Result<FileNode> {
    let base = root.parent().unwrap_or_else(|| Path::new(""));
    let is_dir = fs::metadata(root)
        .with_context(|_| format!("could not read `{}`", root.display()))?
        .is_dir();
    visit(root, base, is_dir)
}

fn visit(path: &Path, base: &Path, is_dir: bool) -> Result<FileNode> {
    let mut node = describe(path, base, is_dir);
    if !is_dir {
        return Ok(node);
    }

    let mut entries = Vec::new();
    for entry in
        fs::read_dir(path).with_context(|_| format!("could not list `{}`", path.display()))?
    {
        let entry = entry.with_context(|_| format!("could not list `{}`", path.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|_| format!("could not read `{}`", entry.path().display()))?;
        entries.push((entry.path(), file_type.is_dir()));
    }
    entries.sort();

    let mut children = Vec::with_capacity(entries.len());
    for (child, child_is_dir) in entries {
        children.push(visit(&child, base, child_is_dir)?);
    }
    node.children = Some(children);
    Ok(node)
}

fn describe(path: &Path, base: &Path, is_dir: bool) -> FileNode {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (file_type, language) = FILE_RULES
        .iter()
        .find(|r| r.is_dir == is_dir && r.pattern.is_match(&name))
        .map_or_else(
            || (if is_dir { FOLDER } else { ANY_TYPE }, "text"),
            |r| (r.file_type, r.language),
        );

    FileNode {
        text: name,
        file_type: file_type.to_owned(),
        li_attr: NodeAttributes {
            path: relative_path(path, base),
            is_dir,
            language: language.to_owned(),
        },
        children: None,
    }
}

fn relative_path(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
