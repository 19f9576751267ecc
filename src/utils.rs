//! Utilities module.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use regex::Regex;

use crate::Result;

lazy_static! {
    static ref ID_SEPARATORS: Regex = Regex::new(r"[\s_:]").expect("invalid separator regex");
}

/// Builds the internal identifier of a finding template from its title.
///
/// Whitespace, underscores and colons are replaced by `-`, double hyphens are collapsed and
/// the result is lowercased.
pub fn make_internal_id<S: AsRef<str>>(title: S) -> String {
    let replaced = ID_SEPARATORS.replace_all(title.as_ref(), "-");
    replaced.replace("--", "-").to_lowercase()
}

/// Gets the code snippet around the given lines, five lines of context at each side.
pub fn get_code(code: &str, s_line: usize, e_line: usize) -> String {
    let mut result = String::new();
    for (i, text) in code.lines().enumerate() {
        if i >= (e_line + 5) {
            break;
        } else if (s_line >= 5 && i > s_line - 5) || (s_line < 5 && i < s_line + 5) {
            result.push_str(text);
            result.push('\n');
        }
    }
    result
}

/// Gets the zero based line of the given byte index in the text.
pub fn get_line_for(index: usize, text: &str) -> usize {
    let end = index.min(text.len());
    bytecount::count(&text.as_bytes()[..end], b'\n')
}

/// Gets the zero based line where the given needle first appears.
pub fn get_line<S: AsRef<str>>(code: &str, haystack: S) -> Option<usize> {
    code.lines()
        .position(|line| line.contains(haystack.as_ref()))
}

/// Collects every regular file below the given directory, recursively.
///
/// A missing directory yields an empty list.
pub fn collect_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.as_ref().is_dir() {
        return Ok(files);
    }
    collect_into(dir.as_ref(), &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_into(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let f_type = entry.file_type()?;
        if f_type.is_dir() {
            collect_into(&entry.path(), files)?;
        } else if f_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(())
}
