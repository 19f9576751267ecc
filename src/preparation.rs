//! Preparation of the scan working tree.
//!
//! Before any scanner runs, the uploaded package is verified and unpacked into
//! `<projects>/<project>/<md5>/`, with the raw artifacts in `contents/` and decompiled
//! sources in `src/`.

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use failure::{Error, ResultExt};
use regex::Regex;
use zip::ZipArchive;

use crate::{
    checksum::FileDigest,
    config::Config,
    error::Kind,
    store::{project_dir, Scan, UploadedFile},
    tools::{Invocation, ToolRunner},
    Result,
};

lazy_static! {
    static ref APK_NAME: Regex = Regex::new(r"(?i).*\.apk$").expect("invalid APK regex");
}

/// Working tree of a prepared scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTree {
    root: PathBuf,
}

impl PreparedTree {
    /// Gets the tree of the given file, whether it was prepared or not.
    pub fn for_file(config: &Config, scan: &Scan, file: &UploadedFile) -> Self {
        Self {
            root: project_dir(config.projects_folder(), scan.project).join(&file.md5),
        }
    }

    /// Gets the tree of a stored upload, next to its copy in the project folder.
    pub fn of_upload(file: &UploadedFile) -> Self {
        let dir = file.file_path.parent().unwrap_or_else(|| Path::new(""));
        Self {
            root: dir.join(&file.md5),
        }
    }

    /// Root of the tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder with the raw extracted artifacts.
    pub fn contents(&self) -> PathBuf {
        self.root.join("contents")
    }

    /// Folder with decompiled sources.
    pub fn src(&self) -> PathBuf {
        self.root.join("src")
    }
}

/// Extraction strategy of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileHandler {
    /// Android package: resources with apktool, then smali and Java sources.
    Android,
    /// Generic archive, extracted as is.
    Archive,
}

impl FileHandler {
    /// Selects the handler for the given file name and scan type.
    pub fn select(file_name: &str, scan_type: &str) -> Self {
        if APK_NAME.is_match(file_name) || scan_type.eq_ignore_ascii_case("android") {
            FileHandler::Android
        } else {
            FileHandler::Archive
        }
    }
}

/// Prepares the working tree of a scan.
///
/// Verifies the checksums of the upload, creates the tree and runs the extraction tool
/// chain. Any tool failure aborts the preparation.
pub fn prepare(
    config: &Config,
    tools: &dyn ToolRunner,
    scan: &Scan,
    file: &UploadedFile,
) -> Result<PreparedTree> {
    let digest = FileDigest::from_path(&file.file_path)?;
    verify(file, &digest)?;

    let tree = PreparedTree::for_file(config, scan, file);
    for dir in &[tree.contents(), tree.src()] {
        fs::create_dir_all(dir)
            .with_context(|_| format!("could not create the folder `{}`", dir.display()))?;
    }

    let handler = FileHandler::select(&file.file_name, &scan.scan_type);
    info!(
        "preparing `{}` ({:?}) in {}",
        file.file_name,
        handler,
        tree.root().display()
    );
    match handler {
        FileHandler::Android => prepare_android(config, tools, &file.file_path, &tree)?,
        FileHandler::Archive => extract_archive(&file.file_path, &tree.contents())?,
    }

    Ok(tree)
}

fn verify(file: &UploadedFile, digest: &FileDigest) -> Result<()> {
    let pairs = [
        ("MD5", file.md5.as_str(), digest.md5()),
        ("SHA-1", file.sha1.as_str(), digest.sha1()),
        ("SHA-256", file.sha256.as_str(), digest.sha256()),
    ];
    for (name, stored, computed) in &pairs {
        if !stored.is_empty() && !stored.eq_ignore_ascii_case(computed) {
            return Err(Kind::Checksum {
                path: file.file_path.display().to_string(),
                message: format!(
                    "{} mismatch: expected {}, found {}",
                    name, stored, computed
                ),
            }
            .into());
        }
    }
    Ok(())
}

fn prepare_android(
    config: &Config,
    tools: &dyn ToolRunner,
    package: &Path,
    tree: &PreparedTree,
) -> Result<()> {
    let contents = tree.contents();
    let _ = tools.run(
        &Invocation::new(config.apktool())
            .arg("d")
            .path_arg(package)
            .arg("-o")
            .path_arg(&contents)
            .arg("-f")
            .arg("--no-src"),
    )?;
    debug!("resources extracted to {}", contents.display());

    let smali = tree.src().join("smali");
    fs::create_dir_all(&smali)?;
    for dex in dex_files(&contents)? {
        let _ = tools.run(
            &Invocation::new(config.dex2smali())
                .path_arg(&dex)
                .arg("-o")
                .path_arg(&smali),
        )?;
    }

    let java = tree.src().join("java");
    let _ = tools.run(
        &Invocation::new(config.jadx())
            .arg("-d")
            .path_arg(&java)
            .arg("--no-res")
            .path_arg(package),
    )?;
    debug!("sources decompiled to {}", tree.src().display());
    Ok(())
}

/// Lists the `.dex` files at the top level of the given folder, sorted by name.
fn dex_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |e| e == "dex") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|e| extraction_error(archive, &e))?;
    let mut zip = ZipArchive::new(file).map_err(|e| extraction_error(archive, &e))?;
    zip.extract(dest)
        .map_err(|e| extraction_error(archive, &e))?;
    debug!("{} entries extracted to {}", zip.len(), dest.display());
    Ok(())
}

fn extraction_error<E: std::fmt::Display>(archive: &Path, error: &E) -> Error {
    Kind::Extraction {
        message: format!("{}: {}", archive.display(), error),
    }
    .into()
}
