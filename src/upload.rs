//! Storage of uploaded scan targets.

use std::{fs, path::Path};

use failure::ResultExt;

use crate::{
    checksum::FileDigest,
    config::Config,
    store::{project_dir, Id, Store, UploadedFile},
    Result,
};

/// Internal name of an uploaded file: the MD5 of its original name.
pub fn internal_name(file_name: &str) -> String {
    format!("{:x}", md5::compute(file_name.as_bytes()))
}

/// Copies a file into the project folder and records it.
///
/// The copy is named `<md5 of the original name><.ext>`. Uploading the same name twice into
/// a project returns the record of the first upload. If that copy went missing, the new
/// source is stored in its place and the record takes its checksums and size.
pub fn store_upload(
    config: &Config,
    store: &Store,
    project: Id,
    source: &Path,
    original_name: &str,
) -> Result<UploadedFile> {
    let project = store.project(project)?;
    let internal = internal_name(original_name);
    let suffix = Path::new(original_name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let dir = project_dir(config.projects_folder(), project.id);
    let dest = dir.join(format!("{}{}", internal, suffix));

    if let Some(existing) = store.file_by_internal_name(project.id, &internal) {
        if dest.exists() {
            debug!("`{}` was already uploaded to {}", original_name, project.name);
            return Ok(existing);
        }

        warn!(
            "stored copy of `{}` is missing, copying it again",
            original_name
        );
        copy(source, &dir, &dest)?;
        let digest = FileDigest::from_path(&dest)?;
        return store.update_file(existing.id, |file| {
            file.md5 = digest.md5().to_owned();
            file.sha1 = digest.sha1().to_owned();
            file.sha256 = digest.sha256().to_owned();
            file.file_size = digest.size();
            file.file_path = dest;
        });
    }

    copy(source, &dir, &dest)?;
    let digest = FileDigest::from_path(&dest)?;
    info!(
        "stored `{}` ({} bytes, md5 {})",
        original_name,
        digest.size(),
        digest.md5()
    );

    store.insert_file(UploadedFile {
        id: 0,
        project: project.id,
        md5: digest.md5().to_owned(),
        sha1: digest.sha1().to_owned(),
        sha256: digest.sha256().to_owned(),
        file_name: original_name.to_owned(),
        file_size: digest.size(),
        file_path: dest,
        internal_name: internal,
    })
}

fn copy(source: &Path, dir: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|_| format!("could not create the folder `{}`", dir.display()))?;
    let _ = fs::copy(source, dest)
        .with_context(|_| format!("could not store `{}`", source.display()))?;
    Ok(())
}
