use crate::core::transfer::FileSet;
use crate::db;
use anyhow::{Result, bail};
use rusqlite::Connection;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Where ingest stored one instance: `root/study/series/sop + extension`.
///
/// Each uid must be a single plain path component, so the result always
/// stays under `storage_root`.
pub fn instance_path(
    storage_root: &Path,
    study_instance_uid: &str,
    series_instance_uid: &str,
    sop_instance_uid: &str,
    extension: &str,
) -> Result<PathBuf> {
    let file_name = format!("{}{}", sop_instance_uid, extension);
    for part in [study_instance_uid, series_instance_uid, file_name.as_str()] {
        ensure_plain_component(part)?;
    }
    Ok(storage_root
        .join(study_instance_uid)
        .join(series_instance_uid)
        .join(file_name))
}

fn ensure_plain_component(part: &str) -> Result<()> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == part => Ok(()),
        _ => bail!("unsafe path component {:?}", part),
    }
}

/// Builds the file set for a study. Any traversal error yields an empty set.
pub fn enumerate(
    conn: &Connection,
    storage_root: &Path,
    study_instance_uid: &str,
    extension: &str,
) -> FileSet {
    match collect_study_files(conn, storage_root, study_instance_uid, extension) {
        Ok(files) => {
            debug!(
                "Enumerated {} files for study {}",
                files.len(),
                study_instance_uid
            );
            files
        }
        Err(e) => {
            warn!(
                "Failed to enumerate files for study {}: {:#}",
                study_instance_uid, e
            );
            FileSet::new()
        }
    }
}

fn collect_study_files(
    conn: &Connection,
    storage_root: &Path,
    study_instance_uid: &str,
    extension: &str,
) -> Result<FileSet> {
    let studies = db::find_studies(conn, study_instance_uid)?;
    let Some(study) = studies.first() else {
        bail!("no study record for {}", study_instance_uid);
    };

    let mut files = FileSet::new();
    for series in db::list_series(conn, study.id)? {
        for instance in db::list_instances(conn, series.id)? {
            let path = instance_path(
                storage_root,
                study_instance_uid,
                &series.series_instance_uid,
                &instance.sop_instance_uid,
                extension,
            )?;
            files.insert(instance.sop_instance_uid, path);
        }
    }
    Ok(files)
}
