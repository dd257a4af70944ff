//! Archive discovery and safe extraction into the staging area

use crate::error::{IngestError, Result};
use crate::profile::DatasetProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zip::ZipArchive;

const TABULAR_EXTENSIONS: &[&str] = &["txt", "csv", "tsv"];

// ============================================================================
// Discovery
// ============================================================================

/// An archive selected for this run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInput {
    /// Arrival order: input directory order, then name within a directory
    pub index: usize,
    /// Archive file name
    pub name: String,
    pub path: PathBuf,
    /// Name qualified by its directory when the same name arrives twice
    pub label: String,
}

impl ArchiveInput {
    /// File stem used to name per-source outputs
    pub fn stem(&self) -> String {
        Path::new(&self.label)
            .with_extension("")
            .to_string_lossy()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect()
    }
}

/// Find the dataset's archives in each input directory
///
/// Canonical release names win when any are present; otherwise every zip whose
/// name contains one of the profile's discovery terms is taken.
pub fn discover_archives(dirs: &[PathBuf], profile: &DatasetProfile) -> Result<Vec<ArchiveInput>> {
    let mut found: Vec<(PathBuf, String)> = Vec::new();

    for dir in dirs {
        let mut names: Vec<String> = fs::read_dir(dir)
            .map_err(|e| IngestError::configuration(format!("cannot list {}: {}", dir.display(), e)))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();

        let expected: Vec<String> = names
            .iter()
            .filter(|name| profile.expected_archives.contains(&name.as_str()))
            .cloned()
            .collect();
        let selected = if expected.is_empty() {
            names.into_iter().filter(|name| profile.matches_archive_name(name)).collect()
        } else {
            expected
        };

        debug!(dir = %dir.display(), archives = selected.len(), "Scanned input directory");
        found.extend(selected.into_iter().map(|name| (dir.clone(), name)));
    }

    let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();
    for (_, name) in &found {
        *occurrences.entry(name.as_str()).or_default() += 1;
    }

    let archives = found
        .iter()
        .enumerate()
        .map(|(index, (dir, name))| {
            let label = if occurrences.get(name.as_str()).copied().unwrap_or(0) > 1 {
                let parent = dir
                    .file_name()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("dir{index}"));
                format!("{parent}/{name}")
            } else {
                name.clone()
            };
            ArchiveInput {
                index,
                name: name.clone(),
                path: dir.join(name),
                label,
            }
        })
        .collect();

    Ok(archives)
}

// ============================================================================
// Extraction
// ============================================================================

/// What happened to one archive member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberAction {
    Extracted,
    Overwritten,
    SkippedExisting,
    SkippedNonTabular,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDecision {
    /// Member name inside the archive
    pub member: String,
    pub action: MemberAction,
    /// Staged location; absent for skipped non-tabular members
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub bytes: u64,
}

impl MemberDecision {
    pub fn is_staged(&self) -> bool {
        self.path.is_some()
    }
}

/// Result of extracting one archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub staging_dir: PathBuf,
    pub decisions: Vec<MemberDecision>,
}

impl ExtractionOutcome {
    /// Staged tabular files in archive member order
    pub fn staged(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.decisions
            .iter()
            .filter_map(|d| d.path.as_deref().map(|p| (d.member.as_str(), p)))
    }

    pub fn count(&self, action: MemberAction) -> usize {
        self.decisions.iter().filter(|d| d.action == action).count()
    }
}

fn is_tabular(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| TABULAR_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Whether a raw member name could escape the extraction root
fn escapes_root(name: &str) -> bool {
    if name.starts_with('/') || name.starts_with('\\') || name.contains(':') {
        return true;
    }
    if name.split(['/', '\\']).any(|part| part == "..") {
        return true;
    }
    Path::new(name)
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
}

/// Extracts tabular members of release archives into a staging directory
#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    staging_root: PathBuf,
    overwrite: bool,
}

impl ArchiveExtractor {
    pub fn new(staging_root: impl Into<PathBuf>, overwrite: bool) -> Self {
        Self {
            staging_root: staging_root.into(),
            overwrite,
        }
    }

    /// Staging directory for one archive
    pub fn staging_dir_for(&self, archive: &ArchiveInput) -> PathBuf {
        self.staging_root.join(archive.stem())
    }

    /// Extract one archive
    ///
    /// Every member name is checked before anything is written, so an archive
    /// with a single unsafe member stages nothing at all.
    pub fn extract(&self, archive: &ArchiveInput, cancel: &CancellationToken) -> Result<ExtractionOutcome> {
        let file = File::open(&archive.path).map_err(|e| IngestError::extraction(&archive.label, e))?;
        let mut zip = ZipArchive::new(file).map_err(|e| {
            IngestError::extraction(&archive.label, format!("not a supported zip container: {e}"))
        })?;

        let mut members = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let entry = zip
                .by_index_raw(i)
                .map_err(|e| IngestError::extraction(&archive.label, e))?;
            let name = entry.name().to_string();
            let enclosed = match entry.enclosed_name() {
                Some(path) if !escapes_root(&name) => path,
                _ => {
                    return Err(IngestError::UnsafeArchiveMember {
                        archive: archive.label.clone(),
                        member: name,
                    });
                },
            };
            if !entry.is_dir() {
                members.push((i, name, enclosed));
            }
        }

        let staging_dir = self.staging_dir_for(archive);
        fs::create_dir_all(&staging_dir).map_err(|e| IngestError::extraction(&archive.label, e))?;

        let mut decisions = Vec::with_capacity(members.len());
        for (i, name, relative) in members {
            if cancel.is_cancelled() {
                return Err(IngestError::Interrupted);
            }
            if !is_tabular(&name) {
                debug!(archive = %archive.label, member = %name, "Skipping non-tabular member");
                decisions.push(MemberDecision {
                    member: name,
                    action: MemberAction::SkippedNonTabular,
                    path: None,
                    bytes: 0,
                });
                continue;
            }

            let target = staging_dir.join(&relative);
            let existed = target.exists();
            if existed && !self.overwrite {
                let bytes = fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
                info!(archive = %archive.label, member = %name, "Already extracted, skipping");
                decisions.push(MemberDecision {
                    member: name,
                    action: MemberAction::SkippedExisting,
                    path: Some(target),
                    bytes,
                });
                continue;
            }

            let mut entry = zip.by_index(i).map_err(|e| IngestError::extraction(&archive.label, e))?;
            let bytes = write_atomically(&target, &mut entry)
                .map_err(|e| IngestError::extraction(&archive.label, format!("member '{name}': {e}")))?;

            let action = if existed {
                MemberAction::Overwritten
            } else {
                MemberAction::Extracted
            };
            info!(archive = %archive.label, member = %name, bytes, ?action, "Staged member");
            decisions.push(MemberDecision {
                member: name,
                action,
                path: Some(target),
                bytes,
            });
        }

        if !decisions.iter().any(MemberDecision::is_staged) {
            warn!(archive = %archive.label, "Archive has no tabular members");
            return Err(IngestError::extraction(&archive.label, "archive contains no tabular members"));
        }

        Ok(ExtractionOutcome {
            staging_dir,
            decisions,
        })
    }
}

/// Stream a reader into `target` through a sibling temp file
fn write_atomically(target: &Path, reader: &mut impl io::Read) -> io::Result<u64> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = target.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".partial");
    let tmp = target.with_file_name(tmp_name);

    let result = copy_and_rename(reader, &tmp, target);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn copy_and_rename(reader: &mut impl io::Read, tmp: &Path, target: &Path) -> io::Result<u64> {
    let mut out = File::create(tmp)?;
    let bytes = io::copy(reader, &mut out)?;
    out.sync_all()?;
    fs::rename(tmp, target)?;
    Ok(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, data) in members {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn input(path: PathBuf) -> ArchiveInput {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        ArchiveInput {
            index: 0,
            label: name.clone(),
            name,
            path,
        }
    }

    #[test]
    fn test_discovery_prefers_expected_names() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "COMPLAINTS_RECEIVED_2025-2026.zip",
            "COMPLAINTS_RECEIVED_2020-2024.zip",
            "complaints_extra.zip",
            "notes.txt",
        ] {
            File::create(dir.path().join(name)).unwrap();
        }
        let found = discover_archives(&[dir.path().to_path_buf()], &DatasetProfile::complaints()).unwrap();
        let names: Vec<&str> = found.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["COMPLAINTS_RECEIVED_2020-2024.zip", "COMPLAINTS_RECEIVED_2025-2026.zip"]);
        assert_eq!(found[1].index, 1);
    }

    #[test]
    fn test_discovery_falls_back_to_terms_and_labels_duplicates() {
        let root = tempfile::tempdir().unwrap();
        let received = root.path().join("received");
        let redelivered = root.path().join("redelivered");
        fs::create_dir_all(&received).unwrap();
        fs::create_dir_all(&redelivered).unwrap();
        File::create(received.join("complaints_b.zip")).unwrap();
        File::create(received.join("complaints_a.zip")).unwrap();
        File::create(redelivered.join("complaints_a.zip")).unwrap();
        File::create(redelivered.join("recalls.zip")).unwrap();

        let found = discover_archives(&[received, redelivered], &DatasetProfile::complaints()).unwrap();
        let labels: Vec<&str> = found.iter().map(|a| a.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["received/complaints_a.zip", "complaints_b.zip", "redelivered/complaints_a.zip"]
        );
        assert_ne!(found[0].stem(), found[2].stem());
    }

    #[test]
    fn test_extracts_tabular_members_only() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("complaints_a.zip");
        write_zip(
            &archive,
            &[("FLAT_CMPL.txt", b"1\tACME\t2020\n"), ("README.pdf", b"%PDF"), ("sub/extra.CSV", b"a,b\n")],
        );
        let staging = dir.path().join("staging");
        let extractor = ArchiveExtractor::new(&staging, false);

        let outcome = extractor.extract(&input(archive), &CancellationToken::new()).unwrap();
        assert_eq!(outcome.count(MemberAction::Extracted), 2);
        assert_eq!(outcome.count(MemberAction::SkippedNonTabular), 1);
        let staged: Vec<&str> = outcome.staged().map(|(m, _)| m).collect();
        assert_eq!(staged, vec!["FLAT_CMPL.txt", "sub/extra.CSV"]);
        assert!(staging.join("complaints_a").join("sub").join("extra.CSV").exists());
        assert!(!staging.join("complaints_a").join("README.pdf").exists());
    }

    #[test]
    fn test_second_run_skips_existing_unless_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("complaints_a.zip");
        write_zip(&archive, &[("FLAT_CMPL.txt", b"1\tACME\t2020\n")]);
        let staging = dir.path().join("staging");
        let token = CancellationToken::new();

        let first = ArchiveExtractor::new(&staging, false).extract(&input(archive.clone()), &token).unwrap();
        let staged_path = first.staged().next().unwrap().1.to_path_buf();
        let before = fs::read(&staged_path).unwrap();

        let second = ArchiveExtractor::new(&staging, false).extract(&input(archive.clone()), &token).unwrap();
        assert_eq!(second.decisions[0].action, MemberAction::SkippedExisting);
        assert_eq!(fs::read(&staged_path).unwrap(), before);

        let third = ArchiveExtractor::new(&staging, true).extract(&input(archive), &token).unwrap();
        assert_eq!(third.decisions[0].action, MemberAction::Overwritten);
    }

    #[test]
    fn test_traversal_member_is_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("complaints_evil.zip");
        write_zip(&archive, &[("good.txt", b"1\n"), ("../../etc/passwd", b"root")]);
        let staging = dir.path().join("nested").join("staging");

        let err = ArchiveExtractor::new(&staging, false)
            .extract(&input(archive), &CancellationToken::new())
            .unwrap_err();
        match err {
            IngestError::UnsafeArchiveMember { member, .. } => assert_eq!(member, "../../etc/passwd"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!staging.exists());
        assert!(!dir.path().join("etc").exists());
    }

    #[test]
    fn test_corrupt_archive_is_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("complaints_bad.zip");
        fs::write(&archive, b"this is not a zip file").unwrap();
        let err = ArchiveExtractor::new(dir.path().join("staging"), false)
            .extract(&input(archive), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), "extraction_error");
    }

    #[test]
    fn test_escapes_root() {
        assert!(escapes_root("../x.txt"));
        assert!(escapes_root("a/../../x.txt"));
        assert!(escapes_root("/etc/passwd"));
        assert!(escapes_root("..\\..\\x.txt"));
        assert!(escapes_root("C:/x.txt"));
        assert!(!escapes_root("dir/file..txt"));
    }
}
