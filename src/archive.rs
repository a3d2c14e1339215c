//! Zip archive validation
//!
//! Portal archives are checked in three steps: the central directory has to
//! be readable (a truncated download fails here), every member is read to the
//! end so the zip reader verifies its CRC, and each waveform or metadata
//! member must start the way its format says it should. The content check is
//! shallow on purpose; records are never decoded.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::{DlTdvmsError, ValidationError};

type Result<T> = std::result::Result<T, DlTdvmsError>;

const SNIFF_LEN: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveVerdict {
    Ok { members: usize },
    Corrupt { reason: String },
}

impl ArchiveVerdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, ArchiveVerdict::Ok { .. })
    }

    fn corrupt(reason: impl Into<String>) -> Self {
        ArchiveVerdict::Corrupt {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ArchiveVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveVerdict::Ok { members } => write!(f, "ok ({} members)", members),
            ArchiveVerdict::Corrupt { reason } => write!(f, "corrupt: {}", reason),
        }
    }
}

/// Check one archive. Only failing to open the file is an error; anything
/// wrong with its contents is reported as [`ArchiveVerdict::Corrupt`].
pub fn verify<P: AsRef<Path>>(path: P) -> Result<ArchiveVerdict> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ValidationError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut archive = match zip::ZipArchive::new(file) {
        Ok(archive) => archive,
        Err(e) => return Ok(ArchiveVerdict::corrupt(format!("unreadable zip: {}", e))),
    };

    let mut members = 0;
    for i in 0..archive.len() {
        let mut entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(e) => return Ok(ArchiveVerdict::corrupt(format!("member {}: {}", i, e))),
        };
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();

        let mut head = Vec::with_capacity(SNIFF_LEN as usize);
        let sniffed = (&mut entry).take(SNIFF_LEN).read_to_end(&mut head);
        let read = sniffed.and_then(|_| io::copy(&mut entry, &mut io::sink()));
        if let Err(e) = read {
            return Ok(ArchiveVerdict::corrupt(format!("{}: {}", name, e)));
        }

        if let Some(problem) = sniff(&name, &head) {
            return Ok(ArchiveVerdict::corrupt(format!("{}: {}", name, problem)));
        }
        members += 1;
    }

    if members == 0 {
        return Ok(ArchiveVerdict::corrupt("archive is empty"));
    }
    tracing::debug!(members, "Archive ok: {}", path.display());
    Ok(ArchiveVerdict::Ok { members })
}

/// Member names of a readable archive
pub fn member_names<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ValidationError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let archive = zip::ZipArchive::new(file).map_err(|e| ValidationError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(archive.file_names().map(str::to_string).collect())
}

/// Zip files directly inside `dir`, sorted by name
pub fn zip_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut zips: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|source| ValidationError::Open {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|ext| ext.eq_ignore_ascii_case("zip"))
                    .unwrap_or(false)
        })
        .collect();
    zips.sort();
    Ok(zips)
}

/// Like [`verify`], but an archive that cannot be opened is corrupt too
pub fn check_file(path: &Path) -> Result<ArchiveVerdict> {
    let verdict = match verify(path) {
        Ok(verdict) => verdict,
        Err(DlTdvmsError::Validation(e)) => ArchiveVerdict::corrupt(e.to_string()),
        Err(e) => return Err(e),
    };
    if let ArchiveVerdict::Corrupt { reason } = &verdict {
        tracing::warn!("{} is corrupt: {}", path.display(), reason);
    }
    Ok(verdict)
}

/// Check `zips` in order, calling `on_checked` after each one
pub fn check_all<F>(zips: Vec<PathBuf>, mut on_checked: F) -> Result<Vec<(PathBuf, ArchiveVerdict)>>
where
    F: FnMut(&Path),
{
    let mut results = Vec::with_capacity(zips.len());
    for path in zips {
        let verdict = check_file(&path)?;
        on_checked(&path);
        results.push((path, verdict));
    }
    Ok(results)
}

/// Check every `*.zip` directly inside `dir`, sorted by file name
pub fn check_dir<P: AsRef<Path>>(dir: P) -> Result<Vec<(PathBuf, ArchiveVerdict)>> {
    check_all(zip_files(dir)?, |_| {})
}

/// Process exit status for a folder check: 1 if any archive is corrupt
pub fn exit_status(results: &[(PathBuf, ArchiveVerdict)]) -> u8 {
    if results.iter().all(|(_, verdict)| verdict.is_ok()) {
        0
    } else {
        1
    }
}

/// What is wrong with the start of a member, judged by its extension
fn sniff(name: &str, head: &[u8]) -> Option<String> {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("mseed") => {
            if head.len() < 8 {
                return Some("too short for a miniSEED record".to_string());
            }
            let sequence_ok = head[..6].iter().all(|b| b.is_ascii_digit() || *b == b' ');
            let quality_ok = matches!(head[6], b'D' | b'R' | b'Q' | b'M');
            if sequence_ok && quality_ok {
                None
            } else {
                Some("does not start with a miniSEED record header".to_string())
            }
        }
        Some("fseed") | Some("seed") => {
            if head.starts_with(b"000001V") {
                None
            } else {
                Some("does not start with a SEED volume header".to_string())
            }
        }
        Some("xml") => {
            let body = head.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(head);
            match body.iter().find(|b| !b.is_ascii_whitespace()) {
                Some(b'<') => None,
                _ => Some("not an XML document".to_string()),
            }
        }
        _ => None,
    }
}
