//! Discovery of pending queue files.
//!
//! The inbound collector writes each finished message as
//! `<prefix><nanosecond timestamp><suffix>` into the queue directory.  A
//! dispatcher run works on a single snapshot of that directory taken at
//! startup; files arriving later wait for the next run.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// The naming convention queue files follow
#[derive(Debug, Clone, PartialEq)]
pub struct FilePattern {
    pub prefix: String,
    pub suffix: String,
}

impl FilePattern {
    pub fn new<P: Into<String>, S: Into<String>>(prefix: P, suffix: S) -> FilePattern {
        FilePattern {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        name.len() >= self.prefix.len() + self.suffix.len()
            && name.starts_with(&*self.prefix)
            && name.ends_with(&*self.suffix)
    }

    /// The creation timestamp embedded between prefix and suffix, if the
    /// name carries one.
    pub fn timestamp(&self, name: &str) -> Option<u128> {
        if !self.matches(name) {
            return None;
        }
        let stamp = &name[self.prefix.len()..name.len() - self.suffix.len()];
        if stamp.is_empty() || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stamp.parse().ok()
    }
}

impl Default for FilePattern {
    fn default() -> FilePattern {
        FilePattern::new("mail-", ".eml")
    }
}

/// One pending message in the queue directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFile {
    pub path: PathBuf,
    pub name: String,
    pub timestamp: Option<u128>,
}

impl Ord for QueueFile {
    // Oldest first; names without a timestamp go last.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.timestamp, other.timestamp) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.name.cmp(&other.name)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.name.cmp(&other.name),
        }
    }
}

impl PartialOrd for QueueFile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// List the queue files present in `dir` right now.
///
/// Fails only if the directory itself cannot be read; entries that vanish or
/// cannot be inspected while listing are skipped.
pub fn scan(dir: &Path, pattern: &FilePattern) -> Result<Vec<QueueFile>, Error> {
    let entries = fs::read_dir(dir).map_err(|e| Error::QueueDirectory {
        path: dir.display().to_string(),
        cause: e,
    })?;

    let mut files: Vec<QueueFile> = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable queue entry in {}: {}", dir.display(), e);
                continue;
            }
        };

        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue, // not ours: we only ever write ASCII names
        };
        if !pattern.matches(&name) {
            continue;
        }

        match entry.file_type() {
            Ok(ft) if ft.is_file() => {}
            Ok(_) => continue,
            Err(e) => {
                warn!("Skipping queue entry {}: {}", name, e);
                continue;
            }
        }

        files.push(QueueFile {
            path: entry.path(),
            timestamp: pattern.timestamp(&name),
            name,
        });
    }

    files.sort();
    debug!("Found {} queued file(s) in {}", files.len(), dir.display());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn pattern_matching() {
        let pattern = FilePattern::default();
        assert!(pattern.matches("mail-1700000000000000000.eml"));
        assert!(!pattern.matches("mail-1700000000000000000.eml.tmp"));
        assert!(!pattern.matches("other-1.eml"));
        assert!(!pattern.matches("mail.eml"));
        assert_eq!(pattern.timestamp("mail-42.eml"), Some(42));
        assert_eq!(pattern.timestamp("mail-abc.eml"), None);
        assert_eq!(pattern.timestamp("mail-.eml"), None);
    }

    #[test]
    fn scan_lists_matching_files_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        for name in &[
            "mail-300.eml",
            "mail-20.eml",
            "mail-1000.eml",
            "notes.txt",
            "mail-x.eml",
        ] {
            File::create(dir.path().join(name)).unwrap();
        }
        fs::create_dir(dir.path().join("mail-5.eml")).unwrap();

        let files = scan(dir.path(), &FilePattern::default()).unwrap();
        let names: Vec<&str> = files.iter().map(|f| &*f.name).collect();
        assert_eq!(
            names,
            vec!["mail-20.eml", "mail-300.eml", "mail-1000.eml", "mail-x.eml"]
        );
        assert_eq!(files[0].path, dir.path().join("mail-20.eml"));
    }

    #[test]
    fn scan_of_empty_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan(dir.path(), &FilePattern::default()).unwrap().is_empty());
    }

    #[test]
    fn unreadable_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        match scan(&missing, &FilePattern::default()) {
            Err(Error::QueueDirectory { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
