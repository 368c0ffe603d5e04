//! The crash corpus of one fuzz campaign, ordered by discovery.
//!
//! AFL-style engines name their findings `id:000000,sig:11,src:...`, so the
//! `id` field is the discovery rank. Files that do not follow the scheme are
//! kept after the ranked ones, in name order.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Name of the directory the engine puts crashing inputs in
pub const CRASHES_DIR: &str = "crashes";

/// Files the engine drops next to its findings
const IGNORED_FILES: &[&str] = &["README.txt"];

/// One crashing input found by the fuzz engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    id: String,
    path: PathBuf,
    rank: Option<u64>,
}

impl CrashRecord {
    /// Creates a record for the file at `path`, parsing its discovery rank from the name
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let rank = parse_rank(&id);
        Self { id, path, rank }
    }

    /// The file name, as given by the engine
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Where the crashing bytes live
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Discovery rank, if the name carries one
    #[must_use]
    pub fn rank(&self) -> Option<u64> {
        self.rank
    }

    /// Reads the crashing input
    pub fn bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(fs::read(&self.path)?)
    }

    fn order_key(&self) -> (u64, &str) {
        (self.rank.unwrap_or(u64::MAX), self.id.as_str())
    }
}

/// Parses the `id:NNNNNN` prefix of an engine file name
fn parse_rank(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("id:").or_else(|| name.strip_prefix("id_"))?;
    let digits: &str = rest.split([',', '_']).next()?;
    digits.parse().ok()
}

/// The crashing inputs of a single campaign.
///
/// Records stay on disk for the whole session; nothing here deletes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrashCorpus {
    root: PathBuf,
    records: Vec<CrashRecord>,
}

impl CrashCorpus {
    /// Loads the findings of the campaign whose output directory is `out_dir`.
    ///
    /// Looks at `out_dir/crashes` and at every `out_dir/<instance>/crashes`;
    /// a missing crash directory simply means no crashes.
    pub fn load<P: AsRef<Path>>(out_dir: P) -> Result<Self, Error> {
        let out_dir = out_dir.as_ref();
        let mut records = vec![];
        for dir in crash_dirs(out_dir)? {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') || IGNORED_FILES.contains(&name.as_ref()) {
                    continue;
                }
                records.push(CrashRecord::new(path));
            }
        }
        Ok(Self::from_records(out_dir.to_path_buf(), records))
    }

    /// Builds a corpus from already known records, sorting them by discovery order
    #[must_use]
    pub fn from_records(root: PathBuf, mut records: Vec<CrashRecord>) -> Self {
        records.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Self { root, records }
    }

    /// The campaign output directory this corpus was loaded from
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of crashing inputs
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` if the campaign found nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, earliest discovery first
    pub fn iter(&self) -> impl Iterator<Item = &CrashRecord> {
        self.records.iter()
    }

    /// The `limit` earliest-discovered records
    #[must_use]
    pub fn first(&self, limit: usize) -> &[CrashRecord] {
        &self.records[..limit.min(self.records.len())]
    }
}

fn crash_dirs(out_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut dirs = vec![];
    if !out_dir.is_dir() {
        return Ok(dirs);
    }
    let direct = out_dir.join(CRASHES_DIR);
    if direct.is_dir() {
        dirs.push(direct);
    }
    let mut instances = fs::read_dir(out_dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path().join(CRASHES_DIR))
        .filter(|dir| dir.is_dir())
        .collect::<Vec<_>>();
    instances.sort();
    dirs.extend(instances);
    Ok(dirs)
}
