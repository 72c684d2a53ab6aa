use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;
use walkdir::WalkDir;

use crate::identity::RecoilElementIdentity;
use crate::seed::{parse_seed, validate_erd_file_names};
use crate::{Result, RunnerError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErdFileEntry {
    pub path: PathBuf,
    pub seed: i64,
    pub active: bool,
}

#[derive(Debug, Clone)]
struct SeedEntry {
    path: PathBuf,
    seed: i64,
}

#[derive(Debug, Default)]
struct Inner {
    // In add order; iteration walks it backwards.
    active: Vec<SeedEntry>,
    finalized: Vec<SeedEntry>,
    finalized_count: Option<u64>,
    // Bumped by every update(); lets readers detect a fold mid-count.
    epoch: u64,
}

impl Inner {
    fn contains(&self, seed: i64, path: &Path) -> bool {
        self.active
            .iter()
            .chain(self.finalized.iter())
            .any(|e| e.seed == seed || e.path == path)
    }
}

/// Output files of one recoil element, split into active files that live
/// workers are still appending to and finalized files whose line count is
/// folded into a cached total exactly once.
///
/// Finalized files are never re-read once their count is cached.
#[derive(Debug)]
pub struct ErdFileRegistry {
    identity: RecoilElementIdentity,
    inner: RwLock<Inner>,
    // Serializes add_active_file, update and the lazy cache fill. Lines are
    // never counted while `inner` is held.
    mutation: Mutex<()>,
}

impl ErdFileRegistry {
    pub fn new(identity: RecoilElementIdentity) -> Self {
        Self {
            identity,
            inner: RwLock::new(Inner::default()),
            mutation: Mutex::new(()),
        }
    }

    /// Registers every valid erd file among `names` as finalized.
    pub fn from_names<I, S>(names: I, identity: RecoilElementIdentity) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let accepted = validate_erd_file_names(names, &identity)
            .into_iter()
            .map(|(name, seed)| (PathBuf::from(name.as_ref()), seed))
            .collect();
        Self::from_accepted(accepted, identity)
    }

    /// Scans `dir` (not recursively) and registers matching files with their
    /// full path. Symlinks to files count; dangling ones are skipped. A
    /// missing directory gives an empty registry.
    pub fn from_directory(dir: &Path, identity: RecoilElementIdentity) -> Result<Self> {
        if !dir.exists() {
            return Ok(Self::new(identity));
        }
        let mut listing: BTreeMap<String, PathBuf> = BTreeMap::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| {
                RunnerError::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "directory walk failed")
                }))
            })?;
            let is_file = entry.file_type().is_file()
                || (entry.path_is_symlink() && entry.path().is_file());
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                listing.insert(name.to_string(), entry.path().to_path_buf());
            }
        }
        let accepted: Vec<(PathBuf, i64)> = validate_erd_file_names(listing.keys(), &identity)
            .into_iter()
            .filter_map(|(name, seed)| listing.get(name).map(|p| (p.clone(), seed)))
            .collect();
        debug!(dir = %dir.display(), files = accepted.len(), "scanned erd directory");
        Ok(Self::from_accepted(accepted, identity))
    }

    fn from_accepted(accepted: Vec<(PathBuf, i64)>, identity: RecoilElementIdentity) -> Self {
        let mut inner = Inner::default();
        for (path, seed) in accepted {
            if inner.contains(seed, &path) {
                debug!(seed, path = %path.display(), "skipping duplicate seed in listing");
                continue;
            }
            inner.finalized.push(SeedEntry { path, seed });
        }
        Self {
            identity,
            inner: RwLock::new(inner),
            mutation: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &RecoilElementIdentity {
        &self.identity
    }

    /// Registers a file a freshly spawned worker writes to. Fails with
    /// `DuplicateSeed` when the seed or the path is already registered.
    pub fn add_active_file(&self, path: impl Into<PathBuf>) -> Result<i64> {
        let path = path.into();
        let seed = parse_seed(&path.to_string_lossy())
            .ok_or_else(|| RunnerError::InvalidFileName(path.display().to_string()))?;
        let _guard = self.lock_mutation();
        let mut inner = self.write();
        if inner.contains(seed, &path) {
            return Err(RunnerError::DuplicateSeed { seed, path });
        }
        debug!(seed, path = %path.display(), "registered active erd file");
        inner.active.push(SeedEntry { path, seed });
        Ok(seed)
    }

    /// Snapshot of all entries: active newest first, then finalized in
    /// registration order. Each call starts over.
    pub fn iter(&self) -> impl Iterator<Item = ErdFileEntry> {
        self.entries().into_iter()
    }

    pub fn entries(&self) -> Vec<ErdFileEntry> {
        let inner = self.read();
        let active = inner.active.iter().rev().map(|e| ErdFileEntry {
            path: e.path.clone(),
            seed: e.seed,
            active: true,
        });
        let finalized = inner.finalized.iter().map(|e| ErdFileEntry {
            path: e.path.clone(),
            seed: e.seed,
            active: false,
        });
        active.chain(finalized).collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.read();
        inner.active.len() + inner.finalized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_len(&self) -> usize {
        self.read().active.len()
    }

    pub fn max_seed(&self) -> Option<i64> {
        let inner = self.read();
        inner
            .active
            .iter()
            .chain(inner.finalized.iter())
            .map(|e| e.seed)
            .max()
    }

    /// Current line total of active files. Always recounted.
    pub fn active_atom_count(&self) -> u64 {
        let paths = self.active_paths();
        sum_lines(&paths)
    }

    /// Cached line total of finalized files, computed on first use.
    pub fn finalized_atom_count(&self) -> u64 {
        if let Some(count) = self.read().finalized_count {
            return count;
        }
        let _guard = self.lock_mutation();
        self.ensure_finalized_count()
    }

    /// Active and finalized totals as one consistent pair: no line is in
    /// both, even while `update` runs concurrently.
    pub fn atom_counts(&self) -> (u64, u64) {
        loop {
            let (paths, finalized, epoch) = {
                let inner = self.read();
                let paths: Vec<PathBuf> = inner.active.iter().map(|e| e.path.clone()).collect();
                (paths, inner.finalized_count, inner.epoch)
            };
            let Some(finalized) = finalized else {
                let _guard = self.lock_mutation();
                self.ensure_finalized_count();
                continue;
            };
            let active = sum_lines(&paths);
            if self.read().epoch == epoch {
                return (active, finalized);
            }
        }
    }

    /// Folds the current line count of every active file into the finalized
    /// total and marks those files finalized. Returns the folded amount.
    pub fn update(&self) -> u64 {
        let _guard = self.lock_mutation();
        self.ensure_finalized_count();
        let paths = self.active_paths();
        let folded = sum_lines(&paths);

        let mut inner = self.write();
        let moved: Vec<SeedEntry> = inner.active.drain(..).collect();
        let moved_len = moved.len();
        inner.finalized.extend(moved);
        let total = inner.finalized_count.unwrap_or_default() + folded;
        inner.finalized_count = Some(total);
        inner.epoch += 1;
        debug!(
            identity = %self.identity,
            files = moved_len,
            folded,
            total,
            "finalized active erd files"
        );
        folded
    }

    // Caller must hold the mutation lock.
    fn ensure_finalized_count(&self) -> u64 {
        if let Some(count) = self.read().finalized_count {
            return count;
        }
        let paths: Vec<PathBuf> = self
            .read()
            .finalized
            .iter()
            .map(|e| e.path.clone())
            .collect();
        let count = sum_lines(&paths);
        self.write().finalized_count = Some(count);
        count
    }

    fn active_paths(&self) -> Vec<PathBuf> {
        self.read().active.iter().map(|e| e.path.clone()).collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_mutation(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Number of lines in `path`. A missing or unreadable file counts as 0.
pub fn count_lines(path: &Path) -> u64 {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return 0,
    };
    let mut count = 0;
    for chunk in BufReader::new(file).split(b'\n') {
        match chunk {
            Ok(_) => count += 1,
            Err(_) => break,
        }
    }
    count
}

fn sum_lines(paths: &[PathBuf]) -> u64 {
    paths.iter().map(|p| count_lines(p)).sum()
}
