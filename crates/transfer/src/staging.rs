use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::StagingError;

/// File extension used for every staging file.
pub const STAGING_EXTENSION: &str = "upload";

/// Name prefix of per-session subdirectories.
const SESSION_PREFIX: &str = "session-";

// ---------------------------------------------------------------------------
// StagingArea
// ---------------------------------------------------------------------------

/// A directory holding per-attempt payload copies.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Opens (and creates if needed) the staging directory at `dir`.
    pub fn open(dir: &Path) -> Result<Self, StagingError> {
        if dir.exists() && !dir.is_dir() {
            return Err(StagingError::InvalidDir(format!(
                "not a directory: {}",
                dir.display()
            )));
        }
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Returns the staging directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates a fresh `session-<uuid>` subdirectory owned by one caller.
    ///
    /// Concurrent users of the same root stage into separate sessions, so
    /// none of them ever touches another's files.
    pub fn session(&self) -> Result<Self, StagingError> {
        let dir = self
            .dir
            .join(format!("{SESSION_PREFIX}{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir(&dir)?;
        debug!(dir = %dir.display(), "opened staging session");
        Ok(Self { dir })
    }

    /// Removes the directory if it is empty. A missing directory is fine.
    pub async fn close(&self) -> Result<(), StagingError> {
        match tokio::fs::remove_dir(&self.dir).await {
            Ok(()) => {
                debug!(dir = %self.dir.display(), "closed staging directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes `data` to a fresh staging file for `key`/`attempt`.
    ///
    /// The file name is `<key>-<attempt>-<uuid>.upload`, so two attempts never
    /// share a path even when an earlier one is still being torn down. A
    /// partially written file is removed before the error is returned.
    pub async fn stage(
        &self,
        key: &str,
        attempt: u32,
        data: &[u8],
    ) -> Result<StagingFile, StagingError> {
        validate_key(key)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let name = format!(
            "{key}-{attempt}-{}.{STAGING_EXTENSION}",
            uuid::Uuid::new_v4().simple()
        );
        let path = self.dir.join(name);

        if let Err(e) = write_new(&path, data).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e.into());
        }

        debug!(path = %path.display(), bytes = data.len(), "staged payload");
        Ok(StagingFile {
            path: Some(path),
            len: data.len() as u64,
        })
    }

    /// Lists staging files currently present in the directory.
    pub fn staged_files(&self) -> Result<Vec<PathBuf>, StagingError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if is_staging_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Removes staging files whose last modification is at least `max_age` ago.
    ///
    /// Covers files directly in the directory and in every `session-*`
    /// subdirectory. A session directory that was already idle for `max_age`
    /// is removed once empty. `max_age` must exceed the longest expected
    /// transfer: live sessions of other processes are only protected by the
    /// age of their files. Returns the number of files removed.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<usize, StagingError> {
        let now = SystemTime::now();
        let mut removed = sweep_files(self.staged_files()?, now, max_age);

        for session in self.session_dirs()? {
            let idle = is_stale(&session, now, max_age);
            let files = match (StagingArea { dir: session.clone() }).staged_files() {
                Ok(files) => files,
                Err(e) => {
                    warn!(dir = %session.display(), error = %e, "cannot list staging session");
                    continue;
                }
            };
            removed += sweep_files(files, now, max_age);

            if idle {
                match std::fs::remove_dir(&session) {
                    Ok(()) => debug!(dir = %session.display(), "removed idle staging session"),
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::NotFound | std::io::ErrorKind::DirectoryNotEmpty
                        ) => {}
                    Err(e) => {
                        warn!(dir = %session.display(), error = %e, "cannot remove staging session")
                    }
                }
            }
        }

        if removed > 0 {
            debug!(dir = %self.dir.display(), removed, "swept stale staging files");
        }
        Ok(removed)
    }

    fn session_dirs(&self) -> Result<Vec<PathBuf>, StagingError> {
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_session = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(SESSION_PREFIX));
            if is_session && path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

fn is_stale(path: &Path, now: SystemTime, max_age: Duration) -> bool {
    match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => now.duration_since(modified).unwrap_or_default() >= max_age,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot stat staging entry");
            false
        }
    }
}

fn sweep_files(files: Vec<PathBuf>, now: SystemTime, max_age: Duration) -> usize {
    let mut removed = 0;
    for path in files {
        if !is_stale(&path, now, max_age) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot remove stale staging file")
            }
        }
    }
    removed
}

async fn write_new(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

fn is_staging_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == STAGING_EXTENSION)
}

/// Keys become part of a file name and must be a single plain component.
fn validate_key(key: &str) -> Result<(), StagingError> {
    if key.is_empty() {
        return Err(StagingError::InvalidKey("empty key".into()));
    }
    let mut components = Path::new(key).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(StagingError::InvalidKey(format!(
            "key must be a single path component: {key}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// StagingFile
// ---------------------------------------------------------------------------

/// Exclusive handle to one staged payload copy.
///
/// [`release`](Self::release) consumes the handle, so a file can only be
/// released once. A handle dropped without release removes its file
/// synchronously.
#[derive(Debug)]
pub struct StagingFile {
    path: Option<PathBuf>,
    len: u64,
}

impl StagingFile {
    /// Path of the staged copy.
    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or(Path::new(""))
    }

    /// Size of the staged payload in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the staged payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Deletes the staged copy. A file that is already gone counts as released.
    pub async fn release(mut self) -> Result<(), StagingError> {
        let Some(path) = self.path.take() else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "released staging file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "failed to remove dropped staging file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn area() -> (TempDir, StagingArea) {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::open(&dir.path().join("staging")).unwrap();
        (dir, area)
    }

    #[test]
    fn open_creates_directory() {
        let (_tmp, area) = area();
        assert!(area.dir().is_dir());
    }

    #[test]
    fn open_rejects_regular_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            StagingArea::open(&file),
            Err(StagingError::InvalidDir(_))
        ));
    }

    #[tokio::test]
    async fn stage_writes_payload() {
        let (_tmp, area) = area();
        let staged = area.stage("42", 0, b"hello world").await.unwrap();

        assert_eq!(staged.len(), 11);
        assert_eq!(std::fs::read(staged.path()).unwrap(), b"hello world");
        let name = staged.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("42-0-"));
        assert!(name.ends_with(".upload"));
    }

    #[tokio::test]
    async fn stage_never_reuses_paths() {
        let (_tmp, area) = area();
        let a = area.stage("7", 1, b"a").await.unwrap();
        let b = area.stage("7", 1, b"b").await.unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(area.staged_files().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stage_rejects_path_like_keys() {
        let (_tmp, area) = area();
        assert!(area.stage("", 0, b"x").await.is_err());
        assert!(area.stage("../escape", 0, b"x").await.is_err());
        assert!(area.stage("a/b", 0, b"x").await.is_err());
    }

    #[tokio::test]
    async fn stage_recreates_vanished_directory() {
        let (_tmp, area) = area();
        std::fs::remove_dir_all(area.dir()).unwrap();
        let staged = area.stage("1", 0, b"x").await.unwrap();
        assert!(staged.path().exists());
    }

    #[tokio::test]
    async fn stage_fails_when_directory_is_blocked() {
        let (_tmp, area) = area();
        std::fs::remove_dir_all(area.dir()).unwrap();
        std::fs::write(area.dir(), b"not a directory").unwrap();
        assert!(matches!(
            area.stage("1", 0, b"x").await,
            Err(StagingError::Io(_))
        ));
    }

    #[tokio::test]
    async fn sessions_are_separate_directories() {
        let (_tmp, root) = area();
        let a = root.session().unwrap();
        let b = root.session().unwrap();
        assert_ne!(a.dir(), b.dir());
        assert_eq!(a.dir().parent(), Some(root.dir()));

        let staged = a.stage("1", 1, b"data").await.unwrap();
        assert!(b.staged_files().unwrap().is_empty());
        assert_eq!(a.staged_files().unwrap(), vec![staged.path().to_path_buf()]);
    }

    #[tokio::test]
    async fn close_removes_only_empty_sessions() {
        let (_tmp, root) = area();
        let session = root.session().unwrap();
        let staged = session.stage("1", 1, b"data").await.unwrap();

        assert!(session.close().await.is_err());
        assert!(session.dir().is_dir());

        staged.release().await.unwrap();
        session.close().await.unwrap();
        assert!(!session.dir().exists());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn sweep_covers_abandoned_sessions() {
        let (_tmp, root) = area();
        let session = root.session().unwrap();
        let staged = session.stage("3", 2, b"leftover").await.unwrap();
        let leftover = staged.path().to_path_buf();
        std::mem::forget(staged);

        let removed = root.sweep_stale(Duration::ZERO).unwrap();

        assert_eq!(removed, 1);
        assert!(!leftover.exists());
        assert!(!session.dir().exists());
    }

    #[tokio::test]
    async fn sweep_keeps_recent_session_files() {
        let (_tmp, root) = area();
        let session = root.session().unwrap();
        let staged = session.stage("3", 1, b"live").await.unwrap();

        let removed = root.sweep_stale(Duration::from_secs(3600)).unwrap();

        assert_eq!(removed, 0);
        assert!(staged.path().exists());
        assert!(session.dir().is_dir());
    }

    #[tokio::test]
    async fn release_removes_file() {
        let (_tmp, area) = area();
        let staged = area.stage("1", 0, b"data").await.unwrap();
        let path = staged.path().to_path_buf();

        staged.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn release_tolerates_missing_file() {
        let (_tmp, area) = area();
        let staged = area.stage("1", 0, b"data").await.unwrap();
        std::fs::remove_file(staged.path()).unwrap();
        staged.release().await.unwrap();
    }

    #[tokio::test]
    async fn drop_removes_unreleased_file() {
        let (_tmp, area) = area();
        let staged = area.stage("1", 0, b"data").await.unwrap();
        let path = staged.path().to_path_buf();

        drop(staged);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn sweep_removes_only_staging_files() {
        let (_tmp, area) = area();
        let staged = area.stage("1", 0, b"leftover").await.unwrap();
        let leftover = staged.path().to_path_buf();
        // Simulate a previous process: forget the handle so Drop doesn't run.
        std::mem::forget(staged);
        std::fs::write(area.dir().join("notes.txt"), b"keep").unwrap();

        let removed = area.sweep_stale(Duration::ZERO).unwrap();

        assert_eq!(removed, 1);
        assert!(!leftover.exists());
        assert!(area.dir().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn sweep_keeps_recent_files() {
        let (_tmp, area) = area();
        let staged = area.stage("1", 0, b"fresh").await.unwrap();

        let removed = area.sweep_stale(Duration::from_secs(3600)).unwrap();

        assert_eq!(removed, 0);
        assert!(staged.path().exists());
    }
}
