use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWriteExt};

/// A regular file under the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Path relative to the storage root, always `/`-separated
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

pub type FileReader = Box<dyn AsyncRead + Unpin + Send>;

#[async_trait]
pub trait StorageService: Send + Sync {
    /// Regular files directly inside `dir` (not recursive), sorted by path.
    async fn list_files(&self, dir: &str) -> Result<Vec<StoredFile>>;
    async fn dir_exists(&self, dir: &str) -> bool;
    async fn file_exists(&self, path: &str) -> Result<bool>;
    async fn open(&self, path: &str) -> Result<FileReader>;
    /// Writes `reader` to a new file in `dir` named after `filename`, picking
    /// another name if it is taken. Returns the stored relative path.
    async fn save<'a>(
        &self,
        dir: &str,
        filename: &str,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> Result<String>;
    async fn delete_file(&self, path: &str) -> Result<()>;
    fn url(&self, path: &str) -> String;
    /// Human readable location, used in logs and reports.
    fn display_path(&self, path: &str) -> String;
}

pub struct LocalStorageService {
    root: PathBuf,
    base_url: String,
}

impl LocalStorageService {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a relative storage path, refusing anything that would leave the root.
    pub fn absolute_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(anyhow!("Invalid storage path: {}", path));
        }
        Ok(self.root.join(relative))
    }
}

fn join_relative(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// `goblin.png` -> `goblin_Ab3dE9q.png`
fn alternate_name(filename: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(char::from)
        .collect();

    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, suffix, ext),
        _ => format!("{}_{}", filename, suffix),
    }
}

#[async_trait]
impl StorageService for LocalStorageService {
    async fn list_files(&self, dir: &str) -> Result<Vec<StoredFile>> {
        let abs_dir = self.absolute_path(dir)?;
        let mut entries = tokio::fs::read_dir(&abs_dir).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                tracing::warn!("Skipping non UTF-8 file name in {}", abs_dir.display());
                continue;
            };
            // follows symlinks, like a plain stat
            let metadata = match tokio::fs::metadata(entry.path()).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("Could not stat {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

            files.push(StoredFile {
                path: join_relative(dir, &name),
                size: metadata.len(),
                modified,
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn dir_exists(&self, dir: &str) -> bool {
        match self.absolute_path(dir) {
            Ok(p) => tokio::fs::metadata(p)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let abs = self.absolute_path(path)?;
        match tokio::fs::metadata(abs).await {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self, path: &str) -> Result<FileReader> {
        let abs = self.absolute_path(path)?;
        let file = tokio::fs::File::open(abs).await?;
        Ok(Box::new(file))
    }

    async fn save<'a>(
        &self,
        dir: &str,
        filename: &str,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> Result<String> {
        let abs_dir = self.absolute_path(dir)?;
        tokio::fs::create_dir_all(&abs_dir).await?;

        let mut name = filename.to_string();
        let mut attempts = 0;
        let (mut file, relative) = loop {
            let relative = join_relative(dir, &name);
            let abs = self.absolute_path(&relative)?;
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&abs)
                .await
            {
                Ok(file) => break (file, relative),
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempts < 16 => {
                    attempts += 1;
                    name = alternate_name(filename);
                }
                Err(e) => return Err(e.into()),
            }
        };

        let written = async {
            tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            drop(file);
            if let Ok(abs) = self.absolute_path(&relative) {
                let _ = tokio::fs::remove_file(abs).await;
            }
            return Err(anyhow!("Failed to write {}: {}", relative, e));
        }

        Ok(relative)
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let abs = self.absolute_path(path)?;
        tokio::fs::remove_file(abs).await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn display_path(&self, path: &str) -> String {
        self.root.join(path).display().to_string()
    }
}
