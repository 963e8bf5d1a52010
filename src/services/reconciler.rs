use crate::config::AppConfig;
use crate::entities::{card_images, prelude::*};
use crate::services::storage::{StorageService, StoredFile};
use crate::utils::hash::{ContentHash, calculate_hash_from_reader};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryFilter,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Which file of a duplicate group survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum KeepStrategy {
    /// Earliest modification time
    #[default]
    Oldest,
    /// Latest modification time
    Newest,
    /// First relative path in byte order
    Lex,
}

impl fmt::Display for KeepStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oldest => f.write_str("oldest"),
            Self::Newest => f.write_str("newest"),
            Self::Lex => f.write_str("lex"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Media directory not found: {0}")]
    MediaDirMissing(String),

    #[error("Failed to list {dir}: {reason}")]
    Listing { dir: String, reason: String },
}

/// Result of hashing one file during the scan.
#[derive(Debug, Clone)]
pub enum HashOutcome {
    Hashed { file: StoredFile, hash: ContentHash },
    Skipped { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalAction {
    Deleted,
    WouldDelete,
    DeleteFailed(String),
    /// Not deleted because rows still point at it
    Retained(String),
}

#[derive(Debug, Clone)]
pub struct RemovedFile {
    pub path: String,
    /// Rows repointed to the keeper (or that would be, on a dry run)
    pub relinked: u64,
    /// Rows left pointing at this path after relinking failed; `None` when
    /// they could not even be counted
    pub unresolved: Option<u64>,
    pub relink_error: Option<String>,
    pub action: RemovalAction,
}

#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub hash: ContentHash,
    pub keeper: String,
    pub removed: Vec<RemovedFile>,
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub media_dir: String,
    pub confirm: bool,
    pub keep: KeepStrategy,
    pub scanned: usize,
    pub skipped: Vec<SkippedFile>,
    pub groups: Vec<DuplicateGroup>,
    pub duplicates_found: usize,
    pub rows_relinked: u64,
    pub files_deleted: usize,
    pub unresolved_references: u64,
    /// Files kept because their remaining references could not be counted
    pub uncounted_references: usize,
}

struct RelinkResult {
    relinked: u64,
    unresolved: Option<u64>,
    error: Option<String>,
}

/// Collapses byte-identical files in the card image directory into one file
/// per content hash and repoints card images at the survivor.
pub struct Reconciler {
    db: DatabaseConnection,
    storage: Arc<dyn StorageService>,
    config: AppConfig,
}

impl Reconciler {
    pub fn new(db: DatabaseConnection, storage: Arc<dyn StorageService>, config: AppConfig) -> Self {
        Self {
            db,
            storage,
            config,
        }
    }

    /// With `confirm == false` nothing is deleted or updated; the report
    /// describes what a confirmed run would do.
    pub async fn reconcile(
        &self,
        keep: KeepStrategy,
        confirm: bool,
    ) -> Result<ReconcileReport, ReconcileError> {
        let dir = self.config.image_dir.as_str();
        let media_dir = self.storage.display_path(dir);

        if !self.storage.dir_exists(dir).await {
            return Err(ReconcileError::MediaDirMissing(media_dir));
        }

        let files = self
            .storage
            .list_files(dir)
            .await
            .map_err(|e| ReconcileError::Listing {
                dir: media_dir.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            "🔍 Scanning {} files in {} (keep={}, confirm={})",
            files.len(),
            media_dir,
            keep,
            confirm
        );

        let mut report = ReconcileReport {
            media_dir,
            confirm,
            keep,
            scanned: files.len(),
            skipped: Vec::new(),
            groups: Vec::new(),
            duplicates_found: 0,
            rows_relinked: 0,
            files_deleted: 0,
            unresolved_references: 0,
            uncounted_references: 0,
        };

        let mut by_hash: BTreeMap<ContentHash, Vec<StoredFile>> = BTreeMap::new();
        for file in files {
            match self.hash_file(file).await {
                HashOutcome::Hashed { file, hash } => by_hash.entry(hash).or_default().push(file),
                HashOutcome::Skipped { path, reason } => {
                    tracing::warn!("Could not hash {}: {}", path, reason);
                    report.skipped.push(SkippedFile { path, reason });
                }
            }
        }

        for (hash, group) in by_hash.into_iter().filter(|(_, g)| g.len() > 1) {
            let Some(keeper) = select_keeper(&group, keep).map(|f| f.path.clone()) else {
                continue;
            };

            tracing::info!(
                "Group hash={}: keep {}, remove {} files",
                hash,
                keeper,
                group.len() - 1
            );

            let mut removed = Vec::new();
            for duplicate in group.iter().filter(|f| f.path != keeper) {
                let outcome = self.collapse(&duplicate.path, &keeper, confirm).await;

                report.duplicates_found += 1;
                report.rows_relinked += outcome.relinked;
                match outcome.unresolved {
                    Some(n) => report.unresolved_references += n,
                    None => report.uncounted_references += 1,
                }
                if outcome.action == RemovalAction::Deleted {
                    report.files_deleted += 1;
                }
                removed.push(outcome);
            }

            report.groups.push(DuplicateGroup {
                hash,
                keeper,
                removed,
            });
        }

        tracing::info!(
            "✅ Reconcile finished: {} duplicates, {} rows relinked, {} files deleted",
            report.duplicates_found,
            report.rows_relinked,
            report.files_deleted
        );

        Ok(report)
    }

    async fn hash_file(&self, file: StoredFile) -> HashOutcome {
        let reader = match self.storage.open(&file.path).await {
            Ok(r) => r,
            Err(e) => {
                return HashOutcome::Skipped {
                    path: file.path,
                    reason: e.to_string(),
                };
            }
        };

        match calculate_hash_from_reader(reader, self.config.chunk_size).await {
            Ok(hash) => HashOutcome::Hashed { file, hash },
            Err(e) => HashOutcome::Skipped {
                path: file.path,
                reason: e.to_string(),
            },
        }
    }

    /// Relinks rows from `duplicate` to `keeper`, then deletes `duplicate`.
    async fn collapse(&self, duplicate: &str, keeper: &str, confirm: bool) -> RemovedFile {
        let relink = if confirm {
            self.relink(duplicate, keeper).await
        } else {
            self.count_references(duplicate).await
        };

        // A file is only deleted once no row can still point at it
        let action = if !confirm {
            RemovalAction::WouldDelete
        } else if let Some(reason) = retention_reason(relink.unresolved) {
            tracing::warn!("Keeping {}: {}", duplicate, reason);
            RemovalAction::Retained(reason)
        } else {
            match self.storage.delete_file(duplicate).await {
                Ok(()) => {
                    tracing::info!("🗑️  Deleted {} (relinked {} DB rows)", duplicate, relink.relinked);
                    RemovalAction::Deleted
                }
                Err(e) => {
                    tracing::error!("Failed to delete {}: {}", duplicate, e);
                    RemovalAction::DeleteFailed(e.to_string())
                }
            }
        };

        RemovedFile {
            path: duplicate.to_string(),
            relinked: relink.relinked,
            unresolved: relink.unresolved,
            relink_error: relink.error,
            action,
        }
    }

    async fn relink(&self, from: &str, to: &str) -> RelinkResult {
        let exact = CardImages::update_many()
            .col_expr(card_images::Column::Image, Expr::value(to))
            .filter(card_images::Column::Image.eq(from))
            .exec(&self.db)
            .await;

        let err = match exact {
            Ok(res) => {
                return RelinkResult {
                    relinked: res.rows_affected,
                    unresolved: Some(0),
                    error: None,
                };
            }
            Err(e) => e,
        };

        tracing::warn!("Exact relink of {} failed ({}), matching by filename", from, err);

        let fallback = CardImages::update_many()
            .col_expr(card_images::Column::Image, Expr::value(to))
            .filter(filename_condition(from))
            .exec(&self.db)
            .await;

        match fallback {
            Ok(res) => RelinkResult {
                relinked: res.rows_affected,
                unresolved: Some(0),
                error: None,
            },
            Err(e) => {
                let unresolved = match self.references(from).await {
                    Ok(count) => Some(count),
                    Err(count_err) => {
                        tracing::error!("Could not count references to {}: {}", from, count_err);
                        None
                    }
                };
                RelinkResult {
                    relinked: 0,
                    unresolved,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn count_references(&self, path: &str) -> RelinkResult {
        match self.references(path).await {
            Ok(count) => RelinkResult {
                relinked: count,
                unresolved: Some(0),
                error: None,
            },
            Err(e) => RelinkResult {
                relinked: 0,
                unresolved: Some(0),
                error: Some(e.to_string()),
            },
        }
    }

    async fn references(&self, path: &str) -> Result<u64, DbErr> {
        CardImages::find()
            .filter(card_images::Column::Image.eq(path))
            .count(&self.db)
            .await
    }
}

fn retention_reason(unresolved: Option<u64>) -> Option<String> {
    match unresolved {
        Some(0) => None,
        Some(n) => Some(format!("{} DB rows could not be relinked", n)),
        None => Some("DB rows referencing it could not be counted".to_string()),
    }
}

/// Rows whose stored path names the same file, wherever the directory part differs.
fn filename_condition(path: &str) -> Condition {
    let basename = path.rsplit('/').next().unwrap_or(path);
    Condition::any()
        .add(card_images::Column::Image.eq(basename))
        .add(card_images::Column::Image.ends_with(format!("/{}", basename)))
}

/// Picks the surviving file of a duplicate group. Ties on modification time
/// go to the first path so repeated runs agree.
pub fn select_keeper(files: &[StoredFile], strategy: KeepStrategy) -> Option<&StoredFile> {
    match strategy {
        KeepStrategy::Oldest => files
            .iter()
            .min_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path))),
        KeepStrategy::Newest => files
            .iter()
            .max_by(|a, b| a.modified.cmp(&b.modified).then_with(|| b.path.cmp(&a.path))),
        KeepStrategy::Lex => files.iter().min_by(|a, b| a.path.cmp(&b.path)),
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Scanning {} files in {}...", self.scanned, self.media_dir)?;
        for skipped in &self.skipped {
            writeln!(f, "Could not hash {}: {}", skipped.path, skipped.reason)?;
        }

        if self.groups.is_empty() {
            return writeln!(f, "No duplicate files found.");
        }

        writeln!(f, "Found {} duplicate groups.", self.groups.len())?;

        for group in &self.groups {
            writeln!(
                f,
                "Group hash={}: keep {}, remove {} files",
                group.hash,
                group.keeper,
                group.removed.len()
            )?;

            for removed in &group.removed {
                if let Some(err) = &removed.relink_error {
                    writeln!(f, "Relink of {} failed: {}", removed.path, err)?;
                }
                match &removed.action {
                    RemovalAction::Deleted => writeln!(
                        f,
                        "Deleted {} (relinked {} DB rows)",
                        removed.path, removed.relinked
                    )?,
                    RemovalAction::WouldDelete => writeln!(
                        f,
                        "[DRY RUN] Would remove {} (relink {} DB rows to {})",
                        removed.path, removed.relinked, group.keeper
                    )?,
                    RemovalAction::DeleteFailed(err) => {
                        writeln!(f, "Failed to delete {}: {}", removed.path, err)?
                    }
                    RemovalAction::Retained(reason) => {
                        writeln!(f, "Kept {}: {}", removed.path, reason)?
                    }
                }
            }
        }

        writeln!(f)?;
        writeln!(f, "Total duplicate files identified: {}", self.duplicates_found)?;
        writeln!(f, "Total DB rows relinked: {}", self.rows_relinked)?;
        if self.unresolved_references > 0 {
            writeln!(
                f,
                "Total DB rows left unresolved: {}",
                self.unresolved_references
            )?;
        }
        if self.uncounted_references > 0 {
            writeln!(
                f,
                "Files kept with uncounted references: {}",
                self.uncounted_references
            )?;
        }
        if self.confirm {
            writeln!(f, "Total files deleted: {}", self.files_deleted)
        } else {
            writeln!(
                f,
                "No files deleted (dry run). Re-run with --confirm to perform deletions."
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn file(path: &str, secs: i64) -> StoredFile {
        StoredFile {
            path: path.to_string(),
            size: 5,
            modified: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_select_keeper_strategies() {
        let files = vec![
            file("card_images/b.png", 1),
            file("card_images/c.png", 2),
            file("card_images/a.png", 3),
        ];

        assert_eq!(
            select_keeper(&files, KeepStrategy::Oldest).unwrap().path,
            "card_images/b.png"
        );
        assert_eq!(
            select_keeper(&files, KeepStrategy::Newest).unwrap().path,
            "card_images/a.png"
        );
        assert_eq!(
            select_keeper(&files, KeepStrategy::Lex).unwrap().path,
            "card_images/a.png"
        );
        assert!(select_keeper(&[], KeepStrategy::Lex).is_none());
    }

    #[test]
    fn test_select_keeper_breaks_ties_by_path() {
        let files = vec![file("card_images/z.png", 7), file("card_images/m.png", 7)];
        assert_eq!(
            select_keeper(&files, KeepStrategy::Oldest).unwrap().path,
            "card_images/m.png"
        );
        assert_eq!(
            select_keeper(&files, KeepStrategy::Newest).unwrap().path,
            "card_images/m.png"
        );
    }

    #[test]
    fn test_retention_reason() {
        assert!(retention_reason(Some(0)).is_none());
        assert_eq!(
            retention_reason(Some(3)).as_deref(),
            Some("3 DB rows could not be relinked")
        );
        assert_eq!(
            retention_reason(None).as_deref(),
            Some("DB rows referencing it could not be counted")
        );
    }

    #[test]
    fn test_lex_is_ordinal() {
        // uppercase sorts before lowercase in byte order
        let files = vec![file("card_images/a.png", 1), file("card_images/B.png", 2)];
        assert_eq!(
            select_keeper(&files, KeepStrategy::Lex).unwrap().path,
            "card_images/B.png"
        );
    }

    #[test]
    fn test_report_dry_run_text() {
        let report = ReconcileReport {
            media_dir: "media/card_images".to_string(),
            confirm: false,
            keep: KeepStrategy::Oldest,
            scanned: 2,
            skipped: vec![],
            groups: vec![DuplicateGroup {
                hash: crate::utils::hash::calculate_hash(b"hello"),
                keeper: "card_images/a.png".to_string(),
                removed: vec![RemovedFile {
                    path: "card_images/b.png".to_string(),
                    relinked: 2,
                    unresolved: Some(0),
                    relink_error: None,
                    action: RemovalAction::WouldDelete,
                }],
            }],
            duplicates_found: 1,
            rows_relinked: 2,
            files_deleted: 0,
            unresolved_references: 0,
            uncounted_references: 0,
        };

        let text = report.to_string();
        assert!(text.starts_with("Scanning 2 files in media/card_images..."));
        assert!(text.contains(
            "[DRY RUN] Would remove card_images/b.png (relink 2 DB rows to card_images/a.png)"
        ));
        assert!(text.contains("Total duplicate files identified: 1"));
        assert!(text.contains("No files deleted (dry run)"));
    }
}
