use crate::api::error::AppError;
use crate::config::{AppConfig, DedupLookup};
use crate::entities::{card_images, prelude::*};
use crate::services::storage::StorageService;
use crate::utils::hash::{ContentHash, ContentHasher, calculate_hash_from_reader};
use crate::utils::validation::{is_executable_content, sanitize_filename};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// Rows fetched per page while scanning stored images.
const SCAN_PAGE_SIZE: u64 = 100;

/// Leading bytes inspected for executable signatures.
const MAGIC_HEADER_LEN: usize = 4;

pub struct UploadOutcome {
    pub image: card_images::Model,
    /// `true` when the upload reused an already stored file
    pub duplicate: bool,
    pub url: String,
}

/// Upload body spooled to a temp file so it can be read twice.
struct SpooledUpload {
    file: NamedTempFile,
    hash: ContentHash,
    size: u64,
}

pub struct CardImageService {
    db: DatabaseConnection,
    storage: Arc<dyn StorageService>,
    config: AppConfig,
}

impl CardImageService {
    pub fn new(db: DatabaseConnection, storage: Arc<dyn StorageService>, config: AppConfig) -> Self {
        Self {
            db,
            storage,
            config,
        }
    }

    /// Stores an uploaded card image, reusing an existing file when one with
    /// identical content is already referenced by a card image.
    pub async fn accept_upload<'a>(
        &self,
        owner_id: Option<String>,
        filename: &str,
        reader: impl AsyncRead + Unpin + Send + 'a,
    ) -> Result<UploadOutcome, AppError> {
        let filename =
            sanitize_filename(filename).map_err(|e| AppError::InvalidInput(e.to_string()))?;

        let spooled = self.spool(reader).await?;
        tracing::debug!(
            "Upload {} hashed to {} ({} bytes)",
            filename,
            spooled.hash,
            spooled.size
        );

        if let Some(existing_path) = self.find_existing(&spooled.hash).await? {
            let image = self
                .insert_record(owner_id, &existing_path, &spooled.hash)
                .await?;
            tracing::info!(
                "♻️  Duplicate upload {} reuses {} (card image {})",
                filename,
                existing_path,
                image.id
            );
            return Ok(UploadOutcome {
                url: self.storage.url(&existing_path),
                image,
                duplicate: true,
            });
        }

        // Re-open the spool file to read it again from the start
        let rewound = tokio::fs::File::open(spooled.file.path())
            .await
            .map_err(|e| AppError::Internal(format!("Failed to reopen upload: {}", e)))?;

        let stored_path = self
            .storage
            .save(&self.config.image_dir, &filename, Box::new(rewound))
            .await
            .map_err(|e| AppError::Internal(format!("Failed to store upload: {}", e)))?;

        let image = match self
            .insert_record(owner_id, &stored_path, &spooled.hash)
            .await
        {
            Ok(image) => image,
            Err(e) => {
                if let Err(cleanup) = self.storage.delete_file(&stored_path).await {
                    tracing::warn!("Failed to remove orphaned {}: {}", stored_path, cleanup);
                }
                return Err(e);
            }
        };

        tracing::info!("📥 Stored new card image {} as {}", image.id, stored_path);

        Ok(UploadOutcome {
            url: self.storage.url(&stored_path),
            image,
            duplicate: false,
        })
    }

    /// Reads the whole upload, hashing it and writing it to a temp file.
    async fn spool<'a>(
        &self,
        mut reader: impl AsyncRead + Unpin + Send + 'a,
    ) -> Result<SpooledUpload, AppError> {
        let temp_file = NamedTempFile::new().map_err(|e| AppError::Internal(e.to_string()))?;
        let mut temp_file_async = tokio::fs::File::from_std(
            temp_file
                .reopen()
                .map_err(|e| AppError::Internal(e.to_string()))?,
        );

        let mut hasher = ContentHasher::new();
        let mut buffer = vec![0u8; self.config.chunk_size.max(1)];
        let mut total_size: u64 = 0;
        let mut header = Vec::with_capacity(MAGIC_HEADER_LEN);

        loop {
            let n = reader.read(&mut buffer).await.map_err(|e| {
                let err_msg = e.to_string();
                if err_msg.contains("length limit exceeded") {
                    AppError::PayloadTooLarge(
                        "Request body exceeds the maximum allowed limit".to_string(),
                    )
                } else {
                    AppError::InvalidInput(format!("Failed to read upload: {}", err_msg))
                }
            })?;
            if n == 0 {
                break;
            }

            // reads may be arbitrarily short, so collect the header first
            if header.len() < MAGIC_HEADER_LEN {
                let take = (MAGIC_HEADER_LEN - header.len()).min(n);
                header.extend_from_slice(&buffer[..take]);
                if header.len() == MAGIC_HEADER_LEN {
                    reject_executable(&header)?;
                }
            }

            total_size += n as u64;
            if total_size > self.config.max_file_size as u64 {
                return Err(AppError::PayloadTooLarge(
                    "File size limits exceeded".to_string(),
                ));
            }

            hasher.update(&buffer[..n]);
            temp_file_async
                .write_all(&buffer[..n])
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?;
        }

        if header.len() < MAGIC_HEADER_LEN {
            reject_executable(&header)?;
        }

        temp_file_async
            .flush()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(SpooledUpload {
            file: temp_file,
            hash: hasher.finalize(),
            size: total_size,
        })
    }

    /// Path of the first stored card image whose file has this content.
    pub async fn find_existing(&self, hash: &ContentHash) -> Result<Option<String>, AppError> {
        match self.config.dedup_lookup {
            DedupLookup::Scan => self.scan_for_match(hash, false).await,
            DedupLookup::Index => {
                if let Some(path) = self.lookup_index(hash).await? {
                    return Ok(Some(path));
                }
                self.scan_for_match(hash, true).await
            }
        }
    }

    async fn lookup_index(&self, hash: &ContentHash) -> Result<Option<String>, AppError> {
        let candidates = CardImages::find()
            .filter(card_images::Column::ContentHash.eq(hash.as_str()))
            .filter(card_images::Column::Image.is_not_null())
            .order_by_asc(card_images::Column::Id)
            .all(&self.db)
            .await?;

        for candidate in candidates {
            let Some(path) = candidate.image.filter(|p| !p.is_empty()) else {
                continue;
            };
            match self.storage.file_exists(&path).await {
                Ok(true) => return Ok(Some(path)),
                Ok(false) => tracing::debug!("Indexed file {} is gone, skipping", path),
                Err(e) => tracing::warn!("Could not check {}: {}", path, e),
            }
        }

        Ok(None)
    }

    /// Walks card images in id order and re-hashes each referenced file.
    /// With `legacy_only`, only rows without a stored hash are visited and
    /// their hash is written back as it is computed.
    async fn scan_for_match(
        &self,
        hash: &ContentHash,
        legacy_only: bool,
    ) -> Result<Option<String>, AppError> {
        let mut last_id = 0;

        loop {
            let mut query = CardImages::find()
                .filter(card_images::Column::Id.gt(last_id))
                .order_by_asc(card_images::Column::Id)
                .limit(SCAN_PAGE_SIZE);
            if legacy_only {
                query = query.filter(card_images::Column::ContentHash.is_null());
            }

            let page = query.all(&self.db).await?;
            let Some(last) = page.last() else {
                return Ok(None);
            };
            last_id = last.id;

            for record in page {
                let Some(path) = record.image.clone().filter(|p| !p.is_empty()) else {
                    continue;
                };

                let file_hash = match self.hash_stored_file(&path).await {
                    Ok(h) => h,
                    Err(e) => {
                        tracing::warn!("Skipping card image {} ({}): {}", record.id, path, e);
                        continue;
                    }
                };

                if legacy_only {
                    let id = record.id;
                    let mut active: card_images::ActiveModel = record.into();
                    active.content_hash = Set(Some(file_hash.to_string()));
                    if let Err(e) = active.update(&self.db).await {
                        tracing::warn!("Could not backfill hash for card image {}: {}", id, e);
                    }
                }

                if file_hash == *hash {
                    return Ok(Some(path));
                }
            }
        }
    }

    async fn hash_stored_file(&self, path: &str) -> anyhow::Result<ContentHash> {
        let reader = self.storage.open(path).await?;
        Ok(calculate_hash_from_reader(reader, self.config.chunk_size).await?)
    }

    async fn insert_record(
        &self,
        owner_id: Option<String>,
        path: &str,
        hash: &ContentHash,
    ) -> Result<card_images::Model, AppError> {
        let record = card_images::ActiveModel {
            uploaded_by: Set(owner_id),
            image: Set(Some(path.to_string())),
            content_hash: Set(Some(hash.to_string())),
            uploaded_at: Set(Utc::now()),
            ..Default::default()
        };

        Ok(record.insert(&self.db).await?)
    }
}

fn reject_executable(header: &[u8]) -> Result<(), AppError> {
    if is_executable_content(header) {
        return Err(AppError::InvalidInput(
            "File contains executable content which is not allowed".to_string(),
        ));
    }
    Ok(())
}
