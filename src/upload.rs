//! Photo upload pipeline
//!
//! Turns locally selected files into stored objects plus metadata records,
//! one file at a time in selection order. A failing file is logged and
//! skipped so the rest of the batch still gets shared.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::ImageFormat;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::state::data::{validate_author, ImageRecord, NewImageRecord};
use crate::store::{ObjectStore, RecordStore};

/// Length of the random part of a storage path
const SUFFIX_LEN: usize = 8;

/// Formats phones produce that the image crate can't identify
const EXTRA_IMAGE_TYPES: [(&str, &str); 2] = [("heic", "image/heic"), ("heif", "image/heif")];

/// A local image picked for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub path: PathBuf,
    pub content_type: String,
}

impl UploadFile {
    /// Describe `path` if it looks like an image, judging by its extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let content_type = match ImageFormat::from_path(path) {
            Ok(format) => format.to_mime_type().to_string(),
            Err(_) => {
                let ext = path.extension()?.to_string_lossy().to_lowercase();
                EXTRA_IMAGE_TYPES
                    .iter()
                    .find(|(known, _)| *known == ext)
                    .map(|(_, mime)| mime.to_string())?
            }
        };
        content_type.starts_with("image/").then(|| UploadFile {
            path: path.to_path_buf(),
            content_type,
        })
    }

    /// Lowercase extension used in the storage path
    fn extension(&self) -> String {
        self.path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| "jpg".to_string())
    }
}

/// Expand the selection into image files, in order.
///
/// Directories are walked recursively (sorted by name); anything that is not
/// an image is left out. A path that doesn't exist is an error.
pub fn collect_images(inputs: &[PathBuf]) -> Result<Vec<UploadFile>> {
    let mut files = Vec::new();
    let mut skipped = 0;

    for input in inputs {
        let metadata = std::fs::metadata(input)?;
        if metadata.is_file() {
            match UploadFile::from_path(input) {
                Some(file) => files.push(file),
                None => skipped += 1,
            }
            continue;
        }

        for entry in WalkDir::new(input)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            match UploadFile::from_path(entry.path()) {
                Some(file) => files.push(file),
                None => skipped += 1,
            }
        }
    }

    if skipped > 0 {
        debug!(skipped, "ignored files that are not images");
    }
    Ok(files)
}

/// Lowercase ASCII slug of a display name, `guest` when nothing survives
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        let c = fold_accent(c);
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("guest");
    }
    slug
}

fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        other => other,
    }
}

/// Fresh object key: `{millis}-{author-slug}-{random}.{ext}`
pub fn storage_path(now: DateTime<Utc>, author: &str, extension: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!(
        "{}-{}-{}.{}",
        now.timestamp_millis(),
        slugify(author),
        suffix,
        extension
    )
}

/// `round(100 * done / total)` in whole percent
fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let rounded = (200 * done + total) / (2 * total);
    u8::try_from(rounded.min(100)).unwrap_or(100)
}

/// Outcome of one batch
#[derive(Debug, Default)]
pub struct UploadReport {
    pub attempted: usize,
    pub uploaded: Vec<ImageRecord>,
    pub failed: Vec<(PathBuf, String)>,
    /// Percentage reported after each successful file
    pub progress: Vec<u8>,
}

impl UploadReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct UploadCoordinator {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
}

impl UploadCoordinator {
    pub fn new(records: Arc<dyn RecordStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { records, objects }
    }

    /// Upload `files` in order as `author`, all stamped with `moment`.
    ///
    /// `on_progress` receives the batch percentage after each successful file.
    /// The files are consumed; nothing about them is kept once the batch ends.
    pub async fn upload_batch(
        &self,
        files: Vec<UploadFile>,
        author: &str,
        moment: DateTime<Utc>,
        mut on_progress: impl FnMut(u8),
    ) -> Result<UploadReport> {
        let author = validate_author(author)?;
        if files.is_empty() {
            return Err(Error::Validation("no images selected".to_string()));
        }

        let total = files.len();
        let mut report = UploadReport {
            attempted: total,
            ..UploadReport::default()
        };
        info!(total, author = %author, "upload batch started");

        for file in files {
            match self.upload_one(&file, &author, moment).await {
                Ok(record) => {
                    report.uploaded.push(record);
                    let pct = percent(report.uploaded.len(), total);
                    report.progress.push(pct);
                    on_progress(pct);
                }
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "upload failed, skipping file");
                    report.failed.push((file.path, e.to_string()));
                }
            }
        }

        info!(
            uploaded = report.uploaded.len(),
            failed = report.failed.len(),
            "upload batch finished"
        );
        Ok(report)
    }

    async fn upload_one(&self, file: &UploadFile, author: &str, moment: DateTime<Utc>) -> Result<ImageRecord> {
        let bytes = tokio::fs::read(&file.path).await?;
        let path = storage_path(Utc::now(), author, &file.extension());

        self.objects.put_object(&path, bytes, &file.content_type).await?;
        let record = self
            .records
            .insert_record(NewImageRecord {
                storage_path: path,
                author: author.to_string(),
                moment,
            })
            .await?;

        debug!(id = %record.id, source = %file.path.display(), "file uploaded");
        Ok(record)
    }
}
