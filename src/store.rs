use std::{
    collections::HashMap,
    ffi::OsStr,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use crate::{entry::CacheEntry, error::CacheResult, persister::CacheEntryPersister};

/// What the in-memory index knows about a persisted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub key: String,
    pub size: u64,
    /// Number of bytes available at the time of the last persist.
    pub available: u64,
    pub fully_available: bool,
}

impl IndexRecord {
    fn of(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key().to_owned(),
            size: entry.size(),
            available: entry.available_len(),
            fully_available: entry.is_fully_available(),
        }
    }
}

/// Maps resource keys to the files holding their data and metadata.
///
/// File names are derived from a slug of the key. Two keys may end up with the same slug; since
/// the metadata carries the full key, such a collision merely shows up as a cache miss.
#[derive(Debug)]
pub struct CacheEntryStore {
    root: Arc<Path>,
    persister: CacheEntryPersister,
    /// Persisted entries, by slug.
    index: RwLock<HashMap<String, IndexRecord>>,
}

impl CacheEntryStore {
    pub const DATA_EXTENSION: &'static str = "data";
    pub const METADATA_EXTENSION: &'static str = "meta";
    pub const TMP_EXTENSION: &'static str = "tmp";

    const MAX_SLUG_LEN: usize = 200;

    pub fn new<P>(root: P, persister: CacheEntryPersister) -> Self
    where
        P: AsRef<Path>,
    {
        Self {
            root: Arc::from(root.as_ref()),
            persister,
            index: RwLock::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn persister(&self) -> &CacheEntryPersister {
        &self.persister
    }

    /// Derives the file name stem for a key: lower-cased, scheme stripped, and every run of
    /// characters other than `[a-z0-9]` collapsed into a single `_`.
    pub fn slug(key: &str) -> String {
        let key = key.to_lowercase();
        let rest = key.split_once("://").map_or(key.as_str(), |(_, rest)| rest);

        let mut slug = String::with_capacity(rest.len());
        for c in rest.chars() {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                slug.push(c);
            } else if !slug.ends_with('_') {
                slug.push('_');
            }
        }

        if slug.is_empty() {
            slug.push('_');
        }

        // Keep file names within common file system limits.
        slug.truncate(Self::MAX_SLUG_LEN);
        slug
    }

    pub fn data_path(&self, key: &str) -> PathBuf {
        self.path_for(&Self::slug(key), Self::DATA_EXTENSION)
    }

    pub fn metadata_path(&self, key: &str) -> PathBuf {
        self.path_for(&Self::slug(key), Self::METADATA_EXTENSION)
    }

    fn path_for(&self, slug: &str, extension: &str) -> PathBuf {
        self.root.join(format!("{slug}.{extension}"))
    }

    fn tmp_path(metadata_path: &Path) -> PathBuf {
        let mut tmp = metadata_path.as_os_str().to_owned();
        tmp.push(".");
        tmp.push(Self::TMP_EXTENSION);
        tmp.into()
    }

    /// Loads the persisted entry for `key`.
    ///
    /// Returns `None` if there is none, if it belongs to another key or if it cannot be decoded.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn load(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let path = self.metadata_path(key);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match self.persister.load(&bytes) {
            Ok(entry) if entry.key() == key => Ok(Some(entry)),
            Ok(entry) => {
                tracing::warn!(other = entry.key(), "metadata belongs to a different key");
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(
                    path = format_args!("{}", path.display()),
                    "ignoring corrupted metadata: {e}"
                );
                Ok(None)
            }
        }
    }

    /// Persists the metadata of the entry, replacing any previous metadata atomically.
    #[tracing::instrument(skip(self, entry), fields(key = entry.key()), err(Debug))]
    pub async fn store(&self, entry: &CacheEntry) -> CacheResult<()> {
        let record = IndexRecord::of(entry);
        let bytes = self.persister.persist(entry);

        let path = self.metadata_path(entry.key());
        let tmp_path = Self::tmp_path(&path);

        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&tmp_path, &bytes).await?;
        // Renaming within the same file system is atomic, a crash leaves either the old or the new
        // metadata behind.
        tokio::fs::rename(&tmp_path, &path).await?;

        self.index
            .write()
            .unwrap()
            .insert(Self::slug(entry.key()), record);

        Ok(())
    }

    /// Returns the persisted entry for `key`, or a new and empty one.
    ///
    /// A persisted entry recorded with a different size is outdated and gets replaced as well.
    pub async fn acquire(&self, key: &str, size: u64) -> CacheResult<CacheEntry> {
        match self.load(key).await? {
            Some(entry) if entry.size() == size => Ok(entry),
            Some(entry) => {
                tracing::info!(
                    key,
                    old_size = entry.size(),
                    size,
                    "resource size changed, starting over"
                );
                Ok(self.empty(key, size))
            }
            None => Ok(self.empty(key, size)),
        }
    }

    fn empty(&self, key: &str, size: u64) -> CacheEntry {
        CacheEntry::new(key, size, self.persister.block_size())
    }

    #[allow(clippy::missing_panics_doc)]
    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    #[allow(clippy::missing_panics_doc)]
    pub fn get(&self, key: &str) -> Option<IndexRecord> {
        self.index
            .read()
            .unwrap()
            .get(&Self::slug(key))
            .filter(|record| record.key == key)
            .cloned()
    }

    /// Number of entries in the index.
    #[allow(clippy::missing_panics_doc)]
    pub fn len(&self) -> usize {
        self.index.read().unwrap().len()
    }

    #[allow(clippy::missing_panics_doc)]
    pub fn is_empty(&self) -> bool {
        self.index.read().unwrap().is_empty()
    }

    /// Deletes the data and metadata files of the entry with the given slug.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn delete_slug(&self, slug: &str) -> CacheResult<()> {
        tracing::info!("deleting cached files");

        self.index.write().unwrap().remove(slug);

        for extension in [Self::METADATA_EXTENSION, Self::DATA_EXTENSION] {
            remove_if_exists(&self.path_for(slug, extension)).await?;
        }

        Ok(())
    }

    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        self.delete_slug(&Self::slug(key)).await
    }

    /// Rebuilds the index from the metadata files of a previous run.
    ///
    /// Interrupted metadata writes are removed, as are undecodable metadata files together with
    /// their data files.
    #[tracing::instrument(skip(self), fields(root = format_args!("{}", self.root.display())), err(Debug))]
    pub async fn restore(&self) -> CacheResult<usize> {
        tracing::info!("attempting to restore the cache index");

        tokio::fs::create_dir_all(&self.root).await?;
        let mut files = tokio::fs::read_dir(&self.root).await?;
        let mut restored = 0;

        while let Some(file) = files.next_entry().await? {
            let path = file.path();

            let Some(name) = path.file_name().and_then(OsStr::to_str) else {
                continue;
            };

            if name.ends_with(&format!(
                ".{}.{}",
                Self::METADATA_EXTENSION,
                Self::TMP_EXTENSION
            )) {
                tracing::info!("removing incomplete metadata: {}", path.display());
                remove_if_exists(&path).await?;
                continue;
            }

            let Some(slug) = name.strip_suffix(&format!(".{}", Self::METADATA_EXTENSION)) else {
                continue;
            };

            let bytes = tokio::fs::read(&path).await?;

            match self.persister.load(&bytes) {
                Ok(entry) if Self::slug(entry.key()) == slug => {
                    tracing::debug!(key = entry.key(), "indexing entry");
                    self.index
                        .write()
                        .unwrap()
                        .insert(slug.to_owned(), IndexRecord::of(&entry));
                    restored += 1;
                }
                Ok(_) | Err(_) => {
                    tracing::warn!("removing unusable metadata: {}", path.display());
                    self.delete_slug(slug).await?;
                }
            }
        }

        Ok(restored)
    }
}

async fn remove_if_exists(path: &Path) -> CacheResult<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
