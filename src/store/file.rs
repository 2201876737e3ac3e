//! File-backed cache store.
//!
//! # Responsibilities
//! - Persist variant lists as JSON metadata and bodies as content-addressed files
//! - Resolve lookups against stored Vary'd request headers
//! - Advisory per-key locks via exclusive-create marker files
//! - Maintenance: pruning dead variants and orphaned bodies, clearing, tag invalidation
//!
//! # Design Decisions
//! - Every file is written to a temporary name and renamed into place
//! - Lock markers never expire unless a lease is configured
//! - Dropping a store handle releases the locks it still holds
//! - Header values are persisted byte-for-byte; non-UTF-8 values are stored as byte arrays
//! - Bodies younger than a grace period survive pruning so in-flight writes keep their content

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, SystemTime};

use axum::body::Bytes;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::key::{cache_key, content_digest, shard_path};
use super::{PruneStats, Store, StoreError, CACHE_TAGS, X_BODY_FILE, X_CONTENT_DIGEST, X_STATUS};
use crate::http::{Request, Response, ResponseExt};

/// Bodies modified more recently than this are never pruned.
const BODY_GRACE: Duration = Duration::from_secs(60);

/// A persisted header value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredValue {
    Text(String),
    Raw(Vec<u8>),
}

impl StoredValue {
    fn from_header(value: &HeaderValue) -> Self {
        match std::str::from_utf8(value.as_bytes()) {
            Ok(text) => StoredValue::Text(text.to_string()),
            Err(_) => StoredValue::Raw(value.as_bytes().to_vec()),
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            StoredValue::Text(text) => text.as_bytes(),
            StoredValue::Raw(bytes) => bytes,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            StoredValue::Text(text) => Some(text),
            StoredValue::Raw(bytes) => std::str::from_utf8(bytes).ok(),
        }
    }
}

impl PartialEq for StoredValue {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

type HeaderSnapshot = BTreeMap<String, Vec<StoredValue>>;

/// One stored variant: request header snapshot, response header snapshot.
type Variant = (HeaderSnapshot, HeaderSnapshot);

struct Shared {
    root: PathBuf,
    lock_lease: Option<Duration>,
    /// Locks taken by this process: key → (owner, marker path).
    held: DashMap<String, (Uuid, PathBuf)>,
    /// Writes between automatic prunes; zero disables them.
    prune_threshold: AtomicU64,
    writes: AtomicU64,
    /// Serializes prune and clear within the process.
    maintenance: Mutex<()>,
}

/// Cache store rooted at a directory.
pub struct FileStore {
    shared: Arc<Shared>,
    owner: Uuid,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::with_lease(root, None)
    }

    /// Open a store whose lock markers are considered abandoned after `lease`.
    pub fn with_lease(root: impl Into<PathBuf>, lease: Option<Duration>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("md"))?;
        fs::create_dir_all(root.join("en"))?;
        tracing::debug!(root = %root.display(), lease = ?lease, "Cache store opened");
        Ok(Self {
            shared: Arc::new(Shared {
                root,
                lock_lease: lease,
                held: DashMap::new(),
                prune_threshold: AtomicU64::new(0),
                writes: AtomicU64::new(0),
                maintenance: Mutex::new(()),
            }),
            owner: Uuid::new_v4(),
        })
    }

    /// Prune automatically after every `threshold` writes (0 disables).
    pub fn with_prune_threshold(self, threshold: u64) -> Self {
        self.shared.prune_threshold.store(threshold, Ordering::Relaxed);
        self
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        shard_path(&self.shared.root, key)
    }

    fn content_path(&self, digest: &str) -> PathBuf {
        shard_path(&self.shared.root, digest)
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let mut path = self.metadata_path(key).into_os_string();
        path.push(".lck");
        path.into()
    }

    fn load_variants(&self, key: &str) -> Result<Vec<Variant>, StoreError> {
        match fs::read(self.metadata_path(key)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_variants(&self, key: &str, variants: &[Variant]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(variants)?;
        write_atomic(&self.metadata_path(key), &bytes)?;
        Ok(())
    }

    /// Rewrite a metadata file with the variants that survived, removing it when none did.
    fn rewrite_metadata(&self, path: &Path, variants: &[Variant]) -> Result<(), StoreError> {
        if variants.is_empty() {
            return match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        write_atomic(path, &serde_json::to_vec(variants)?)?;
        Ok(())
    }

    /// Every metadata file with its variants; unreadable files are skipped with a warning.
    fn metadata_entries(&self) -> Result<Vec<(PathBuf, Vec<Variant>)>, StoreError> {
        let mut files = Vec::new();
        collect_files(&self.shared.root.join("md"), &mut files)?;
        let mut entries = Vec::with_capacity(files.len());
        for path in files {
            if path.extension().is_some_and(|ext| ext == "lck") {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<Vec<Variant>>(&bytes) {
                Ok(variants) => entries.push((path, variants)),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable cache metadata"),
            }
        }
        Ok(entries)
    }

    fn maintenance(&self) -> MutexGuard<'_, ()> {
        match self.shared.maintenance.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn prune_after_write(&self) {
        let threshold = self.shared.prune_threshold.load(Ordering::Relaxed);
        if threshold == 0 {
            return;
        }
        let writes = self.shared.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % threshold != 0 {
            return;
        }
        match self.prune() {
            Ok(stats) => {
                tracing::debug!(writes, variants = stats.variants, bodies = stats.bodies, "Automatic store prune")
            }
            Err(e) => tracing::warn!(error = %e, "Automatic store prune failed"),
        }
    }

    /// Read a body file, refusing anything outside the content directory.
    fn read_body_file(&self, path: &Path) -> Result<Bytes, StoreError> {
        let invalid = || StoreError::InvalidBodyFile(path.to_path_buf());
        let content_root = self.shared.root.join("en").canonicalize().map_err(|_| invalid())?;
        let resolved = path.canonicalize().map_err(|_| invalid())?;
        if !resolved.starts_with(&content_root) {
            return Err(invalid());
        }
        Ok(Bytes::from(fs::read(&resolved)?))
    }

    fn lease_expired(&self, marker: &Path) -> bool {
        let Some(lease) = self.shared.lock_lease else {
            return false;
        };
        fs::metadata(marker)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|elapsed| elapsed > lease)
    }

    fn create_marker(&self, path: &Path) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(self.owner.to_string().as_bytes())
    }

    fn release(&self, key: &str) -> bool {
        let owned = self
            .shared
            .held
            .remove_if(key, |_, (owner, _)| *owner == self.owner);
        match owned {
            Some((_, (_, path))) => {
                remove_marker(&path);
                true
            }
            None => false,
        }
    }
}

impl Store for FileStore {
    fn lookup(&self, request: &Request) -> Result<Option<Response>, StoreError> {
        let key = cache_key(request);
        let variants = self.load_variants(&key)?;
        if variants.is_empty() {
            return Ok(None);
        }

        let env = persist_request(request);
        let matched = variants
            .into_iter()
            .find(|(stored_env, headers)| requests_match(&vary_of(headers), &env, stored_env));
        let Some((_, headers)) = matched else {
            return Ok(None);
        };
        let Some(digest) = digest_of(&headers) else {
            return Ok(None);
        };
        let body_path = self.content_path(digest);
        if !body_path.exists() {
            tracing::debug!(key = %key, digest = %digest, "Stored content missing, treating as miss");
            return Ok(None);
        }
        restore_response(&headers, Some(&body_path)).map(Some)
    }

    fn write(&self, request: &Request, response: &mut Response) -> Result<String, StoreError> {
        let key = cache_key(request);
        let stored_env = persist_request(request);

        // Bodies restored from the store are re-read from our own content directory.
        let body_file = response.header_str(X_BODY_FILE).map(PathBuf::from);
        if let Some(path) = body_file {
            let body = self.read_body_file(&path)?;
            *response.body_mut() = body;
            response.headers_mut().remove(X_BODY_FILE);
        }

        let digest = content_digest(response.body());
        let content_path = self.content_path(&digest);
        if !content_path.exists() {
            write_atomic(&content_path, response.body())?;
        }
        let digest_value =
            HeaderValue::from_str(&digest).map_err(|e| StoreError::InvalidHeader(e.to_string()))?;
        response.headers_mut().insert(X_CONTENT_DIGEST, digest_value);
        if !response.headers().contains_key(header::TRANSFER_ENCODING) {
            let len = response.body().len();
            response.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }

        let vary = normalized_vary(response.vary());
        let mut variants = self.load_variants(&key)?;
        variants.retain(|(env, headers)| {
            vary_of(headers) != vary || !requests_match(&vary, env, &stored_env)
        });

        let mut headers = persist_response(response);
        headers.remove("age");
        variants.insert(0, (stored_env, headers));
        self.save_variants(&key, &variants)?;

        tracing::debug!(key = %key, digest = %digest, variants = variants.len(), "Response stored");
        self.prune_after_write();
        Ok(key)
    }

    fn restore_body(&self, response: &mut Response) -> Result<(), StoreError> {
        let Some(path) = response.header_str(X_BODY_FILE).map(PathBuf::from) else {
            return Ok(());
        };
        let body = self.read_body_file(&path)?;
        *response.body_mut() = body;
        response.headers_mut().remove(X_BODY_FILE);
        Ok(())
    }

    fn invalidate(&self, request: &Request) -> Result<(), StoreError> {
        let key = cache_key(request);
        let mut variants = self.load_variants(&key)?;
        let mut modified = false;
        for (_, headers) in variants.iter_mut() {
            let mut response = restore_response(headers, None)?;
            if response.is_fresh() {
                response.expire();
                *headers = persist_response(&response);
                modified = true;
            }
        }
        if modified {
            self.save_variants(&key, &variants)?;
            tracing::debug!(key = %key, "Stored variants invalidated");
        }
        Ok(())
    }

    fn purge(&self, url: &str) -> Result<bool, StoreError> {
        let http = match url.strip_prefix("https:") {
            Some(rest) => format!("http:{}", rest),
            None => url.to_string(),
        };
        let https = match url.strip_prefix("http:") {
            Some(rest) => format!("https:{}", rest),
            None => url.to_string(),
        };

        let mut purged = false;
        for target in [http, https] {
            let Ok(uri) = target.parse::<axum::http::Uri>() else {
                continue;
            };
            let request = axum::http::Request::builder()
                .uri(uri)
                .body(Bytes::new())
                .map_err(|e| StoreError::InvalidHeader(e.to_string()))?;
            match fs::remove_file(self.metadata_path(&cache_key(&request))) {
                Ok(()) => purged = true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(purged)
    }

    fn prune(&self) -> Result<PruneStats, StoreError> {
        let _guard = match self.shared.maintenance.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("Store maintenance already running, prune skipped");
                return Ok(PruneStats::default());
            }
        };

        let mut stats = PruneStats::default();
        let mut referenced = HashSet::new();
        for (path, mut variants) in self.metadata_entries()? {
            let before = variants.len();
            variants.retain(|(_, headers)| match restore_response(headers, None) {
                Ok(response) => !is_dead(&response),
                Err(_) => false,
            });
            if variants.len() != before {
                stats.variants += before - variants.len();
                self.rewrite_metadata(&path, &variants)?;
            }
            for (_, headers) in &variants {
                if let Some(digest) = digest_of(headers) {
                    referenced.insert(self.content_path(digest));
                }
            }
        }

        let mut bodies = Vec::new();
        collect_files(&self.shared.root.join("en"), &mut bodies)?;
        let now = SystemTime::now();
        for path in bodies {
            if referenced.contains(&path) {
                continue;
            }
            let recent = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .map_or(true, |elapsed| elapsed < BODY_GRACE);
            if recent {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => stats.bodies += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(variants = stats.variants, bodies = stats.bodies, "Store pruned");
        Ok(stats)
    }

    fn clear(&self) -> Result<usize, StoreError> {
        let _guard = self.maintenance();
        let mut removed = 0;
        for (path, _) in self.metadata_entries()? {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let content = self.shared.root.join("en");
        if let Err(e) = fs::remove_dir_all(&content) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        fs::create_dir_all(&content)?;
        tracing::info!(entries = removed, "Store cleared");
        Ok(removed)
    }

    fn invalidate_tags(&self, tags: &[String]) -> Result<usize, StoreError> {
        let wanted: HashSet<&str> = tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()).collect();
        if wanted.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        for (path, mut variants) in self.metadata_entries()? {
            let before = variants.len();
            variants.retain(|(_, headers)| !tags_of(headers).any(|tag| wanted.contains(tag)));
            if variants.len() != before {
                removed += before - variants.len();
                self.rewrite_metadata(&path, &variants)?;
            }
        }
        tracing::info!(tags = ?wanted, variants = removed, "Tagged variants invalidated");
        Ok(removed)
    }

    fn lock(&self, request: &Request) -> Result<bool, StoreError> {
        let key = cache_key(request);
        if let Some(entry) = self.shared.held.get(&key) {
            if entry.0 == self.owner {
                return Ok(true);
            }
        }

        let path = self.lock_path(&key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let acquired = match self.create_marker(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if self.lease_expired(&path) {
                    tracing::warn!(key = %key, "Taking over abandoned cache lock");
                    remove_marker(&path);
                    match self.create_marker(&path) {
                        Ok(()) => true,
                        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => false,
                        Err(e) => return Err(e.into()),
                    }
                } else {
                    false
                }
            }
            Err(e) => return Err(e.into()),
        };

        if acquired {
            self.shared.held.insert(key, (self.owner, path));
        }
        Ok(acquired)
    }

    fn unlock(&self, request: &Request) -> Result<bool, StoreError> {
        Ok(self.release(&cache_key(request)))
    }

    fn is_locked(&self, request: &Request) -> Result<bool, StoreError> {
        let key = cache_key(request);
        if self.shared.held.contains_key(&key) {
            return Ok(true);
        }
        let path = self.lock_path(&key);
        Ok(path.exists() && !self.lease_expired(&path))
    }

    fn cleanup(&self) {
        let keys: Vec<String> = self.shared.held.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, (_, path))) = self.shared.held.remove(&key) {
                remove_marker(&path);
            }
        }
    }

    fn session(&self) -> Arc<dyn Store> {
        Arc::new(FileStore {
            shared: self.shared.clone(),
            owner: Uuid::new_v4(),
        })
    }

    fn held_locks(&self) -> usize {
        self.shared.held.len()
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let mine: Vec<String> = self
            .shared
            .held
            .iter()
            .filter(|entry| entry.value().0 == self.owner)
            .map(|entry| entry.key().clone())
            .collect();
        for key in mine {
            self.release(&key);
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    if let Err(e) = fs::write(&tmp, data).and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn remove_marker(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove lock marker");
        }
    }
}

/// Regular files below `dir`, skipping temporaries. A missing `dir` yields nothing.
fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() && !entry.file_name().to_string_lossy().starts_with('.') {
            out.push(path);
        }
    }
    Ok(())
}

/// Stale, without a validator, and past every stale window it declares.
fn is_dead(response: &Response) -> bool {
    if response.is_fresh() || response.is_validateable() {
        return false;
    }
    let cc = response.cache_control();
    let window = ["stale-while-revalidate", "stale-if-error"]
        .iter()
        .filter_map(|directive| cc.seconds(directive))
        .max()
        .unwrap_or(0);
    response.ttl().unwrap_or(0).saturating_add(window) <= 0
}

fn digest_of(headers: &HeaderSnapshot) -> Option<&str> {
    headers.get(X_CONTENT_DIGEST)?.first()?.as_str()
}

fn tags_of(headers: &HeaderSnapshot) -> impl Iterator<Item = &str> {
    headers
        .get(CACHE_TAGS)
        .into_iter()
        .flatten()
        .filter_map(StoredValue::as_str)
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
}

fn snapshot(headers: &axum::http::HeaderMap) -> HeaderSnapshot {
    let mut out = HeaderSnapshot::new();
    for (name, value) in headers {
        out.entry(name.as_str().to_string())
            .or_default()
            .push(StoredValue::from_header(value));
    }
    out
}

fn persist_request(request: &Request) -> HeaderSnapshot {
    snapshot(request.headers())
}

fn persist_response(response: &Response) -> HeaderSnapshot {
    let mut headers = snapshot(response.headers());
    headers.insert(
        X_STATUS.to_string(),
        vec![StoredValue::Text(response.status().as_u16().to_string())],
    );
    headers
}

fn restore_response(headers: &HeaderSnapshot, body_path: Option<&Path>) -> Result<Response, StoreError> {
    let status = headers
        .get(X_STATUS)
        .and_then(|v| v.first())
        .and_then(StoredValue::as_str)
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(200);
    let mut response = Response::new(Bytes::new());
    *response.status_mut() =
        StatusCode::from_u16(status).map_err(|e| StoreError::InvalidHeader(e.to_string()))?;

    for (name, values) in headers {
        if name == X_STATUS {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| StoreError::InvalidHeader(e.to_string()))?;
        for value in values {
            let value = HeaderValue::from_bytes(value.as_bytes())
                .map_err(|e| StoreError::InvalidHeader(e.to_string()))?;
            response.headers_mut().append(name.clone(), value);
        }
    }

    if let Some(path) = body_path {
        let value = HeaderValue::from_str(&path.to_string_lossy())
            .map_err(|e| StoreError::InvalidHeader(e.to_string()))?;
        response.headers_mut().insert(X_BODY_FILE, value);
    }
    Ok(response)
}

fn normalized_vary(names: Vec<String>) -> Vec<String> {
    names.into_iter().map(|name| name.to_ascii_lowercase()).collect()
}

fn vary_of(headers: &HeaderSnapshot) -> Vec<String> {
    let names = headers
        .get("vary")
        .into_iter()
        .flatten()
        .filter_map(StoredValue::as_str)
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    normalized_vary(names)
}

/// Both snapshots agree on every header named in `vary` (absent matches absent).
fn requests_match(vary: &[String], env: &HeaderSnapshot, stored_env: &HeaderSnapshot) -> bool {
    vary.iter().all(|name| env.get(name) == stored_env.get(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::date::format_http_date;
    use chrono::Utc;

    struct TempRoot(PathBuf);

    impl TempRoot {
        fn new() -> Self {
            Self(std::env::temp_dir().join(format!("http-cache-proxy-store-{}", Uuid::new_v4())))
        }
    }

    impl Drop for TempRoot {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Bytes::new()).unwrap()
    }

    fn response(body: &'static str, headers: &[(&str, &str)]) -> Response {
        let mut builder = axum::http::Response::builder()
            .status(200)
            .header("date", format_http_date(Utc::now()));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Bytes::from_static(body.as_bytes())).unwrap()
    }

    fn load(store: &FileStore, request: &Request) -> Option<Response> {
        let mut found = store.lookup(request).unwrap()?;
        store.restore_body(&mut found).unwrap();
        Some(found)
    }

    #[test]
    fn test_write_then_lookup() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let req = request("http://localhost/test", &[]);
        let mut res = response("hello", &[("cache-control", "max-age=60"), ("age", "3")]);

        let key = store.write(&req, &mut res).unwrap();
        assert!(key.starts_with("md"));
        assert_eq!(res.header_str(X_CONTENT_DIGEST), Some(content_digest(b"hello").as_str()));
        assert_eq!(res.header_str("content-length"), Some("5"));

        let found = store.lookup(&req).unwrap().unwrap();
        assert!(found.headers().contains_key(X_BODY_FILE));
        assert!(found.body().is_empty());
        assert!(found.headers().get("age").is_none());

        let found = load(&store, &req).unwrap();
        assert_eq!(found.body().as_ref(), b"hello");
        assert_eq!(found.status(), StatusCode::OK);
        assert!(!found.headers().contains_key(X_BODY_FILE));
    }

    #[test]
    fn test_lookup_unknown_is_none() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        assert!(store.lookup(&request("http://localhost/none", &[])).unwrap().is_none());
    }

    #[test]
    fn test_status_is_preserved() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let req = request("http://localhost/gone", &[]);
        let mut res = response("gone", &[("cache-control", "max-age=60")]);
        *res.status_mut() = StatusCode::GONE;
        store.write(&req, &mut res).unwrap();
        assert_eq!(store.lookup(&req).unwrap().unwrap().status(), StatusCode::GONE);
    }

    #[test]
    fn test_vary_variants_coexist() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let foo = request("http://localhost/v", &[("foo", "Foo"), ("bar", "Bar")]);
        let baz = request("http://localhost/v", &[("foo", "Baz"), ("bar", "Boom")]);

        let mut first = response("foo", &[("vary", "Foo, Bar"), ("cache-control", "max-age=60")]);
        store.write(&foo, &mut first).unwrap();
        let mut second = response("baz", &[("vary", "Foo, Bar"), ("cache-control", "max-age=60")]);
        store.write(&baz, &mut second).unwrap();

        assert_eq!(load(&store, &foo).unwrap().body().as_ref(), b"foo");
        assert_eq!(load(&store, &baz).unwrap().body().as_ref(), b"baz");

        let other = request("http://localhost/v", &[("foo", "Other"), ("bar", "Bar")]);
        assert!(store.lookup(&other).unwrap().is_none());
    }

    #[test]
    fn test_same_vary_values_replace_variant() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let req = request("http://localhost/r", &[("foo", "Foo")]);

        let mut first = response("one", &[("vary", "Foo"), ("cache-control", "max-age=60")]);
        let key = store.write(&req, &mut first).unwrap();
        let mut second = response("two", &[("vary", "Foo"), ("cache-control", "max-age=60")]);
        store.write(&req, &mut second).unwrap();

        assert_eq!(store.load_variants(&key).unwrap().len(), 1);
        assert_eq!(load(&store, &req).unwrap().body().as_ref(), b"two");
    }

    #[test]
    fn test_missing_content_is_miss() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let req = request("http://localhost/m", &[]);
        let mut res = response("body", &[("cache-control", "max-age=60")]);
        store.write(&req, &mut res).unwrap();

        fs::remove_file(store.content_path(&content_digest(b"body"))).unwrap();
        assert!(store.lookup(&req).unwrap().is_none());
    }

    #[test]
    fn test_forged_digest_is_recomputed() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let req = request("http://localhost/d", &[]);
        let mut res = response(
            "real",
            &[("cache-control", "max-age=60"), (X_CONTENT_DIGEST, "enforged")],
        );
        store.write(&req, &mut res).unwrap();
        assert_eq!(res.header_str(X_CONTENT_DIGEST), Some(content_digest(b"real").as_str()));
    }

    #[test]
    fn test_body_file_outside_store_rejected() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let outside = root.0.join("secret.txt");
        fs::write(&outside, b"secret").unwrap();

        let req = request("http://localhost/x", &[]);
        let mut res = response("", &[("cache-control", "max-age=60")]);
        res.headers_mut()
            .insert(X_BODY_FILE, HeaderValue::from_str(&outside.to_string_lossy()).unwrap());
        assert!(matches!(store.write(&req, &mut res), Err(StoreError::InvalidBodyFile(_))));
    }

    #[test]
    fn test_rewrite_of_looked_up_response() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let req = request("http://localhost/again", &[]);
        let mut res = response("again", &[("cache-control", "max-age=60")]);
        store.write(&req, &mut res).unwrap();

        let mut found = store.lookup(&req).unwrap().unwrap();
        store.write(&req, &mut found).unwrap();
        assert_eq!(found.body().as_ref(), b"again");
        assert!(!found.headers().contains_key(X_BODY_FILE));
    }

    #[test]
    fn test_invalidate_expires_fresh_entries() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let req = request("http://localhost/i", &[]);
        let mut res = response("fresh", &[("cache-control", "max-age=100")]);
        store.write(&req, &mut res).unwrap();
        assert!(store.lookup(&req).unwrap().unwrap().is_fresh());

        store.invalidate(&req).unwrap();
        let found = store.lookup(&req).unwrap().unwrap();
        assert!(!found.is_fresh());
        assert_eq!(found.age(), 100);
        // Content is kept.
        assert_eq!(load(&store, &req).unwrap().body().as_ref(), b"fresh");
    }

    #[test]
    fn test_purge_both_schemes() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let http = request("http://localhost/p", &[]);
        let https = request("https://localhost/p", &[]);
        store.write(&http, &mut response("a", &[("cache-control", "max-age=60")])).unwrap();
        store.write(&https, &mut response("b", &[("cache-control", "max-age=60")])).unwrap();

        assert!(store.purge("http://localhost/p").unwrap());
        assert!(store.lookup(&http).unwrap().is_none());
        assert!(store.lookup(&https).unwrap().is_none());
        assert!(!store.purge("https://localhost/p").unwrap());
        assert!(store.content_path(&content_digest(b"a")).exists());
    }

    #[test]
    fn test_lock_identity() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let other = store.session();
        let req = request("http://localhost/l", &[]);

        assert!(!store.is_locked(&req).unwrap());
        assert!(store.lock(&req).unwrap());
        assert!(store.lock(&req).unwrap());
        assert!(store.is_locked(&req).unwrap());
        assert!(other.is_locked(&req).unwrap());
        assert!(!other.lock(&req).unwrap());
        assert!(!other.unlock(&req).unwrap());

        assert!(store.unlock(&req).unwrap());
        assert!(!store.unlock(&req).unwrap());
        assert!(!store.is_locked(&req).unwrap());
        assert!(other.lock(&req).unwrap());
    }

    #[test]
    fn test_lock_across_processes_shares_marker() {
        let root = TempRoot::new();
        let first = FileStore::open(&root.0).unwrap();
        let second = FileStore::open(&root.0).unwrap();
        let req = request("http://localhost/shared", &[]);

        assert!(first.lock(&req).unwrap());
        assert!(second.is_locked(&req).unwrap());
        assert!(!second.lock(&req).unwrap());
        first.cleanup();
        assert!(second.lock(&req).unwrap());
    }

    #[test]
    fn test_lease_allows_takeover() {
        let root = TempRoot::new();
        let holder = FileStore::open(&root.0).unwrap();
        let waiter = FileStore::with_lease(&root.0, Some(Duration::from_millis(10))).unwrap();
        let req = request("http://localhost/lease", &[]);

        assert!(holder.lock(&req).unwrap());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_locked(&req).unwrap());
        assert!(waiter.lock(&req).unwrap());
    }

    #[test]
    fn test_dropping_session_releases_locks() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let req = request("http://localhost/drop", &[]);
        {
            let session = store.session();
            assert!(session.lock(&req).unwrap());
            assert_eq!(store.held_locks(), 1);
        }
        assert_eq!(store.held_locks(), 0);
        assert!(!store.is_locked(&req).unwrap());
    }

    fn aged(body: &'static str, secs: i64, headers: &[(&str, &str)]) -> Response {
        let mut res = response(body, headers);
        let date = format_http_date(Utc::now() - chrono::Duration::seconds(secs));
        res.headers_mut().insert("date", HeaderValue::from_str(&date).unwrap());
        res
    }

    fn backdate(path: &Path) {
        let old = SystemTime::now() - Duration::from_secs(600);
        fs::File::options().write(true).open(path).unwrap().set_modified(old).unwrap();
    }

    #[test]
    fn test_non_utf8_header_values_survive() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let req = request("http://localhost/latin1", &[]);
        let mut res = response("x", &[("cache-control", "max-age=60")]);
        res.headers_mut()
            .insert("x-title", HeaderValue::from_bytes(b"caf\xe9").unwrap());
        store.write(&req, &mut res).unwrap();

        let found = store.lookup(&req).unwrap().unwrap();
        assert_eq!(found.headers().get("x-title").unwrap().as_bytes(), b"caf\xe9");
        assert_eq!(found.headers().get("cache-control").unwrap(), "max-age=60");
    }

    #[test]
    fn test_vary_compares_raw_bytes() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let with = |value: &[u8]| {
            let mut req = request("http://localhost/bytes", &[]);
            req.headers_mut().insert("x-lang", HeaderValue::from_bytes(value).unwrap());
            req
        };
        let mut res = response("e-acute", &[("vary", "X-Lang"), ("cache-control", "max-age=60")]);
        store.write(&with(b"\xe9"), &mut res).unwrap();

        assert_eq!(load(&store, &with(b"\xe9")).unwrap().body().as_ref(), b"e-acute");
        assert!(store.lookup(&with(b"\xe8")).unwrap().is_none());
    }

    #[test]
    fn test_cleanup_tolerates_missing_marker() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let req = request("http://localhost/gone-marker", &[]);
        assert!(store.lock(&req).unwrap());
        fs::remove_file(store.lock_path(&cache_key(&req))).unwrap();

        store.cleanup();
        assert_eq!(store.held_locks(), 0);
        assert!(store.lock(&req).unwrap());
    }

    #[test]
    fn test_prune_drops_dead_variants_and_orphans() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let dead = request("http://localhost/dead", &[]);
        let validated = request("http://localhost/validated", &[]);
        let lingering = request("http://localhost/lingering", &[]);
        let fresh = request("http://localhost/fresh", &[]);

        store.write(&dead, &mut aged("dead", 120, &[("cache-control", "max-age=60")])).unwrap();
        store
            .write(&validated, &mut aged("tagged", 120, &[("cache-control", "max-age=60"), ("etag", "\"v\"")]))
            .unwrap();
        store
            .write(
                &lingering,
                &mut aged("lingering", 120, &[("cache-control", "max-age=60, stale-if-error=600")]),
            )
            .unwrap();
        store.write(&fresh, &mut response("fresh", &[("cache-control", "max-age=60")])).unwrap();

        let stats = store.prune().unwrap();
        assert_eq!(stats, PruneStats { variants: 1, bodies: 0 });
        assert!(store.lookup(&dead).unwrap().is_none());
        assert!(store.lookup(&validated).unwrap().is_some());
        assert!(store.lookup(&lingering).unwrap().is_some());
        assert!(store.lookup(&fresh).unwrap().is_some());

        // The orphaned body is kept until it leaves the grace period.
        let orphan = store.content_path(&content_digest(b"dead"));
        assert!(orphan.exists());
        backdate(&orphan);
        let kept = store.content_path(&content_digest(b"fresh"));
        backdate(&kept);

        assert_eq!(store.prune().unwrap(), PruneStats { variants: 0, bodies: 1 });
        assert!(!orphan.exists());
        assert!(kept.exists());
    }

    #[test]
    fn test_prune_runs_after_threshold_writes() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap().with_prune_threshold(2);
        let dead = request("http://localhost/auto-dead", &[]);
        store.write(&dead, &mut aged("old", 120, &[("cache-control", "max-age=60")])).unwrap();
        assert!(store.lookup(&dead).unwrap().is_some());

        let other = request("http://localhost/auto-other", &[]);
        store.write(&other, &mut response("new", &[("cache-control", "max-age=60")])).unwrap();
        assert!(store.lookup(&dead).unwrap().is_none());
        assert!(store.lookup(&other).unwrap().is_some());
    }

    #[test]
    fn test_clear_keeps_lock_markers() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let a = request("http://localhost/a", &[]);
        let b = request("http://localhost/b", &[("accept", "text/html")]);
        store.write(&a, &mut response("a", &[("cache-control", "max-age=60")])).unwrap();
        store.write(&b, &mut response("b", &[("cache-control", "max-age=60")])).unwrap();
        assert!(store.lock(&a).unwrap());

        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.lookup(&a).unwrap().is_none());
        assert!(store.lookup(&b).unwrap().is_none());
        assert!(!store.content_path(&content_digest(b"a")).exists());
        assert!(store.is_locked(&a).unwrap());
        assert!(store.unlock(&a).unwrap());

        store.write(&a, &mut response("again", &[("cache-control", "max-age=60")])).unwrap();
        assert_eq!(load(&store, &a).unwrap().body().as_ref(), b"again");
    }

    #[test]
    fn test_invalidate_tags_removes_tagged_variants() {
        let root = TempRoot::new();
        let store = FileStore::open(&root.0).unwrap();
        let en = request("http://localhost/product", &[("accept-language", "en")]);
        let de = request("http://localhost/product", &[("accept-language", "de")]);
        let list = request("http://localhost/list", &[]);
        let other = request("http://localhost/other", &[]);
        let vary = ("vary", "Accept-Language");

        store
            .write(&en, &mut response("en", &[vary, ("cache-control", "max-age=60"), ("cache-tags", "product-1, lang-en")]))
            .unwrap();
        store
            .write(&de, &mut response("de", &[vary, ("cache-control", "max-age=60"), ("cache-tags", "product-2")]))
            .unwrap();
        store
            .write(&list, &mut response("list", &[("cache-control", "max-age=60"), ("cache-tags", "list,product-1")]))
            .unwrap();
        store.write(&other, &mut response("other", &[("cache-control", "max-age=60")])).unwrap();

        let tags = vec!["product-1".to_string(), " ".to_string()];
        assert_eq!(store.invalidate_tags(&tags).unwrap(), 2);
        assert!(store.lookup(&en).unwrap().is_none());
        assert!(store.lookup(&list).unwrap().is_none());
        assert_eq!(load(&store, &de).unwrap().body().as_ref(), b"de");
        assert!(store.lookup(&other).unwrap().is_some());

        assert_eq!(store.invalidate_tags(&["missing".to_string()]).unwrap(), 0);
        assert_eq!(store.invalidate_tags(&[]).unwrap(), 0);
    }
}
