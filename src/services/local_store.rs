//! src/services/local_store.rs
//!
//! LocalStore — an ObjectStore backed by SQLite for metadata and leases and
//! by local disk for object payloads. Payloads are sharded beneath
//! `base_path/{container}/{shard}/{shard}/{digest}` so arbitrary keys
//! (including folder markers ending in `/`) never become filesystem paths.
//!
//! Native leases are a pair of columns updated with a conditional `UPDATE`,
//! which SQLite applies atomically; metadata writes bump `metageneration`
//! so callers can ask for compare-and-set semantics.

use crate::{
    models::{
        container::Container,
        object::{Metadata, MetadataSnapshot, ObjectRecord, ObjectRef},
        scope::Scope,
    },
    services::{
        clock::{Clock, SystemClock},
        store::{LeaseToken, ObjectStore, StoreError, StoreResult},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::{Stream, StreamExt, pin_mut, stream};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const CONTAINER_NAME_MIN_LEN: usize = 3;
const CONTAINER_NAME_MAX_LEN: usize = 63;
const LIST_PAGE_SIZE: i64 = 1000;
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const OBJECT_COLUMNS: &str = "id, container_id, key, content_type, size_bytes, etag, \
     last_modified, metageneration, lease_id, lease_expires_ms";

#[derive(Clone, Debug)]
pub struct LocalStore {
    /// Shared SQLite connection pool used for metadata and lease state.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    clock: Arc<dyn Clock>,
}

impl LocalStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for native lease expiry instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Preflight check: one query against SQLite and a write/read/delete
    /// round trip under `base_path`.
    pub async fn ping(&self) -> StoreResult<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        if one != 1 {
            return Err(StoreError::Backend(format!(
                "unexpected SELECT 1 result: {}",
                one
            )));
        }

        fs::create_dir_all(&self.base_path).await?;
        let probe = self.base_path.join(format!(".ping-{}", Uuid::new_v4()));
        fs::write(&probe, b"ping").await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if read_back? != b"ping" {
            return Err(StoreError::Backend(format!(
                "storage directory {} returned mismatched content",
                self.base_path.display()
            )));
        }
        Ok(())
    }

    /// Create a container and its payload directory.
    pub async fn create_container(&self, name: &str) -> StoreResult<Container> {
        ensure_container_name_safe(name)?;
        fs::create_dir_all(self.container_root(name)).await?;

        let container = Container {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        match sqlx::query("INSERT INTO containers (id, name, created_at) VALUES (?, ?, ?)")
            .bind(container.id)
            .bind(&container.name)
            .bind(container.created_at)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(container),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::ContainerAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StoreError::Sqlx(err)),
        }
    }

    /// Store an in-memory payload. Overwrites an existing object.
    pub async fn put_object(
        &self,
        object: &ObjectRef,
        content: impl Into<Bytes>,
        metadata: &Metadata,
    ) -> StoreResult<ObjectRecord> {
        let body = stream::once(futures::future::ready(Ok::<_, io::Error>(content.into())));
        self.put_object_stream(object, None, metadata, body).await
    }

    /// Stream a payload to disk and upsert its record and metadata.
    pub async fn put_object_stream<S>(
        &self,
        object: &ObjectRef,
        content_type: Option<String>,
        metadata: &Metadata,
        body: S,
    ) -> StoreResult<ObjectRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        ensure_key_safe(&object.key)?;
        let container = self.fetch_container(&object.container).await?;
        let file_path = self.object_path(object);
        let (size_bytes, etag) = write_payload(&file_path, body).await?;

        match self
            .upsert_record(&container, &object.key, content_type, size_bytes, etag, metadata)
            .await
        {
            Ok(record) => Ok(record),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(err)
            }
        }
    }

    /// Read a whole payload into memory.
    pub async fn read_object(&self, object: &ObjectRef) -> StoreResult<Bytes> {
        let container = self.fetch_container(&object.container).await?;
        self.fetch_object(&container, object).await?;
        let bytes = fs::read(self.object_path(object)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::ObjectNotFound(object.clone())
            } else {
                StoreError::Io(err)
            }
        })?;
        Ok(Bytes::from(bytes))
    }

    fn container_root(&self, container: &str) -> PathBuf {
        self.base_path.join(container)
    }

    /// Payload location: two shard levels plus the full digest as file name.
    fn object_path(&self, object: &ObjectRef) -> PathBuf {
        let digest = md5::compute(format!("{}/{}", object.container, object.key));
        let mut path = self.container_root(&object.container);
        path.push(format!("{:02x}", digest[0]));
        path.push(format!("{:02x}", digest[1]));
        path.push(format!("{:x}", digest));
        path
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    async fn fetch_container(&self, name: &str) -> StoreResult<Container> {
        ensure_container_name_safe(name)?;
        sqlx::query_as::<_, Container>("SELECT id, name, created_at FROM containers WHERE name = ?")
            .bind(name)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StoreError::ContainerNotFound(name.to_string()),
                other => StoreError::Sqlx(other),
            })
    }

    async fn fetch_object(
        &self,
        container: &Container,
        object: &ObjectRef,
    ) -> StoreResult<ObjectRecord> {
        sqlx::query_as::<_, ObjectRecord>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE container_id = ? AND key = ?"
        ))
        .bind(container.id)
        .bind(&object.key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::ObjectNotFound(object.clone()),
            other => StoreError::Sqlx(other),
        })
    }

    async fn fetch_metadata(&self, object_id: Uuid) -> StoreResult<Metadata> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM object_metadata WHERE object_id = ?",
        )
        .bind(object_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn upsert_record(
        &self,
        container: &Container,
        key: &str,
        content_type: Option<String>,
        size_bytes: i64,
        etag: String,
        metadata: &Metadata,
    ) -> StoreResult<ObjectRecord> {
        let mut tx = self.db.begin().await?;
        let record = sqlx::query_as::<_, ObjectRecord>(&format!(
            r#"
            INSERT INTO objects (
                id, container_id, key, content_type, size_bytes, etag,
                last_modified, metageneration
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT(container_id, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                metageneration = objects.metageneration + 1
            RETURNING {OBJECT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(container.id)
        .bind(key)
        .bind(content_type)
        .bind(size_bytes)
        .bind(etag)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        replace_metadata(&mut tx, record.id, metadata).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Remove empty shard directories up to the container root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    fn supports_native_leases(&self) -> bool {
        true
    }

    async fn list(&self, scope: &Scope) -> StoreResult<Vec<ObjectRef>> {
        let container = self.fetch_container(&scope.container).await?;
        let prefix_len = scope.prefix.chars().count() as i64;
        let mut keys = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let page = sqlx::query_scalar::<_, String>(
                "SELECT key FROM objects
                 WHERE container_id = ? AND substr(key, 1, ?) = ? AND (? IS NULL OR key > ?)
                 ORDER BY key ASC LIMIT ?",
            )
            .bind(container.id)
            .bind(prefix_len)
            .bind(&scope.prefix)
            .bind(after.as_deref())
            .bind(after.as_deref())
            .bind(LIST_PAGE_SIZE)
            .fetch_all(&*self.db)
            .await?;

            let full_page = page.len() as i64 == LIST_PAGE_SIZE;
            after = page.last().cloned();
            keys.extend(page);
            if !full_page {
                break;
            }
        }

        debug!("listed {} objects under {}", keys.len(), scope);
        Ok(keys
            .into_iter()
            .map(|key| ObjectRef::new(scope.container.clone(), key))
            .collect())
    }

    async fn read_metadata(&self, object: &ObjectRef) -> StoreResult<MetadataSnapshot> {
        let container = self.fetch_container(&object.container).await?;
        let record = self.fetch_object(&container, object).await?;
        let values = self.fetch_metadata(record.id).await?;
        Ok(MetadataSnapshot {
            values,
            generation: Some(record.metageneration),
        })
    }

    async fn write_metadata(
        &self,
        object: &ObjectRef,
        values: &Metadata,
        if_generation: Option<i64>,
    ) -> StoreResult<()> {
        let container = self.fetch_container(&object.container).await?;
        let record = self.fetch_object(&container, object).await?;

        let mut tx = self.db.begin().await?;
        let bumped = sqlx::query(
            "UPDATE objects SET metageneration = metageneration + 1
             WHERE id = ? AND (? IS NULL OR metageneration = ?)",
        )
        .bind(record.id)
        .bind(if_generation)
        .bind(if_generation)
        .execute(&mut *tx)
        .await?;

        if bumped.rows_affected() == 0 {
            return Err(match if_generation {
                Some(_) => StoreError::Conflict(object.clone()),
                None => StoreError::ObjectNotFound(object.clone()),
            });
        }

        replace_metadata(&mut tx, record.id, values).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn copy(
        &self,
        src: &ObjectRef,
        dst: &ObjectRef,
        drop_metadata: &[&str],
    ) -> StoreResult<()> {
        ensure_key_safe(&dst.key)?;
        let src_container = self.fetch_container(&src.container).await?;
        let dst_container = self.fetch_container(&dst.container).await?;
        let record = self.fetch_object(&src_container, src).await?;
        let mut metadata = self.fetch_metadata(record.id).await?;
        metadata.retain(|key, _| !drop_metadata.contains(&key.as_str()));

        let file = File::open(self.object_path(src)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::ObjectNotFound(src.clone())
            } else {
                StoreError::Io(err)
            }
        })?;

        let dst_path = self.object_path(dst);
        let (size_bytes, etag) = write_payload(&dst_path, ReaderStream::new(file)).await?;
        debug!("copied {} bytes from {} to {}", size_bytes, src, dst);

        match self
            .upsert_record(
                &dst_container,
                &dst.key,
                record.content_type,
                size_bytes,
                etag,
                &metadata,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&dst_path).await;
                Err(err)
            }
        }
    }

    async fn delete(&self, object: &ObjectRef, lease: Option<&LeaseToken>) -> StoreResult<()> {
        let container = self.fetch_container(&object.container).await?;
        let record = self.fetch_object(&container, object).await?;

        let mut tx = self.db.begin().await?;
        let result = sqlx::query(
            "DELETE FROM objects
             WHERE id = ? AND (lease_id IS NULL OR lease_expires_ms <= ? OR lease_id = ?)",
        )
        .bind(record.id)
        .bind(self.now_ms())
        .bind(lease.map(|token| token.0.as_str()))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyLeased(object.clone()));
        }

        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(record.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let file_path = self.object_path(object);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed payload {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", file_path.display());
            }
            // The row is gone, so the delete stands.
            Err(err) => warn!(
                "deleted {} but could not remove payload {}: {}",
                object,
                file_path.display(),
                err
            ),
        }

        if let Some(parent) = file_path.parent() {
            let root = self.container_root(&object.container);
            self.prune_empty_dirs(parent, &root).await;
        }

        Ok(())
    }

    async fn acquire_lease(&self, object: &ObjectRef, ttl: Duration) -> StoreResult<LeaseToken> {
        let container = self.fetch_container(&object.container).await?;
        let now = self.now_ms();
        let expires_ms = now
            .checked_add(ttl.num_milliseconds())
            .ok_or(StoreError::InvalidLeaseTtl(ttl))?;
        let token = LeaseToken(Uuid::new_v4().to_string());

        let result = sqlx::query(
            "UPDATE objects SET lease_id = ?, lease_expires_ms = ?
             WHERE container_id = ? AND key = ?
               AND (lease_id IS NULL OR lease_expires_ms IS NULL OR lease_expires_ms <= ?)",
        )
        .bind(&token.0)
        .bind(expires_ms)
        .bind(container.id)
        .bind(&object.key)
        .bind(now)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            // Either missing or held; fetch_object tells the two apart.
            self.fetch_object(&container, object).await?;
            return Err(StoreError::AlreadyLeased(object.clone()));
        }
        Ok(token)
    }

    async fn release_lease(&self, object: &ObjectRef, token: &LeaseToken) -> StoreResult<()> {
        let container = self.fetch_container(&object.container).await?;
        let result = sqlx::query(
            "UPDATE objects SET lease_id = NULL, lease_expires_ms = NULL
             WHERE container_id = ? AND key = ? AND lease_id = ? AND lease_expires_ms > ?",
        )
        .bind(container.id)
        .bind(&object.key)
        .bind(&token.0)
        .bind(self.now_ms())
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            self.fetch_object(&container, object).await?;
            return Err(StoreError::LeaseLost(object.clone()));
        }
        Ok(())
    }

    async fn lease_expiry(&self, object: &ObjectRef) -> StoreResult<Option<DateTime<Utc>>> {
        let container = self.fetch_container(&object.container).await?;
        let record = self.fetch_object(&container, object).await?;
        let now = self.now_ms();
        Ok(record
            .lease_expires_ms
            .filter(|expires| record.lease_id.is_some() && *expires > now)
            .and_then(DateTime::<Utc>::from_timestamp_millis))
    }
}

/// Stream bytes into a temp file next to `file_path`, fsync, then rename
/// into place. Returns the payload size and its hex MD5.
async fn write_payload<S>(file_path: &Path, body: S) -> StoreResult<(i64, String)>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
        StoreError::Io(io::Error::new(
            ErrorKind::Other,
            "object path missing parent directory",
        ))
    })?;
    fs::create_dir_all(&parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let mut file = File::create(&tmp_path).await?;

    let mut size_bytes: i64 = 0;
    let mut digest = Context::new();
    pin_mut!(body);
    while let Some(chunk_res) = body.next().await {
        let chunk = match chunk_res {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        };
        size_bytes += chunk.len() as i64;
        digest.consume(&chunk);
        if let Err(err) = file.write_all(&chunk).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
    }
    if let Err(err) = file.flush().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StoreError::Io(err));
    }
    if let Err(err) = file.sync_all().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StoreError::Io(err));
    }

    if let Err(err) = fs::rename(&tmp_path, file_path).await {
        if err.kind() == ErrorKind::AlreadyExists {
            fs::remove_file(file_path).await?;
            fs::rename(&tmp_path, file_path).await?;
        } else {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
    }

    Ok((size_bytes, format!("{:x}", digest.compute())))
}

async fn replace_metadata(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    object_id: Uuid,
    values: &Metadata,
) -> StoreResult<()> {
    sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
        .bind(object_id)
        .execute(&mut **tx)
        .await?;
    for (key, value) in values {
        sqlx::query("INSERT INTO object_metadata (object_id, key, value) VALUES (?, ?, ?)")
            .bind(object_id)
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Rejects empty, oversized and control-character keys.
fn ensure_key_safe(key: &str) -> StoreResult<()> {
    if key.is_empty()
        || key.len() > MAX_OBJECT_KEY_LEN
        || key.bytes().any(|b| b.is_ascii_control() || b == b'\\')
    {
        return Err(StoreError::InvalidObjectKey(key.to_string()));
    }
    Ok(())
}

/// Validate container name format.
///
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - starts and ends with a letter or digit
/// - no consecutive dots or dot-hyphen patterns
fn ensure_container_name_safe(name: &str) -> StoreResult<()> {
    let invalid = |reason: &str| {
        Err(StoreError::InvalidContainerName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    let len = name.len();
    if !(CONTAINER_NAME_MIN_LEN..=CONTAINER_NAME_MAX_LEN).contains(&len) {
        return invalid("must be between 3 and 63 characters");
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return invalid("allowed characters are lowercase letters, digits, dots, and hyphens");
    }
    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return invalid("must start and end with a lowercase letter or digit");
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return invalid("cannot contain consecutive dots or dot-hyphen combinations");
    }
    Ok(())
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    async fn store_with_clock(clock: Arc<dyn Clock>) -> (LocalStore, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        let store = LocalStore::new(Arc::new(pool), dir.path().join("objects")).with_clock(clock);
        store.migrate().await.expect("schema");
        store.create_container("bucket").await.expect("container");
        (store, dir)
    }

    async fn store() -> (LocalStore, TempDir) {
        store_with_clock(Arc::new(SystemClock)).await
    }

    fn obj(key: &str) -> ObjectRef {
        ObjectRef::new("bucket", key)
    }

    #[tokio::test]
    async fn migrate_is_idempotent_and_ping_passes() {
        let (store, _dir) = store().await;
        store.migrate().await.expect("second migrate");
        store.ping().await.expect("ping");
    }

    #[tokio::test]
    async fn rejects_bad_container_names() {
        let (store, _dir) = store().await;
        for name in ["ab", "Upper", "-lead", "a..b", "has space"] {
            assert!(matches!(
                store.create_container(name).await,
                Err(StoreError::InvalidContainerName { .. })
            ));
        }
        assert!(matches!(
            store.create_container("bucket").await,
            Err(StoreError::ContainerAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn put_list_and_read_back() {
        let (store, _dir) = store().await;
        for key in ["src/b.txt", "src/a/c.txt", "dst/x.txt", "src/"] {
            store
                .put_object(&obj(key), key.to_string(), &Metadata::new())
                .await
                .expect("put");
        }

        let listed = store
            .list(&Scope::new("bucket", "src/"))
            .await
            .expect("list");
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["src/", "src/a/c.txt", "src/b.txt"]);

        let body = store.read_object(&obj("src/b.txt")).await.expect("read");
        assert_eq!(body, Bytes::from("src/b.txt"));
    }

    #[tokio::test]
    async fn prefix_match_is_literal() {
        let (store, _dir) = store().await;
        for key in ["a_b/1", "axb/2"] {
            store
                .put_object(&obj(key), "x", &Metadata::new())
                .await
                .expect("put");
        }
        let listed = store.list(&Scope::new("bucket", "a_b/")).await.expect("list");
        assert_eq!(listed, vec![obj("a_b/1")]);
    }

    #[tokio::test]
    async fn copy_carries_payload_and_filtered_metadata() {
        let (store, _dir) = store().await;
        store.create_container("archive").await.expect("container");
        let mut metadata = Metadata::new();
        metadata.insert("lease_expiration".into(), "2030-01-01T00:00:00".into());
        metadata.insert("owner".into(), "ops".into());
        store
            .put_object(&obj("in/a.bin"), "payload", &metadata)
            .await
            .expect("put");

        let dst = ObjectRef::new("archive", "out/a.bin");
        store
            .copy(&obj("in/a.bin"), &dst, &["lease_expiration"])
            .await
            .expect("copy");

        assert_eq!(store.read_object(&dst).await.expect("read"), Bytes::from("payload"));
        let copied = store.read_metadata(&dst).await.expect("metadata");
        assert_eq!(copied.values.get("owner").map(String::as_str), Some("ops"));
        assert!(!copied.values.contains_key("lease_expiration"));
        let original = store.read_metadata(&obj("in/a.bin")).await.expect("metadata");
        assert!(original.values.contains_key("lease_expiration"));
    }

    #[tokio::test]
    async fn conditional_metadata_write() {
        let (store, _dir) = store().await;
        store
            .put_object(&obj("a"), "x", &Metadata::new())
            .await
            .expect("put");
        let snapshot = store.read_metadata(&obj("a")).await.expect("read");

        let mut values = Metadata::new();
        values.insert("k".into(), "v".into());
        store
            .write_metadata(&obj("a"), &values, snapshot.generation)
            .await
            .expect("first write");
        assert!(matches!(
            store
                .write_metadata(&obj("a"), &values, snapshot.generation)
                .await,
            Err(StoreError::Conflict(_))
        ));
        store
            .write_metadata(&obj("a"), &Metadata::new(), None)
            .await
            .expect("unconditional write");
        assert!(store.read_metadata(&obj("a")).await.expect("read").values.is_empty());
    }

    #[tokio::test]
    async fn native_lease_is_exclusive_until_expiry() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        let (store, _dir) = store_with_clock(Arc::new(clock.clone())).await;
        store
            .put_object(&obj("a"), "x", &Metadata::new())
            .await
            .expect("put");

        let token = store
            .acquire_lease(&obj("a"), Duration::seconds(60))
            .await
            .expect("lease");
        assert!(matches!(
            store.acquire_lease(&obj("a"), Duration::seconds(60)).await,
            Err(StoreError::AlreadyLeased(_))
        ));
        assert!(matches!(
            store.delete(&obj("a"), None).await,
            Err(StoreError::AlreadyLeased(_))
        ));
        assert!(store.lease_expiry(&obj("a")).await.expect("expiry").is_some());

        clock.advance(Duration::seconds(61));
        assert!(store.lease_expiry(&obj("a")).await.expect("expiry").is_none());
        assert!(matches!(
            store.release_lease(&obj("a"), &token).await,
            Err(StoreError::LeaseLost(_))
        ));
        store
            .acquire_lease(&obj("a"), Duration::seconds(60))
            .await
            .expect("lease after expiry");
    }

    #[tokio::test]
    async fn delete_with_token_removes_payload() {
        let (store, dir) = store().await;
        store
            .put_object(&obj("a"), "x", &Metadata::new())
            .await
            .expect("put");
        let token = store
            .acquire_lease(&obj("a"), Duration::seconds(60))
            .await
            .expect("lease");
        store.delete(&obj("a"), Some(&token)).await.expect("delete");

        assert!(matches!(
            store.read_metadata(&obj("a")).await,
            Err(StoreError::ObjectNotFound(_))
        ));
        assert!(matches!(
            store.release_lease(&obj("a"), &token).await,
            Err(StoreError::ObjectNotFound(_))
        ));
        let bucket_dir = dir.path().join("objects").join("bucket");
        let mut entries = fs::read_dir(&bucket_dir).await.expect("bucket dir");
        assert!(entries.next_entry().await.expect("read_dir").is_none());
    }

    #[tokio::test]
    async fn delete_succeeds_when_payload_cannot_be_removed() {
        let (store, _dir) = store().await;
        store
            .put_object(&obj("a"), "x", &Metadata::new())
            .await
            .expect("put");

        // A non-empty directory where the payload file should be makes
        // remove_file fail with something other than NotFound.
        let payload = store.object_path(&obj("a"));
        fs::remove_file(&payload).await.expect("drop payload");
        fs::create_dir_all(payload.join("blocker"))
            .await
            .expect("blocking dir");

        store.delete(&obj("a"), None).await.expect("delete");
        assert!(matches!(
            store.read_metadata(&obj("a")).await,
            Err(StoreError::ObjectNotFound(_))
        ));
        assert!(store.list(&Scope::new("bucket", "")).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn missing_container_is_reported() {
        let (store, _dir) = store().await;
        assert!(matches!(
            store.list(&Scope::new("nowhere", "")).await,
            Err(StoreError::ContainerNotFound(_))
        ));
    }
}
