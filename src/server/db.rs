//! SQLite-backed metadata store: one row per file, one row per compiled
//! permission rule, and a denormalized rule→file link table for bulk
//! lookups. The snapshot folder holds the authoritative bytes; everything
//! here is derived and can be rebuilt by rescanning it.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, Transaction};

use crate::metadata::FileMetadata;
use crate::permissions::{PermissionFile, PermissionRule, PermissionSet};
use crate::scanner::scan_tree;
use crate::sync_path::{SyncPath, PERM_FILE};
use crate::workspace::IgnoreRules;

/// File name of the legacy JSON permission format, migrated once at startup.
const LEGACY_PERM_FILE: &str = "_.syftperm";

const LIST_PAGE_SIZE: i64 = 1000;

#[derive(Clone)]
pub struct MetaStore {
    pool: SqlitePool,
}

impl MetaStore {
    pub async fn connect(db_path: &Path) -> Result<MetaStore, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().max_connections(8).connect_with(options).await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(MetaStore { pool })
    }

    /// All multi-statement mutations run inside one of these. IMMEDIATE
    /// takes the write lock up front so concurrent writers queue on the
    /// busy timeout instead of failing mid-transaction. Dropping the
    /// returned transaction without committing rolls it back.
    pub async fn begin_immediate(&self) -> Result<Transaction<'static, sqlx::Sqlite>, sqlx::Error> {
        self.pool.begin_with("BEGIN IMMEDIATE").await
    }

    // ---- file metadata ----

    pub async fn save_file_metadata(&self, meta: &FileMetadata) -> Result<(), sqlx::Error> {
        upsert_metadata(&mut *self.pool.acquire().await?, meta).await
    }

    /// Requires exactly one row to be affected.
    pub async fn delete_file_metadata(&self, path: &SyncPath) -> Result<(), sqlx::Error> {
        let mut tx = self.begin_immediate().await?;
        delete_metadata(&mut tx, path).await?;
        tx.commit().await
    }

    pub async fn get_metadata(&self, path: &SyncPath) -> Result<Option<FileMetadata>, sqlx::Error> {
        let row = sqlx::query("SELECT path, hash, signature, file_size, last_modified FROM file_metadata WHERE path = ?")
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(metadata_from_row).transpose()
    }

    /// All metadata rows under a path prefix (a datasite or a directory),
    /// fetched in keyset-paginated pages so one huge datasite can't pin an
    /// unbounded result set in a single statement.
    pub async fn list_metadata(&self, prefix: &str) -> Result<Vec<FileMetadata>, sqlx::Error> {
        let mut result = Vec::new();
        let mut after = String::new();
        loop {
            let rows = sqlx::query(
                "SELECT path, hash, signature, file_size, last_modified FROM file_metadata \
                 WHERE (path = ?1 OR path LIKE ?2 ESCAPE '\\') AND path > ?3 \
                 ORDER BY path LIMIT ?4",
            )
            .bind(prefix)
            .bind(format!("{}/%", like_escape(prefix)))
            .bind(&after)
            .bind(LIST_PAGE_SIZE)
            .fetch_all(&self.pool)
            .await?;
            let page_len = rows.len();
            for row in rows {
                let meta = metadata_from_row(row)?;
                after = meta.path.to_string();
                result.push(meta);
            }
            if (page_len as i64) < LIST_PAGE_SIZE {
                return Ok(result);
            }
        }
    }

    /// Distinct first path segments, i.e. every datasite with content.
    pub async fn list_datasites(&self) -> Result<Vec<String>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT DISTINCT SUBSTR(path, 1, INSTR(path, '/') - 1) AS datasite \
             FROM file_metadata WHERE INSTR(path, '/') > 0 ORDER BY datasite",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("datasite")).collect())
    }

    /// Renames a file in the metadata row and on disk. The row moves
    /// first; if the filesystem rename then fails, the row is moved back,
    /// leaving the file in place.
    pub async fn move_with_transaction(
        &self,
        from: &SyncPath,
        to: &SyncPath,
        snapshot: &Path,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.begin_immediate().await?;
        let updated = sqlx::query("UPDATE file_metadata SET path = ? WHERE path = ?")
            .bind(to.as_str())
            .bind(from.as_str())
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() != 1 {
            return Err(sqlx::Error::RowNotFound);
        }
        relink_file(&mut tx, to).await?;

        if let Err(e) = std::fs::rename(from.to_disk_path(snapshot), to.to_disk_path(snapshot)) {
            // Dropping the transaction restores the row
            warn!("Move of '{from}' failed on disk, restoring row: {e}");
            return Err(sqlx::Error::Io(e));
        }
        tx.commit().await
    }

    // ---- permission rules ----

    /// Rules gathered from every permission file on the ancestor chain of
    /// `path`. This is the exact (non-denormalized) lookup, valid for
    /// paths that don't exist yet — the gate for `create`.
    pub async fn rules_for_path(&self, path: &SyncPath) -> Result<Vec<PermissionRule>, sqlx::Error> {
        let mut dirs = Vec::new();
        let segments: Vec<&str> = path.as_str().split('/').collect();
        for i in 1..segments.len() {
            dirs.push(segments[..i].join("/"));
        }
        if dirs.is_empty() {
            return Ok(vec![]);
        }

        let placeholders = vec!["?"; dirs.len()].join(",");
        let sql = format!(
            "SELECT * FROM permission_rule WHERE permfile_dir IN ({placeholders}) \
             ORDER BY permfile_depth, permfile_dir, priority"
        );
        let mut query = sqlx::query(&sql);
        for dir in &dirs {
            query = query.bind(dir);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(rule_from_row).collect())
    }

    /// Link-table variant for bulk listings: the links are a superset of
    /// applicability, and evaluation re-checks exactly, so the answer
    /// matches `rules_for_path` for any file that has a row.
    pub async fn rules_linked_to(&self, path: &SyncPath) -> Result<Vec<PermissionRule>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT r.* FROM permission_rule r \
             JOIN rule_file_link l ON l.rule_id = r.id \
             WHERE l.file_path = ? \
             ORDER BY r.permfile_depth, r.permfile_dir, r.priority",
        )
        .bind(path.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(rule_from_row).collect())
    }

    /// All rules owned by permission files inside `dir` (the dir's own
    /// file included). Used to evaluate bulk listings in one query.
    pub async fn rules_under_dir(&self, dir: &str) -> Result<Vec<PermissionRule>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM permission_rule WHERE permfile_dir = ?1 OR permfile_dir LIKE ?2 ESCAPE '\\' \
             ORDER BY permfile_depth, permfile_dir, priority",
        )
        .bind(dir)
        .bind(format!("{}/%", like_escape(dir)))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(rule_from_row).collect())
    }

    /// Replaces the compiled rows of one permission file wholesale and
    /// rebuilds the link rows for files under its directory.
    pub async fn replace_rules_for_permfile(&self, file: &PermissionFile) -> Result<(), sqlx::Error> {
        let mut tx = self.begin_immediate().await?;
        replace_rules(&mut tx, file).await?;
        tx.commit().await
    }

    pub async fn delete_rules_for_permfile(&self, dir: &str) -> Result<(), sqlx::Error> {
        let mut tx = self.begin_immediate().await?;
        delete_rules(&mut tx, dir).await?;
        tx.commit().await
    }

    // ---- users ----

    pub async fn register_user(&self, email: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO users (email, registered_at) VALUES (?, ?) ON CONFLICT(email) DO NOTHING")
            .bind(email)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- startup reconciliation ----

    /// Reconciles the database against the snapshot folder: hashes what's
    /// on disk, upserts every row, drops rows whose file vanished, and
    /// recompiles every permission file. This is the recovery path for
    /// any disk/DB divergence (crash windows, direct edits).
    pub async fn rescan_snapshot(&self, snapshot: &Path) -> Result<(), sqlx::Error> {
        migrate_legacy_permission_files(snapshot);

        info!("Rescanning snapshot folder {}", snapshot.display());
        let snapshot_owned = snapshot.to_path_buf();
        let found = tokio::task::spawn_blocking(move || {
            scan_tree(&snapshot_owned, None, &IgnoreRules::empty())
        })
        .await
        .map_err(|e| sqlx::Error::Protocol(format!("scan task: {e}")))?;

        let mut tx = self.begin_immediate().await?;
        for meta in &found {
            upsert_metadata(&mut tx, meta).await?;
        }
        // Drop rows for files that no longer exist on disk
        let rows = sqlx::query("SELECT path FROM file_metadata").fetch_all(&mut *tx).await?;
        let on_disk: std::collections::HashSet<&str> = found.iter().map(|m| m.path.as_str()).collect();
        for row in rows {
            let path: String = row.get("path");
            if !on_disk.contains(path.as_str()) {
                info!("'{path}' vanished from the snapshot; dropping its row");
                sqlx::query("DELETE FROM rule_file_link WHERE file_path = ?").bind(&path).execute(&mut *tx).await?;
                sqlx::query("DELETE FROM file_metadata WHERE path = ?").bind(&path).execute(&mut *tx).await?;
            }
        }

        // Recompile every permission file found on disk. A file that no
        // longer parses keeps its previously compiled rows in force.
        for meta in &found {
            if !meta.path.is_permission_file() {
                continue;
            }
            let disk = meta.path.to_disk_path(snapshot);
            let content = match std::fs::read_to_string(&disk) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Can't read permission file {}: {e}", disk.display());
                    continue;
                }
            };
            match PermissionFile::parse(&content, &meta.path) {
                Ok(file) => replace_rules(&mut tx, &file).await?,
                Err(e) => warn!("Keeping previous rules: {e}"),
            }
        }
        tx.commit().await?;
        info!("Rescan complete: {} files", found.len());
        Ok(())
    }
}

// ---- statement-level helpers, composable inside one transaction ----

pub(crate) async fn upsert_metadata(conn: &mut SqliteConnection, meta: &FileMetadata) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO file_metadata (path, hash, signature, file_size, last_modified) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(path) DO UPDATE SET \
             hash = excluded.hash, \
             signature = excluded.signature, \
             file_size = excluded.file_size, \
             last_modified = excluded.last_modified",
    )
    .bind(meta.path.as_str())
    .bind(&meta.hash)
    .bind(&meta.signature)
    .bind(meta.file_size as i64)
    .bind(meta.last_modified)
    .execute(&mut *conn)
    .await?;
    relink_file(conn, &meta.path).await
}

/// Insert-only variant for `create`: returns false (and writes nothing)
/// when a row for the path already exists, so a racing create loses
/// cleanly instead of clobbering.
pub(crate) async fn insert_metadata_if_absent(
    conn: &mut SqliteConnection,
    meta: &FileMetadata,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO file_metadata (path, hash, signature, file_size, last_modified) \
         VALUES (?, ?, ?, ?, ?) ON CONFLICT(path) DO NOTHING",
    )
    .bind(meta.path.as_str())
    .bind(&meta.hash)
    .bind(&meta.signature)
    .bind(meta.file_size as i64)
    .bind(meta.last_modified)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }
    relink_file(conn, &meta.path).await?;
    Ok(true)
}

pub(crate) async fn delete_metadata(conn: &mut SqliteConnection, path: &SyncPath) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM rule_file_link WHERE file_path = ?")
        .bind(path.as_str())
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM file_metadata WHERE path = ?")
        .bind(path.as_str())
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() != 1 {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}

/// Recomputes the link rows for one file against the current rule set.
/// Called whenever a file is created or moved.
pub(crate) async fn relink_file(conn: &mut SqliteConnection, path: &SyncPath) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM rule_file_link WHERE file_path = ?")
        .bind(path.as_str())
        .execute(&mut *conn)
        .await?;

    let mut dirs = Vec::new();
    let segments: Vec<&str> = path.as_str().split('/').collect();
    for i in 1..segments.len() {
        dirs.push(segments[..i].join("/"));
    }
    if dirs.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; dirs.len()].join(",");
    let sql = format!("SELECT * FROM permission_rule WHERE permfile_dir IN ({placeholders})");
    let mut query = sqlx::query(&sql);
    for dir in &dirs {
        query = query.bind(dir);
    }
    let rules: Vec<(i64, PermissionRule)> = query
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(|row| (row.get::<i64, _>("id"), rule_from_row(row)))
        .collect();

    for (id, rule) in rules {
        if rule.may_apply_to(path) {
            sqlx::query("INSERT OR IGNORE INTO rule_file_link (rule_id, file_path) VALUES (?, ?)")
                .bind(id)
                .bind(path.as_str())
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

pub(crate) async fn replace_rules(conn: &mut SqliteConnection, file: &PermissionFile) -> Result<(), sqlx::Error> {
    let dir = file.path.parent().map(|p| p.to_string()).unwrap_or_default();
    delete_rules(conn, &dir).await?;

    let mut inserted: Vec<(i64, &PermissionRule)> = Vec::with_capacity(file.rules.len());
    for rule in &file.rules {
        let result = sqlx::query(
            "INSERT INTO permission_rule \
             (permfile_dir, permfile_depth, priority, path_pattern, user, \
              can_read, can_create, can_write, admin, disallow, terminal) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.dir)
        .bind(rule.depth as i64)
        .bind(rule.priority as i64)
        .bind(&rule.pattern)
        .bind(&rule.user)
        .bind(rule.perms.read)
        .bind(rule.perms.create)
        .bind(rule.perms.write)
        .bind(rule.perms.admin)
        .bind(!rule.allow)
        .bind(rule.terminal)
        .execute(&mut *conn)
        .await?;
        inserted.push((result.last_insert_rowid(), rule));
    }

    // Rebuild links for everything under the owning directory
    let rows = sqlx::query("SELECT path FROM file_metadata WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'")
        .bind(&dir)
        .bind(format!("{}/%", like_escape(&dir)))
        .fetch_all(&mut *conn)
        .await?;
    for row in rows {
        let path_text: String = row.get("path");
        let path = match SyncPath::try_from(path_text.as_str()) {
            Ok(p) => p,
            Err(_) => continue,
        };
        for (id, rule) in &inserted {
            if rule.may_apply_to(&path) {
                sqlx::query("INSERT OR IGNORE INTO rule_file_link (rule_id, file_path) VALUES (?, ?)")
                    .bind(id)
                    .bind(path.as_str())
                    .execute(&mut *conn)
                    .await?;
            }
        }
    }
    Ok(())
}

pub(crate) async fn delete_rules(conn: &mut SqliteConnection, dir: &str) -> Result<(), sqlx::Error> {
    // Link rows go with their rules via ON DELETE CASCADE
    sqlx::query("DELETE FROM permission_rule WHERE permfile_dir = ?")
        .bind(dir)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Escapes LIKE wildcards so path prefixes match literally ('_' is common
/// in emails).
fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn metadata_from_row(row: SqliteRow) -> Result<FileMetadata, sqlx::Error> {
    let path_text: String = row.get("path");
    let path = SyncPath::try_from(path_text.as_str())
        .map_err(|e| sqlx::Error::Decode(format!("bad path in file_metadata: {e}").into()))?;
    Ok(FileMetadata {
        path,
        hash: row.get("hash"),
        signature: row.get("signature"),
        file_size: row.get::<i64, _>("file_size") as u64,
        last_modified: row.get::<DateTime<Utc>, _>("last_modified"),
    })
}

fn rule_from_row(row: SqliteRow) -> PermissionRule {
    PermissionRule {
        dir: row.get("permfile_dir"),
        depth: row.get::<i64, _>("permfile_depth") as u32,
        priority: row.get::<i64, _>("priority") as u32,
        pattern: row.get("path_pattern"),
        user: row.get("user"),
        perms: PermissionSet {
            read: row.get("can_read"),
            create: row.get("can_create"),
            write: row.get("can_write"),
            admin: row.get("admin"),
        },
        allow: !row.get::<bool, _>("disallow"),
        terminal: row.get("terminal"),
    }
}

/// One-time migration of the legacy JSON permission format: each
/// `_.syftperm` holds `{ "<permission>": [emails...], "terminal": bool }`
/// and becomes a YAML rules file in the same directory. Runs before the
/// rescan so the new files are picked up like any others.
fn migrate_legacy_permission_files(snapshot: &Path) {
    let legacy: Vec<_> = walkdir::WalkDir::new(snapshot)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == LEGACY_PERM_FILE)
        .collect();

    for entry in legacy {
        match convert_legacy_file(entry.path(), snapshot) {
            Ok(()) => {
                info!("Migrated legacy permission file {}", entry.path().display());
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!("Couldn't remove migrated {}: {e}", entry.path().display());
                }
            }
            Err(e) => warn!("Skipping legacy permission file {}: {e}", entry.path().display()),
        }
    }
}

fn convert_legacy_file(path: &Path, snapshot: &Path) -> Result<(), String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let value: serde_json::Value = serde_json::from_str(&content).map_err(|e| e.to_string())?;
    let object = value.as_object().ok_or("not a JSON object")?;

    let terminal = object.get("terminal").and_then(|v| v.as_bool()).unwrap_or(false);

    // permission name -> emails becomes email -> permission names
    let mut by_email: std::collections::BTreeMap<String, Vec<String>> = std::collections::BTreeMap::new();
    for (key, emails) in object {
        if key == "terminal" || key == "filepath" {
            continue;
        }
        if crate::permissions::PermissionKind::from_name(key).is_none() {
            warn!("Legacy permission file {} has unknown permission '{key}'", path.display());
            continue;
        }
        let Some(list) = emails.as_array() else { continue };
        for email in list.iter().filter_map(|e| e.as_str()) {
            let user = if email == "GLOBAL" { "*".to_string() } else { email.to_string() };
            by_email.entry(user).or_default().push(key.clone());
        }
    }

    let docs: Vec<crate::permissions::RuleDoc> = by_email
        .into_iter()
        .map(|(user, permissions)| crate::permissions::RuleDoc {
            path: "**".to_string(),
            user,
            permissions: crate::permissions::PermissionNames::Many(permissions),
            rule_type: None,
            terminal,
        })
        .collect();

    let rel = path
        .parent()
        .and_then(|p| p.strip_prefix(snapshot).ok())
        .ok_or("outside the snapshot folder")?;
    let new_rel = SyncPath::try_from(rel.join(PERM_FILE).as_path()).map_err(|e| e.to_string())?;
    let yaml = serde_yaml::to_string(&docs).map_err(|e| e.to_string())?;
    // Validate what we're about to write
    PermissionFile::parse(&yaml, &new_rel).map_err(|e| e.to_string())?;

    let target = path.with_file_name(PERM_FILE);
    std::fs::write(&target, yaml).map_err(|e| e.to_string())?;
    Ok(())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS file_metadata (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        hash TEXT NOT NULL,
        signature TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        last_modified TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS permission_rule (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        permfile_dir TEXT NOT NULL,
        permfile_depth INTEGER NOT NULL,
        priority INTEGER NOT NULL,
        path_pattern TEXT NOT NULL,
        user TEXT NOT NULL,
        can_read INTEGER NOT NULL,
        can_create INTEGER NOT NULL,
        can_write INTEGER NOT NULL,
        admin INTEGER NOT NULL,
        disallow INTEGER NOT NULL,
        terminal INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_permission_rule_dir ON permission_rule (permfile_dir)",
    "CREATE TABLE IF NOT EXISTS rule_file_link (
        rule_id INTEGER NOT NULL REFERENCES permission_rule(id) ON DELETE CASCADE,
        file_path TEXT NOT NULL,
        PRIMARY KEY (rule_id, file_path)
    )",
    "CREATE INDEX IF NOT EXISTS idx_rule_file_link_path ON rule_file_link (file_path)",
    "CREATE TABLE IF NOT EXISTS users (
        email TEXT PRIMARY KEY,
        registered_at TEXT NOT NULL
    )",
];
