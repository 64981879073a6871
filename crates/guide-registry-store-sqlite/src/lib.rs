use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use guide_registry_core::{
    format_iso_date, parse_iso_date, ElementDraft, ElementFilter, ElementId, ElementProbe, Guide,
    GuideDraft, GuideElement, GuideFilter, GuideId, Page, PageRequest, RegistryError,
    UpsertOutcome,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, DatabaseName, OptionalExtension, Transaction,
    TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

pub const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS guides (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT CHECK (name IS NULL OR length(name) <= 255),
  short_name TEXT CHECK (short_name IS NULL OR length(short_name) <= 63),
  description TEXT,
  version TEXT NOT NULL CHECK (length(version) BETWEEN 1 AND 63),
  start_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS guide_elements (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  guide_id INTEGER NOT NULL,
  element_code TEXT NOT NULL CHECK (length(element_code) BETWEEN 1 AND 63),
  value TEXT NOT NULL CHECK (length(value) BETWEEN 1 AND 255),
  UNIQUE(guide_id, element_code),
  FOREIGN KEY (guide_id) REFERENCES guides(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_guides_name_version ON guides(IFNULL(name, ''), version);
CREATE INDEX IF NOT EXISTS idx_guides_version_start_date ON guides(version, start_date);
CREATE INDEX IF NOT EXISTS idx_guide_elements_code ON guide_elements(element_code);
";

const GUIDE_COLUMNS: &str = "id, name, short_name, description, version, start_date";
const ELEMENT_COLUMNS: &str = "id, guide_id, element_code, value";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteSummary {
    pub guide_id: GuideId,
    pub removed_elements: u64,
}

/// SQL `WHERE` fragment plus its positional parameters.
#[derive(Default)]
struct Conditions {
    clauses: Vec<String>,
    values: Vec<SqlValue>,
}

impl Conditions {
    fn push(&mut self, clause: &str, value: SqlValue) {
        self.values.push(value);
        self.clauses.push(clause.replace('?', &format!("?{}", self.values.len())));
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

impl SqliteStore {
    /// Open a SQLite-backed guide store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Create the schema on first use and record its version.
    ///
    /// # Errors
    /// Returns an error when bootstrapping fails or the file carries an unknown schema version.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::info!(version = 1, "initialized guide registry schema");
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if !table_exists(&self.conn, "guides")? || !table_exists(&self.conn, "guide_elements")? {
            return Err(anyhow!("database schema is invalid: guide tables are missing"));
        }

        Ok(())
    }

    /// Create or update the guide keyed by `(name, version)`.
    ///
    /// # Errors
    /// Returns an error wrapping [`RegistryError::Validation`] for an invalid draft, or
    /// when any statement in the transaction fails.
    pub fn upsert_guide(&mut self, draft: GuideDraft) -> Result<UpsertOutcome<Guide>> {
        let draft = draft.normalized();
        draft.validate()?;
        let start_date = format_iso_date(draft.start_date);

        let tx = self.write_transaction()?;

        let existing = tx
            .query_row(
                "SELECT id FROM guides WHERE name IS ?1 AND version = ?2",
                params![draft.name, draft.version],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to look up guide by name and version")?;

        let (id, created) = if let Some(id) = existing {
            tx.execute(
                "UPDATE guides SET short_name = ?1, description = ?2, start_date = ?3 WHERE id = ?4",
                params![draft.short_name, draft.description, start_date, id],
            )
            .context("failed to update guide")?;
            (id, false)
        } else {
            tx.execute(
                "INSERT INTO guides(name, short_name, description, version, start_date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![draft.name, draft.short_name, draft.description, draft.version, start_date],
            )
            .context("failed to insert guide")?;
            (tx.last_insert_rowid(), true)
        };

        tx.commit().context("failed to commit guide upsert")?;
        tracing::debug!(guide_id = id, created, version = %draft.version, "upserted guide");

        Ok(UpsertOutcome {
            created,
            item: Guide {
                id: GuideId(id),
                name: draft.name,
                short_name: draft.short_name,
                description: draft.description,
                version: draft.version,
                start_date: draft.start_date,
            },
        })
    }

    /// Create or update the element keyed by `(guide_id, element_code)`.
    ///
    /// # Errors
    /// Returns an error wrapping [`RegistryError::GuideNotFound`] when the guide does not
    /// exist (nothing is written), [`RegistryError::Validation`] for an invalid draft, or a
    /// storage error.
    pub fn upsert_element(
        &mut self,
        guide_id: GuideId,
        draft: ElementDraft,
    ) -> Result<UpsertOutcome<GuideElement>> {
        let draft = draft.normalized();
        draft.validate()?;

        let tx = self.write_transaction()?;

        let guide_exists = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM guides WHERE id = ?1)",
                params![guide_id.0],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to look up guide")?
            == 1;
        if !guide_exists {
            return Err(RegistryError::GuideNotFound(guide_id).into());
        }

        let existing = tx
            .query_row(
                "SELECT id FROM guide_elements WHERE guide_id = ?1 AND element_code = ?2",
                params![guide_id.0, draft.element_code],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to look up guide element")?;

        let (id, created) = if let Some(id) = existing {
            tx.execute(
                "UPDATE guide_elements SET value = ?1 WHERE id = ?2",
                params![draft.value, id],
            )
            .context("failed to update guide element")?;
            (id, false)
        } else {
            tx.execute(
                "INSERT INTO guide_elements(guide_id, element_code, value) VALUES (?1, ?2, ?3)",
                params![guide_id.0, draft.element_code, draft.value],
            )
            .context("failed to insert guide element")?;
            (tx.last_insert_rowid(), true)
        };

        tx.commit().context("failed to commit guide element upsert")?;
        tracing::debug!(guide_id = guide_id.0, element_id = id, created, "upserted guide element");

        Ok(UpsertOutcome {
            created,
            item: GuideElement {
                id: ElementId(id),
                guide_id,
                element_code: draft.element_code,
                value: draft.value,
            },
        })
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_guide(&self, id: GuideId) -> Result<Option<Guide>> {
        let sql = format!("SELECT {GUIDE_COLUMNS} FROM guides WHERE id = ?1");
        let mut guides = self.select_guides(&sql, &[SqlValue::Integer(id.0)])?;
        Ok(guides.pop())
    }

    /// Filtered guide listing ordered by id.
    ///
    /// # Errors
    /// Returns an error when the count or page query fails.
    pub fn query_guides(&self, filter: &GuideFilter, page: &PageRequest) -> Result<Page<Guide>> {
        let mut conditions = Conditions::default();
        if let Some(name) = filter.name.as_deref().filter(|name| !name.is_empty()) {
            conditions.push("instr(name, ?) > 0", SqlValue::Text(name.to_string()));
        }
        if let Some(from) = filter.start_date {
            conditions.push("start_date >= ?", SqlValue::Text(format_iso_date(from)));
        }
        self.paged_guides(&conditions, page)
    }

    /// Every version of guides with exactly `name` (all guides when `name` is `None`),
    /// ordered by id.
    ///
    /// # Errors
    /// Returns an error when the count or page query fails.
    pub fn list_guides_named(&self, name: Option<&str>, page: &PageRequest) -> Result<Page<Guide>> {
        let mut conditions = Conditions::default();
        if let Some(name) = name {
            conditions.push("name = ?", SqlValue::Text(name.to_string()));
        }
        self.paged_guides(&conditions, page)
    }

    /// Resolution candidates: guides started on or before `as_of`, restricted to `name`
    /// when given.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn guides_started_by(&self, as_of: Date, name: Option<&str>) -> Result<Vec<Guide>> {
        let mut conditions = Conditions::default();
        conditions.push("start_date <= ?", SqlValue::Text(format_iso_date(as_of)));
        if let Some(name) = name {
            conditions.push("name = ?", SqlValue::Text(name.to_string()));
        }
        let sql =
            format!("SELECT {GUIDE_COLUMNS} FROM guides{} ORDER BY id ASC", conditions.where_sql());
        self.select_guides(&sql, &conditions.values)
    }

    /// Guides carrying `version`, restricted to `name` when given.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn guides_with_version(&self, name: Option<&str>, version: &str) -> Result<Vec<Guide>> {
        let mut conditions = Conditions::default();
        conditions.push("version = ?", SqlValue::Text(version.to_string()));
        if let Some(name) = name {
            conditions.push("name = ?", SqlValue::Text(name.to_string()));
        }
        let sql =
            format!("SELECT {GUIDE_COLUMNS} FROM guides{} ORDER BY id ASC", conditions.where_sql());
        self.select_guides(&sql, &conditions.values)
    }

    /// Filtered elements of the given guides ordered by id. No guides yields an empty page.
    ///
    /// # Errors
    /// Returns an error when the count or page query fails.
    pub fn query_elements(
        &self,
        guide_ids: &[GuideId],
        filter: &ElementFilter,
        page: &PageRequest,
    ) -> Result<Page<GuideElement>> {
        let mut conditions = Conditions::default();
        conditions.push(
            "guide_id IN (SELECT value FROM json_each(?))",
            SqlValue::Text(guide_ids_json(guide_ids)?),
        );
        if let Some(code) = filter.element_code.as_deref().filter(|code| !code.is_empty()) {
            conditions.push("instr(element_code, ?) > 0", SqlValue::Text(code.to_string()));
        }
        if let Some(value) = filter.value.as_deref().filter(|value| !value.is_empty()) {
            conditions.push("instr(value, ?) > 0", SqlValue::Text(value.to_string()));
        }

        let where_sql = conditions.where_sql();
        let total = self.count_rows("guide_elements", &where_sql, &conditions.values)?;
        let window = page.window(total);

        let mut values = conditions.values;
        values.push(SqlValue::Integer(i64::try_from(window.limit).unwrap_or(i64::MAX)));
        values.push(SqlValue::Integer(i64::try_from(window.offset).unwrap_or(i64::MAX)));
        let sql = format!(
            "SELECT {ELEMENT_COLUMNS} FROM guide_elements{where_sql} ORDER BY id ASC LIMIT ?{} OFFSET ?{}",
            values.len() - 1,
            values.len()
        );

        let mut stmt = self.conn.prepare(&sql).context("failed to prepare element query")?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut elements = Vec::new();
        while let Some(row) = rows.next()? {
            elements.push(GuideElement {
                id: ElementId(row.get(0)?),
                guide_id: GuideId(row.get(1)?),
                element_code: row.get(2)?,
                value: row.get(3)?,
            });
        }

        Ok(Page::from_window(window, total, elements))
    }

    /// Exact, case-sensitive membership of `probe` among the elements of `guide_ids`.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn element_exists(&self, guide_ids: &[GuideId], probe: &ElementProbe) -> Result<bool> {
        if guide_ids.is_empty() {
            return Ok(false);
        }
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM guide_elements
                    WHERE guide_id IN (SELECT value FROM json_each(?1))
                      AND element_code = ?2 AND value = ?3
                 )",
                params![guide_ids_json(guide_ids)?, probe.element_code, probe.value],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check guide element existence")?;
        Ok(exists == 1)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_elements(&self, guide_id: GuideId) -> Result<u64> {
        self.count_rows("guide_elements", " WHERE guide_id = ?1", &[SqlValue::Integer(guide_id.0)])
    }

    /// Delete a guide and, through the cascade, its elements. `None` when the guide is unknown.
    ///
    /// # Errors
    /// Returns an error when the delete transaction fails.
    pub fn delete_guide(&mut self, guide_id: GuideId) -> Result<Option<DeleteSummary>> {
        let tx = self.write_transaction()?;
        let removed_elements = tx
            .query_row(
                "SELECT COUNT(*) FROM guide_elements WHERE guide_id = ?1",
                params![guide_id.0],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count guide elements")?;
        let removed_elements = u64::try_from(removed_elements).unwrap_or_default();
        let deleted = tx
            .execute("DELETE FROM guides WHERE id = ?1", params![guide_id.0])
            .context("failed to delete guide")?;
        tx.commit().context("failed to commit guide delete")?;

        if deleted == 0 {
            return Ok(None);
        }
        tracing::info!(guide_id = guide_id.0, removed_elements, "deleted guide");
        Ok(Some(DeleteSummary { guide_id, removed_elements }))
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn paged_guides(&self, conditions: &Conditions, page: &PageRequest) -> Result<Page<Guide>> {
        let where_sql = conditions.where_sql();
        let total = self.count_rows("guides", &where_sql, &conditions.values)?;
        let window = page.window(total);

        let mut values = conditions.values.clone();
        values.push(SqlValue::Integer(i64::try_from(window.limit).unwrap_or(i64::MAX)));
        values.push(SqlValue::Integer(i64::try_from(window.offset).unwrap_or(i64::MAX)));
        let sql = format!(
            "SELECT {GUIDE_COLUMNS} FROM guides{where_sql} ORDER BY id ASC LIMIT ?{} OFFSET ?{}",
            values.len() - 1,
            values.len()
        );

        let guides = self.select_guides(&sql, &values)?;
        Ok(Page::from_window(window, total, guides))
    }

    // Takes the write lock up front so the busy timeout covers lock contention.
    fn write_transaction(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start write transaction")
    }

    fn count_rows(&self, table: &str, where_sql: &str, values: &[SqlValue]) -> Result<u64> {
        let total = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {table}{where_sql}"),
                params_from_iter(values.iter()),
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to count rows in {table}"))?;
        Ok(u64::try_from(total).unwrap_or_default())
    }

    fn select_guides(&self, sql: &str, values: &[SqlValue]) -> Result<Vec<Guide>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare guide query")?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut guides = Vec::new();

        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let start_date_raw: String = row.get(5)?;
            let start_date = parse_iso_date("start_date", &start_date_raw)
                .with_context(|| format!("invalid start_date stored for guide {id}"))?;
            guides.push(Guide {
                id: GuideId(id),
                name: row.get(1)?,
                short_name: row.get(2)?,
                description: row.get(3)?,
                version: row.get(4)?,
                start_date,
            });
        }

        Ok(guides)
    }
}

fn guide_ids_json(guide_ids: &[GuideId]) -> Result<String> {
    serde_json::to_string(&guide_ids.iter().map(|id| id.0).collect::<Vec<_>>())
        .context("failed to encode guide id list")
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Month;

    fn date(year: i32, month: u8, day: u8) -> Date {
        let month = Month::try_from(month).unwrap_or_else(|err| panic!("bad month: {err}"));
        Date::from_calendar_date(year, month, day)
            .unwrap_or_else(|err| panic!("invalid fixture date: {err}"))
    }

    fn open_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn draft(name: Option<&str>, version: &str, start_date: Date) -> GuideDraft {
        GuideDraft {
            name: name.map(str::to_string),
            short_name: name.map(|name| name.to_lowercase()),
            description: None,
            version: version.to_string(),
            start_date,
        }
    }

    fn element(code: &str, value: &str) -> ElementDraft {
        ElementDraft { element_code: code.to_string(), value: value.to_string() }
    }

    fn page(page: u64, page_size: u64) -> PageRequest {
        PageRequest { page, page_size }
    }

    fn names(page: &Page<Guide>) -> Vec<Option<String>> {
        page.results.iter().map(|guide| guide.name.clone()).collect()
    }

    // Test IDs: TDB-001
    #[test]
    fn migrate_bootstraps_schema_once() -> Result<()> {
        let mut store = open_store()?;
        store.migrate()?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert!(status.pending_versions.is_empty());

        let migrations: i64 =
            store.conn.query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))?;
        assert_eq!(migrations, 1);
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn sqlite_constraints_enforce_uniqueness_and_foreign_keys() -> Result<()> {
        let mut store = open_store()?;
        store.upsert_guide(draft(Some("Colors"), "1", date(2026, 1, 1)))?;
        store.upsert_guide(draft(None, "1", date(2026, 1, 1)))?;

        let duplicate = store.conn.execute(
            "INSERT INTO guides(name, version, start_date) VALUES ('Colors', '1', '2026-02-01')",
            [],
        );
        assert!(duplicate.is_err());

        let duplicate_unnamed = store.conn.execute(
            "INSERT INTO guides(name, version, start_date) VALUES (NULL, '1', '2026-02-01')",
            [],
        );
        assert!(duplicate_unnamed.is_err());

        let orphan = store.conn.execute(
            "INSERT INTO guide_elements(guide_id, element_code, value) VALUES (999, 'A', '1')",
            [],
        );
        assert!(orphan.is_err());
        Ok(())
    }

    // Test IDs: TUPS-001
    #[test]
    fn upserting_identical_guide_twice_keeps_one_row() -> Result<()> {
        let mut store = open_store()?;
        let first = store.upsert_guide(draft(Some("Colors"), "1", date(2026, 1, 1)))?;
        let second = store.upsert_guide(draft(Some("Colors"), "1", date(2026, 1, 1)))?;

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.item.id, second.item.id);

        let all = store.list_guides_named(Some("Colors"), &page(1, 100))?;
        assert_eq!(all.count, 1);
        Ok(())
    }

    // Test IDs: TUPS-002
    #[test]
    fn guide_upsert_overwrites_descriptive_fields_only() -> Result<()> {
        let mut store = open_store()?;
        let original = store.upsert_guide(draft(Some("Colors"), "1", date(2026, 1, 1)))?;

        let updated = store.upsert_guide(GuideDraft {
            name: Some("Colors".to_string()),
            short_name: Some("clr".to_string()),
            description: Some("palette".to_string()),
            version: "1".to_string(),
            start_date: date(2026, 3, 1),
        })?;
        assert_eq!(updated.item.id, original.item.id);

        let stored = store.get_guide(original.item.id)?;
        let stored = stored.unwrap_or_else(|| panic!("guide disappeared after update"));
        assert_eq!(stored.short_name.as_deref(), Some("clr"));
        assert_eq!(stored.description.as_deref(), Some("palette"));
        assert_eq!(stored.start_date, date(2026, 3, 1));

        let other_version = store.upsert_guide(draft(Some("Colors"), "2", date(2026, 6, 1)))?;
        assert!(other_version.created);
        assert_ne!(other_version.item.id, original.item.id);
        Ok(())
    }

    // Test IDs: TUPS-003
    #[test]
    fn element_upsert_against_missing_guide_writes_nothing() -> Result<()> {
        let mut store = open_store()?;
        let err = match store.upsert_element(GuideId(42), element("A", "1")) {
            Ok(outcome) => panic!("expected GuideNotFound, got {outcome:?}"),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<RegistryError>(),
            Some(&RegistryError::GuideNotFound(GuideId(42)))
        );

        let rows: i64 =
            store.conn.query_row("SELECT COUNT(*) FROM guide_elements", [], |row| row.get(0))?;
        assert_eq!(rows, 0);
        Ok(())
    }

    // Test IDs: TUPS-004
    #[test]
    fn element_upsert_overwrites_value_by_code() -> Result<()> {
        let mut store = open_store()?;
        let guide = store.upsert_guide(draft(Some("Colors"), "1", date(2026, 1, 1)))?.item;

        let first = store.upsert_element(guide.id, element("A", "1"))?;
        let second = store.upsert_element(guide.id, element("A", "2"))?;
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.item.id, second.item.id);

        let elements = store.query_elements(&[guide.id], &ElementFilter::default(), &page(1, 10))?;
        assert_eq!(elements.count, 1);
        assert_eq!(elements.results[0].value, "2");
        Ok(())
    }

    // Test IDs: TUPS-005
    #[test]
    fn invalid_drafts_are_rejected_before_writing() -> Result<()> {
        let mut store = open_store()?;
        let err = match store.upsert_guide(draft(Some("Colors"), "   ", date(2026, 1, 1))) {
            Ok(outcome) => panic!("expected validation error, got {outcome:?}"),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<RegistryError>().and_then(RegistryError::field),
            Some("version")
        );

        let rows: i64 =
            store.conn.query_row("SELECT COUNT(*) FROM guides", [], |row| row.get(0))?;
        assert_eq!(rows, 0);
        Ok(())
    }

    // Test IDs: TFLT-101
    #[test]
    fn guide_name_filter_is_case_sensitive_substring() -> Result<()> {
        let mut store = open_store()?;
        for name in ["Colors", "Food", "Tags"] {
            store.upsert_guide(draft(Some(name), "1", date(2026, 1, 1)))?;
        }
        store.upsert_guide(draft(None, "1", date(2026, 1, 1)))?;

        let o = GuideFilter { name: Some("o".to_string()), start_date: None };
        assert_eq!(
            names(&store.query_guides(&o, &page(1, 10))?),
            vec![Some("Colors".to_string()), Some("Food".to_string())]
        );

        let oo = GuideFilter { name: Some("oo".to_string()), start_date: None };
        assert_eq!(names(&store.query_guides(&oo, &page(1, 10))?), vec![Some("Food".to_string())]);

        let upper = GuideFilter { name: Some("OO".to_string()), start_date: None };
        assert_eq!(store.query_guides(&upper, &page(1, 10))?.count, 0);

        let blank = GuideFilter { name: Some(String::new()), start_date: None };
        assert_eq!(store.query_guides(&blank, &page(1, 10))?.count, 4);
        Ok(())
    }

    // Test IDs: TFLT-102
    #[test]
    fn sql_filters_agree_with_core_matchers() -> Result<()> {
        let mut store = open_store()?;
        let names = ["Colors", "Food", "Tags", "colors", "Flood"];
        for (index, name) in names.iter().enumerate() {
            let day = u8::try_from(index + 1).unwrap_or(1);
            store.upsert_guide(draft(Some(name), "1", date(2026, 1, day)))?;
        }
        let all = store.query_guides(&GuideFilter::default(), &page(1, 100))?.results;

        for needle in ["o", "oo", "lo", "C", "x"] {
            for from in [None, Some(date(2026, 1, 3))] {
                let filter = GuideFilter { name: Some(needle.to_string()), start_date: from };
                let expected = all
                    .iter()
                    .filter(|guide| filter.matches(guide))
                    .map(|guide| guide.id)
                    .collect::<Vec<_>>();
                let actual = store
                    .query_guides(&filter, &page(1, 100))?
                    .results
                    .iter()
                    .map(|guide| guide.id)
                    .collect::<Vec<_>>();
                assert_eq!(actual, expected, "filter {filter:?}");
            }
        }
        Ok(())
    }

    // Test IDs: TFLT-103
    #[test]
    fn element_filters_are_scoped_to_the_given_guides() -> Result<()> {
        let mut store = open_store()?;
        let colors = store.upsert_guide(draft(Some("Colors"), "1", date(2026, 1, 1)))?.item;
        let food = store.upsert_guide(draft(Some("Food"), "1", date(2026, 1, 1)))?.item;
        store.upsert_element(colors.id, element("RED", "Красный"))?;
        store.upsert_element(colors.id, element("GREEN", "Зелёный"))?;
        store.upsert_element(food.id, element("RED", "Томат"))?;

        let filter = ElementFilter { element_code: Some("RE".to_string()), value: None };
        let page_one = store.query_elements(&[colors.id], &filter, &page(1, 10))?;
        assert_eq!(page_one.count, 2);
        assert!(page_one.results.iter().all(|element| element.guide_id == colors.id));

        let filter = ElementFilter { element_code: None, value: Some("расн".to_string()) };
        assert_eq!(store.query_elements(&[colors.id], &filter, &page(1, 10))?.count, 1);

        let both = store.query_elements(
            &[colors.id, food.id],
            &ElementFilter { element_code: Some("RED".to_string()), value: None },
            &page(1, 10),
        )?;
        assert_eq!(both.count, 2);

        let none = store.query_elements(&[], &ElementFilter::default(), &page(1, 10))?;
        assert_eq!(none.count, 0);
        assert_eq!(none.num_pages, 1);
        Ok(())
    }

    // Test IDs: TPAG-101
    #[test]
    fn guide_pages_clamp_to_the_last_page() -> Result<()> {
        let mut store = open_store()?;
        for index in 0..25 {
            store.upsert_guide(draft(Some("Colors"), &format!("v{index:02}"), date(2026, 1, 1)))?;
        }

        let second = store.query_guides(&GuideFilter::default(), &page(2, 10))?;
        assert_eq!(second.results.len(), 10);
        assert_eq!(second.results[0].version, "v10");
        assert_eq!(second.next, Some(3));

        let beyond = store.query_guides(&GuideFilter::default(), &page(99, 10))?;
        assert_eq!(beyond.page, 3);
        assert_eq!(beyond.results.len(), 5);
        assert_eq!(beyond.results[4].version, "v24");
        Ok(())
    }

    // Test IDs: TRES-101
    #[test]
    fn candidate_queries_respect_date_name_and_version() -> Result<()> {
        let mut store = open_store()?;
        store.upsert_guide(draft(Some("Colors"), "1", date(2026, 1, 1)))?;
        store.upsert_guide(draft(Some("Colors"), "2", date(2026, 6, 1)))?;
        store.upsert_guide(draft(Some("Food"), "2", date(2027, 1, 1)))?;

        let started = store.guides_started_by(date(2026, 6, 1), None)?;
        assert_eq!(started.len(), 2);
        let started_colors = store.guides_started_by(date(2026, 2, 1), Some("Colors"))?;
        assert_eq!(started_colors.len(), 1);
        assert_eq!(started_colors[0].version, "1");

        assert_eq!(store.guides_with_version(None, "2")?.len(), 2);
        let colors_two = store.guides_with_version(Some("Colors"), "2")?;
        assert_eq!(colors_two.len(), 1);
        assert_eq!(colors_two[0].start_date, date(2026, 6, 1));
        Ok(())
    }

    // Test IDs: TCHK-101
    #[test]
    fn element_existence_is_exact_and_case_sensitive() -> Result<()> {
        let mut store = open_store()?;
        let guide = store.upsert_guide(draft(Some("Colors"), "1", date(2026, 1, 1)))?.item;
        store.upsert_element(guide.id, element("A", "1"))?;

        let probe = |code: &str, value: &str| ElementProbe {
            element_code: code.to_string(),
            value: value.to_string(),
        };
        assert!(store.element_exists(&[guide.id], &probe("A", "1"))?);
        assert!(!store.element_exists(&[guide.id], &probe("a", "1"))?);
        assert!(!store.element_exists(&[guide.id], &probe("A", "10"))?);
        assert!(!store.element_exists(&[], &probe("A", "1"))?);
        Ok(())
    }

    // Test IDs: TDEL-001
    #[test]
    fn deleting_a_guide_cascades_to_its_elements() -> Result<()> {
        let mut store = open_store()?;
        let colors = store.upsert_guide(draft(Some("Colors"), "1", date(2026, 1, 1)))?.item;
        let food = store.upsert_guide(draft(Some("Food"), "1", date(2026, 1, 1)))?.item;
        store.upsert_element(colors.id, element("A", "1"))?;
        store.upsert_element(colors.id, element("B", "2"))?;
        store.upsert_element(food.id, element("A", "1"))?;

        let summary = store.delete_guide(colors.id)?;
        assert_eq!(summary, Some(DeleteSummary { guide_id: colors.id, removed_elements: 2 }));
        assert_eq!(store.count_elements(colors.id)?, 0);
        assert_eq!(store.count_elements(food.id)?, 1);
        assert_eq!(store.get_guide(colors.id)?, None);
        assert_eq!(store.delete_guide(colors.id)?, None);

        let next = store.upsert_guide(draft(Some("Colors"), "1", date(2026, 1, 1)))?.item;
        assert!(next.id > food.id, "ids must never be reused");
        Ok(())
    }

    // Test IDs: TOPS-001
    #[test]
    fn integrity_check_and_backup_report_healthy_database() -> Result<()> {
        let mut store = open_store()?;
        let guide = store.upsert_guide(draft(Some("Colors"), "1", date(2026, 1, 1)))?.item;
        store.upsert_element(guide.id, element("A", "1"))?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);

        let backup_path = std::env::temp_dir()
            .join(format!("guide-registry-backup-{}.sqlite3", ulid::Ulid::new()));
        store.backup_database(&backup_path)?;

        let mut restored = SqliteStore::open(&backup_path)?;
        restored.migrate()?;
        assert_eq!(restored.count_elements(guide.id)?, 1);
        drop(restored);
        let _ = fs::remove_file(&backup_path);
        Ok(())
    }

    // Test IDs: TCON-001
    #[test]
    fn concurrent_upserts_on_one_file_all_succeed() -> Result<()> {
        let dir = std::env::temp_dir()
            .join(format!("guide-registry-concurrent-{}", ulid::Ulid::new()));
        fs::create_dir_all(&dir)?;
        let db_path = dir.join("guides.sqlite3");

        let guide_id = {
            let mut store = SqliteStore::open(&db_path)?;
            store.migrate()?;
            store.upsert_guide(draft(Some("Colors"), "1", date(2020, 1, 1)))?.item.id
        };

        let failures: Vec<String> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|worker| {
                    let db_path = &db_path;
                    scope.spawn(move || -> Vec<String> {
                        let mut store = match SqliteStore::open(db_path) {
                            Ok(store) => store,
                            Err(err) => return vec![format!("{err:#}")],
                        };
                        let mut failures = Vec::new();
                        for k in 0..25 {
                            let code = format!("C{}", (worker + k) % 5);
                            if let Err(err) = store.upsert_element(guide_id, element(&code, "v")) {
                                failures.push(format!("{err:#}"));
                            }
                            let version = format!("v{}", k % 3);
                            let guide = draft(Some("Colors"), &version, date(2021, 1, 1));
                            if let Err(err) = store.upsert_guide(guide) {
                                failures.push(format!("{err:#}"));
                            }
                        }
                        failures
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| {
                    worker.join().unwrap_or_else(|_| vec!["worker panicked".to_string()])
                })
                .collect()
        });

        assert!(
            failures.is_empty(),
            "{} upserts failed, first: {:?}",
            failures.len(),
            failures.first()
        );

        let mut store = SqliteStore::open(&db_path)?;
        assert_eq!(store.count_elements(guide_id)?, 5);
        assert_eq!(store.list_guides_named(Some("Colors"), &page(1, 100))?.count, 4);
        let summary = store.delete_guide(guide_id)?;
        assert_eq!(summary, Some(DeleteSummary { guide_id, removed_elements: 5 }));
        drop(store);
        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }
}
