use std::path::{Path, PathBuf};

use anyhow::Result;
use guide_registry_core::{
    iso_date, parse_probes, resolve_effective, today_utc, ElementDraft, ElementFilter,
    ExistenceReport, Guide, GuideDraft, GuideElement, GuideFilter, GuideId, GuideSelector, Page,
    PageRequest, RegistryError, UpsertOutcome,
};
use guide_registry_store_sqlite::{DeleteSummary, IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::Date;

pub const API_CONTRACT_VERSION: &str = "guides.v1";

/// Guide listing request. Without `date` every guide is listed (exact `name` match when
/// given); with `date` the effective set as of that day.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuidesRequest {
    pub name: Option<String>,
    #[serde(default, with = "iso_date::option")]
    pub date: Option<Date>,
}

#[derive(Debug, Clone)]
pub struct GuideRegistryApi {
    db_path: PathBuf,
}

impl GuideRegistryApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Create or update a guide by `(name, version)`.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn upsert_guide(&self, draft: GuideDraft) -> Result<UpsertOutcome<Guide>> {
        let mut store = self.open_store()?;
        store.upsert_guide(draft)
    }

    /// Create or update an element of `guide_id` by `element_code`.
    ///
    /// # Errors
    /// Returns an error carrying [`RegistryError::GuideNotFound`] for an unknown guide,
    /// or a validation/persistence error.
    pub fn upsert_element(
        &self,
        guide_id: GuideId,
        draft: ElementDraft,
    ) -> Result<UpsertOutcome<GuideElement>> {
        let mut store = self.open_store()?;
        store.upsert_element(guide_id, draft)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn get_guide(&self, guide_id: GuideId) -> Result<Option<Guide>> {
        let store = self.open_store()?;
        store.get_guide(guide_id)
    }

    /// Filtered guide list view.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_guides(&self, filter: &GuideFilter, page: &PageRequest) -> Result<Page<Guide>> {
        let store = self.open_store()?;
        store.query_guides(filter, page)
    }

    /// Guide API listing.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn get_guides(&self, request: &GuidesRequest, page: &PageRequest) -> Result<Page<Guide>> {
        let store = self.open_store()?;
        let name = request.name.as_deref();
        match request.date {
            None => store.list_guides_named(name, page),
            Some(as_of) => {
                let candidates = store.guides_started_by(as_of, name)?;
                let resolved = resolve_effective(&candidates, name, as_of);
                tracing::debug!(
                    candidates = candidates.len(),
                    resolved = resolved.len(),
                    "resolved effective guides"
                );
                Ok(Page::paginate(resolved, page))
            }
        }
    }

    /// Effective guide(s) as of `as_of` (today when absent).
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn resolve(&self, name: Option<&str>, as_of: Option<Date>) -> Result<Vec<Guide>> {
        let store = self.open_store()?;
        resolve_with(&store, name, as_of.unwrap_or_else(today_utc))
    }

    /// Elements of the guide selected by name plus version or date.
    ///
    /// # Errors
    /// Returns an error carrying [`RegistryError::MissingParameter`] when `name` is absent,
    /// or a storage error.
    pub fn get_elements(
        &self,
        selector: &GuideSelector,
        page: &PageRequest,
    ) -> Result<Page<GuideElement>> {
        let selector = selector.clone().normalized();
        if selector.name.is_none() {
            return Err(RegistryError::missing_parameter("name").into());
        }
        let store = self.open_store()?;
        let guide_ids = select_guide_ids(&store, &selector)?;
        store.query_elements(&guide_ids, &ElementFilter::default(), page)
    }

    /// Filtered element list view of one guide. An unknown guide yields an empty page.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_elements(
        &self,
        guide_id: GuideId,
        filter: &ElementFilter,
        page: &PageRequest,
    ) -> Result<Page<GuideElement>> {
        let store = self.open_store()?;
        store.query_elements(&[guide_id], filter, page)
    }

    /// Batch existence check of `(element_code, value)` pairs against the selected guides.
    ///
    /// # Errors
    /// Returns an error only for storage failures; malformed items report `false`.
    pub fn check_elements(&self, selector: &GuideSelector, body: &Value) -> Result<ExistenceReport> {
        let selector = selector.clone().normalized();
        let probes = parse_probes(body);
        if probes.is_empty() {
            return Ok(ExistenceReport::default());
        }

        let store = self.open_store()?;
        let guide_ids = select_guide_ids(&store, &selector)?;
        let report = ExistenceReport::evaluate(&probes, |probe| store.element_exists(&guide_ids, probe))?;
        tracing::debug!(items = report.len(), guides = guide_ids.len(), "checked element batch");
        Ok(report)
    }

    /// Administrative delete; `None` when the guide does not exist.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_guide(&self, guide_id: GuideId) -> Result<Option<DeleteSummary>> {
        let mut store = self.open_store()?;
        store.delete_guide(guide_id)
    }

    /// # Errors
    /// Returns an error when any integrity probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        let store = self.open_store()?;
        store.backup_database(out_file)
    }
}

fn resolve_with(store: &SqliteStore, name: Option<&str>, as_of: Date) -> Result<Vec<Guide>> {
    let candidates = store.guides_started_by(as_of, name)?;
    Ok(resolve_effective(&candidates, name, as_of))
}

fn select_guide_ids(store: &SqliteStore, selector: &GuideSelector) -> Result<Vec<GuideId>> {
    let name = selector.name.as_deref();
    let guides = match selector.version.as_deref() {
        Some(version) => store.guides_with_version(name, version)?,
        None => resolve_with(store, name, selector.as_of.unwrap_or_else(today_utc))?,
    };
    Ok(guides.into_iter().map(|guide| guide.id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Month;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("guide-registry-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn date(year: i32, month: u8, day: u8) -> Date {
        let month = Month::try_from(month).unwrap_or_else(|err| panic!("bad month: {err}"));
        Date::from_calendar_date(year, month, day)
            .unwrap_or_else(|err| panic!("invalid fixture date: {err}"))
    }

    fn draft(name: &str, version: &str, start_date: Date) -> GuideDraft {
        GuideDraft {
            name: Some(name.to_string()),
            short_name: None,
            description: None,
            version: version.to_string(),
            start_date,
        }
    }

    fn element(code: &str, value: &str) -> ElementDraft {
        ElementDraft { element_code: code.to_string(), value: value.to_string() }
    }

    fn selector(name: Option<&str>, version: Option<&str>, as_of: Option<Date>) -> GuideSelector {
        GuideSelector {
            name: name.map(str::to_string),
            version: version.map(str::to_string),
            as_of,
        }
    }

    fn seed(api: &GuideRegistryApi) -> Result<(Guide, Guide)> {
        let v1 = api.upsert_guide(draft("Colors", "1", date(2026, 1, 1)))?.item;
        let v2 = api.upsert_guide(draft("Colors", "2", date(2026, 6, 1)))?.item;
        api.upsert_element(v1.id, element("A", "old"))?;
        api.upsert_element(v2.id, element("A", "1"))?;
        api.upsert_element(v2.id, element("C", "3"))?;
        Ok((v1, v2))
    }

    // Test IDs: TAPI-001
    #[test]
    fn effective_listing_returns_latest_started_version() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = GuideRegistryApi::new(db_path.clone());
        let (v1, v2) = seed(&api)?;
        api.upsert_guide(draft("Colors", "3", date(2099, 1, 1)))?;

        let page = PageRequest { page: 1, page_size: 100 };
        let effective = api.get_guides(
            &GuidesRequest { name: Some("Colors".to_string()), date: Some(date(2026, 10, 14)) },
            &page,
        )?;
        assert_eq!(effective.results.iter().map(|guide| guide.id).collect::<Vec<_>>(), vec![v2.id]);

        let before_v2 = api.resolve(Some("Colors"), Some(date(2026, 3, 1)))?;
        assert_eq!(before_v2.iter().map(|guide| guide.id).collect::<Vec<_>>(), vec![v1.id]);

        let everything = api.get_guides(&GuidesRequest::default(), &page)?;
        assert_eq!(everything.count, 3);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn get_elements_requires_name_and_honours_version() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = GuideRegistryApi::new(db_path.clone());
        let (v1, v2) = seed(&api)?;
        for version in ["1", "2"] {
            let food = api.upsert_guide(draft("Food", version, date(2026, 1, 1)))?.item;
            api.upsert_element(food.id, element("A", "1"))?;
            api.upsert_element(food.id, element("F", "bread"))?;
        }
        let page = PageRequest { page: 1, page_size: 100 };

        let err = match api.get_elements(&selector(None, Some("2"), None), &page) {
            Ok(elements) => panic!("expected missing name, got {elements:?}"),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<RegistryError>(),
            Some(&RegistryError::MissingParameter("name".to_string()))
        );

        let by_version = api.get_elements(&selector(Some("Colors"), Some("1"), None), &page)?;
        assert_eq!(by_version.count, 1);
        assert!(by_version.results.iter().all(|element| element.guide_id == v1.id));

        let by_version = api.get_elements(&selector(Some("Colors"), Some("2"), None), &page)?;
        assert_eq!(by_version.count, 2);
        assert!(by_version.results.iter().all(|element| element.guide_id == v2.id));

        let effective =
            api.get_elements(&selector(Some("Colors"), None, Some(date(2026, 10, 14))), &page)?;
        assert_eq!(effective.count, 2);

        let unknown = api.get_elements(&selector(Some("Nope"), None, None), &page)?;
        assert_eq!(unknown.count, 0);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn batch_check_reports_each_item_in_order() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = GuideRegistryApi::new(db_path.clone());
        seed(&api)?;

        let body = serde_json::json!([
            {"element_code": "A", "value": "1"},
            {"bad": "x"},
            {"element_code": "B", "value": "2"}
        ]);
        let report = api.check_elements(&selector(Some("Colors"), None, Some(date(2026, 10, 14))), &body)?;
        assert_eq!(
            serde_json::to_value(&report)?,
            serde_json::json!({"0": true, "1": false, "2": false})
        );

        let old = api.check_elements(
            &selector(Some("Colors"), Some("1"), None),
            &serde_json::json!({"element_code": "A", "value": "old"}),
        )?;
        assert_eq!(old.results(), &[true]);

        let nameless = api.check_elements(
            &selector(None, None, Some(date(2026, 10, 14))),
            &serde_json::json!({"element_code": "C", "value": "3"}),
        )?;
        assert_eq!(nameless.results(), &[true]);

        assert!(api.check_elements(&GuideSelector::default(), &serde_json::json!([]))?.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn delete_guide_removes_elements_and_reports_unknown_ids() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = GuideRegistryApi::new(db_path.clone());
        let (_v1, v2) = seed(&api)?;

        let summary = api.delete_guide(v2.id)?;
        assert_eq!(summary.map(|summary| summary.removed_elements), Some(2));
        let elements = api.list_elements(
            v2.id,
            &ElementFilter::default(),
            &PageRequest { page: 1, page_size: 10 },
        )?;
        assert_eq!(elements.count, 0);
        assert_eq!(api.delete_guide(v2.id)?, None);

        let report = api.integrity_check()?;
        assert!(report.quick_check_ok);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
