use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

pub const NAME_MAX_LEN: usize = 255;
pub const SHORT_NAME_MAX_LEN: usize = 63;
pub const VERSION_MAX_LEN: usize = 63;
pub const ELEMENT_CODE_MAX_LEN: usize = 63;
pub const VALUE_MAX_LEN: usize = 255;

/// Page size of the browsable list views.
pub const UI_PAGE_SIZE: u64 = 10;

/// Date parameter keyword meaning "today".
pub const DATE_ACTUAL: &str = "actual";

pub const MSG_INVALID_DATE: &str = "Введите правильную дату.";
pub const MSG_REQUIRED_FIELD: &str = "Обязательное поле.";

const ISO_DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const RU_DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[day].[month].[year]");

const RU_MONTHS_GENITIVE: [&str; 12] = [
    "января",
    "февраля",
    "марта",
    "апреля",
    "мая",
    "июня",
    "июля",
    "августа",
    "сентября",
    "октября",
    "ноября",
    "декабря",
];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("Не указан url-параметр {0}")]
    MissingParameter(String),
    #[error("invalid date for {field}: {raw}")]
    InvalidDate { field: String, raw: String },
    #[error("validation error on {field}: {message}")]
    Validation { field: String, message: String },
    #[error("Не найден справочник с id {0}")]
    GuideNotFound(GuideId),
}

impl RegistryError {
    #[must_use]
    pub fn missing_parameter(name: &str) -> Self {
        Self::MissingParameter(name.to_string())
    }

    #[must_use]
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation { field: field.to_string(), message: message.into() }
    }

    /// Field the error is attached to, when it is a field-level error.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::InvalidDate { field, .. } | Self::Validation { field, .. } => Some(field),
            Self::MissingParameter(_) | Self::GuideNotFound(_) => None,
        }
    }

    /// Message shown to end users.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidDate { .. } => MSG_INVALID_DATE.to_string(),
            Self::Validation { message, .. } => message.clone(),
            Self::MissingParameter(_) | Self::GuideNotFound(_) => self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuideId(pub i64);

impl Display for GuideId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ElementId(pub i64);

impl Display for ElementId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `YYYY-MM-DD` serde representation for [`Date`].
pub mod iso_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    /// # Errors
    /// Returns the serializer's error when the string cannot be written.
    pub fn serialize<S>(date: &Date, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_iso_date(*date))
    }

    /// # Errors
    /// Returns a deserializer error when the input is not a `YYYY-MM-DD` date.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Date, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_iso_date("date", &raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::Date;

        /// # Errors
        /// Returns the serializer's error when the value cannot be written.
        pub fn serialize<S>(date: &Option<Date>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match date {
                Some(date) => serializer.serialize_some(&crate::format_iso_date(*date)),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        /// Returns a deserializer error when a present value is not a `YYYY-MM-DD` date.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Date>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|raw| crate::parse_iso_date("date", &raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[must_use]
pub fn format_iso_date(date: Date) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
}

/// Parse a `YYYY-MM-DD` date.
///
/// # Errors
/// Returns [`RegistryError::InvalidDate`] naming `field` when `raw` is not a valid date.
pub fn parse_iso_date(field: &str, raw: &str) -> Result<Date, RegistryError> {
    Date::parse(raw.trim(), ISO_DATE_FORMAT).map_err(|_| RegistryError::InvalidDate {
        field: field.to_string(),
        raw: raw.to_string(),
    })
}

/// Parse a date entered in a form: `YYYY-MM-DD` or `DD.MM.YYYY`.
///
/// # Errors
/// Returns [`RegistryError::InvalidDate`] when neither input format matches.
pub fn parse_form_date(field: &str, raw: &str) -> Result<Date, RegistryError> {
    let trimmed = raw.trim();
    Date::parse(trimmed, ISO_DATE_FORMAT)
        .or_else(|_| Date::parse(trimmed, RU_DATE_FORMAT))
        .map_err(|_| RegistryError::InvalidDate { field: field.to_string(), raw: raw.to_string() })
}

/// Resolve a `date=actual|YYYY-MM-DD` parameter. Absent or blank input yields `None`.
///
/// # Errors
/// Returns [`RegistryError::InvalidDate`] when the value is neither keyword nor date.
pub fn parse_date_param(
    field: &str,
    raw: Option<&str>,
    today: Date,
) -> Result<Option<Date>, RegistryError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(DATE_ACTUAL) => Ok(Some(today)),
        Some(value) => parse_iso_date(field, value).map(Some),
    }
}

#[must_use]
pub fn today_utc() -> Date {
    OffsetDateTime::now_utc().date()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Guide {
    pub id: GuideId,
    pub name: Option<String>,
    pub short_name: Option<String>,
    pub description: Option<String>,
    pub version: String,
    #[serde(with = "iso_date")]
    pub start_date: Date,
}

impl Guide {
    /// Listing label, `<short_name> version-<version>`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} version-{}", self.short_name.as_deref().unwrap_or("None"), self.version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GuideElement {
    pub id: ElementId,
    #[serde(rename = "guide")]
    pub guide_id: GuideId,
    pub element_code: String,
    pub value: String,
}

/// Input of a guide upsert. `(name, version)` is the natural key.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GuideDraft {
    pub name: Option<String>,
    pub short_name: Option<String>,
    pub description: Option<String>,
    pub version: String,
    #[serde(with = "iso_date")]
    pub start_date: Date,
}

impl GuideDraft {
    /// Trim text fields and turn blank optional fields into `None`.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            name: non_blank(self.name),
            short_name: non_blank(self.short_name),
            description: non_blank(self.description),
            version: self.version.trim().to_string(),
            start_date: self.start_date,
        }
    }

    /// # Errors
    /// Returns [`RegistryError::Validation`] for a blank version, an over-long field,
    /// or a start date outside years 1..=9999.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.version.trim().is_empty() {
            return Err(RegistryError::validation("version", MSG_REQUIRED_FIELD));
        }
        check_len("version", &self.version, VERSION_MAX_LEN)?;
        if let Some(name) = &self.name {
            check_len("name", name, NAME_MAX_LEN)?;
        }
        if let Some(short_name) = &self.short_name {
            check_len("short_name", short_name, SHORT_NAME_MAX_LEN)?;
        }
        if !(1..=9999).contains(&self.start_date.year()) {
            return Err(RegistryError::validation(
                "start_date",
                "Год должен быть в диапазоне 1..9999.",
            ));
        }
        Ok(())
    }
}

/// Input of an element upsert. `(guide, element_code)` is the natural key.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ElementDraft {
    pub element_code: String,
    pub value: String,
}

impl ElementDraft {
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            element_code: self.element_code.trim().to_string(),
            value: self.value.trim().to_string(),
        }
    }

    /// # Errors
    /// Returns [`RegistryError::Validation`] for blank or over-long fields.
    pub fn validate(&self) -> Result<(), RegistryError> {
        for (field, value, max_len) in [
            ("element_code", &self.element_code, ELEMENT_CODE_MAX_LEN),
            ("value", &self.value, VALUE_MAX_LEN),
        ] {
            if value.trim().is_empty() {
                return Err(RegistryError::validation(field, MSG_REQUIRED_FIELD));
            }
            check_len(field, value, max_len)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpsertOutcome<T> {
    pub created: bool,
    #[serde(flatten)]
    pub item: T,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn check_len(field: &str, value: &str, max_len: usize) -> Result<(), RegistryError> {
    let len = value.chars().count();
    if len > max_len {
        return Err(RegistryError::validation(
            field,
            format!("Убедитесь, что это значение содержит не более {max_len} символов (сейчас {len})."),
        ));
    }
    Ok(())
}

/// Guide list filters. Substring matching is case-sensitive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct GuideFilter {
    pub name: Option<String>,
    #[serde(default, with = "iso_date::option")]
    pub start_date: Option<Date>,
}

impl GuideFilter {
    #[must_use]
    pub fn normalized(self) -> Self {
        Self { name: self.name.filter(|name| !name.is_empty()), start_date: self.start_date }
    }

    #[must_use]
    pub fn matches(&self, guide: &Guide) -> bool {
        let name_ok = match self.name.as_deref() {
            None | Some("") => true,
            Some(needle) => guide.name.as_deref().is_some_and(|name| name.contains(needle)),
        };
        let date_ok = match self.start_date {
            None => true,
            Some(from) => guide.start_date >= from,
        };
        name_ok && date_ok
    }
}

/// Element list filters. Substring matching is case-sensitive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ElementFilter {
    pub element_code: Option<String>,
    pub value: Option<String>,
}

impl ElementFilter {
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            element_code: self.element_code.filter(|code| !code.is_empty()),
            value: self.value.filter(|value| !value.is_empty()),
        }
    }

    #[must_use]
    pub fn matches(&self, element: &GuideElement) -> bool {
        let contains = |needle: Option<&str>, haystack: &str| match needle {
            None => true,
            Some(needle) => haystack.contains(needle),
        };
        contains(self.element_code.as_deref(), &element.element_code)
            && contains(self.value.as_deref(), &element.value)
    }
}

/// Which guides an element lookup runs against.
///
/// With a `version` the guides carrying that version are used, otherwise the
/// effective guide(s) as of `as_of`. `name` narrows either branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct GuideSelector {
    pub name: Option<String>,
    pub version: Option<String>,
    #[serde(default, with = "iso_date::option")]
    pub as_of: Option<Date>,
}

impl GuideSelector {
    #[must_use]
    pub fn normalized(self) -> Self {
        Self { name: non_blank(self.name), version: non_blank(self.version), as_of: self.as_of }
    }
}

/// Order of versions within one guide family: later start date first, then higher id.
#[must_use]
pub fn effective_order(lhs: &Guide, rhs: &Guide) -> Ordering {
    rhs.start_date.cmp(&lhs.start_date).then_with(|| rhs.id.cmp(&lhs.id))
}

/// Pick the effective version of each guide family as of `as_of`.
///
/// A family is the set of guides sharing a name; an absent name is its own family.
/// With `name` only that family is considered. The winner is the guide with the
/// latest `start_date <= as_of`; equal dates resolve to the highest id. The result
/// is ordered by id.
#[must_use]
pub fn resolve_effective(candidates: &[Guide], name: Option<&str>, as_of: Date) -> Vec<Guide> {
    let mut winners: BTreeMap<Option<&str>, &Guide> = BTreeMap::new();

    for guide in candidates {
        if guide.start_date > as_of {
            continue;
        }
        if let Some(name) = name {
            if guide.name.as_deref() != Some(name) {
                continue;
            }
        }

        winners
            .entry(guide.name.as_deref())
            .and_modify(|current| {
                if effective_order(guide, *current) == Ordering::Less {
                    *current = guide;
                }
            })
            .or_insert(guide);
    }

    let mut resolved = winners.into_values().cloned().collect::<Vec<_>>();
    resolved.sort_by_key(|guide| guide.id);
    resolved
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PageRequest {
    pub page: u64,
    pub page_size: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PageWindow {
    pub page: u64,
    pub num_pages: u64,
    pub offset: u64,
    pub limit: u64,
}

impl PageRequest {
    /// # Errors
    /// Returns [`RegistryError::Validation`] when `page_size` is zero.
    pub fn new(page: u64, page_size: u64) -> Result<Self, RegistryError> {
        if page_size == 0 {
            return Err(RegistryError::validation(
                "page_size",
                "Убедитесь, что это значение больше либо равно 1.",
            ));
        }
        Ok(Self { page, page_size })
    }

    /// Lenient page-number parsing: absent or non-numeric input is page 1,
    /// numbers below 1 point past the end and clamp to the last page.
    #[must_use]
    pub fn parse_page(raw: Option<&str>) -> u64 {
        match raw.map(str::trim).map(str::parse::<i64>) {
            None | Some(Err(_)) => 1,
            Some(Ok(number)) if number < 1 => u64::MAX,
            Some(Ok(number)) => number.unsigned_abs(),
        }
    }

    /// Clamp the requested page into `1..=num_pages` for `total` items.
    /// An empty set still has one page.
    #[must_use]
    pub fn window(&self, total: u64) -> PageWindow {
        let page_size = self.page_size.max(1);
        let num_pages = if total == 0 { 1 } else { total.div_ceil(page_size) };
        let page = self.page.clamp(1, num_pages);
        PageWindow { page, num_pages, offset: (page - 1) * page_size, limit: page_size }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Page<T> {
    pub count: u64,
    pub page: u64,
    pub page_size: u64,
    pub num_pages: u64,
    pub next: Option<u64>,
    pub previous: Option<u64>,
    pub results: Vec<T>,
}

impl<T> Page<T> {
    #[must_use]
    pub fn from_window(window: PageWindow, count: u64, results: Vec<T>) -> Self {
        Self {
            count,
            page: window.page,
            page_size: window.limit,
            num_pages: window.num_pages,
            next: (window.page < window.num_pages).then_some(window.page + 1),
            previous: (window.page > 1).then(|| window.page - 1),
            results,
        }
    }

    /// Paginate an already materialized, already ordered list.
    #[must_use]
    pub fn paginate(items: Vec<T>, request: &PageRequest) -> Self {
        let count = u64::try_from(items.len()).unwrap_or(u64::MAX);
        let window = request.window(count);
        let offset = usize::try_from(window.offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(window.limit).unwrap_or(usize::MAX);
        let results = items.into_iter().skip(offset).take(limit).collect();
        Self::from_window(window, count, results)
    }

    #[must_use]
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            count: self.count,
            page: self.page,
            page_size: self.page_size,
            num_pages: self.num_pages,
            next: self.next,
            previous: self.previous,
            results: self.results.into_iter().map(f).collect(),
        }
    }

    /// Elided page links around the current page (3 on each side, 2 at the ends).
    #[must_use]
    pub fn page_range(&self) -> Vec<PageLink> {
        elided_page_range(self.page, self.num_pages, 3, 2)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PageLink {
    Page(u64),
    Ellipsis,
}

impl PageLink {
    pub const ELLIPSIS: &'static str = "…";
}

impl Serialize for PageLink {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Page(number) => serializer.serialize_u64(*number),
            Self::Ellipsis => serializer.serialize_str(Self::ELLIPSIS),
        }
    }
}

#[must_use]
pub fn elided_page_range(
    number: u64,
    num_pages: u64,
    on_each_side: u64,
    on_ends: u64,
) -> Vec<PageLink> {
    if num_pages <= (on_each_side + on_ends) * 2 {
        return (1..=num_pages).map(PageLink::Page).collect();
    }

    let mut links = Vec::new();
    if number > on_each_side + on_ends + 2 {
        links.extend((1..=on_ends).map(PageLink::Page));
        links.push(PageLink::Ellipsis);
        links.extend((number - on_each_side..=number).map(PageLink::Page));
    } else {
        links.extend((1..=number).map(PageLink::Page));
    }

    if number + on_each_side + on_ends + 1 < num_pages {
        links.extend((number + 1..=number + on_each_side).map(PageLink::Page));
        links.push(PageLink::Ellipsis);
        links.extend((num_pages - on_ends + 1..=num_pages).map(PageLink::Page));
    } else {
        links.extend((number + 1..=num_pages).map(PageLink::Page));
    }
    links
}

/// One `(element_code, value)` pair of an existence check.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ElementProbe {
    pub element_code: String,
    pub value: String,
}

impl ElementProbe {
    /// `None` unless `value` is an object with string `element_code` and `value`.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let element_code = object.get("element_code")?.as_str()?;
        let value = object.get("value")?.as_str()?;
        Some(Self { element_code: element_code.to_string(), value: value.to_string() })
    }
}

/// Split a check body into probes: an array is one probe per item, anything else
/// is a single probe. Malformed items become `None`.
#[must_use]
pub fn parse_probes(body: &Value) -> Vec<Option<ElementProbe>> {
    match body {
        Value::Array(items) => items.iter().map(ElementProbe::from_json).collect(),
        other => vec![ElementProbe::from_json(other)],
    }
}

/// Per-item existence results, serialized as `{"0": bool, "1": bool, ...}` in input order.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ExistenceReport {
    results: Vec<bool>,
}

impl ExistenceReport {
    /// Evaluate each probe with `exists`; malformed probes report `false` without a lookup.
    ///
    /// # Errors
    /// Propagates the first error returned by `exists`.
    pub fn evaluate<F, E>(probes: &[Option<ElementProbe>], mut exists: F) -> Result<Self, E>
    where
        F: FnMut(&ElementProbe) -> Result<bool, E>,
    {
        let mut results = Vec::with_capacity(probes.len());
        for probe in probes {
            let found = match probe {
                Some(probe) => exists(probe)?,
                None => false,
            };
            results.push(found);
        }
        Ok(Self { results })
    }

    #[must_use]
    pub fn results(&self) -> &[bool] {
        &self.results
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl Serialize for ExistenceReport {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.results.len()))?;
        for (index, found) in self.results.iter().enumerate() {
            map.serialize_entry(&index.to_string(), found)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum DateStyle {
    Iso,
    #[default]
    RuLong,
}

impl DateStyle {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Iso => "iso",
            Self::RuLong => "ru-long",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "iso" => Some(Self::Iso),
            "ru-long" => Some(Self::RuLong),
            _ => None,
        }
    }
}

/// Formatting settings handed to the list views.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DisplayConfig {
    pub date_style: DateStyle,
}

impl DisplayConfig {
    #[must_use]
    pub fn format_date(&self, date: Date) -> String {
        match self.date_style {
            DateStyle::Iso => format_iso_date(date),
            DateStyle::RuLong => {
                let month = RU_MONTHS_GENITIVE[usize::from(u8::from(date.month())) - 1];
                format!("{} {month} {}", date.day(), date.year())
            }
        }
    }
}
