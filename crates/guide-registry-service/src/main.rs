use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use clap::Parser;
use guide_registry_api::{GuideRegistryApi, GuidesRequest, API_CONTRACT_VERSION};
use guide_registry_core::{
    parse_date_param, parse_form_date, today_utc, DateStyle, DisplayConfig, ElementDraft,
    ElementFilter, ExistenceReport, Guide, GuideDraft, GuideElement, GuideFilter, GuideId,
    GuideSelector, Page, PageLink, PageRequest, RegistryError, MSG_REQUIRED_FIELD, UI_PAGE_SIZE,
};
use guide_registry_store_sqlite::LATEST_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const DEFAULT_LOG_FILTER: &str = "guide_registry=info,tower_http=info";
const MSG_INVALID_NUMBER: &str = "Введите целое число.";

type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy)]
struct ServiceConfig {
    api_page_size: u64,
    max_page_size: u64,
    display: DisplayConfig,
}

#[derive(Debug, Clone)]
struct ServiceState {
    api: GuideRegistryApi,
    config: ServiceConfig,
}

#[derive(Debug, Parser)]
#[command(name = "guide-registry-service")]
#[command(about = "HTTP service for versioned reference guides")]
struct Args {
    #[arg(long, env = "GUIDE_REGISTRY_DB", default_value = "./guides.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "GUIDE_REGISTRY_BIND", default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[arg(
        long,
        env = "GUIDE_REGISTRY_API_PAGE_SIZE",
        default_value_t = 100,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    api_page_size: u64,
    #[arg(
        long,
        env = "GUIDE_REGISTRY_MAX_PAGE_SIZE",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    max_page_size: u64,
    #[arg(long, env = "GUIDE_REGISTRY_DATE_STYLE", default_value = "ru-long", value_parser = parse_date_style)]
    date_style: DateStyle,
    /// Tracing filter directives; falls back to `RUST_LOG`.
    #[arg(long, env = "GUIDE_REGISTRY_LOG")]
    log_filter: Option<String>,
}

#[derive(Debug)]
struct ServiceError {
    status: StatusCode,
    body: Value,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_version: &'static str,
    schema_version: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct GuidesQuery {
    date: Option<String>,
    name: Option<String>,
    page: Option<String>,
    page_size: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct LegacyGuidesBody {
    date: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PagingQuery {
    page: Option<String>,
    page_size: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ElementsQuery {
    name: Option<String>,
    version: Option<String>,
    date: Option<String>,
    page: Option<String>,
    page_size: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct GuideListQuery {
    name: Option<String>,
    start_date: Option<String>,
    page: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ElementListQuery {
    element_code: Option<String>,
    value: Option<String>,
    page: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct GuideForm {
    name: Option<String>,
    short_name: Option<String>,
    description: Option<String>,
    version: Option<String>,
    start_date: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ElementForm {
    element_code: Option<String>,
    value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct GuideListItem {
    #[serde(flatten)]
    guide: Guide,
    label: String,
    start_date_display: String,
}

#[derive(Debug, Clone, Serialize)]
struct GuideListView {
    page: Page<GuideListItem>,
    page_range: Vec<PageLink>,
    filter: GuideFilter,
    display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize)]
struct ElementListView {
    guide_pk: GuideId,
    page: Page<GuideElement>,
    page_range: Vec<PageLink>,
    filter: ElementFilter,
}

/// Rejected form submission: the submitted values plus field and non-field errors.
#[derive(Debug, Clone, Serialize)]
struct FormContext<F>
where
    F: Serialize,
{
    form: F,
    errors: FieldErrors,
    non_field_errors: Vec<String>,
}

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, body: serde_json::json!({"error": message.into()}) }
    }

    fn internal(err: &anyhow::Error) -> Self {
        tracing::error!(error = %format!("{err:#}"), "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: serde_json::json!({"error": "internal error"}),
        }
    }
}

impl From<RegistryError> for ServiceError {
    fn from(err: RegistryError) -> Self {
        let body = match err.field() {
            Some(field) => {
                let mut errors = serde_json::Map::new();
                errors.insert(field.to_string(), Value::from(vec![err.user_message()]));
                Value::Object(errors)
            }
            None => serde_json::json!({"error": err.user_message()}),
        };
        Self { status: StatusCode::BAD_REQUEST, body }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<RegistryError>() {
            Some(registry_err) => Self::from(registry_err.clone()),
            None => Self::internal(&err),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl<F> IntoResponse for FormContext<F>
where
    F: Serialize,
{
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

impl<F> FormContext<F>
where
    F: Serialize,
{
    fn with_field_errors(form: F, errors: FieldErrors) -> Self {
        Self { form, errors, non_field_errors: Vec::new() }
    }

    /// `None` when `err` is not something a form can display.
    fn from_error(form: F, err: &anyhow::Error) -> Option<Self> {
        let registry_err = err.downcast_ref::<RegistryError>()?;
        match registry_err {
            RegistryError::Validation { .. } => {
                let mut errors = FieldErrors::new();
                push_field_error(&mut errors, registry_err);
                Some(Self::with_field_errors(form, errors))
            }
            RegistryError::GuideNotFound(_) => Some(Self {
                form,
                errors: FieldErrors::new(),
                non_field_errors: vec![registry_err.user_message()],
            }),
            RegistryError::MissingParameter(_) | RegistryError::InvalidDate { .. } => None,
        }
    }
}

impl ServiceConfig {
    fn api_page(&self, page: Option<&str>, page_size: Option<&str>) -> Result<PageRequest, ServiceError> {
        let page_size = match page_size.map(str::trim).filter(|raw| !raw.is_empty()) {
            None => self.api_page_size,
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| RegistryError::validation("page_size", MSG_INVALID_NUMBER))?,
        };
        Ok(PageRequest::new(PageRequest::parse_page(page), page_size.min(self.max_page_size))?)
    }

    fn ui_page(page: Option<&str>) -> PageRequest {
        PageRequest { page: PageRequest::parse_page(page), page_size: UI_PAGE_SIZE }
    }
}

fn parse_date_style(raw: &str) -> Result<DateStyle, String> {
    DateStyle::parse(raw).ok_or_else(|| format!("unknown date style {raw}; expected iso or ru-long"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn push_field_error(errors: &mut FieldErrors, err: &RegistryError) {
    if let Some(field) = err.field() {
        errors.entry(field.to_string()).or_default().push(err.user_message());
    }
}

fn required(errors: &mut FieldErrors, field: &str, value: Option<&str>) -> Option<String> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => Some(value.to_string()),
        None => {
            push_field_error(errors, &RegistryError::validation(field, MSG_REQUIRED_FIELD));
            None
        }
    }
}

fn guide_draft_from_form(form: &GuideForm) -> Result<GuideDraft, FieldErrors> {
    let mut errors = FieldErrors::new();
    let version = required(&mut errors, "version", form.version.as_deref());
    let start_date = required(&mut errors, "start_date", form.start_date.as_deref()).and_then(
        |raw| match parse_form_date("start_date", &raw) {
            Ok(date) => Some(date),
            Err(err) => {
                push_field_error(&mut errors, &err);
                None
            }
        },
    );

    let (Some(version), Some(start_date)) = (version, start_date) else {
        return Err(errors);
    };

    let draft = GuideDraft {
        name: form.name.clone(),
        short_name: form.short_name.clone(),
        description: form.description.clone(),
        version,
        start_date,
    }
    .normalized();
    if let Err(err) = draft.validate() {
        push_field_error(&mut errors, &err);
        return Err(errors);
    }
    Ok(draft)
}

fn element_draft_from_form(form: &ElementForm) -> Result<ElementDraft, FieldErrors> {
    let mut errors = FieldErrors::new();
    let element_code = required(&mut errors, "element_code", form.element_code.as_deref());
    let value = required(&mut errors, "value", form.value.as_deref());

    let (Some(element_code), Some(value)) = (element_code, value) else {
        return Err(errors);
    };

    let draft = ElementDraft { element_code, value }.normalized();
    if let Err(err) = draft.validate() {
        push_field_error(&mut errors, &err);
        return Err(errors);
    }
    Ok(draft)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(guide_list))
        .route("/enter-guide", post(enter_guide))
        .route("/guide-elements/:guide_pk", get(element_list))
        .route("/guide-elements/:guide_pk/enter", post(enter_element))
        .route("/api/get-guides", get(api_get_guides).post(api_post_guides))
        .route("/api/get-elements", get(api_get_elements).post(api_check_elements))
        .route("/api/openapi", get(openapi))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_filter.as_deref())?;

    let api = GuideRegistryApi::new(args.db.clone());
    let schema = api.schema_status().context("failed to initialize guide database")?;
    let config = ServiceConfig {
        api_page_size: args.api_page_size.min(args.max_page_size),
        max_page_size: args.max_page_size,
        display: DisplayConfig { date_style: args.date_style },
    };
    let state = ServiceState { api, config };

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(
        bind = %args.bind,
        db = %args.db.display(),
        schema_version = schema.current_version,
        date_style = args.date_style.as_str(),
        "guide registry service started"
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

fn init_tracing(directives: Option<&str>) -> Result<()> {
    let filter = match directives {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log filter: {directives}"))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "unable to install ctrl+c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "unable to install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service_version: API_CONTRACT_VERSION,
        schema_version: LATEST_SCHEMA_VERSION,
    })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn api_get_guides(
    State(state): State<ServiceState>,
    Query(query): Query<GuidesQuery>,
) -> Result<Json<Page<Guide>>, ServiceError> {
    let date = parse_date_param("date", query.date.as_deref(), today_utc())?;
    let page = state.config.api_page(query.page.as_deref(), query.page_size.as_deref())?;
    let request = GuidesRequest { name: non_blank(query.name), date };
    Ok(Json(state.api.get_guides(&request, &page)?))
}

async fn api_post_guides(
    State(state): State<ServiceState>,
    Query(paging): Query<PagingQuery>,
    body: Bytes,
) -> Result<Json<Page<Guide>>, ServiceError> {
    let body = legacy_guides_body(&body)?;
    let today = today_utc();
    let date = parse_date_param("date", body.date.as_deref(), today)?.unwrap_or(today);
    let page = state.config.api_page(paging.page.as_deref(), paging.page_size.as_deref())?;
    let request = GuidesRequest { name: non_blank(body.name), date: Some(date) };
    Ok(Json(state.api.get_guides(&request, &page)?))
}

// An empty body means "effective today".
fn legacy_guides_body(raw: &[u8]) -> Result<LegacyGuidesBody, ServiceError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(LegacyGuidesBody::default());
    }
    serde_json::from_slice(raw)
        .map_err(|err| ServiceError::bad_request(format!("Некорректное тело запроса: {err}")))
}

async fn api_get_elements(
    State(state): State<ServiceState>,
    Query(query): Query<ElementsQuery>,
) -> Result<Json<Page<GuideElement>>, ServiceError> {
    let as_of = parse_date_param("date", query.date.as_deref(), today_utc())?;
    let page = state.config.api_page(query.page.as_deref(), query.page_size.as_deref())?;
    let selector = GuideSelector { name: query.name, version: query.version, as_of };
    Ok(Json(state.api.get_elements(&selector, &page)?))
}

async fn api_check_elements(
    State(state): State<ServiceState>,
    Query(query): Query<ElementsQuery>,
    Json(body): Json<Value>,
) -> Result<Json<ExistenceReport>, ServiceError> {
    let as_of = parse_date_param("date", query.date.as_deref(), today_utc())?;
    let selector = GuideSelector { name: query.name, version: query.version, as_of };
    Ok(Json(state.api.check_elements(&selector, &body)?))
}

async fn guide_list(
    State(state): State<ServiceState>,
    Query(query): Query<GuideListQuery>,
) -> Result<Json<GuideListView>, ServiceError> {
    let start_date = match non_blank(query.start_date) {
        Some(raw) => Some(parse_form_date("start_date", &raw)?),
        None => None,
    };
    let filter = GuideFilter { name: query.name, start_date }.normalized();
    let page = state.api.list_guides(&filter, &ServiceConfig::ui_page(query.page.as_deref()))?;

    let display = state.config.display;
    let page_range = page.page_range();
    let page = page.map(|guide| GuideListItem {
        label: guide.label(),
        start_date_display: display.format_date(guide.start_date),
        guide,
    });
    Ok(Json(GuideListView { page, page_range, filter, display }))
}

async fn element_list(
    State(state): State<ServiceState>,
    Path(guide_pk): Path<i64>,
    Query(query): Query<ElementListQuery>,
) -> Result<Json<ElementListView>, ServiceError> {
    let guide_pk = GuideId(guide_pk);
    let filter =
        ElementFilter { element_code: query.element_code, value: query.value }.normalized();
    let page =
        state.api.list_elements(guide_pk, &filter, &ServiceConfig::ui_page(query.page.as_deref()))?;
    let page_range = page.page_range();
    Ok(Json(ElementListView { guide_pk, page, page_range, filter }))
}

async fn enter_guide(
    State(state): State<ServiceState>,
    Form(form): Form<GuideForm>,
) -> Result<Response, ServiceError> {
    let draft = match guide_draft_from_form(&form) {
        Ok(draft) => draft,
        Err(errors) => return Ok(FormContext::with_field_errors(form, errors).into_response()),
    };

    match state.api.upsert_guide(draft) {
        Ok(outcome) => {
            tracing::info!(guide_id = outcome.item.id.0, created = outcome.created, "guide entered");
            Ok(Redirect::to("/").into_response())
        }
        Err(err) => match FormContext::from_error(form, &err) {
            Some(context) => Ok(context.into_response()),
            None => Err(ServiceError::from(err)),
        },
    }
}

async fn enter_element(
    State(state): State<ServiceState>,
    Path(guide_pk): Path<i64>,
    Form(form): Form<ElementForm>,
) -> Result<Response, ServiceError> {
    let draft = match element_draft_from_form(&form) {
        Ok(draft) => draft,
        Err(errors) => return Ok(FormContext::with_field_errors(form, errors).into_response()),
    };

    match state.api.upsert_element(GuideId(guide_pk), draft) {
        Ok(outcome) => {
            tracing::info!(
                guide_id = guide_pk,
                element_id = outcome.item.id.0,
                created = outcome.created,
                "guide element entered"
            );
            Ok(Redirect::to(&format!("/guide-elements/{guide_pk}")).into_response())
        }
        Err(err) => match FormContext::from_error(form, &err) {
            Some(context) => Ok(context.into_response()),
            None => Err(ServiceError::from(err)),
        },
    }
}
