use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use guide_registry_api::GuideRegistryApi;
use guide_registry_core::{
    format_iso_date, parse_date_param, parse_form_date, today_utc, ElementDraft, ElementFilter,
    GuideDraft, GuideFilter, GuideId, GuideSelector, PageRequest, RegistryError,
};
use serde_json::Value;
use time::Date;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "guides")]
#[command(about = "Guide Registry operator CLI")]
struct Cli {
    #[arg(long, env = "GUIDE_REGISTRY_DB", default_value = "./guides.sqlite3")]
    db: PathBuf,

    /// Tracing filter directives for diagnostics on stderr.
    #[arg(long, env = "GUIDE_REGISTRY_LOG", default_value = "warn")]
    log_filter: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Guide {
        #[command(subcommand)]
        command: Box<GuideCommand>,
    },
    Element {
        #[command(subcommand)]
        command: Box<ElementCommand>,
    },
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum GuideCommand {
    Upsert(GuideUpsertArgs),
    List(GuideListArgs),
    Show(GuideIdArgs),
    Resolve(GuideResolveArgs),
    /// Delete a guide together with its elements.
    Delete(GuideIdArgs),
}

#[derive(Debug, Subcommand)]
enum ElementCommand {
    Upsert(ElementUpsertArgs),
    List(ElementListArgs),
    Check(ElementCheckArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    IntegrityCheck,
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct GuideUpsertArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    short_name: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    version: String,
    #[arg(long)]
    start_date: String,
}

#[derive(Debug, Args)]
struct PageArgs {
    #[arg(long, default_value_t = 1)]
    page: u64,
    #[arg(long, default_value_t = 100)]
    page_size: u64,
}

#[derive(Debug, Args)]
struct GuideListArgs {
    /// Case-sensitive substring of the guide name.
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    start_date: Option<String>,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Args)]
struct GuideIdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct GuideResolveArgs {
    #[arg(long)]
    name: Option<String>,
    /// `actual` or `YYYY-MM-DD`; defaults to today.
    #[arg(long)]
    date: Option<String>,
}

#[derive(Debug, Args)]
struct ElementUpsertArgs {
    #[arg(long)]
    guide_id: i64,
    #[arg(long)]
    code: String,
    #[arg(long)]
    value: String,
}

#[derive(Debug, Args)]
struct ElementListArgs {
    #[arg(long)]
    guide_id: i64,
    #[arg(long)]
    code: Option<String>,
    #[arg(long)]
    value: Option<String>,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Args)]
struct ElementCheckArgs {
    /// JSON object or array of `{"element_code", "value"}` items.
    #[arg(long)]
    body: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    version: Option<String>,
    #[arg(long)]
    date: Option<String>,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(directives: &str) -> Result<()> {
    let filter = EnvFilter::try_new(directives)
        .with_context(|| format!("invalid log filter: {directives}"))?;
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter)?;
    tracing::debug!(db = %cli.db.display(), "opening guide registry");

    let api = GuideRegistryApi::new(cli.db);
    match cli.command {
        Command::Guide { command } => run_guide(*command, &api),
        Command::Element { command } => run_element(*command, &api),
        Command::Db { command } => run_db(*command, &api),
    }
}

fn page_request(args: &PageArgs) -> Result<PageRequest> {
    Ok(PageRequest::new(args.page, args.page_size)?)
}

fn optional_date(field: &str, raw: Option<&str>) -> Result<Option<Date>> {
    Ok(parse_date_param(field, raw, today_utc())?)
}

fn run_guide(command: GuideCommand, api: &GuideRegistryApi) -> Result<()> {
    match command {
        GuideCommand::Upsert(args) => {
            let draft = GuideDraft {
                name: args.name,
                short_name: args.short_name,
                description: args.description,
                version: args.version,
                start_date: parse_form_date("start_date", &args.start_date)?,
            };
            let outcome = api.upsert_guide(draft)?;
            emit_json(serde_json::to_value(&outcome).context("failed to serialize guide")?)
        }
        GuideCommand::List(args) => {
            let start_date = args
                .start_date
                .as_deref()
                .map(|raw| parse_form_date("start_date", raw))
                .transpose()?;
            let filter = GuideFilter { name: args.name, start_date }.normalized();
            let page = api.list_guides(&filter, &page_request(&args.page)?)?;
            emit_json(serde_json::to_value(&page).context("failed to serialize guide page")?)
        }
        GuideCommand::Show(args) => {
            let guide_id = GuideId(args.id);
            let guide = api.get_guide(guide_id)?.ok_or(RegistryError::GuideNotFound(guide_id))?;
            let elements = api.list_elements(
                guide_id,
                &ElementFilter::default(),
                &PageRequest { page: 1, page_size: 1 },
            )?;
            emit_json(serde_json::json!({
                "guide": guide,
                "label": guide.label(),
                "element_count": elements.count
            }))
        }
        GuideCommand::Resolve(args) => {
            let as_of = optional_date("date", args.date.as_deref())?.unwrap_or_else(today_utc);
            let guides = api.resolve(args.name.as_deref(), Some(as_of))?;
            emit_json(serde_json::json!({
                "as_of": format_iso_date(as_of),
                "name": args.name,
                "guides": guides
            }))
        }
        GuideCommand::Delete(args) => {
            let guide_id = GuideId(args.id);
            let summary =
                api.delete_guide(guide_id)?.ok_or(RegistryError::GuideNotFound(guide_id))?;
            emit_json(serde_json::to_value(&summary).context("failed to serialize delete summary")?)
        }
    }
}

fn run_element(command: ElementCommand, api: &GuideRegistryApi) -> Result<()> {
    match command {
        ElementCommand::Upsert(args) => {
            let draft = ElementDraft { element_code: args.code, value: args.value };
            let outcome = api.upsert_element(GuideId(args.guide_id), draft)?;
            emit_json(serde_json::to_value(&outcome).context("failed to serialize element")?)
        }
        ElementCommand::List(args) => {
            let filter = ElementFilter { element_code: args.code, value: args.value }.normalized();
            let page =
                api.list_elements(GuideId(args.guide_id), &filter, &page_request(&args.page)?)?;
            emit_json(serde_json::to_value(&page).context("failed to serialize element page")?)
        }
        ElementCommand::Check(args) => {
            let body: Value =
                serde_json::from_str(&args.body).context("--body must be valid JSON")?;
            let selector = GuideSelector {
                name: args.name,
                version: args.version,
                as_of: optional_date("date", args.date.as_deref())?,
            };
            let report = api.check_elements(&selector, &body)?;
            emit_json(serde_json::json!({ "results": report }))
        }
    }
}

fn run_db(command: DbCommand, api: &GuideRegistryApi) -> Result<()> {
    match command {
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
        DbCommand::Backup(args) => {
            api.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
    }
}
