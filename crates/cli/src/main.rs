use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use optiq_api::{ApiConfig, CacheApi};
use optiq_client::InMemoryRemote;
use optiq_core::{
    NewTask, Priority, Task, TaskDetail, TaskFeed, TaskFilters, TaskId, TaskPage, TaskPatch,
    TaskStatus, UserId, DEFAULT_PAGE_LIMIT,
};
use optiq_sync::{Notice, NoticeKind, NotificationSink};

#[derive(Parser, Debug)]
#[command(name = "optiqctl", version, about = "Optiq CLI (optimistic cache over a seeded in-memory remote)")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Page size for list views
    #[arg(long = "limit", global = true, default_value_t = DEFAULT_PAGE_LIMIT)]
    limit: u32,

    /// Offset of the paged window
    #[arg(long = "offset", global = true, default_value_t = 0)]
    offset: u32,

    /// List filter, e.g. -f status=done -f assignee=u-bo (repeatable)
    #[arg(short = 'f', long = "filter", global = true, action = ArgAction::Append, value_name = "FIELD=VALUE")]
    filters: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List tasks from the cached paged window
    Ls {
        /// Show the infinite feed instead of the paged window
        #[arg(long = "feed", action = ArgAction::SetTrue)]
        feed: bool,
        /// Feed pages to load (with --feed)
        #[arg(long = "pages", default_value_t = 1)]
        pages: usize,
    },
    /// Show one task's detail view
    Show {
        /// Task id, e.g. T-1003
        id: String,
    },
    /// Create a task (lands optimistically before the server confirms)
    Create {
        title: String,
        /// todo | in_progress | in_review | done
        #[arg(long)]
        status: Option<String>,
        /// low | medium | high | urgent
        #[arg(long)]
        priority: Option<String>,
        /// feature | bug | chore
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        assignee: Option<String>,
        /// Due date, RFC 3339 or YYYY-MM-DD
        #[arg(long)]
        due: Option<String>,
        #[arg(long, default_value = "u-local")]
        reporter: String,
    },
    /// Patch fields on a task, e.g. `set T-1003 status=done priority=high`
    Set {
        id: String,
        /// field=value pairs; an empty value clears assignee/due
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Delete one task
    Rm {
        id: String,
    },
    /// Delete several tasks in one remote round trip
    Purge {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Scripted tour of the optimistic write lifecycle
    Demo,
}

fn init_tracing() {
    let env = std::env::var("OPTIQ_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("OPTIQ_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid OPTIQ_METRICS_ADDR; expected host:port");
        }
    }
}

/// Every invocation runs against a fresh in-memory remote seeded with
/// OPTIQ_SEED tasks (default 12).
fn bootstrap(limit: u32, offset: u32, filters: &TaskFilters) -> (Arc<InMemoryRemote>, Arc<CacheApi>) {
    let seed =
        std::env::var("OPTIQ_SEED").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(12);
    let remote = Arc::new(InMemoryRemote::new());
    remote.seed(seed);
    let mut cfg = ApiConfig::from_env();
    cfg.page_limit = limit;
    let api = Arc::new(CacheApi::with_config(remote.clone(), cfg));
    api.set_context(offset, filters.clone());
    (remote, api)
}

fn wait_budget() -> Duration {
    let ms =
        std::env::var("OPTIQ_WAIT_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(2000);
    Duration::from_millis(ms)
}

/// Demo sink: notices print as indented lines between the tables.
struct StdoutNotices;

impl NotificationSink for StdoutNotices {
    fn notify(&self, notice: Notice) {
        let tag = match notice.kind {
            NoticeKind::Info => "info",
            NoticeKind::Success => "ok",
            NoticeKind::Warn => "warn",
            NoticeKind::Error => "error",
        };
        println!("  [{tag}] {}", notice.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let filters = TaskFilters::from_pairs(cli.filters.iter().map(String::as_str))?;
    let wait = wait_budget();

    match cli.command {
        Commands::Ls { feed, pages } => {
            info!(limit = cli.limit, offset = cli.offset, feed, "ls invoked");
            let (_remote, api) = bootstrap(cli.limit, cli.offset, &filters);
            if feed {
                let sub = api.subscribe_infinite();
                api.quiesce(wait).await;
                for _ in 1..pages.max(1) {
                    if let Err(e) = api.load_more().await {
                        eprintln!("load more error: {e}");
                        break;
                    }
                }
                match sub.current() {
                    Some(f) => match cli.output {
                        Output::Human => print_feed(&f),
                        Output::Json => println!("{}", serde_json::to_string_pretty(&f)?),
                    },
                    None => eprintln!("feed did not load"),
                }
            } else {
                let sub = api.subscribe_paged();
                api.quiesce(wait).await;
                match sub.current() {
                    Some(page) => match cli.output {
                        Output::Human => print_page(&page),
                        Output::Json => println!("{}", serde_json::to_string_pretty(&page)?),
                    },
                    None => eprintln!("page did not load"),
                }
            }
            api.shutdown();
        }
        Commands::Show { id } => {
            info!(id = %id, "show invoked");
            let (_remote, api) = bootstrap(cli.limit, cli.offset, &filters);
            let tid = TaskId::from(id.as_str());
            let sub = api.subscribe_detail(&tid);
            api.quiesce(wait).await;
            match sub.current() {
                Some(detail) => match cli.output {
                    Output::Human => print_detail(&detail),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&detail)?),
                },
                None => eprintln!("task {id} not found"),
            }
            api.shutdown();
        }
        Commands::Create { title, status, priority, kind, assignee, due, reporter } => {
            info!(title = %title, "create invoked");
            let mut draft = NewTask::new(title, UserId::from(reporter.as_str()));
            if let Some(s) = status.as_deref() {
                draft.status = s.parse()?;
            }
            if let Some(p) = priority.as_deref() {
                draft.priority = p.parse()?;
            }
            if let Some(k) = kind.as_deref() {
                draft.kind = k.parse()?;
            }
            if let Some(a) = assignee.as_deref() {
                draft.assignee = Some(UserId::from(a));
            }
            if let Some(d) = due.as_deref() {
                draft.due_date = Some(parse_due(d)?);
            }
            let (_remote, api) = bootstrap(cli.limit, cli.offset, &filters);
            let sub = api.subscribe_paged();
            api.quiesce(wait).await;
            match api.create(draft).await {
                Ok(task) => {
                    api.quiesce(wait).await;
                    match cli.output {
                        Output::Human => {
                            println!("created {}", task.id);
                            if let Some(page) = sub.current() {
                                print_page(&page);
                            }
                        }
                        Output::Json => println!("{}", serde_json::to_string_pretty(&task)?),
                    }
                }
                Err(e) => {
                    error!(error = %e, "create failed");
                    eprintln!("create error: {e}");
                    api.quiesce(wait).await;
                }
            }
            api.shutdown();
        }
        Commands::Set { id, fields } => {
            info!(id = %id, fields = fields.len(), "set invoked");
            let patch = parse_patch(&fields)?;
            let (_remote, api) = bootstrap(cli.limit, cli.offset, &filters);
            let sub = api.subscribe_paged();
            api.quiesce(wait).await;
            let tid = TaskId::from(id.as_str());
            match api.update(&tid, patch).await {
                Ok(task) => {
                    api.quiesce(wait).await;
                    match cli.output {
                        Output::Human => {
                            println!("updated {}", task.id);
                            if let Some(page) = sub.current() {
                                print_page(&page);
                            }
                        }
                        Output::Json => println!("{}", serde_json::to_string_pretty(&task)?),
                    }
                }
                Err(e) => {
                    error!(error = %e, "set failed");
                    eprintln!("set error: {e}");
                    api.quiesce(wait).await;
                }
            }
            api.shutdown();
        }
        Commands::Rm { id } => {
            info!(id = %id, "rm invoked");
            let (_remote, api) = bootstrap(cli.limit, cli.offset, &filters);
            let sub = api.subscribe_paged();
            api.quiesce(wait).await;
            let tid = TaskId::from(id.as_str());
            match api.delete(&tid).await {
                Ok(()) => {
                    if matches!(cli.output, Output::Human) {
                        println!("deleted {tid}");
                    }
                }
                Err(e) => {
                    error!(error = %e, "rm failed");
                    eprintln!("rm error: {e}");
                }
            }
            api.quiesce(wait).await;
            if let Some(page) = sub.current() {
                match cli.output {
                    Output::Human => print_page(&page),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&page)?),
                }
            }
            api.shutdown();
        }
        Commands::Purge { ids } => {
            info!(count = ids.len(), "purge invoked");
            let (_remote, api) = bootstrap(cli.limit, cli.offset, &filters);
            let sub = api.subscribe_paged();
            api.quiesce(wait).await;
            let tids: Vec<TaskId> = ids.iter().map(|s| TaskId::from(s.as_str())).collect();
            match api.bulk_delete(&tids).await {
                Ok(()) => {
                    if matches!(cli.output, Output::Human) {
                        println!("deleted {} tasks", tids.len());
                    }
                }
                Err(e) => {
                    error!(error = %e, "purge failed");
                    eprintln!("purge error: {e}");
                }
            }
            api.quiesce(wait).await;
            if let Some(page) = sub.current() {
                match cli.output {
                    Output::Human => print_page(&page),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&page)?),
                }
            }
            api.shutdown();
        }
        Commands::Demo => {
            let latency_ms = std::env::var("OPTIQ_REMOTE_LATENCY_MS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(150);
            info!(latency_ms, "demo invoked");
            let remote = Arc::new(InMemoryRemote::with_latency(Duration::from_millis(latency_ms)));
            remote.seed(6);
            let mut cfg = ApiConfig::from_env();
            cfg.page_limit = cli.limit;
            let api = Arc::new(
                CacheApi::with_config(remote.clone(), cfg)
                    .with_notifications(Arc::new(StdoutNotices)),
            );
            api.set_context(cli.offset, filters.clone());
            let paged = api.subscribe_paged();
            let feed = api.subscribe_infinite();
            api.quiesce(wait).await;

            println!("== initial (6 tasks seeded, remote latency {latency_ms}ms) ==");
            if let Some(page) = paged.current() {
                print_page(&page);
            }
            let peek = Duration::from_millis((latency_ms / 2).max(10));

            println!();
            println!("== create: speculative row first, server id after ==");
            let draft = NewTask::new("Draft the cache sync notes", UserId::from("u-demo"));
            let pending = tokio::spawn({
                let api = Arc::clone(&api);
                async move { api.create(draft).await }
            });
            tokio::time::sleep(peek).await;
            if let Some(page) = paged.current() {
                println!("-- while the remote call is in flight --");
                print_page(&page);
            }
            match pending.await? {
                Ok(task) => println!("-- server assigned {} --", task.id),
                Err(e) => eprintln!("create error: {e}"),
            }
            api.quiesce(wait).await;
            if let Some(page) = paged.current() {
                print_page(&page);
            }

            println!();
            println!("== update: every cached view patches in place ==");
            let head = paged.current().and_then(|p| p.items.first().map(|t| t.id.clone()));
            if let Some(id) = head {
                let patch = TaskPatch {
                    status: Some(TaskStatus::Done),
                    priority: Some(Priority::High),
                    ..Default::default()
                };
                let pending = tokio::spawn({
                    let api = Arc::clone(&api);
                    let id = id.clone();
                    async move { api.update(&id, patch).await }
                });
                tokio::time::sleep(peek).await;
                if let Some(page) = paged.current() {
                    println!("-- while the remote call is in flight --");
                    print_page(&page);
                }
                if let Err(e) = pending.await? {
                    eprintln!("update error: {e}");
                }
                api.quiesce(wait).await;
                if let Some(page) = paged.current() {
                    print_page(&page);
                }
            }

            println!();
            println!("== delete: paged total waits for the server, feed total does not ==");
            let victim = paged.current().and_then(|p| p.items.last().map(|t| t.id.clone()));
            if let Some(id) = victim {
                let pending = tokio::spawn({
                    let api = Arc::clone(&api);
                    let id = id.clone();
                    async move { api.delete(&id).await }
                });
                tokio::time::sleep(peek).await;
                let paged_total = paged.current().map(|p| p.page.total).unwrap_or(0);
                let feed_total = feed.current().and_then(|f| f.total()).unwrap_or(0);
                println!("-- in flight: paged total {paged_total}, feed total {feed_total} --");
                if let Err(e) = pending.await? {
                    eprintln!("delete error: {e}");
                }
                api.quiesce(wait).await;
                let paged_total = paged.current().map(|p| p.page.total).unwrap_or(0);
                let feed_total = feed.current().and_then(|f| f.total()).unwrap_or(0);
                println!("-- settled: paged total {paged_total}, feed total {feed_total} --");
            }

            println!();
            println!("== failure: the speculative write rolls back ==");
            remote.fail_next("remote rejected the write");
            if let Some(before) = paged.current() {
                if let Some(id) = before.items.first().map(|t| t.id.clone()) {
                    if let Err(e) = api.delete(&id).await {
                        println!("-- {e}; cache rolled back --");
                    }
                    api.quiesce(wait).await;
                    if let Some(after) = paged.current() {
                        let restored = after
                            .items
                            .iter()
                            .map(|t| &t.id)
                            .eq(before.items.iter().map(|t| &t.id));
                        println!("-- ids match the pre-delete page: {restored} --");
                        print_page(&after);
                    }
                }
            }
            api.shutdown();
        }
    }

    Ok(())
}

/// Parse `field=value` pairs into a patch. An empty value clears the
/// nullable fields (assignee, due).
fn parse_patch(pairs: &[String]) -> Result<TaskPatch> {
    let mut patch = TaskPatch::default();
    for pair in pairs {
        let (field, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected field=value, got: {pair}"))?;
        let value = value.trim();
        match field.trim() {
            "title" => patch.title = Some(value.to_string()),
            "status" => patch.status = Some(value.parse()?),
            "priority" => patch.priority = Some(value.parse()?),
            "kind" => patch.kind = Some(value.parse()?),
            "assignee" => {
                patch.assignee =
                    Some(if value.is_empty() { None } else { Some(UserId::from(value)) });
            }
            "due" => {
                patch.due_date =
                    Some(if value.is_empty() { None } else { Some(parse_due(value)?) });
            }
            other => anyhow::bail!("unknown field: {other}"),
        }
    }
    Ok(patch)
}

fn parse_due(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = s.parse::<DateTime<Utc>>() {
        return Ok(ts);
    }
    let naive = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")?.and_time(chrono::NaiveTime::MIN);
    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

fn print_page(page: &TaskPage) {
    print_header();
    for t in &page.items {
        println!("{}", task_row(t));
    }
    let limit = page.page.limit.max(1);
    let index = (page.page.offset / limit) as u64;
    let pages = page.page.total.div_ceil(limit as u64).max(1);
    println!("page {} of {} ({} total)", index + 1, pages, page.page.total);
}

fn print_feed(feed: &TaskFeed) {
    print_header();
    for t in feed.tasks() {
        println!("{}", task_row(t));
    }
    println!(
        "{} pages loaded, {} rows, total {}",
        feed.loaded_pages(),
        feed.tasks().count(),
        feed.total().unwrap_or(0)
    );
}

fn print_detail(detail: &TaskDetail) {
    let t = &detail.task;
    println!("id:        {}", t.id);
    println!("title:     {}", t.title);
    println!("status:    {}", t.status);
    println!("priority:  {}", t.priority);
    println!("kind:      {}", t.kind);
    println!("assignee:  {}", t.assignee.as_ref().map(UserId::as_str).unwrap_or("-"));
    println!("reporter:  {}", t.reporter);
    match t.due_date {
        Some(due) => println!("due:       {}", due.format("%Y-%m-%d")),
        None => println!("due:       -"),
    }
    println!("created:   {} ({} ago)", t.created_at.format("%Y-%m-%d %H:%M"), render_age(t.created_at));
    println!("updated:   {} ({} ago)", t.updated_at.format("%Y-%m-%d %H:%M"), render_age(t.updated_at));
    if !t.optimistic.is_stable() {
        println!("state:     {}", t.optimistic);
    }
    if detail.is_deleted {
        println!("deleted:   yes");
    }
}

fn print_header() {
    println!(
        "{:<12} {:<9} {:<12} {:<7} {:<8} {:<8} {:<6} TITLE",
        "ID", "STATE", "STATUS", "PRIO", "KIND", "ASSIGNEE", "AGE"
    );
}

fn task_row(t: &Task) -> String {
    let state = if t.is_pending() { t.optimistic.as_str() } else { "-" };
    let assignee = t.assignee.as_ref().map(UserId::as_str).unwrap_or("-");
    format!(
        "{:<12} {:<9} {:<12} {:<7} {:<8} {:<8} {:<6} {}",
        short_id(&t.id),
        state,
        t.status,
        t.priority,
        t.kind,
        assignee,
        render_age(t.created_at),
        t.title,
    )
}

/// Placeholder ids from optimistic creates are uuid-length; keep rows aligned.
/// Ids come from whatever backend is plugged in, so truncate by chars, not
/// bytes.
fn short_id(id: &TaskId) -> String {
    let s = id.as_str();
    if s.chars().count() > 12 {
        let head: String = s.chars().take(10).collect();
        format!("{head}..")
    } else {
        s.to_string()
    }
}

fn render_age(ts: DateTime<Utc>) -> String {
    let mut secs = (Utc::now() - ts).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_cuts_on_char_boundaries() {
        assert_eq!(short_id(&TaskId::from("T-1001")), "T-1001");
        assert_eq!(short_id(&TaskId::from("local-0123456789abcdef")), "local-0123..");
        // Ids from a foreign backend can put a multi-byte char across the
        // cut point; the renderer must not split it.
        let cut = short_id(&TaskId::from("zadanie-wąż-42"));
        assert_eq!(cut, "zadanie-wą..");
        assert_eq!(cut.chars().count(), 12);
    }
}
