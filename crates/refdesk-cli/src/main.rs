use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use refdesk_client::{
    ApiClient, ApiError, ReferenceChoice, SearchResponse, SynopsisOptions, DEFAULT_BASE_URL,
};
use refdesk_core::{HistoryRecord, RunInfo, RunStatus, SearchQuery};
use refdesk_history::HistoryService;
use refdesk_store::{HistoryStore, Preferences, PrefsStore};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "refdesk")]
#[command(about = "Reference-drug search and analysis client", long_about = None)]
struct Cli {
    /// Base URL of the analysis service.
    #[arg(long, env = "REFDESK_API_URL", default_value = DEFAULT_BASE_URL)]
    api_url: String,
    /// Directory holding history.json and prefs.json.
    #[arg(long, env = "REFDESK_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Search the registry for matching reference products
    Search(SearchArgs),
    /// Choose a reference option for an existing search session
    Choose(ChooseArgs),
    /// Choose a reference and run the full analysis pipeline
    Analyze(AnalyzeArgs),
    /// Inspect the server-side run ledger
    Runs {
        #[command(subcommand)]
        action: RunsCommands,
    },
    /// Build or inspect the synopsis for a finished run
    Synopsis {
        #[command(subcommand)]
        action: SynopsisCommands,
    },
    /// Show the reconciled local history
    History(HistoryArgs),
    /// Poll every outstanding run to completion
    Watch(WatchArgs),
    /// Show or change persisted preferences
    Prefs {
        #[command(subcommand)]
        action: PrefsCommands,
    },
    /// Check that the analysis service is reachable
    Health,
}

#[derive(Args)]
struct SearchArgs {
    #[arg(long, default_value = "")]
    mnn: String,
    #[arg(long, default_value = "")]
    routes: String,
    #[arg(long, default_value = "")]
    base_form: String,
    #[arg(long, default_value = "")]
    release_type: String,
    #[arg(long, default_value = "")]
    dosage: String,
    /// Registry workbook; the server picks one up automatically when omitted.
    #[arg(long)]
    xls_path: Option<String>,
}

#[derive(Args)]
struct ChooseArgs {
    #[arg(long)]
    session: String,
    /// 1-based option number from the search output.
    #[arg(long, conflicts_with = "drug")]
    option: Option<usize>,
    /// Exact reference drug name from the search output.
    #[arg(long)]
    drug: Option<String>,
    #[arg(long)]
    save_json: Option<String>,
}

#[derive(Args)]
struct AnalyzeArgs {
    #[command(flatten)]
    choose: ChooseArgs,
    #[arg(long)]
    save_output: Option<String>,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum RunsCommands {
    List(RunsListArgs),
    Show { run_id: String },
    #[command(alias = "rm")]
    Delete { run_id: String },
}

#[derive(Args)]
struct RunsListArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long)]
    status: Option<RunStatus>,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum SynopsisCommands {
    Build(SynopsisBuildArgs),
    Show { run_id: String },
}

#[derive(Args)]
struct SynopsisBuildArgs {
    run_id: String,
    #[arg(long)]
    template_path: Option<String>,
    #[arg(long)]
    prompt_path: Option<String>,
    #[arg(long)]
    output_docx: Option<String>,
    /// Keep polling until the synopsis reaches a terminal state.
    #[arg(long)]
    wait: bool,
}

#[derive(Args)]
struct HistoryArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Args)]
struct WatchArgs {
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum PrefsCommands {
    Show,
    Set(PrefsSetArgs),
}

#[derive(Args)]
struct PrefsSetArgs {
    #[arg(long)]
    history_drawer: Option<bool>,
    #[arg(long)]
    details_drawer: Option<bool>,
}

struct App {
    client: Arc<ApiClient>,
    service: Arc<HistoryService>,
    prefs: PrefsStore,
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::home_dir()
            .context("Cannot resolve a home directory; pass --data-dir")?
            .join(".refdesk"),
    };
    let client = Arc::new(ApiClient::new(&cli.api_url).map_err(surface)?);
    let store = HistoryStore::open(data_dir.join("history.json"));
    let service = HistoryService::new(client.clone(), store);
    let app = App {
        client,
        service,
        prefs: PrefsStore::new(data_dir.join("prefs.json")),
        json: cli.json,
    };

    match cli.command {
        Commands::Search(args) => search(&app, args).await,
        Commands::Choose(args) => choose(&app, args).await,
        Commands::Analyze(args) => analyze(&app, args).await,
        Commands::Runs { action } => match action {
            RunsCommands::List(args) => runs_list(&app, args).await,
            RunsCommands::Show { run_id } => runs_show(&app, &run_id).await,
            RunsCommands::Delete { run_id } => runs_delete(&app, &run_id).await,
        },
        Commands::Synopsis { action } => match action {
            SynopsisCommands::Build(args) => synopsis_build(&app, args).await,
            SynopsisCommands::Show { run_id } => synopsis_show(&app, &run_id).await,
        },
        Commands::History(args) => history(&app, args).await,
        Commands::Watch(args) => watch(&app, args).await,
        Commands::Prefs { action } => match action {
            PrefsCommands::Show => prefs_show(&app),
            PrefsCommands::Set(args) => prefs_set(&app, args),
        },
        Commands::Health => health(&app).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Attach the server's diagnostic payload when there is one.
fn surface(err: ApiError) -> anyhow::Error {
    match err {
        ApiError::Api {
            message,
            details: Some(details),
        } => anyhow!("{message}\n{details}"),
        other => anyhow!(other),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn search(app: &App, args: SearchArgs) -> Result<()> {
    let query = SearchQuery {
        mnn: args.mnn,
        routes: args.routes,
        base_form: args.base_form,
        release_type: args.release_type,
        dosage: args.dosage,
    };
    query.validate()?;

    let resp = app
        .client
        .search(&query, args.xls_path.as_deref())
        .await
        .map_err(surface)?;

    if !resp.has_matches() {
        if app.json {
            return print_json(&resp);
        }
        println!("No matches.");
        if let Some(message) = &resp.message {
            println!("{message}");
        }
        return Ok(());
    }

    let record = app.service.record_search(query, &resp).await;
    if app.json {
        return print_json(&resp);
    }
    print_search(&resp, &record);
    Ok(())
}

fn print_search(resp: &SearchResponse, record: &HistoryRecord) {
    println!("Matching rows: {}", resp.matches_count);
    println!("Reference options: {}", resp.reference_options_count);
    for (index, option) in resp.reference_options.iter().enumerate() {
        println!(
            "{}. {} (rows: {})",
            index + 1,
            option.reference_drug,
            option.rows_count
        );
        for sample in &option.sample_rows {
            println!(
                "   - {} | {} | {}",
                sample.trade_name.as_deref().unwrap_or("-"),
                sample.drug_form.as_deref().unwrap_or("-"),
                sample.dosage.as_deref().unwrap_or("-"),
            );
        }
    }
    if let Some(session_id) = &record.session_id {
        println!("Session: {session_id}");
    }
    println!("Saved to history as {}", record.id);
}

fn reference_choice(args: &ChooseArgs) -> Result<ReferenceChoice> {
    match (&args.option, &args.drug) {
        (Some(index), None) => Ok(ReferenceChoice::OptionIndex(*index)),
        (None, Some(name)) => Ok(ReferenceChoice::DrugName(name.clone())),
        _ => bail!("Pass exactly one of --option or --drug"),
    }
}

async fn choose(app: &App, args: ChooseArgs) -> Result<()> {
    let choice = reference_choice(&args)?;
    app.service.begin_pending(&args.session).await;
    let result = app
        .client
        .choose_reference(&args.session, &choice, args.save_json.as_deref())
        .await;
    let resp = match result {
        Ok(resp) => resp,
        Err(err) => {
            app.service.end_pending(&args.session).await;
            return Err(surface(err));
        }
    };
    app.service.apply_choose(&resp).await;

    if app.json {
        return print_json(&resp);
    }
    println!("Selected reference: {}", resp.selected_reference_drug);
    println!("Run: {}", resp.run_id);
    if let Some(path) = &resp.saved_json_path {
        println!("Selection JSON: {path}");
    }
    Ok(())
}

async fn analyze(app: &App, args: AnalyzeArgs) -> Result<()> {
    let choice = reference_choice(&args.choose)?;
    let session = &args.choose.session;
    app.service.begin_pending(session).await;
    let result = app
        .client
        .run_pipeline(
            session,
            &choice,
            args.choose.save_json.as_deref(),
            args.save_output.as_deref(),
        )
        .await;
    let resp = match result {
        Ok(resp) => resp,
        Err(err) => {
            app.service.end_pending(session).await;
            return Err(surface(err));
        }
    };
    app.service.apply_pipeline(&resp).await;

    if app.json {
        return print_json(&resp);
    }
    println!(
        "Selected reference: {}",
        resp.selection.selected_reference_drug
    );
    println!("Run: {}", resp.selection.run_id);
    if let Some(path) = &resp.selection.saved_json_path {
        println!("Selection JSON: {path}");
    }
    if let Some(path) = &resp.router.saved_response_path {
        println!("Analysis saved: {path}");
    }
    if let Some(text) = &resp.router.analysis_text {
        println!("\n{}", refdesk_core::record::preview(text));
    }
    Ok(())
}

async fn runs_list(app: &App, args: RunsListArgs) -> Result<()> {
    let runs = app
        .client
        .list_runs(args.limit, args.status)
        .await
        .map_err(surface)?;
    if app.json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }
    for run in &runs {
        print_run_line(run);
    }
    Ok(())
}

fn print_run_line(run: &RunInfo) {
    println!(
        "{} | {} | {} | {} | {}",
        run.id,
        run.status,
        run.created_at.as_deref().unwrap_or("-"),
        run.mode.as_deref().unwrap_or("-"),
        run.selected_reference_drug.as_deref().unwrap_or("-"),
    );
}

async fn runs_show(app: &App, run_id: &str) -> Result<()> {
    let run = app.client.get_run(run_id).await.map_err(surface)?;
    app.service.ensure_from_run(&run).await;
    if app.json {
        return print_json(&run);
    }
    print_run_line(&run);
    if let Some(query) = &run.query {
        println!("Query: {} | {} | {}", query.mnn, query.base_form, query.dosage);
    }
    if let Some(path) = &run.selection_file_path {
        println!("Selection JSON: {path}");
    }
    if let Some(path) = &run.router_output_path {
        println!("Analysis saved: {path}");
    }
    if let Some(text) = &run.router_output_text {
        println!("\n{}", refdesk_core::record::preview(text));
    }
    Ok(())
}

async fn runs_delete(app: &App, run_id: &str) -> Result<()> {
    app.client.delete_run(run_id).await.map_err(surface)?;
    app.service.remove_by_run_id(run_id).await;
    println!("Deleted {run_id}");
    Ok(())
}

async fn synopsis_build(app: &App, args: SynopsisBuildArgs) -> Result<()> {
    let options = SynopsisOptions {
        template_path: args.template_path,
        prompt_path: args.prompt_path,
        output_docx: args.output_docx,
    };
    let resp = app
        .client
        .build_synopsis(&args.run_id, &options)
        .await
        .map_err(surface)?;
    app.service.apply_synopsis_build(&args.run_id, &resp).await;
    if args.wait {
        app.service.clone().track_synopsis(&args.run_id).await;
        app.service.join_pollers().await;
    }

    if app.json {
        return print_json(&resp);
    }
    if let Some(id) = &resp.synopsis_run_id {
        println!("Synopsis run: {id}");
    }
    if let Some(url) = &resp.download_url {
        println!("Download: {url}");
    }
    if let Some(path) = &resp.output_docx_path {
        println!("Document: {path}");
    }
    Ok(())
}

async fn synopsis_show(app: &App, run_id: &str) -> Result<()> {
    let synopsis = app.client.get_synopsis(run_id).await.map_err(surface)?;
    let Some(info) = synopsis else {
        println!("No synopsis for {run_id}");
        return Ok(());
    };
    app.service.apply_synopsis_info(run_id, &info).await;
    if app.json {
        return print_json(&info);
    }
    println!("{} | {}", info.id, info.status);
    if let Some(url) = &info.download_url {
        println!("Download: {url}");
    }
    if let Some(text) = &info.error_text {
        println!("Error: {text}");
    }
    Ok(())
}

async fn history(app: &App, args: HistoryArgs) -> Result<()> {
    if app.service.clone().refresh(args.limit).await.is_err() {
        warn!("service unreachable, showing cached history");
    }
    let records = app.service.records().await;
    if app.json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("History is empty.");
        return Ok(());
    }
    for record in &records {
        let marker = match app.service.pending_key_for(record).await {
            Some(key) => format!("in flight ({key})"),
            None => record
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
        };
        println!(
            "{} | {} | {} | {} | {}",
            record.created_at.format("%Y-%m-%d %H:%M"),
            record
                .query
                .as_ref()
                .map(|q| q.mnn.as_str())
                .unwrap_or("-"),
            record.selected_reference_drug.as_deref().unwrap_or("-"),
            record
                .matches_count
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string()),
            marker,
        );
    }
    Ok(())
}

async fn watch(app: &App, args: WatchArgs) -> Result<()> {
    app.service.clone().refresh(args.limit).await.map_err(surface)?;
    let tracked = app.service.tracked_runs().await;
    if tracked == 0 {
        println!("Nothing in flight.");
        return Ok(());
    }
    println!("Polling {tracked} run(s)...");
    app.service.join_pollers().await;
    for record in app.service.records().await {
        if let Some(run_id) = &record.run_id {
            let status = record
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{run_id} | {status}");
        }
    }
    Ok(())
}

fn prefs_show(app: &App) -> Result<()> {
    let prefs = app.prefs.load();
    if app.json {
        return print_json(&prefs);
    }
    println!("historyDrawerOpen: {}", prefs.history_drawer_open);
    println!("detailsDrawerOpen: {}", prefs.details_drawer_open);
    Ok(())
}

fn prefs_set(app: &App, args: PrefsSetArgs) -> Result<()> {
    let mut prefs: Preferences = app.prefs.load();
    if let Some(open) = args.history_drawer {
        prefs.history_drawer_open = open;
    }
    if let Some(open) = args.details_drawer {
        prefs.details_drawer_open = open;
    }
    app.prefs.save(&prefs);
    prefs_show(app)
}

async fn health(app: &App) -> Result<()> {
    let resp = app.client.health().await.map_err(surface)?;
    if app.json {
        return print_json(&resp);
    }
    println!(
        "{} ok | sessions: {} | cached workbooks: {}",
        resp.service,
        resp.sessions_count.unwrap_or(0),
        resp.cached_workbooks.unwrap_or(0),
    );
    Ok(())
}
