//! Sitekeeper CLI - command-line access to the facilities data
//!
//! Usage: sitekeeper-cli [OPTIONS] <COMMAND>
//!
//! Supports JSON output for scripting.

use chrono::{DateTime, Local, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sitekeeper_lib::auth::{AuthClient, AuthSession, IdentityProvider};
use sitekeeper_lib::db::{
    Computer, DateRange, Issue, IssueType, Printer, PrinterStatus, Site, SupplyCount, TimestampEncoding,
};
use sitekeeper_lib::logging::{init_logging, LogFormat};
use sitekeeper_lib::managers::{
    IssueQuery, Managers, NewCleaning, NewIssue, NewSiteReady, NewSupplyRequest, Scope,
    SupplyCountScope,
};
use sitekeeper_lib::search::{IssueSearch, IssueSort};
use sitekeeper_lib::settings::{Backend, Settings};
use sitekeeper_lib::utils::{ellipsize, parse_range};
use sitekeeper_lib::{open_store_with_token, AuthError, SettingsError, StoreError};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("{0}")]
    Usage(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) | CliError::Settings(_) | CliError::Store(StoreError::InvalidInput(_)) => 2,
            CliError::Store(StoreError::MissingIndex { .. }) => 3,
            CliError::Store(StoreError::Unavailable(_)) | CliError::Auth(AuthError::Unavailable(_)) => 4,
            CliError::Store(StoreError::NotFound { .. }) => 5,
            _ => 1,
        }
    }
}

type CliResult = Result<(), CliError>;

fn usage(msg: impl Into<String>) -> CliError {
    CliError::Usage(msg.into())
}

// ============================================================================
// Main CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "sitekeeper-cli")]
#[command(version, about = "Computer site facilities CLI", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Settings file (default: <data dir>/sitekeeper/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Document store backend: memory, sqlite or firestore
    #[arg(long, global = true)]
    backend: Option<String>,

    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<String>,

    /// Output as JSON for scripting
    #[arg(long, global = true)]
    json: bool,

    /// Detailed logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Buildings that host sites
    Buildings {
        #[command(subcommand)]
        cmd: BuildingCommands,
    },
    /// Computer sites
    Sites {
        #[command(subcommand)]
        cmd: SiteCommands,
    },
    /// Computers at a site
    Computers {
        #[command(subcommand)]
        cmd: ComputerCommands,
    },
    /// Printers at a site
    Printers {
        #[command(subcommand)]
        cmd: PrinterCommands,
    },
    /// Reported issues
    Issues {
        #[command(subcommand)]
        cmd: IssueCommands,
    },
    /// Hourly cleaning logs
    Cleaning {
        #[command(subcommand)]
        cmd: CleaningCommands,
    },
    /// Site ready surveys
    SiteReady {
        #[command(subcommand)]
        cmd: SiteReadyCommands,
    },
    /// Supply counts and requests
    Supplies {
        #[command(subcommand)]
        cmd: SupplyCommands,
    },
    /// Sign in and record the user profile
    Login {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        password: Option<String>,
        /// Create the account instead of signing in
        #[arg(long)]
        sign_up: bool,
        /// Google ID token
        #[arg(long, conflicts_with_all = ["email", "apple_token"])]
        google_token: Option<String>,
        /// Apple ID token
        #[arg(long, conflicts_with_all = ["email", "google_token"])]
        apple_token: Option<String>,
        /// Send a password reset email instead
        #[arg(long, requires = "email")]
        reset: bool,
    },
    /// Settings file
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum BuildingCommands {
    List,
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        abbr: String,
    },
}

#[derive(Subcommand)]
enum SiteCommands {
    List {
        #[arg(long)]
        building: Option<String>,
    },
    Show {
        id: String,
    },
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        building: String,
        /// computerLab, classroom, library, office or other
        #[arg(long, default_value = "computerLab")]
        site_type: String,
        #[arg(long)]
        room: Option<String>,
        #[arg(long)]
        printer: bool,
        #[arg(long)]
        clock: bool,
        #[arg(long)]
        inventory: bool,
    },
    Remove {
        id: String,
    },
}

#[derive(Subcommand)]
enum ComputerCommands {
    List {
        #[arg(long)]
        site: Option<String>,
    },
    Add {
        #[arg(long)]
        site: String,
        #[arg(long)]
        name: String,
        /// windows, mac or linux
        #[arg(long, default_value = "windows")]
        os: String,
        #[arg(long)]
        section: Option<String>,
    },
    /// Mark computers as cleaned now
    Cleaned {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PrinterCommands {
    List {
        #[arg(long)]
        site: Option<String>,
        #[arg(long)]
        not_working: bool,
    },
    Add {
        #[arg(long)]
        site: String,
        #[arg(long)]
        name: String,
        /// bw, color or plotter
        #[arg(long, default_value = "bw")]
        kind: String,
    },
    /// working, offline, jammed, outOfToner or outOfPaper
    Status {
        id: String,
        status: String,
    },
}

#[derive(clap::Args)]
struct RangeArgs {
    /// Start (epoch millis, RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    from: Option<String>,
    /// End, inclusive
    #[arg(long)]
    to: Option<String>,
    /// Oldest first instead of newest first
    #[arg(long)]
    oldest_first: bool,
}

impl RangeArgs {
    fn range(&self) -> Result<Option<DateRange>, CliError> {
        Ok(parse_range(self.from.as_deref(), self.to.as_deref(), Utc::now())?)
    }

    fn descending(&self) -> Option<bool> {
        self.oldest_first.then_some(false)
    }
}

#[derive(Subcommand)]
enum IssueCommands {
    List {
        #[arg(long)]
        site: Option<String>,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Open issues
    Open {
        #[arg(long)]
        site: Option<String>,
    },
    Search {
        /// Matches description, ticket, site name or type
        text: Option<String>,
        #[arg(long)]
        site: Option<String>,
        #[arg(long = "type")]
        issue_type: Option<String>,
        #[arg(long, conflicts_with = "unresolved")]
        resolved: bool,
        #[arg(long)]
        unresolved: bool,
        #[arg(long)]
        by: Option<String>,
        /// newest, oldest, site or type (default newest, or oldest with --oldest-first)
        #[arg(long)]
        sort: Option<String>,
        #[command(flatten)]
        range: RangeArgs,
    },
    Report {
        #[arg(long)]
        site: String,
        /// computer, printer, supplies, cleanliness, furniture or other
        #[arg(long = "type")]
        issue_type: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        ticket: Option<String>,
        #[arg(long)]
        computer: Option<String>,
    },
    Resolve {
        id: String,
        /// Mark unresolved again
        #[arg(long)]
        reopen: bool,
    },
}

#[derive(Subcommand)]
enum CleaningCommands {
    List {
        #[arg(long)]
        site: Option<String>,
        #[arg(long, conflicts_with = "site")]
        user: Option<String>,
        #[command(flatten)]
        range: RangeArgs,
    },
    Log {
        #[arg(long)]
        site: String,
        #[arg(long)]
        user: String,
        /// Computer ids wiped down during this cleaning
        #[arg(long, value_delimiter = ',')]
        computers: Vec<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Most recent cleaning per site
    Latest {
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(i64).range(0..=MAX_HOURS))]
        hours: i64,
    },
    /// Sites with no cleaning in the last N hours
    Missing {
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(i64).range(0..=MAX_HOURS))]
        hours: i64,
    },
}

/// Up to ten years back
const MAX_HOURS: i64 = 24 * 366 * 10;

#[derive(Subcommand)]
enum SiteReadyCommands {
    List {
        #[arg(long)]
        site: Option<String>,
        #[arg(long, conflicts_with = "site")]
        user: Option<String>,
        #[command(flatten)]
        range: RangeArgs,
    },
    Submit {
        #[arg(long)]
        site: String,
        #[arg(long)]
        user: String,
        /// Failed checks: chairs, clock, computers, printers, posters, trash
        #[arg(long, value_delimiter = ',')]
        failed: Vec<String>,
        #[arg(long)]
        comments: Option<String>,
        #[arg(long, value_delimiter = ',')]
        issues: Vec<String>,
    },
}

#[derive(Subcommand)]
enum SupplyCommands {
    Types,
    AddType {
        #[arg(long)]
        name: String,
        #[arg(long)]
        collective: bool,
    },
    Counts {
        #[arg(long)]
        site: Option<String>,
        #[arg(long = "type", conflicts_with = "site")]
        supply_type: Option<String>,
    },
    AddCount {
        #[arg(long)]
        site: String,
        #[arg(long = "type")]
        supply_type: String,
        #[arg(long)]
        count: i64,
        #[arg(long, default_value_t = 0)]
        par: i64,
    },
    /// Counts below par
    Low {
        #[arg(long)]
        site: Option<String>,
    },
    Set {
        id: String,
        count: i64,
    },
    Request {
        #[arg(long)]
        site: String,
        #[arg(long = "type")]
        supply_type: String,
        #[arg(long)]
        count: i64,
        #[arg(long)]
        user: String,
    },
    Pending {
        #[arg(long)]
        site: Option<String>,
    },
    History {
        #[arg(long)]
        site: Option<String>,
        #[command(flatten)]
        range: RangeArgs,
    },
    Fulfil {
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    Show,
    /// Keys: backend, db-path, project-id, database, emulator-host, timestamps, api-key, log-format, bind
    Set {
        key: String,
        value: String,
    },
}

// ============================================================================
// Entry
// ============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run_cli(cli).await {
        eprintln!("Error: {}", e);
        if let CliError::Store(StoreError::MissingIndex { hint: Some(hint), .. }) = &e {
            eprintln!("Create the index: {}", hint);
        }
        std::process::exit(e.exit_code());
    }
}

async fn run_cli(cli: Cli) -> CliResult {
    // Handle completions first (no store needed)
    if let Commands::Completions { shell } = &cli.command {
        generate(*shell, &mut Cli::command(), "sitekeeper-cli", &mut std::io::stdout());
        return Ok(());
    }

    let settings_path = cli.settings.clone().unwrap_or_else(Settings::default_path);
    let mut settings = Settings::load_with_env(&settings_path)?;

    let format = if settings.log_format == LogFormat::Json { LogFormat::Json } else { LogFormat::Compact };
    init_logging(format, if cli.verbose { "debug" } else { "warn" });

    if let Commands::Config { cmd } = cli.command {
        return handle_config(cmd, &settings_path, cli.json);
    }

    if let Some(backend) = &cli.backend {
        settings.backend = Backend::from_str(backend)?;
    }
    if let Some(db) = &cli.db {
        settings.db_path = Some(db.clone());
    }
    settings.validate()?;

    let session_path = AuthSession::default_path();
    let id_token = match AuthSession::load(&session_path) {
        Some(session) if !session.is_expired(Utc::now()) => Some(session.id_token),
        Some(session) if settings.backend == Backend::Firestore => {
            refresh_session(&settings, session, &session_path).await
        }
        _ => None,
    };
    let store = open_store_with_token(&settings, id_token)?;
    let managers = Managers::new(store);
    let json = cli.json;

    match cli.command {
        Commands::Buildings { cmd } => handle_buildings(cmd, &managers, json).await,
        Commands::Sites { cmd } => handle_sites(cmd, &managers, json).await,
        Commands::Computers { cmd } => handle_computers(cmd, &managers, json).await,
        Commands::Printers { cmd } => handle_printers(cmd, &managers, json).await,
        Commands::Issues { cmd } => handle_issues(cmd, &managers, json).await,
        Commands::Cleaning { cmd } => handle_cleaning(cmd, &managers, json).await,
        Commands::SiteReady { cmd } => handle_site_ready(cmd, &managers, json).await,
        Commands::Supplies { cmd } => handle_supplies(cmd, &managers, json).await,
        Commands::Login { email, password, sign_up, google_token, apple_token, reset } => {
            let login = LoginArgs { email, password, sign_up, google_token, apple_token, reset };
            handle_login(login, &settings, &managers, &session_path, json).await
        }
        Commands::Config { .. } | Commands::Completions { .. } => Ok(()),
    }
}

// ============================================================================
// Output helpers
// ============================================================================

fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult {
    let out = serde_json::to_string_pretty(value).map_err(StoreError::Encode)?;
    println!("{}", out);
    Ok(())
}

fn fmt_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

fn short(id: &str) -> &str {
    sitekeeper_lib::utils::safe_truncate(id, 8)
}

/// Parse a unit enum from its serialized name.
fn parse_enum<T: DeserializeOwned>(value: &str, what: &str) -> Result<T, CliError> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| usage(format!("unknown {} '{}'", what, value)))
}

async fn site_names(managers: &Managers) -> Result<HashMap<String, String>, CliError> {
    Ok(managers
        .sites
        .list(None)
        .await?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect())
}

fn print_issues(issues: &[Issue], names: &HashMap<String, String>) {
    for issue in issues {
        let site = names.get(&issue.site_id).map(String::as_str).unwrap_or(&issue.site_id);
        println!(
            "{} {} [{}] {:<20} {}: {}",
            short(&issue.id),
            fmt_time(issue.timestamp),
            if issue.resolved { "x" } else { " " },
            ellipsize(site, 20),
            issue.issue_type.label(),
            ellipsize(&issue.description, 60),
        );
    }
    println!("\n{} issues", issues.len());
}

// ============================================================================
// Handlers
// ============================================================================

async fn handle_buildings(cmd: BuildingCommands, managers: &Managers, json: bool) -> CliResult {
    match cmd {
        BuildingCommands::List => {
            let buildings = managers.buildings.all().await?;
            if json {
                return print_json(&buildings);
            }
            for b in &buildings {
                println!("{} {:<8} {}", short(&b.id), b.abbreviation, b.name);
            }
            println!("\n{} buildings", buildings.len());
        }
        BuildingCommands::Add { name, abbr } => {
            let building = managers.buildings.create(&name, &abbr).await?;
            if json {
                return print_json(&building);
            }
            println!("Created building {} ({})", building.name, building.id);
        }
    }
    Ok(())
}

async fn handle_sites(cmd: SiteCommands, managers: &Managers, json: bool) -> CliResult {
    match cmd {
        SiteCommands::List { building } => {
            let sites = managers.sites.list(building.as_deref()).await?;
            if json {
                return print_json(&sites);
            }
            for s in &sites {
                println!(
                    "{} {:<30} {:<12} {}",
                    short(&s.id),
                    ellipsize(&s.name, 30),
                    s.site_type.as_str(),
                    s.room.as_deref().unwrap_or("")
                );
            }
            println!("\n{} sites", sites.len());
        }
        SiteCommands::Show { id } => {
            let site = managers.sites.require(&id).await?;
            if json {
                return print_json(&site);
            }
            let building = managers.buildings.get(&site.building_id).await?;
            println!("ID:        {}", site.id);
            println!("Name:      {}", site.name);
            println!("Building:  {}", building.map(|b| b.name).unwrap_or(site.building_id.clone()));
            println!("Type:      {}", site.site_type.as_str());
            println!("Room:      {}", site.room.as_deref().unwrap_or("-"));
            println!("Printer:   {}", site.has_printer);
            println!("Clock:     {}", site.has_clock);
            println!("Inventory: {}", site.has_inventory);
        }
        SiteCommands::Add { name, building, site_type, room, printer, clock, inventory } => {
            let site = Site {
                id: String::new(),
                name,
                building_id: building,
                site_type: parse_enum(&site_type, "site type")?,
                room,
                has_clock: clock,
                has_inventory: inventory,
                has_printer: printer,
            };
            let created = managers.sites.create(&site).await?;
            if json {
                return print_json(&created);
            }
            println!("Created site {} ({})", created.name, created.id);
        }
        SiteCommands::Remove { id } => {
            managers.sites.delete(&id).await?;
            if !json {
                println!("Removed site {}", id);
            }
        }
    }
    Ok(())
}

async fn handle_computers(cmd: ComputerCommands, managers: &Managers, json: bool) -> CliResult {
    match cmd {
        ComputerCommands::List { site } => {
            let computers = managers.computers.list(site.as_deref()).await?;
            if json {
                return print_json(&computers);
            }
            for c in &computers {
                println!(
                    "{} {:<16} {:?}  last cleaned: {}",
                    short(&c.id),
                    c.name,
                    c.os,
                    c.last_cleaned.map(fmt_time).unwrap_or_else(|| "never".to_string())
                );
            }
            println!("\n{} computers", computers.len());
        }
        ComputerCommands::Add { site, name, os, section } => {
            let computer = Computer {
                id: String::new(),
                site_id: site,
                name,
                os: parse_enum(&os, "os")?,
                section,
                last_cleaned: None,
            };
            let created = managers.computers.create(&computer).await?;
            if json {
                return print_json(&created);
            }
            println!("Created computer {} ({})", created.name, created.id);
        }
        ComputerCommands::Cleaned { ids } => {
            let updated = managers.computers.mark_all_cleaned(&ids, Utc::now()).await?;
            if json {
                return print_json(&serde_json::json!({ "updated": updated }));
            }
            println!("Marked {} computers cleaned", updated);
        }
    }
    Ok(())
}

async fn handle_printers(cmd: PrinterCommands, managers: &Managers, json: bool) -> CliResult {
    match cmd {
        PrinterCommands::List { site, not_working } => {
            let printers = if not_working {
                managers.printers.not_working(site.as_deref()).await?
            } else {
                managers.printers.list(site.as_deref()).await?
            };
            if json {
                return print_json(&printers);
            }
            for p in &printers {
                println!("{} {:<20} {:?} {:?} ({})", short(&p.id), p.name, p.kind, p.status, fmt_time(p.last_updated));
            }
            println!("\n{} printers", printers.len());
        }
        PrinterCommands::Add { site, name, kind } => {
            let printer = Printer {
                id: String::new(),
                site_id: site,
                name,
                kind: parse_enum(&kind, "printer kind")?,
                status: PrinterStatus::Working,
                last_updated: Utc::now(),
            };
            let created = managers.printers.create(&printer).await?;
            if json {
                return print_json(&created);
            }
            println!("Created printer {} ({})", created.name, created.id);
        }
        PrinterCommands::Status { id, status } => {
            let status: PrinterStatus = parse_enum(&status, "printer status")?;
            managers.printers.set_status(&id, status, Utc::now()).await?;
            if !json {
                println!("Printer {} is now {:?}", id, status);
            }
        }
    }
    Ok(())
}

async fn handle_issues(cmd: IssueCommands, managers: &Managers, json: bool) -> CliResult {
    match cmd {
        IssueCommands::List { site, range } => {
            let query = IssueQuery {
                site_id: site,
                range: range.range()?,
                descending: range.descending(),
            };
            let issues = managers.issues.list(&query).await?;
            if json {
                return print_json(&issues);
            }
            print_issues(&issues, &site_names(managers).await?);
        }
        IssueCommands::Open { site } => {
            let issues = managers.issues.unresolved(site.as_deref()).await?;
            if json {
                return print_json(&issues);
            }
            print_issues(&issues, &site_names(managers).await?);
        }
        IssueCommands::Search { text, site, issue_type, resolved, unresolved, by, sort, range } => {
            let issue_type = match issue_type {
                Some(t) => Some(IssueType::from_str(&t).ok_or_else(|| usage(format!("unknown issue type '{}'", t)))?),
                None => None,
            };
            let sort = search_sort(sort.as_deref(), range.oldest_first)?;
            let search = IssueSearch {
                text,
                site_id: site.clone(),
                issue_type,
                resolved: if resolved { Some(true) } else if unresolved { Some(false) } else { None },
                submitted_by: by,
                range: None,
                sort,
            };
            // Narrow on the store side; the rest is in memory
            let query = IssueQuery { site_id: site, range: range.range()?, descending: None };
            let issues = managers.issues.list(&query).await?;
            let names = site_names(managers).await?;
            let found = search.apply(&issues, &names);
            if json {
                return print_json(&found);
            }
            print_issues(&found, &names);
        }
        IssueCommands::Report { site, issue_type, description, user, ticket, computer } => {
            let new = NewIssue {
                site_id: site,
                issue_type: IssueType::from_str(&issue_type)
                    .ok_or_else(|| usage(format!("unknown issue type '{}'", issue_type)))?,
                description,
                user_submitted: user,
                ticket,
                computer_id: computer,
            };
            let issue = managers.issues.create(new, Utc::now()).await?;
            if json {
                return print_json(&issue);
            }
            println!("Reported issue {}", issue.id);
        }
        IssueCommands::Resolve { id, reopen } => {
            managers.issues.set_resolved(&id, !reopen).await?;
            if !json {
                println!("Issue {} {}", id, if reopen { "reopened" } else { "resolved" });
            }
        }
    }
    Ok(())
}

async fn handle_cleaning(cmd: CleaningCommands, managers: &Managers, json: bool) -> CliResult {
    match cmd {
        CleaningCommands::List { site, user, range } => {
            let scope = Scope::from_options(site, user);
            let cleanings = managers.cleaning.list(&scope, range.range()?, range.descending()).await?;
            if json {
                return print_json(&cleanings);
            }
            let names = site_names(managers).await?;
            for c in &cleanings {
                let site = names.get(&c.site_id).map(String::as_str).unwrap_or(&c.site_id);
                println!(
                    "{} {} {:<24} {:<12} {} computers",
                    short(&c.id),
                    fmt_time(c.timestamp),
                    ellipsize(site, 24),
                    c.user_id,
                    c.cleaned_computers.len()
                );
            }
            println!("\n{} cleanings", cleanings.len());
        }
        CleaningCommands::Log { site, user, computers, notes } => {
            let new = NewCleaning {
                site_id: site,
                user_id: user,
                cleaned_computers: computers,
                notes,
            };
            let cleaning = managers.log_cleaning(new, Utc::now()).await?;
            if json {
                return print_json(&cleaning);
            }
            println!("Logged cleaning {}", cleaning.id);
        }
        CleaningCommands::Latest { hours } => {
            let latest = managers.cleaning.latest_by_site(DateRange::last_hours(hours, Utc::now())?).await?;
            if json {
                return print_json(&latest);
            }
            let names = site_names(managers).await?;
            for (site_id, c) in &latest {
                let site = names.get(site_id).map(String::as_str).unwrap_or(site_id);
                println!("{:<30} {} by {}", ellipsize(site, 30), fmt_time(c.timestamp), c.user_id);
            }
        }
        CleaningCommands::Missing { hours } => {
            let names = site_names(managers).await?;
            let ids: Vec<String> = names.keys().cloned().collect();
            let mut missing = managers
                .cleaning
                .sites_missing_cleaning(&ids, DateRange::last_hours(hours, Utc::now())?)
                .await?;
            missing.sort_by(|a, b| names.get(a).cmp(&names.get(b)));
            if json {
                return print_json(&missing);
            }
            for id in &missing {
                println!("{} {}", short(id), names.get(id).map(String::as_str).unwrap_or(""));
            }
            println!("\n{} sites not cleaned in the last {}h", missing.len(), hours);
        }
    }
    Ok(())
}

async fn handle_site_ready(cmd: SiteReadyCommands, managers: &Managers, json: bool) -> CliResult {
    match cmd {
        SiteReadyCommands::List { site, user, range } => {
            let scope = Scope::from_options(site, user);
            let surveys = managers.site_ready.list(&scope, range.range()?, range.descending()).await?;
            if json {
                return print_json(&surveys);
            }
            for s in &surveys {
                println!(
                    "{} {} {:<10} {}",
                    short(&s.id),
                    fmt_time(s.timestamp),
                    s.user_id,
                    if s.passed() { "ready" } else { "NOT READY" }
                );
            }
            println!("\n{} surveys", surveys.len());
        }
        SiteReadyCommands::Submit { site, user, failed, comments, issues } => {
            let survey = build_survey(site, user, &failed, comments, issues)?;
            let created = managers.site_ready.submit(survey, Utc::now()).await?;
            if json {
                return print_json(&created);
            }
            println!(
                "Submitted survey {} ({})",
                created.id,
                if created.passed() { "ready" } else { "not ready" }
            );
        }
    }
    Ok(())
}

fn build_survey(
    site: String,
    user: String,
    failed: &[String],
    comments: Option<String>,
    issue_ids: Vec<String>,
) -> Result<NewSiteReady, CliError> {
    let mut survey = NewSiteReady {
        comments,
        issue_ids,
        ..NewSiteReady::all_passing(site, user)
    };
    for check in failed {
        match check.trim() {
            "chairs" => survey.chairs_pushed_in = false,
            "clock" => survey.clock_correct = false,
            "computers" => survey.computers_working = false,
            "printers" => survey.printers_working = false,
            "posters" => survey.posters_present = false,
            "trash" => survey.trash_emptied = false,
            other => return Err(usage(format!("unknown check '{}'", other))),
        }
    }
    Ok(survey)
}

/// `--sort` wins; otherwise `--oldest-first` picks the oldest-first order.
fn search_sort(sort: Option<&str>, oldest_first: bool) -> Result<IssueSort, CliError> {
    match sort {
        Some(s) => IssueSort::from_str(s).ok_or_else(|| usage(format!("unknown sort '{}'", s))),
        None if oldest_first => Ok(IssueSort::OldestFirst),
        None => Ok(IssueSort::NewestFirst),
    }
}

async fn handle_supplies(cmd: SupplyCommands, managers: &Managers, json: bool) -> CliResult {
    match cmd {
        SupplyCommands::Types => {
            let types = managers.supply_types.all().await?;
            if json {
                return print_json(&types);
            }
            for t in &types {
                println!("{} {}{}", short(&t.id), t.name, if t.collective { " (collective)" } else { "" });
            }
        }
        SupplyCommands::AddType { name, collective } => {
            let created = managers.supply_types.create(&name, collective).await?;
            if json {
                return print_json(&created);
            }
            println!("Created supply type {} ({})", created.name, created.id);
        }
        SupplyCommands::Counts { site, supply_type } => {
            let scope = match (site, supply_type) {
                (Some(site), _) => SupplyCountScope::Site(site),
                (None, Some(t)) => SupplyCountScope::SupplyType(t),
                (None, None) => SupplyCountScope::All,
            };
            let counts = managers.supply_counts.list(&scope).await?;
            print_counts(&counts, json)?;
        }
        SupplyCommands::AddCount { site, supply_type, count, par } => {
            let created = managers
                .supply_counts
                .create(&SupplyCount {
                    id: String::new(),
                    site_id: site,
                    supply_type_id: supply_type,
                    count,
                    par_level: par,
                })
                .await?;
            if json {
                return print_json(&created);
            }
            println!("Created supply count {}", created.id);
        }
        SupplyCommands::Low { site } => {
            let counts = managers.supply_counts.low_stock(site.as_deref()).await?;
            print_counts(&counts, json)?;
        }
        SupplyCommands::Set { id, count } => {
            managers.supply_counts.set_count(&id, count).await?;
            if !json {
                println!("Count {} set to {}", id, count);
            }
        }
        SupplyCommands::Request { site, supply_type, count, user } => {
            let new = NewSupplyRequest { site_id: site, supply_type_id: supply_type, count, user_id: user };
            let created = managers.supply_requests.create(new, Utc::now()).await?;
            if json {
                return print_json(&created);
            }
            println!("Requested {} (request {})", created.count, created.id);
        }
        SupplyCommands::Pending { site } => {
            let pending = managers.supply_requests.pending(site.as_deref()).await?;
            if json {
                return print_json(&pending);
            }
            for r in &pending {
                println!("{} {} {} x{} by {}", short(&r.id), fmt_time(r.timestamp), r.supply_type_id, r.count, r.user_id);
            }
            println!("\n{} pending requests", pending.len());
        }
        SupplyCommands::History { site, range } => {
            let requests = managers
                .supply_requests
                .list(site.as_deref(), range.range()?, range.descending())
                .await?;
            if json {
                return print_json(&requests);
            }
            for r in &requests {
                println!(
                    "{} {} {} x{} {}",
                    short(&r.id),
                    fmt_time(r.timestamp),
                    r.supply_type_id,
                    r.count,
                    if r.fulfilled { "fulfilled" } else { "pending" }
                );
            }
        }
        SupplyCommands::Fulfil { id } => {
            managers.supply_requests.fulfil(&id, Utc::now()).await?;
            if !json {
                println!("Request {} fulfilled", id);
            }
        }
    }
    Ok(())
}

fn print_counts(counts: &[SupplyCount], json: bool) -> CliResult {
    if json {
        return print_json(counts);
    }
    for c in counts {
        println!(
            "{} site {} {:<12} {:>4} / par {:<4}{}",
            short(&c.id),
            short(&c.site_id),
            c.supply_type_id,
            c.count,
            c.par_level,
            if c.needs_restock() { "  LOW" } else { "" }
        );
    }
    Ok(())
}

struct LoginArgs {
    email: Option<String>,
    password: Option<String>,
    sign_up: bool,
    google_token: Option<String>,
    apple_token: Option<String>,
    reset: bool,
}

async fn handle_login(
    args: LoginArgs,
    settings: &Settings,
    managers: &Managers,
    session_path: &std::path::Path,
    json: bool,
) -> CliResult {
    let client = AuthClient::new(settings.api_key.as_deref())?;

    if args.reset {
        let email = args.email.ok_or_else(|| usage("--reset needs --email"))?;
        client.send_password_reset(&email).await?;
        if !json {
            println!("Password reset email sent to {}", email);
        }
        return Ok(());
    }

    let session: AuthSession = match (args.google_token, args.apple_token, args.email) {
        (Some(token), _, _) => client.sign_in_with_id_token(IdentityProvider::Google, &token).await?,
        (_, Some(token), _) => client.sign_in_with_id_token(IdentityProvider::Apple, &token).await?,
        (None, None, Some(email)) => {
            let password = args.password.ok_or_else(|| usage("--email needs --password"))?;
            if args.sign_up {
                client.sign_up(&email, &password).await?
            } else {
                client.sign_in_with_password(&email, &password).await?
            }
        }
        (None, None, None) => return Err(usage("give --email/--password, --google-token or --apple-token")),
    };

    if let Err(e) = session.save(session_path) {
        tracing::warn!(path = %session_path.display(), error = %e, "could not save session");
    }
    let email = session.email.clone().unwrap_or_default();
    let user = managers.users.record_sign_in(&session.user_id, &email, Utc::now()).await?;
    if json {
        return print_json(&serde_json::json!({ "session": session, "user": user }));
    }
    println!("Signed in as {} ({})", if email.is_empty() { &user.id } else { &email }, user.id);
    println!("Token expires {}", fmt_time(session.expires_at));
    Ok(())
}

/// Exchange an expired session's refresh token; `None` when that fails.
async fn refresh_session(settings: &Settings, old: AuthSession, path: &std::path::Path) -> Option<String> {
    let client = AuthClient::new(settings.api_key.as_deref()).ok()?;
    match client.refresh(&old.refresh_token).await {
        Ok(mut session) => {
            session.email = old.email;
            if let Err(e) = session.save(path) {
                tracing::warn!(error = %e, "could not save refreshed session");
            }
            Some(session.id_token)
        }
        Err(e) => {
            tracing::warn!(error = %e, "session refresh failed; continuing unauthenticated");
            None
        }
    }
}

fn handle_config(cmd: ConfigCommands, path: &std::path::Path, json: bool) -> CliResult {
    let mut settings = Settings::load(path);
    match cmd {
        ConfigCommands::Show => {
            if json {
                let mut shown = settings.clone();
                shown.api_key = settings.masked_api_key();
                return print_json(&shown);
            }
            println!("file:           {}", path.display());
            println!("backend:        {}", settings.backend.as_str());
            println!("db-path:        {}", settings.resolved_db_path().display());
            println!("project-id:     {}", settings.firestore_project_id.as_deref().unwrap_or("not set"));
            println!("database:       {}", settings.firestore_database);
            println!("emulator-host:  {}", settings.firestore_emulator_host.as_deref().unwrap_or("not set"));
            println!("timestamps:     {}", settings.firestore_timestamps.as_str());
            println!("api-key:        {}", settings.masked_api_key().unwrap_or_else(|| "not set".to_string()));
            println!("log-format:     {:?}", settings.log_format);
            println!("bind:           {}", settings.bind);
        }
        ConfigCommands::Set { key, value } => {
            let optional = |v: &str| if v.is_empty() { None } else { Some(v.to_string()) };
            match key.as_str() {
                "backend" => settings.backend = Backend::from_str(&value)?,
                "db-path" => settings.db_path = optional(&value),
                "project-id" => settings.firestore_project_id = optional(&value),
                "database" => settings.firestore_database = value.clone(),
                "emulator-host" => settings.firestore_emulator_host = optional(&value),
                "timestamps" => {
                    settings.firestore_timestamps = TimestampEncoding::from_str(&value)
                        .ok_or_else(|| SettingsError::UnknownTimestampEncoding(value.clone()))?
                }
                "api-key" => settings.api_key = optional(&value),
                "log-format" => {
                    settings.log_format = LogFormat::from_str(&value)
                        .ok_or_else(|| usage(format!("unknown log format '{}'", value)))?
                }
                "bind" => settings.bind = value.clone(),
                other => return Err(usage(format!("unknown setting '{}'", other))),
            }
            settings.save(path)?;
            if !json {
                println!("{} updated", key);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
        let cli = Cli::try_parse_from([
            "sitekeeper-cli", "--json", "issues", "list", "--site", "s1", "--from", "2024-09-01", "--oldest-first",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Issues { cmd: IssueCommands::List { site, range } } => {
                assert_eq!(site.as_deref(), Some("s1"));
                assert_eq!(range.descending(), Some(false));
                assert!(range.range().unwrap().is_some());
            }
            _ => panic!("expected issues list"),
        }
    }

    #[test]
    fn test_build_survey_failed_checks() {
        let survey = build_survey("s1".into(), "u1".into(), &["clock".into(), "trash".into()], None, vec![]).unwrap();
        assert!(!survey.clock_correct);
        assert!(!survey.trash_emptied);
        assert!(survey.chairs_pushed_in);
        assert!(survey.computers_working);
        assert!(build_survey("s1".into(), "u1".into(), &["coffee".into()], None, vec![]).is_err());
    }

    #[test]
    fn test_parse_enum_names() {
        let status: PrinterStatus = parse_enum("outOfToner", "printer status").unwrap();
        assert_eq!(status, PrinterStatus::OutOfToner);
        assert!(parse_enum::<PrinterStatus>("melted", "printer status").is_err());
    }

    #[test]
    fn test_exit_codes() {
        let missing = CliError::Store(StoreError::MissingIndex {
            collection: "Issues".into(),
            fields: vec!["siteId".into(), "timestamp".into()],
            hint: None,
        });
        assert_eq!(missing.exit_code(), 3);
        assert_eq!(CliError::Store(StoreError::Unavailable("x".into())).exit_code(), 4);
        assert_eq!(usage("bad").exit_code(), 2);
        assert_eq!(CliError::Store(StoreError::InvalidInput("x".into())).exit_code(), 2);
    }

    #[test]
    fn test_cleaning_hours_are_bounded() {
        let cli = Cli::try_parse_from(["sitekeeper-cli", "cleaning", "missing", "--hours", "48"]).unwrap();
        assert!(matches!(cli.command, Commands::Cleaning { cmd: CleaningCommands::Missing { hours: 48 } }));

        let huge = i64::MAX.to_string();
        assert!(Cli::try_parse_from(["sitekeeper-cli", "cleaning", "latest", "--hours", huge.as_str()]).is_err());
        assert!(Cli::try_parse_from(["sitekeeper-cli", "cleaning", "latest", "--hours", "-1"]).is_err());
        assert!(DateRange::last_hours(MAX_HOURS, Utc::now()).is_ok());
    }

    #[test]
    fn test_search_oldest_first_without_sort() {
        let cli = Cli::try_parse_from(["sitekeeper-cli", "issues", "search", "monitor", "--oldest-first"]).unwrap();
        match cli.command {
            Commands::Issues { cmd: IssueCommands::Search { sort, range, .. } } => {
                assert_eq!(search_sort(sort.as_deref(), range.oldest_first).unwrap(), IssueSort::OldestFirst);
            }
            _ => panic!("expected issues search"),
        }
        assert_eq!(search_sort(Some("site"), true).unwrap(), IssueSort::BySite);
        assert_eq!(search_sort(None, false).unwrap(), IssueSort::NewestFirst);
        assert!(search_sort(Some("random"), false).is_err());
    }
}
