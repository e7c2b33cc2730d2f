use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use bujo::core::{Line, StoreError};
use bujo::folder::{PathPicker, PromptPicker};
use bujo::{Config, Journal, MirrorMode, classify_text};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bujo", about = "Bullet journal kept in one plain-text log", version)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Config file to read instead of the platform default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the journal databases (overrides config).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Folder write strategy (overrides config).
    #[arg(long, global = true, value_enum)]
    mirror: Option<MirrorArg>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum MirrorArg {
    Inline,
    Background,
}

impl From<MirrorArg> for MirrorMode {
    fn from(value: MirrorArg) -> Self {
        match value {
            MirrorArg::Inline => MirrorMode::Inline,
            MirrorArg::Background => MirrorMode::Background,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the whole journal.
    Show,

    /// Replace the whole journal with the contents of FILE (or stdin).
    Write(InputArgs),

    /// Search the journal (case-insensitive).
    Search(SearchArgs),

    /// Read or write a single dated section.
    #[command(subcommand)]
    Day(DayCommand),

    /// Print today's date (YYYY-MM-DD).
    Today,

    /// Classify each line of FILE (or stdin) by its sigil.
    Classify(ClassifyArgs),

    /// Run the legacy migration now and report what happened.
    Migrate,

    /// Show where the journal is stored.
    Status(JsonArgs),

    /// Manage the mirrored journal folder.
    #[command(subcommand)]
    Folder(FolderCommand),
}

#[derive(Debug, Args)]
struct InputArgs {
    /// Read content from this file instead of stdin.
    file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
    /// Report matching dated sections instead of the whole journal.
    #[arg(long)]
    sections: bool,
    /// Emit JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ClassifyArgs {
    file: Option<PathBuf>,
    /// Emit JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct JsonArgs {
    /// Emit JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum DayCommand {
    /// Print one day's section.
    Show { date: NaiveDate },
    /// Replace one day's section from FILE (or stdin); `>` lines move to the next day.
    Write { date: NaiveDate, file: Option<PathBuf> },
}

#[derive(Debug, Subcommand)]
enum FolderCommand {
    /// Pick a folder to mirror the journal into; prompts when PATH is omitted.
    Select { path: Option<PathBuf> },
    /// Re-authorize the remembered folder.
    Reconnect,
    /// Stop mirroring and forget the folder.
    Forget,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Today => {
            println!("{}", today());
            Ok(())
        }
        Commands::Classify(args) => handle_classify(args),
        command => {
            let config = resolve_config(cli.config.as_deref(), cli.data_dir, cli.mirror)?;
            let journal = Journal::open(&config).with_context(|| {
                format!("opening journal in {:?}", config.data_dir)
            })?;
            let result = run(&journal, command);
            journal.store().flush();
            result
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "bujo=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn resolve_config(
    path: Option<&Path>,
    data_dir: Option<PathBuf>,
    mirror: Option<MirrorArg>,
) -> Result<Config> {
    let mut config = match path.map(Path::to_path_buf).or_else(Config::default_path) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    if let Some(mode) = mirror {
        config.mirror_mode = mode.into();
    }
    Ok(config)
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn run(journal: &Journal, command: Commands) -> Result<()> {
    match command {
        Commands::Show => {
            print!("{}", ensure_newline(journal.load()));
            Ok(())
        }
        Commands::Write(InputArgs { file }) => {
            let content = read_input(file.as_deref())?;
            journal.save(&content).context("saving journal")?;
            report_mirror(journal);
            Ok(())
        }
        Commands::Search(args) => handle_search(journal, args),
        Commands::Day(DayCommand::Show { date }) => {
            let content = journal
                .load_day(date)
                .with_context(|| format!("loading {date}"))?;
            print!("{}", ensure_newline(content));
            Ok(())
        }
        Commands::Day(DayCommand::Write { date, file }) => {
            let content = read_input(file.as_deref())?;
            let carried = journal
                .save_day(date, content.trim_end_matches('\n'))
                .with_context(|| format!("saving {date}"))?;
            if let Some(target) = carried {
                eprintln!("Carried migrated tasks to {target}.");
            }
            report_mirror(journal);
            Ok(())
        }
        Commands::Migrate => {
            let cache = journal.cache();
            match bujo::legacy::run_migration(cache) {
                Ok(Some(report)) => println!("Migrated {} legacy entries.", report.entries),
                Ok(None) => match journal.migration_report() {
                    Some(report) => println!(
                        "Migrated {} legacy entries at startup.",
                        report.entries
                    ),
                    None => println!("Nothing to migrate."),
                },
                Err(err) => return Err(err).context("migrating legacy journal"),
            }
            Ok(())
        }
        Commands::Status(JsonArgs { json }) => {
            let status = journal.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                match &status.store.folder {
                    Some(folder) => println!("storage: folder {folder}"),
                    None => println!("storage: cache only"),
                }
                println!("mirror: {:?}", status.store.mirror_mode);
                if let Some(err) = &status.store.last_mirror_error {
                    println!("last folder error: {err}");
                }
                if let Some(err) = &status.migration_error {
                    println!("migration error: {err}");
                }
            }
            Ok(())
        }
        Commands::Folder(cmd) => handle_folder(journal, cmd),
        other => anyhow::bail!("{other:?} does not open the journal"),
    }
}

fn handle_search(journal: &Journal, args: SearchArgs) -> Result<()> {
    let SearchArgs {
        query,
        sections,
        json,
    } = args;
    let matches = if sections {
        journal.search_sections(&query)
    } else {
        journal.search(&query)
    }
    .context("searching journal")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&matches)?);
        return Ok(());
    }
    if matches.is_empty() {
        eprintln!("No matches.");
    }
    for m in matches {
        if let Some(date) = m.date {
            println!("--- {date} ---");
        }
        println!("{}", m.content);
    }
    Ok(())
}

fn handle_folder(journal: &Journal, cmd: FolderCommand) -> Result<()> {
    let result = match cmd {
        FolderCommand::Select { path: Some(path) } => {
            journal.choose_folder(&mut PathPicker::new(Some(path)))
        }
        FolderCommand::Select { path: None } => {
            let stdin = io::stdin();
            let mut picker = PromptPicker::new(stdin.lock(), io::stderr());
            journal.choose_folder(&mut picker)
        }
        FolderCommand::Reconnect => match journal.reconnect_folder() {
            Ok(Some(content)) => Ok(content),
            Ok(None) => {
                println!("No folder remembered.");
                return Ok(());
            }
            Err(err) => Err(err),
        },
        FolderCommand::Forget => {
            journal.forget_folder().context("forgetting folder")?;
            println!("Folder forgotten; using cache only.");
            return Ok(());
        }
    };

    match result {
        Ok(_) => {
            if let Some(folder) = journal.status().store.folder {
                println!("Mirroring journal into {folder}.");
            }
            Ok(())
        }
        Err(StoreError::UserCancelledSelection) => {
            eprintln!("Folder selection cancelled.");
            Ok(())
        }
        Err(err) => Err(err).context("attaching folder"),
    }
}

fn handle_classify(args: ClassifyArgs) -> Result<()> {
    let text = read_input(args.file.as_deref())?;
    let lines: Vec<Line<'_>> = classify_text(text.trim_end_matches('\n')).collect();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&lines)?);
    } else {
        let mut out = io::stdout().lock();
        for line in &lines {
            writeln!(out, "{}", format_classified(line))?;
        }
    }
    Ok(())
}

fn format_classified(line: &Line<'_>) -> String {
    format!("{:<8} {}", line.kind.as_str(), line.render())
}

fn report_mirror(journal: &Journal) {
    journal.store().flush();
    if let Some(err) = journal.status().store.last_mirror_error {
        eprintln!("Saved to cache; folder write failed: {err}");
    }
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => fs::read_to_string(path).with_context(|| format!("reading {:?}", path)),
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            Ok(buf)
        }
    }
}

fn ensure_newline(mut text: String) -> String {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text
}
