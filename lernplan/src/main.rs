use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Days, Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use lernplan::blocks::{BlockDraft, BlockPatch};
use lernplan::core::{ArchiveId, BlockContent, BlockKind, BlockTask, EntryId, SeriesId};
use lernplan::hierarchy::OcrPayload;
use lernplan::planner::StudyPlanner;
use lernplan::sessions::SessionDraft;
use lernplan::storage::JsonDirStore;
use lernplan::{parse_repeat_expr, parse_time_range};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "lernplan",
    about = "Study-planner tooling built on the lernplan crate",
    version
)]
struct Cli {
    /// Data directory holding the plan's JSON collections.
    #[arg(long, global = true, default_value = ".lernplan")]
    dir: PathBuf,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the occupied days of a date range.
    Agenda(AgendaArgs),

    /// Add a block, optionally as a repeating series.
    AddBlock(AddBlockArgs),

    /// Add a time-ranged session, optionally repeating.
    AddSession(AddSessionArgs),

    /// Move a block to another position on its day.
    MoveBlock(MoveBlockArgs),

    /// Delete a single calendar entry.
    Delete(DeleteArgs),

    /// Delete every occurrence of a series.
    DeleteSeries(DeleteSeriesArgs),

    /// Print the topic hierarchy.
    Topics(TopicsArgs),

    /// Import an OCR candidate tree (JSON payload) into the hierarchy.
    Import(ImportArgs),

    /// Project the live calendar into a dateless topic list.
    Themenliste(ThemenlisteArgs),

    /// Snapshot the live calendar into the archive.
    Archive,

    /// Bring an archived calendar back.
    Restore(RestoreArgs),

    /// List archived calendars.
    Archives(ArchivesArgs),

    /// Clear expired scheduling links.
    Cleanup,
}

#[derive(Debug, Args)]
struct AgendaArgs {
    /// Inclusive start date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Inclusive end date (YYYY-MM-DD). Defaults to two weeks after `from`.
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct AddBlockArgs {
    /// Day the block goes on (YYYY-MM-DD).
    date: NaiveDate,
    /// Block title.
    title: String,
    /// Block category.
    #[arg(long, value_enum, default_value_t = KindArg::Lernblock)]
    kind: KindArg,
    /// Subject area the content belongs to.
    #[arg(long)]
    rechtsgebiet: Option<String>,
    /// Sub-area within the subject.
    #[arg(long)]
    unterrechtsgebiet: Option<String>,
    /// Topic the block covers.
    #[arg(long)]
    thema: Option<String>,
    /// Checklist lines; may be given multiple times.
    #[arg(long = "task")]
    tasks: Vec<String>,
    /// Repeat expression, e.g. `daily*5`, `weekly until 2026-09-01`,
    /// `custom[mo,mi]*8`.
    #[arg(long)]
    repeat: Option<String>,
}

#[derive(Debug, Args)]
struct AddSessionArgs {
    /// Day the session starts on (YYYY-MM-DD).
    date: NaiveDate,
    /// Time range, e.g. `09:00-10:30`.
    time: String,
    /// Session title.
    title: String,
    /// Session category.
    #[arg(long, value_enum, default_value_t = KindArg::Privat)]
    kind: KindArg,
    /// Last day of a multi-day span (YYYY-MM-DD).
    #[arg(long)]
    end_date: Option<NaiveDate>,
    /// Repeat expression; same grammar as for blocks.
    #[arg(long)]
    repeat: Option<String>,
}

#[derive(Debug, Args)]
struct MoveBlockArgs {
    /// Day the block sits on (YYYY-MM-DD).
    date: NaiveDate,
    /// Id of the block.
    id: String,
    /// Target position (1..=4).
    position: u8,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    /// Day the entry sits on (YYYY-MM-DD).
    date: NaiveDate,
    /// Id of the entry (block or session).
    id: String,
}

#[derive(Debug, Args)]
struct DeleteSeriesArgs {
    /// Series id shared by the occurrences.
    id: String,
}

#[derive(Debug, Args)]
struct TopicsArgs {
    /// Emit JSON instead of an indented tree.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// JSON file with the OCR payload.
    file: PathBuf,
}

#[derive(Debug, Args)]
struct ThemenlisteArgs {
    /// Emit JSON instead of an indented tree.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    /// Id of the archived plan.
    id: String,
}

#[derive(Debug, Args)]
struct ArchivesArgs {
    /// Emit JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum KindArg {
    Lernblock,
    Wiederholung,
    Klausur,
    Privat,
}

impl From<KindArg> for BlockKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Lernblock => BlockKind::Lernblock,
            KindArg::Wiederholung => BlockKind::Wiederholung,
            KindArg::Klausur => BlockKind::Klausur,
            KindArg::Privat => BlockKind::Privat,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let storage = JsonDirStore::open(&cli.dir)?;
    let today = Local::now().date_naive();
    let now = Local::now().naive_local();
    let mut planner = StudyPlanner::load(storage, today, now)?;

    match cli.command {
        Commands::Agenda(args) => handle_agenda(&planner, args, today),
        Commands::AddBlock(args) => handle_add_block(&mut planner, args),
        Commands::AddSession(args) => handle_add_session(&mut planner, args),
        Commands::MoveBlock(args) => handle_move_block(&mut planner, args),
        Commands::Delete(args) => handle_delete(&mut planner, args),
        Commands::DeleteSeries(args) => handle_delete_series(&mut planner, args),
        Commands::Topics(args) => handle_topics(&planner, args),
        Commands::Import(args) => handle_import(&mut planner, args),
        Commands::Themenliste(args) => handle_themenliste(&planner, args),
        Commands::Archive => handle_archive(&mut planner),
        Commands::Restore(args) => handle_restore(&mut planner, args),
        Commands::Archives(args) => handle_archives(&planner, args),
        Commands::Cleanup => handle_cleanup(&mut planner, today),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_entry_id(raw: &str) -> Result<EntryId> {
    let uuid = Uuid::parse_str(raw).with_context(|| format!("invalid entry id {raw:?}"))?;
    Ok(EntryId(uuid))
}

fn handle_agenda(
    planner: &StudyPlanner<JsonDirStore>,
    args: AgendaArgs,
    today: NaiveDate,
) -> Result<()> {
    let AgendaArgs { from, to, json } = args;
    let from = from.unwrap_or(today);
    let to = to.unwrap_or_else(|| from + Days::new(13));
    let days = planner.agenda(from, to);

    if json {
        println!("{}", serde_json::to_string_pretty(&days)?);
        return Ok(());
    }
    if days.is_empty() {
        eprintln!("No entries between {from} and {to}.");
        return Ok(());
    }
    for day in days {
        println!("{}", day.date);
        for block in &day.blocks {
            let series = block
                .series
                .map(|m| format!("  [{}/{}]", m.index, m.total))
                .unwrap_or_default();
            println!(
                "  {}. {:<12} {}{}  ({})",
                block.position,
                block.kind.as_str(),
                block.content.title,
                series,
                block.id
            );
        }
        for session in &day.sessions {
            println!(
                "  {}-{} {:<10} {}  ({})",
                session.start_time.format("%H:%M"),
                session.end_time.format("%H:%M"),
                session.kind.as_str(),
                session.title,
                session.id
            );
        }
    }
    Ok(())
}

fn handle_add_block(planner: &mut StudyPlanner<JsonDirStore>, args: AddBlockArgs) -> Result<()> {
    let AddBlockArgs {
        date,
        title,
        kind,
        rechtsgebiet,
        unterrechtsgebiet,
        thema,
        tasks,
        repeat,
    } = args;

    let repeat = repeat.as_deref().map(parse_repeat_expr).transpose()?;
    let draft = BlockDraft {
        kind: kind.into(),
        content: BlockContent {
            title,
            rechtsgebiet,
            unterrechtsgebiet,
            thema,
        },
        tasks: tasks
            .into_iter()
            .map(|text| BlockTask { text, done: false })
            .collect(),
    };

    let outcome = planner.add_block(date, draft, repeat)?;
    match outcome.series_id {
        Some(series_id) => {
            println!(
                "Created series {} with {} occurrences.",
                series_id,
                1 + outcome.created_dates.len()
            );
            if !outcome.skipped_dates.is_empty() {
                let skipped: Vec<String> = outcome
                    .skipped_dates
                    .iter()
                    .map(|d| d.to_string())
                    .collect();
                println!("Skipped full days: {}", skipped.join(", "));
            }
        }
        None => println!("Created block {} on {}.", outcome.original, date),
    }
    Ok(())
}

fn handle_add_session(
    planner: &mut StudyPlanner<JsonDirStore>,
    args: AddSessionArgs,
) -> Result<()> {
    let AddSessionArgs {
        date,
        time,
        title,
        kind,
        end_date,
        repeat,
    } = args;

    let (start_time, end_time) = parse_time_range(&time)?;
    let repeat = repeat.as_deref().map(parse_repeat_expr).transpose()?;
    let draft = SessionDraft {
        title,
        kind: kind.into(),
        start_time,
        end_time,
        end_date,
    };

    let outcome = planner.add_session(date, draft, repeat)?;
    match outcome.series_id {
        Some(series_id) => println!(
            "Created session series {} with {} occurrences.",
            series_id,
            1 + outcome.created_dates.len()
        ),
        None => println!("Created session {} on {}.", outcome.original, date),
    }
    Ok(())
}

fn handle_move_block(planner: &mut StudyPlanner<JsonDirStore>, args: MoveBlockArgs) -> Result<()> {
    let MoveBlockArgs { date, id, position } = args;
    let id = parse_entry_id(&id)?;
    planner.update_block(
        date,
        id,
        BlockPatch {
            position: Some(position),
            ..BlockPatch::default()
        },
    )?;
    println!("Moved {id} to position {position}.");
    Ok(())
}

fn handle_delete(planner: &mut StudyPlanner<JsonDirStore>, args: DeleteArgs) -> Result<()> {
    let DeleteArgs { date, id } = args;
    let id = parse_entry_id(&id)?;
    planner.delete_entry(date, id)?;
    println!("Deleted {id} from {date}.");
    Ok(())
}

fn handle_delete_series(
    planner: &mut StudyPlanner<JsonDirStore>,
    args: DeleteSeriesArgs,
) -> Result<()> {
    let uuid = Uuid::parse_str(&args.id).with_context(|| format!("invalid series id {:?}", args.id))?;
    let removed = planner.delete_series(SeriesId(uuid));
    if removed == 0 {
        println!("No occurrences with that series id.");
    } else {
        println!("Removed {removed} occurrences.");
    }
    Ok(())
}

fn handle_topics(planner: &StudyPlanner<JsonDirStore>, args: TopicsArgs) -> Result<()> {
    let Some(plan) = &planner.hierarchy else {
        eprintln!("No topic hierarchy yet.");
        return Ok(());
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(plan)?);
    } else {
        print_themenliste(plan);
    }
    Ok(())
}

fn handle_import(planner: &mut StudyPlanner<JsonDirStore>, args: ImportArgs) -> Result<()> {
    let text = fs::read_to_string(&args.file)
        .with_context(|| format!("reading {:?}", args.file))?;
    let payload: OcrPayload =
        serde_json::from_str(&text).with_context(|| format!("decoding {:?}", args.file))?;
    let ids = planner.import_ocr(&payload);
    println!("Imported {} subject subtree(s) from {:?}.", ids.len(), args.file);
    Ok(())
}

fn handle_themenliste(planner: &StudyPlanner<JsonDirStore>, args: ThemenlisteArgs) -> Result<()> {
    let plan = planner.themenliste_from_calendar();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else if plan.rechtsgebiete.is_empty() {
        eprintln!("The calendar holds nothing to project.");
    } else {
        print_themenliste(&plan);
    }
    Ok(())
}

fn print_themenliste(plan: &lernplan::hierarchy::Themenliste) {
    println!("{}", plan.name);
    for rechtsgebiet in &plan.rechtsgebiete {
        println!("  {}", rechtsgebiet.name);
        for urg in &rechtsgebiet.unterrechtsgebiete {
            println!("    {}", urg.name);
            for kapitel in &urg.kapitel {
                if !kapitel.hidden {
                    println!("      {}", kapitel.name);
                }
                for thema in &kapitel.themen {
                    let marker = if thema.schedule.is_scheduled() { "*" } else { " " };
                    println!("      {} {}", marker, thema.name);
                    for aufgabe in &thema.aufgaben {
                        let done = if aufgabe.completed { "x" } else { " " };
                        println!("        [{done}] {}", aufgabe.text);
                    }
                }
            }
        }
    }
}

fn handle_archive(planner: &mut StudyPlanner<JsonDirStore>) -> Result<()> {
    let now = Local::now().naive_local();
    let id = planner.archive_current(now);
    println!("Archived the live calendar as {id}.");
    Ok(())
}

fn handle_restore(planner: &mut StudyPlanner<JsonDirStore>, args: RestoreArgs) -> Result<()> {
    let uuid = Uuid::parse_str(&args.id).with_context(|| format!("invalid archive id {:?}", args.id))?;
    let now = Local::now().naive_local();
    planner.restore_archive(ArchiveId(uuid), now)?;
    println!("Restored archive {}; the previous calendar was archived.", args.id);
    Ok(())
}

fn handle_archives(planner: &StudyPlanner<JsonDirStore>, args: ArchivesArgs) -> Result<()> {
    if args.json {
        let list: Vec<_> = planner.archives.list().collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }
    if planner.archives.is_empty() {
        eprintln!("No archived plans.");
        return Ok(());
    }
    for plan in planner.archives.list() {
        println!(
            "{}  {}  ({} days, archived {})",
            plan.id,
            plan.name,
            plan.state.blocks.days().len(),
            plan.archived_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn handle_cleanup(planner: &mut StudyPlanner<JsonDirStore>, today: NaiveDate) -> Result<()> {
    let cleared = planner.run_cleanup(today);
    println!("Cleared {cleared} expired scheduling link(s).");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn now() -> NaiveDateTime {
        d(2026, 3, 1).and_hms_opt(8, 0, 0).unwrap()
    }

    #[test]
    fn entry_ids_must_be_uuids() {
        assert!(parse_entry_id("not-a-uuid").is_err());
        let id = EntryId::new();
        assert_eq!(parse_entry_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn planner_state_survives_a_reload_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");

        {
            let storage = JsonDirStore::open(dir.path()).unwrap();
            let mut planner = StudyPlanner::load(storage, d(2026, 3, 1), now()).unwrap();
            let rule = parse_repeat_expr("daily*3").unwrap();
            planner
                .add_block(
                    d(2026, 3, 2),
                    BlockDraft {
                        kind: BlockKind::Lernblock,
                        content: BlockContent {
                            title: "Sachenrecht".into(),
                            ..BlockContent::default()
                        },
                        tasks: vec![],
                    },
                    Some(rule),
                )
                .unwrap();
        }

        let storage = JsonDirStore::open(dir.path()).unwrap();
        let planner = StudyPlanner::load(storage, d(2026, 3, 1), now()).unwrap();
        assert_eq!(planner.blocks.len(), 3);
        let days = planner.agenda(d(2026, 3, 2), d(2026, 3, 10));
        assert_eq!(days.len(), 3);
    }

    #[test]
    fn import_round_trips_an_ocr_payload_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let payload_path = dir.path().join("scan.json");
        fs::write(
            &payload_path,
            r#"{"fach":"Strafrecht","kapitel":[{"name":"AT","themen":[{"name":"Versuch","aufgaben":["Schema lernen"]}]}],"themen":[],"lines":[],"raw_text":""}"#,
        )
        .unwrap();

        let storage = JsonDirStore::open(dir.path().join("data")).unwrap();
        let mut planner = StudyPlanner::load(storage, d(2026, 3, 1), now()).unwrap();
        let text = fs::read_to_string(&payload_path).unwrap();
        let payload: OcrPayload = serde_json::from_str(&text).unwrap();
        let ids = planner.import_ocr(&payload);
        assert_eq!(ids.len(), 1);
        let plan = planner.hierarchy.as_ref().unwrap();
        assert_eq!(plan.rechtsgebiete[0].name, "Strafrecht");
    }
}
