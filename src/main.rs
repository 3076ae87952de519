//! CLI entry point for `mailsummary`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use unicode_width::UnicodeWidthChar;

use mailsummary::config::{self, Config};
use mailsummary::model::address::EmailAddress;
use mailsummary::model::flags::MessageFlags;
use mailsummary::store::mbox::summary_location;
use mailsummary::store::MboxFolder;
use mailsummary::summary::mbox::MboxInfo;
use mailsummary::summary::{LoadOutcome, MboxBackend, MboxSummary, SummaryContext, SyncReport};

#[derive(Parser)]
#[command(
    name = "mailsummary",
    version,
    about = "Build and inspect persistent summaries of mbox folders"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Ignore the stored summary and parse every message again
    #[arg(short, long, global = true)]
    force: bool,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or refresh the summary of an mbox
    Index { path: PathBuf },
    /// List the messages of an mbox
    List {
        path: PathBuf,
        #[arg(long)]
        json: bool,
        /// Show at most this many messages
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Read a stored summary and report whether it matches its mbox
    Check { path: PathBuf },
    /// Set or clear system flags (Seen, Deleted, ...) on a message
    Flag {
        path: PathBuf,
        uid: String,
        #[arg(required = true)]
        flags: Vec<String>,
        /// Clear the flags instead of setting them
        #[arg(long)]
        clear: bool,
    },
    /// Remove messages flagged Deleted from an mbox
    Expunge {
        path: PathBuf,
        /// Also rewrite Status/X-Status headers from the summary flags
        #[arg(long)]
        status: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    let force = cli.force;
    match cli.command {
        Commands::Index { path } => cmd_index(&path, &config, force),
        Commands::List { path, json, limit } => cmd_list(&path, &config, force, json, limit),
        Commands::Check { path } => cmd_check(&path, &config),
        Commands::Flag {
            path,
            uid,
            flags,
            clear,
        } => cmd_flag(&path, &config, &uid, &flags, clear),
        Commands::Expunge { path, status } => cmd_expunge(&path, &config, status),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mailsummary.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mailsummary", &mut std::io::stdout());
    Ok(())
}

fn cmd_manpage() -> anyhow::Result<()> {
    let man = clap_mangen::Man::new(Cli::command());
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

/// Open `path` with a progress bar over the sync.
fn open_folder(path: &Path, config: &Config, force: bool) -> anyhow::Result<MboxFolder> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let file_size = std::fs::metadata(path)?.len();
    let pb = ProgressBar::new(file_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Summarising [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );
    let folder = MboxFolder::open_with(
        path,
        config,
        SummaryContext::shared(),
        force,
        Some(&|current, total| {
            pb.set_length(total);
            pb.set_position(current);
        }),
    )
    .with_context(|| format!("Cannot open {}", path.display()))?;
    pb.finish_and_clear();
    Ok(folder)
}

fn cmd_index(path: &Path, config: &Config, force: bool) -> anyhow::Result<()> {
    let start = Instant::now();
    let folder = open_folder(path, config, force)?;
    let elapsed = start.elapsed();
    print_stats_table(&folder, &folder.last_sync(), elapsed)?;
    Ok(())
}

fn print_stats_table(
    folder: &MboxFolder,
    report: &SyncReport,
    elapsed: std::time::Duration,
) -> anyhow::Result<()> {
    let file_size = std::fs::metadata(folder.path())?.len();
    let summary_size = std::fs::metadata(folder.summary().path())
        .map(|m| m.len())
        .unwrap_or(0);
    let counts = folder.counts();

    println!();
    println!("  {:<20} {}", "File", folder.path().display());
    println!("  {:<20} {}", "File size", format_size(file_size, BINARY));
    println!("  {:<20} {}", "Messages", counts.total);
    println!("  {:<20} {}", "Unread", counts.unread);
    println!("  {:<20} {}", "Deleted", counts.deleted);
    println!("  {:<20} {}", "Summary", folder.summary().path().display());
    println!("  {:<20} {}", "Summary size", format_size(summary_size, BINARY));
    if report.added > 0 || report.removed > 0 {
        println!(
            "  {:<20} +{} -{}{}",
            "Changes",
            report.added,
            report.removed,
            if report.full { " (full rescan)" } else { "" }
        );
    }
    println!("  {:<20} {:.2?}", "Time", elapsed);
    println!();
    Ok(())
}

fn cmd_list(
    path: &Path,
    config: &Config,
    force: bool,
    json: bool,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let folder = open_folder(path, config, force)?;
    let infos: Vec<MboxInfo> = folder
        .summary()
        .array()
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|info| info.snapshot())
        .collect();
    if json {
        print_list_json(&infos)
    } else {
        print_list_table(&infos);
        Ok(())
    }
}

fn format_date(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

fn sender(info: &MboxInfo) -> String {
    EmailAddress::parse_list(&info.from)
        .into_iter()
        .next()
        .map(|a| if a.name.is_empty() { a.address } else { a.name })
        .unwrap_or_default()
}

/// Pad or cut `s` to `width` terminal columns.
fn fit(s: &str, width: usize) -> String {
    let mut out = String::with_capacity(width);
    let mut used = 0;
    for c in s.chars() {
        let w = c.width().unwrap_or(0);
        if used + w > width {
            break;
        }
        out.push(c);
        used += w;
    }
    out.extend(std::iter::repeat(' ').take(width - used));
    out
}

fn flag_letters(flags: MessageFlags) -> String {
    [
        (MessageFlags::SEEN, 'S'),
        (MessageFlags::ANSWERED, 'A'),
        (MessageFlags::FLAGGED, 'F'),
        (MessageFlags::DELETED, 'D'),
        (MessageFlags::ATTACHMENTS, '@'),
    ]
    .iter()
    .map(|(flag, c)| if flags.contains(*flag) { *c } else { '-' })
    .collect()
}

fn print_list_table(infos: &[MboxInfo]) {
    println!();
    println!(
        "  {} {} {} {} {} {:>8}",
        fit("Uid", 6),
        fit("Flags", 5),
        fit("Date", 16),
        fit("From", 24),
        fit("Subject", 40),
        "Size"
    );
    println!("  {}", "-".repeat(106));
    for info in infos {
        println!(
            "  {} {} {} {} {} {:>8}",
            fit(&info.uid, 6),
            flag_letters(info.flags),
            fit(&format_date(info.date_sent), 16),
            fit(&sender(info), 24),
            fit(&info.subject, 40),
            format_size(info.size, BINARY)
        );
    }
    println!();
    println!("  {} message(s)", infos.len());
    println!();
}

fn print_list_json(infos: &[MboxInfo]) -> anyhow::Result<()> {
    let items: Vec<serde_json::Value> = infos
        .iter()
        .map(|info| {
            serde_json::json!({
                "uid": &*info.uid,
                "date": chrono::DateTime::from_timestamp(info.date_sent, 0).map(|d| d.to_rfc3339()),
                "from": &*info.from,
                "to": &*info.to,
                "cc": &*info.cc,
                "subject": &*info.subject,
                "mailing_list": &*info.mlist,
                "message_id": info.message_id.to_string(),
                "size": info.size,
                "offset": info.extra.from_offset,
                "flags": info.flags.names(),
                "user_flags": info.user_flags.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
                "user_tags": info
                    .user_tags
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::from(v.to_string())))
                    .collect::<serde_json::Map<_, _>>(),
            })
        })
        .collect();

    let output = serde_json::json!({
        "message_count": infos.len(),
        "messages": items,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Read-only: nothing is synced or written.
fn cmd_check(path: &Path, config: &Config) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let is_summary = path.extension().is_some_and(|e| e == "summary");
    let summary_path = if is_summary {
        path.to_path_buf()
    } else {
        summary_location(path, &config::cache_dir(config))
    };
    if !summary_path.exists() {
        anyhow::bail!("No summary for {}", path.display());
    }

    let summary = MboxSummary::new(
        &summary_path,
        MboxBackend,
        SummaryContext::shared(),
        config.summary.options(None),
    );
    let outcome = summary
        .load()
        .with_context(|| format!("Summary {} is unreadable", summary_path.display()))?;
    let LoadOutcome::Loaded { records, version } = outcome else {
        anyhow::bail!("No summary for {}", path.display());
    };

    let header = summary.header();
    let mbox = summary.backend_header();
    println!();
    println!("  {:<20} {}", "Summary", summary_path.display());
    println!("  {:<20} {}", "Version", version);
    println!("  {:<20} {}", "Records", records);
    println!("  {:<20} {}", "Next uid", header.next_uid);
    println!("  {:<20} {}", "Last save", format_date(header.last_save));
    println!("  {:<20} {}", "Content trees", if header.has_content() { "yes" } else { "no" });
    println!("  {:<20} {}", "Folder size", format_size(mbox.folder_size, BINARY));
    if !is_summary {
        let meta = std::fs::metadata(path)?;
        let state = if meta.len() == mbox.folder_size { "up to date" } else { "stale" };
        println!("  {:<20} {}", "State", state);
    }
    println!();
    Ok(())
}

fn cmd_flag(path: &Path, config: &Config, uid: &str, names: &[String], clear: bool) -> anyhow::Result<()> {
    let mut mask = MessageFlags::empty();
    for name in names {
        mask |= MessageFlags::parse_name(name)
            .with_context(|| format!("Unknown flag '{name}'"))?;
    }
    let folder = open_folder(path, config, false)?;
    let set = if clear { MessageFlags::empty() } else { mask };
    let changed = folder.set_flags(uid, mask, set)?;
    folder.save()?;
    println!("  {uid}: {}", if changed { "updated" } else { "unchanged" });
    Ok(())
}

fn cmd_expunge(path: &Path, config: &Config, refresh_status: bool) -> anyhow::Result<()> {
    let mut folder = open_folder(path, config, false)?;
    let report = folder.expunge(refresh_status)?;
    println!();
    println!("  {:<20} {}", "Expunged", report.expunged);
    println!("  {:<20} {}", "Kept", report.kept);
    println!("  {:<20} {}", "New size", format_size(report.new_size, BINARY));
    println!();
    Ok(())
}
