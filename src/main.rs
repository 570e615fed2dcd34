use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, NaiveDate};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use chatlog_index::db::MessageRepo;
use chatlog_index::{
    Archive, Archives, Config, ContextFilter, FilterCriteria, SessionIndex, SessionQuery,
    SessionSearch, Segmenter, TimeRange,
};

/// Chatlog - Session segmentation and context filtering for chat archives
#[derive(Parser)]
#[command(name = "chatlog", version, about)]
struct Cli {
    /// Directory holding archive files
    #[arg(long, env = "CHATLOG_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List archives in the data directory
    Archives,
    /// Create an empty archive
    Init {
        /// Archive id
        archive: String,
    },
    /// Rebuild the session index
    Generate {
        /// Archive id
        archive: String,
        /// Gap threshold in seconds (defaults to the archive's stored value)
        #[arg(long)]
        gap: Option<u32>,
    },
    /// Remove the session index
    Clear {
        /// Archive id
        archive: String,
    },
    /// Show index status
    Status {
        /// Archive id
        archive: String,
    },
    /// Store the archive's gap threshold
    SetGap {
        /// Archive id
        archive: String,
        /// Gap threshold in seconds
        #[arg(required_unless_present = "reset", conflicts_with = "reset")]
        seconds: Option<u32>,
        /// Fall back to the global default
        #[arg(long)]
        reset: bool,
    },
    /// List all sessions
    List {
        /// Archive id
        archive: String,
    },
    /// Search sessions by keyword and time range
    Search {
        /// Archive id
        archive: String,
        #[command(flatten)]
        range: RangeArgs,
        /// Keyword (repeatable)
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,
        /// Maximum number of sessions
        #[arg(short, long)]
        limit: Option<usize>,
        /// Preview messages per session
        #[arg(long)]
        preview: Option<usize>,
    },
    /// Show the messages of one session
    Show {
        /// Archive id
        archive: String,
        /// Session id
        session: i64,
        /// Maximum number of messages
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show the messages of several sessions
    Sessions {
        /// Archive id
        archive: String,
        /// Session ids
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Filter messages and expand hits with context
    Filter {
        /// Archive id
        archive: String,
        #[command(flatten)]
        range: RangeArgs,
        /// Keyword (repeatable)
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,
        /// Sender member id (repeatable)
        #[arg(short, long = "sender")]
        senders: Vec<i64>,
        /// Messages before and after each hit
        #[arg(short, long)]
        context: Option<usize>,
    },
    /// Show the context around specific messages
    Context {
        /// Archive id
        archive: String,
        /// Message ids
        #[arg(required = true)]
        ids: Vec<i64>,
        /// Messages before and after each one
        #[arg(short, long)]
        context: Option<usize>,
    },
    /// Get or set a session summary
    Summary {
        /// Archive id
        archive: String,
        /// Session id
        session: i64,
        /// New summary text
        #[arg(long)]
        set: Option<String>,
    },
    /// List summarized sessions
    Summaries {
        /// Archive id
        archive: String,
        #[command(flatten)]
        range: RangeArgs,
        /// Maximum number of sessions
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

/// Time range given as epoch seconds, `YYYY-MM-DD` or RFC 3339
#[derive(Args)]
struct RangeArgs {
    /// Range start (inclusive)
    #[arg(long)]
    from: Option<String>,
    /// Range end (inclusive)
    #[arg(long)]
    to: Option<String>,
}

impl RangeArgs {
    fn resolve(&self) -> anyhow::Result<Option<TimeRange>> {
        if self.from.is_none() && self.to.is_none() {
            return Ok(None);
        }
        let start = self
            .from
            .as_deref()
            .map(|raw| parse_time(raw, false))
            .transpose()?
            .unwrap_or(i64::MIN);
        let end = self
            .to
            .as_deref()
            .map(|raw| parse_time(raw, true))
            .transpose()?
            .unwrap_or(i64::MAX);
        Ok(Some(TimeRange::new(start, end)))
    }
}

/// Parse a timestamp; a bare date covers the whole day
fn parse_time(raw: &str, end_of_day: bool) -> anyhow::Result<i64> {
    if let Ok(ts) = raw.parse::<i64>() {
        return Ok(ts);
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let time = if end_of_day {
            date.and_hms_opt(23, 59, 59)
        } else {
            date.and_hms_opt(0, 0, 0)
        };
        if let Some(time) = time {
            return Ok(time.and_utc().timestamp());
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .with_context(|| format!("invalid time {raw:?}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,chatlog_index=info",
        1 => "info,chatlog_index=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    let defaults = config.defaults;
    let archives = Archives::new(&config.data_dir);

    match cli.command {
        Command::Archives => print_json(&archives.list()?),
        Command::Init { archive } => {
            let archive = archives.create(&archive)?;
            println!("Created archive {} at {}", archive.id(), archive.path().display());
            Ok(())
        }
        Command::Generate { archive, gap } => {
            let archive = open(&archives, &archive)?;
            let gap = gap.unwrap_or_else(|| {
                SessionIndex::with_default_gap(Arc::clone(&archive), defaults.gap_threshold)
                    .gap_threshold()
            });
            let count = Segmenter::new(archive).generate_with_progress(gap, |current, total| {
                tracing::debug!(current, total, "segmentation progress");
            })?;
            println!("Generated {count} sessions (gap threshold {gap}s)");
            Ok(())
        }
        Command::Clear { archive } => {
            SessionIndex::new(open(&archives, &archive)?).clear()?;
            println!("Cleared session index");
            Ok(())
        }
        Command::Status { archive } => {
            let archive = open(&archives, &archive)?;
            let messages = MessageRepo::new(Arc::clone(&archive)).count()?;
            let stats = SessionIndex::with_default_gap(archive, defaults.gap_threshold).stats();
            print_json(&Status { messages, stats })
        }
        Command::SetGap {
            archive,
            seconds,
            reset,
        } => {
            let index = SessionIndex::new(open(&archives, &archive)?);
            let value = if reset { None } else { seconds };
            index.set_gap_threshold(value)?;
            match value {
                Some(s) => println!("Set gap threshold to {s}s"),
                None => println!("Reset gap threshold to default"),
            }
            Ok(())
        }
        Command::List { archive } => {
            print_json(&SessionIndex::new(open(&archives, &archive)?).list())
        }
        Command::Search {
            archive,
            range,
            keywords,
            limit,
            preview,
        } => {
            let query = SessionQuery::new(open(&archives, &archive)?);
            print_json(&query.search_sessions(&SessionSearch {
                keywords,
                time_range: range.resolve()?,
                limit: limit.unwrap_or(defaults.search_limit),
                preview_count: preview.unwrap_or(defaults.preview_count),
            }))
        }
        Command::Show {
            archive,
            session,
            limit,
        } => {
            let query = SessionQuery::new(open(&archives, &archive)?);
            let Some(messages) = query
                .session_messages(session, limit.unwrap_or(defaults.session_messages_limit))
            else {
                bail!("session {session} not found");
            };
            print_json(&messages)
        }
        Command::Sessions { archive, ids } => {
            let query = SessionQuery::new(open(&archives, &archive)?);
            print_json(&query.multiple_sessions_messages(&ids))
        }
        Command::Filter {
            archive,
            range,
            keywords,
            senders,
            context,
        } => {
            let criteria = FilterCriteria::new()
                .with_keywords(keywords)
                .with_sender_ids(senders)
                .with_time_range(range.resolve()?);
            let filter = ContextFilter::new(open(&archives, &archive)?);
            print_json(&filter.filter(&criteria, context.unwrap_or(defaults.context_size)))
        }
        Command::Context {
            archive,
            ids,
            context,
        } => {
            let filter = ContextFilter::new(open(&archives, &archive)?);
            print_json(&filter.message_context(&ids, context.unwrap_or(defaults.context_size)))
        }
        Command::Summary {
            archive,
            session,
            set,
        } => {
            let index = SessionIndex::new(open(&archives, &archive)?);
            if let Some(text) = set {
                if !index.attach_summary(session, &text)? {
                    bail!("session {session} not found");
                }
                println!("Saved summary for session {session}");
            } else {
                match index.summary(session) {
                    Some(summary) => println!("{summary}"),
                    None => println!("Session {session} has no summary"),
                }
            }
            Ok(())
        }
        Command::Summaries {
            archive,
            range,
            limit,
        } => {
            let query = SessionQuery::new(open(&archives, &archive)?);
            print_json(
                &query.session_summaries(range.resolve()?, limit.unwrap_or(defaults.search_limit)),
            )
        }
    }
}

#[derive(Serialize)]
struct Status {
    messages: usize,
    #[serde(flatten)]
    stats: chatlog_index::IndexStats,
}

/// Resolve an existing archive
fn open(archives: &Archives, id: &str) -> anyhow::Result<Arc<Archive>> {
    let archive = archives.get(id)?;
    if !archive.path().is_file() {
        bail!(
            "archive {id} not found in {}",
            archives.data_dir().display()
        );
    }
    Ok(archive)
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
