mod api;
mod queue;
mod store;
mod tree;
mod wire;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{ApiClient, DEFAULT_API_URL};
use crate::queue::{
    BatchTarget, FsReader, UploadEntry, UploadQueue, UploadStatus, DEFAULT_MAX_FILE_BYTES,
};
use crate::store::{CourseCache, JsonFileStore};
use crate::tree::{category_filter, ExpandState, Filter, SortOrder, ViewState, CATEGORIES};

/// Browse shared course notes and contribute new files.
#[derive(Parser)]
#[clap(name = "notes-client", version)]
struct Cli {
    /// Base URL of the notes API (falls back to NOTES_API_URL)
    #[clap(long, global = true)]
    api: Option<String>,

    /// Log progress details to stderr
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List course files as a folder tree
    Browse {
        /// Case-insensitive match on course or file name
        #[clap(long, default_value = "")]
        search: String,
        /// Keep only files whose name contains this category label ("all" or "全部" disables)
        #[clap(long)]
        category: Option<String>,
        #[clap(long, value_enum, default_value_t = SortArg::Default)]
        sort: SortArg,
        /// Open a folder by path, e.g. `OS/unit2` (repeatable)
        #[clap(long)]
        expand: Vec<String>,
        #[clap(long)]
        expand_all: bool,
        /// Flip a folder open or closed after the expand options (repeatable)
        #[clap(long)]
        toggle: Vec<String>,
    },
    /// Upload files (or every file under a directory) as one draft PR each
    Upload(UploadArgs),
    /// Suggest known course names from the local cache
    Suggest { text: String },
}

#[derive(Args)]
struct UploadArgs {
    #[clap(long)]
    course: String,
    #[clap(long, default_value = CATEGORIES[0])]
    category: String,
    /// New name for a single file; the extension is kept
    #[clap(long)]
    name: Option<String>,
    #[clap(long, default_value_t = DEFAULT_MAX_FILE_BYTES)]
    max_bytes: u64,
    /// Drop a selected file by name before uploading (repeatable)
    #[clap(long)]
    skip: Vec<String>,
    /// Re-queue failed files and run the batch again up to this many times
    #[clap(long, default_value_t = 0)]
    retries: u32,
    #[clap(required = true)]
    paths: Vec<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Default,
    Asc,
    Desc,
}

impl From<SortArg> for SortOrder {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Default => SortOrder::Default,
            SortArg::Asc => SortOrder::Ascending,
            SortArg::Desc => SortOrder::Descending,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::INFO } else { Level::WARN })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let api_url = cli
        .api
        .or_else(|| std::env::var("NOTES_API_URL").ok())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let api = ApiClient::new(&api_url);

    match cli.command {
        Commands::Browse {
            search,
            category,
            sort,
            expand,
            expand_all,
            toggle,
        } => browse(&api, search, category, sort.into(), &expand, expand_all, &toggle),
        Commands::Upload(args) => upload(&api, args),
        Commands::Suggest { text } => {
            let cache = CourseCache::new(JsonFileStore::default_location()?);
            for course in cache.suggest(&text) {
                println!("{}", course);
            }
            Ok(())
        }
    }
}

fn browse(
    api: &ApiClient,
    search: String,
    category: Option<String>,
    sort: SortOrder,
    expand: &[String],
    expand_all: bool,
    toggle: &[String],
) -> Result<()> {
    let filter = Filter {
        query: search,
        category: category_filter(category.as_deref()),
        sort,
    };

    for line in ViewState::Loading.render(&ExpandState::default()) {
        eprintln!("{}", line);
    }

    let listing = api.fetch_index();
    if let Ok(index) = &listing {
        match JsonFileStore::default_location() {
            Ok(store) => {
                let location = store.path().display().to_string();
                match CourseCache::new(store).remember(index) {
                    Ok(()) => info!("cached {} course names in {}", index.len(), location),
                    Err(e) => warn!("could not update course cache: {}", e),
                }
            }
            Err(e) => warn!("course cache unavailable: {}", e),
        }
    }

    let view = ViewState::from_listing(listing, &filter);

    let mut state = ExpandState::default();
    if expand_all {
        if let ViewState::Ready(forest) = &view {
            state.expand_all(forest);
        }
    }
    for path in expand {
        state.open(path);
    }
    for path in toggle {
        state.toggle(path);
    }

    for line in view.render(&state) {
        println!("{}", line);
    }

    if let ViewState::Failed(_) = view {
        bail!("listing failed");
    }
    Ok(())
}

fn upload(api: &ApiClient, args: UploadArgs) -> Result<()> {
    let UploadArgs {
        course,
        category,
        name,
        max_bytes,
        skip,
        retries,
        paths,
    } = args;
    let mut queue = UploadQueue::new(max_bytes);

    for err in queue.select_paths(&paths) {
        println!("skipped {}: {}", err.path.display(), err.message);
    }
    for name in &skip {
        if queue.remove_named(name)? == 0 {
            warn!("--skip {}: no selected file has that name", name);
        }
    }
    if queue.entries().is_empty() {
        bail!("nothing to upload");
    }

    if let Some(name) = name {
        if queue.entries().len() != 1 {
            bail!("--name only applies when uploading a single file");
        }
        let id = queue.entries()[0].id;
        queue.rename(id, &name)?;
    }

    let target = BatchTarget { course, category };
    let mut counts = queue.run_batch(&target, &FsReader, api, print_update)?;
    for attempt in 1..=retries {
        if counts.failed == 0 {
            break;
        }
        println!("retrying {} failed upload(s), attempt {}", queue.requeue_failed(), attempt);
        counts = queue.run_batch(&target, &FsReader, api, print_update)?;
    }

    println!(
        "pending {}, uploading {}, succeeded {}, failed {}",
        counts.pending, counts.uploading, counts.succeeded, counts.failed
    );

    if counts.failed > 0 {
        bail!("{} upload(s) failed", counts.failed);
    }
    Ok(())
}

fn print_update(entry: &UploadEntry) {
    match entry.status {
        UploadStatus::Uploading => println!("[{:>3}%] {}", entry.progress, entry.proposed_name),
        UploadStatus::Succeeded => println!(
            "[done] {} -> {}",
            entry.proposed_name,
            entry.pr_url.as_deref().unwrap_or_default()
        ),
        UploadStatus::Failed => println!(
            "[fail] {}: {}",
            entry.proposed_name,
            entry.error.as_deref().unwrap_or_default()
        ),
        UploadStatus::Pending => {}
    }
}
