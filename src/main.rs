use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use wedding_timeline::auth::{token_digest, GuestSession};
use wedding_timeline::config::Config;
use wedding_timeline::gift::GiftBox;
use wedding_timeline::state::data::TimelineItem;
use wedding_timeline::state::guest::GuestIdentity;
use wedding_timeline::state::library::Library;
use wedding_timeline::state::local::JsonFileStore;
use wedding_timeline::store::objects::LocalObjectStore;
use wedding_timeline::timeline::{PageLoader, TimelineHandle};
use wedding_timeline::upload::{collect_images, UploadCoordinator};

#[derive(Parser)]
#[command(name = "wedding-timeline", version, about = "Share and browse the wedding photo timeline")]
struct Cli {
    /// Directory holding the database, photos and local state
    #[arg(long, global = true, env = "WEDDING_TIMELINE_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Set the invitation token guests sign in with (host only)
    SetToken { token: String },
    /// Sign in with the token from the invitation link
    Login { token: String },
    /// Forget the session on this device
    Logout,
    /// Show or register your display name
    Name { name: Option<String> },
    /// Share photos (files or folders) on the timeline
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Show the timeline, newest first
    Timeline {
        /// Pages to load
        #[arg(long, default_value_t = 1)]
        pages: usize,
        /// Keep printing new photos until interrupted
        #[arg(long)]
        follow: bool,
        /// Print one JSON object per photo
        #[arg(long)]
        json: bool,
    },
    /// Reveal your gift
    Gift {
        /// Forget the drawn gift
        #[arg(long)]
        clear: bool,
    },
}

/// Everything a command may need, opened from one data directory
struct App {
    config: Config,
    records: Arc<Library>,
    objects: Arc<LocalObjectStore>,
    local: Arc<JsonFileStore>,
}

impl App {
    fn open(config: Config) -> anyhow::Result<Self> {
        let records = Library::open(&config.db_path())
            .context("opening the record database")?
            .with_poll_interval(config.poll_interval());
        let objects = LocalObjectStore::new(config.objects_dir(), config.signing_key.clone());
        let local = JsonFileStore::open(config.local_state_path()).context("reading local state")?;
        Ok(Self {
            config,
            records: Arc::new(records),
            objects: Arc::new(objects),
            local: Arc::new(local),
        })
    }

    fn session(&self) -> GuestSession {
        GuestSession::new(self.local.clone(), self.config.token_digest.clone())
    }

    fn guest(&self) -> GuestIdentity {
        GuestIdentity::new(self.local.clone())
    }

    fn loader(&self) -> PageLoader {
        PageLoader::new(self.records.clone(), self.objects.clone())
            .with_page_size(self.config.page_size)
            .with_url_ttl(self.config.url_ttl())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.data_dir).context("loading configuration")?;
    info!(data_dir = %config.data_dir().display(), "starting");

    match cli.command {
        Command::SetToken { token } => {
            if token.trim().is_empty() {
                bail!("the invitation token cannot be empty");
            }
            config.token_digest = Some(token_digest(&token));
            config.save()?;
            println!("Invitation token updated.");
        }
        Command::Login { token } => {
            App::open(config)?.session().sign_in(&token)?;
            println!("Welcome! You're signed in.");
        }
        Command::Logout => {
            App::open(config)?.session().sign_out()?;
            println!("Signed out.");
        }
        Command::Name { name } => {
            let app = App::open(config)?;
            match name {
                Some(name) => {
                    let name = app.guest().set_name(&name)?;
                    println!("Hi, {name}!");
                }
                None => match app.guest().name()? {
                    Some(name) => println!("{name}"),
                    None => println!("No name registered yet. Run `wedding-timeline name <NAME>`."),
                },
            }
        }
        Command::Upload { paths } => upload(App::open(config)?, &paths).await?,
        Command::Timeline {
            pages,
            follow,
            json,
        } => show_timeline(App::open(config)?, pages, follow, json).await?,
        Command::Gift { clear } => {
            let app = App::open(config)?;
            app.session().require()?;
            let gifts = GiftBox::new(app.local.clone());
            if clear {
                gifts.clear()?;
                println!("Gift forgotten.");
            } else {
                let gift = gifts.get_or_draw()?;
                println!("{} {}\n{}", gift.emoji, gift.title, gift.description);
            }
        }
    }

    Ok(())
}

async fn upload(app: App, paths: &[PathBuf]) -> anyhow::Result<()> {
    app.session().require()?;
    let Some(author) = app.guest().name()? else {
        bail!("register your name first with `wedding-timeline name <NAME>`");
    };

    let files = collect_images(paths)?;
    if files.is_empty() {
        bail!("no images found in the selection");
    }

    let coordinator = UploadCoordinator::new(app.records.clone(), app.objects.clone());
    let report = coordinator
        .upload_batch(files, &author, Utc::now(), |pct| println!("⏳ {pct}%"))
        .await?;

    for (path, error) in &report.failed {
        eprintln!("⚠️  {}: {error}", path.display());
    }
    println!(
        "✅ Shared {} of {} photos.",
        report.uploaded.len(),
        report.attempted
    );

    show_timeline(app, 1, false, false).await
}

async fn show_timeline(app: App, pages: usize, follow: bool, json: bool) -> anyhow::Result<()> {
    app.session().require()?;

    let handle = TimelineHandle::spawn(app.loader());
    let mut snapshots = handle.watch();
    snapshots.wait_for(|s| s.initial_loaded).await?;

    for _ in 1..pages {
        if handle.load_more().await.is_none() {
            break;
        }
    }

    let snapshot = handle.snapshot();
    if snapshot.items.is_empty() && !json {
        println!("No photos yet. Be the first to share one!");
    }
    for item in &snapshot.items {
        print_item(item, json)?;
    }
    if snapshot.has_more && !json {
        println!("… more photos available (use --pages)");
    }

    if follow {
        let mut seen: HashSet<Uuid> = snapshot.items.iter().map(|i| i.id()).collect();
        if !json {
            println!("Waiting for new photos, press Ctrl+C to stop.");
        }
        loop {
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    for item in unseen_items(&mut seen, &snapshot.items) {
                        print_item(item, json)?;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    handle.close().await?;
    Ok(())
}

/// Items not printed yet, oldest first, marking them as seen
fn unseen_items<'a>(seen: &mut HashSet<Uuid>, items: &'a [TimelineItem]) -> Vec<&'a TimelineItem> {
    let mut fresh: Vec<_> = items.iter().filter(|i| seen.insert(i.id())).collect();
    // Live items sit at the front, newest first
    fresh.reverse();
    fresh
}

fn print_item(item: &TimelineItem, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(item)?);
    } else {
        println!(
            "{}  {:<20}  {}",
            item.record.moment.with_timezone(&Local).format("%d/%m %H:%M"),
            item.record.author,
            item.url
        );
    }
    Ok(())
}
