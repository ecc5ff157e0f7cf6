use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "quizlet-scraper", version, about = "Export your Quizlet flashcard sets")]
pub struct Cli {
    /// Configuration file (defaults to ./config.toml when present)
    #[arg(long, global = true, env = "QUIZLET_CONFIG")]
    pub config: Option<PathBuf>,

    /// More logging; repeat for trace output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Override browser.headless
    #[arg(long, global = true)]
    pub headless: Option<bool>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Log in and store the session
    Login(LoginArgs),
    /// Find every set in the library, classes and folders
    Discover(AuthArgs),
    /// Scrape sets and export their cards
    Scrape(ScrapeArgs),
    /// Forget the stored session
    Logout {
        /// Also sign out on quizlet.com
        #[arg(long)]
        remote: bool,
    },
}

#[derive(Debug, Args)]
pub struct AuthArgs {
    /// Account email or username (password comes from QUIZLET_PASSWORD)
    #[arg(short, long)]
    pub username: Option<String>,

    /// Log in by hand in a visible browser window if no session is stored
    #[arg(long)]
    pub manual: bool,
}

#[derive(Debug, Args)]
pub struct LoginArgs {
    #[command(flatten)]
    pub auth: AuthArgs,

    /// Seconds to wait for a manual login
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Args)]
pub struct ScrapeArgs {
    #[command(flatten)]
    pub auth: AuthArgs,

    /// Set ID from the catalog; repeatable
    #[arg(long = "set-id")]
    pub set_ids: Vec<String>,

    /// Set URL; repeatable
    #[arg(long = "url")]
    pub urls: Vec<String>,

    /// Every set in the catalog
    #[arg(long)]
    pub all: bool,

    /// Export format (quizlet, json, csv, tsv, anki); repeatable
    #[arg(short, long = "format")]
    pub formats: Vec<String>,

    /// Write one combined file per format instead of one per set
    #[arg(long)]
    pub combined: bool,
}

impl ScrapeArgs {
    pub fn has_targets(&self) -> bool {
        self.all || !self.set_ids.is_empty() || !self.urls.is_empty()
    }
}

impl Command {
    pub fn auth_args(&self) -> Option<&AuthArgs> {
        match self {
            Command::Login(args) => Some(&args.auth),
            Command::Discover(args) => Some(args),
            Command::Scrape(args) => Some(&args.auth),
            Command::Logout { .. } => None,
        }
    }

    /// Commands that may open a visible window for a manual login.
    pub fn wants_manual(&self) -> bool {
        self.auth_args().is_some_and(|a| a.manual)
    }
}
