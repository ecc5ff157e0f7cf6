use clap::Parser;
use quizlet_scraper::auth::{AuthState, Credentials, LoginMethod};
use quizlet_scraper::browser::{ChromeDriver, PageDriver};
use quizlet_scraper::cli::{AuthArgs, Cli, Command};
use quizlet_scraper::config::Config;
use quizlet_scraper::error::{Error, ExitStatus, Result};
use quizlet_scraper::logging::{self, LOG_LEVEL_ENV};
use quizlet_scraper::pipeline::{resolve_targets, Pipeline};
use quizlet_scraper::session_store::SessionStore;
use quizlet_scraper::throttle::Throttle;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env_level = std::env::var(LOG_LEVEL_ENV).ok();
    let level = logging::level(cli.verbose, cli.quiet, env_level.as_deref());
    if let Err(e) = logging::init(level) {
        eprintln!("Failed to initialize logging: {:#}", e);
    }

    let status = match run(cli).await {
        Ok(status) => status,
        Err(e) => {
            log::error!("{}", e);
            ExitStatus::for_error(&e)
        }
    };
    std::process::exit(status.as_i32());
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(headless) = cli.headless {
        config.browser.headless = headless;
    }
    if let Command::Scrape(args) = &cli.command {
        if !args.formats.is_empty() {
            config.export.formats = args.formats.clone();
        }
        config.export.combined |= args.combined;
    }
    config.validate()?;
    Ok(config)
}

/// Manual login when asked for, otherwise credentials when a password is
/// configured.
fn login_method(config: &Config, args: &AuthArgs, timeout: Option<u64>) -> Option<LoginMethod> {
    if args.manual {
        return Some(LoginMethod::Manual {
            timeout: timeout.map(Duration::from_secs),
        });
    }
    let username = args.username.clone().or_else(|| config.auth.username.clone())?;
    let password = config.auth.password.clone()?;
    Some(LoginMethod::Credentials(Credentials { username, password }))
}

fn watch_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, finishing up");
            cancel.cancel();
        }
    });
}

fn watch_auth_state(pipeline: &Pipeline) {
    let mut rx = pipeline.auth().subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            match state {
                AuthState::AwaitingManualLogin { timeout_secs } => log::info!(
                    "Complete the login in the browser window ({}s timeout)",
                    timeout_secs
                ),
                other => log::debug!("Auth state: {:?}", other),
            }
        }
    });
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let config = load_config(&cli)?;
    let cancel = CancellationToken::new();
    watch_ctrl_c(cancel.clone());

    let store = SessionStore::in_dir(&config.auth.session_dir);
    if let Command::Logout { remote: false } = cli.command {
        // Nothing to do on the service, so no browser is needed.
        store.clear()?;
        log::info!("Logged out, stored session removed");
        return Ok(ExitStatus::Success);
    }

    let throttle = Arc::new(Throttle::new(config.throttle_profile()?)?);
    if let Some(session) = store.load() {
        // A restored session keeps presenting the fingerprint it was captured with.
        throttle.pin(session.fingerprint);
    }

    let mut browser = config.browser_config();
    if cli.command.wants_manual() {
        browser = browser.visible();
    }
    log::info!("Launching browser (headless: {})", browser.headless);
    let driver: Arc<dyn PageDriver> = Arc::new(ChromeDriver::launch(browser, throttle.fingerprint()).await?);

    let pipeline = Pipeline::new(&config, driver, throttle)?;
    watch_auth_state(&pipeline);

    match &cli.command {
        Command::Login(args) => {
            let method = login_method(&config, &args.auth, args.timeout).ok_or_else(|| {
                Error::Config(
                    "no credentials: set auth.username and QUIZLET_PASSWORD, or pass --manual".into(),
                )
            })?;
            let session = pipeline.login(method, &cancel).await?;
            log::info!("Logged in as {}", session.account);
            Ok(ExitStatus::Success)
        }
        Command::Discover(args) => {
            let method = login_method(&config, args, None);
            let summary = pipeline.discover(method, &cancel).await?;
            log::info!(
                "Catalog: {} sets ({} found this run, {} new)",
                summary.total,
                summary.found,
                summary.added
            );
            for section in &summary.partial_sections {
                log::warn!("Section may be incomplete: {}", section);
            }
            Ok(summary.exit_status())
        }
        Command::Scrape(args) => {
            if !args.has_targets() {
                return Err(Error::Config("nothing to scrape: pass --set-id, --url or --all".into()));
            }
            let catalog = pipeline.catalog()?;
            let targets = resolve_targets(&catalog, &config.site, &args.set_ids, &args.urls, args.all)?;
            if targets.is_empty() {
                log::warn!("Catalog is empty, run discover first");
                return Ok(ExitStatus::Success);
            }
            let method = login_method(&config, &args.auth, None);
            let report = pipeline.scrape_batch(&targets, method, &cancel).await?;
            Ok(report.exit_status())
        }
        Command::Logout { remote } => {
            pipeline.logout(*remote, &cancel).await?;
            Ok(ExitStatus::Success)
        }
    }
}
