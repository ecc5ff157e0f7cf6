use anyhow::Context;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;
use std::str::FromStr;

pub const LOG_CONFIG_FILE: &str = "log4rs.yml";
pub const LOG_LEVEL_ENV: &str = "QUIZLET_LOG";

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} | {h({l})} | {t} | {m}{n}";

/// Level from `-v`/`-q`, unless `QUIZLET_LOG` names one.
pub fn level(verbose: u8, quiet: bool, env: Option<&str>) -> LevelFilter {
    if let Some(level) = env.and_then(|v| LevelFilter::from_str(v.trim()).ok()) {
        return level;
    }
    if quiet {
        return LevelFilter::Warn;
    }
    match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Uses `log4rs.yml` from the working directory when present, otherwise
/// logs to stderr at `level`.
pub fn init(level: LevelFilter) -> anyhow::Result<()> {
    if Path::new(LOG_CONFIG_FILE).exists() {
        log4rs::init_file(LOG_CONFIG_FILE, Default::default())
            .with_context(|| format!("failed to load {}", LOG_CONFIG_FILE))?;
        return Ok(());
    }

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
        .context("invalid logging configuration")?;
    log4rs::init_config(config).context("logger already initialized")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_flags() {
        assert_eq!(level(0, false, None), LevelFilter::Info);
        assert_eq!(level(1, false, None), LevelFilter::Debug);
        assert_eq!(level(3, false, None), LevelFilter::Trace);
        assert_eq!(level(2, true, None), LevelFilter::Warn);
    }

    #[test]
    fn test_env_override() {
        assert_eq!(level(0, false, Some("error")), LevelFilter::Error);
        assert_eq!(level(0, true, Some("DEBUG")), LevelFilter::Debug);
        assert_eq!(level(1, false, Some("loud")), LevelFilter::Debug);
    }
}
