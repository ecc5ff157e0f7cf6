use crate::throttle::Fingerprint;
use std::time::Duration;

/// Configuration for browser instances
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Run browser in headless mode
    pub headless: bool,

    /// Navigation timeout in seconds
    pub timeout_seconds: u64,

    /// Disable image loading for performance
    pub disable_images: bool,

    /// Inject the fingerprint spoofing script after each navigation
    pub stealth: bool,

    /// Additional Chrome flags
    pub chrome_flags: Vec<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            timeout_seconds: 30,
            disable_images: false,
            stealth: true,
            chrome_flags: vec![],
        }
    }
}

/// Flags that hide the usual automation markers.
const ANTI_DETECTION_FLAGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-dev-shm-usage",
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-infobars",
];

impl BrowserConfig {
    /// Create a configuration for a visible browser, e.g. for manual login
    pub fn visible(mut self) -> Self {
        self.headless = false;
        self
    }

    /// Get timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Chrome command line for a session presenting `fingerprint`.
    pub fn launch_args(&self, fingerprint: &Fingerprint) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        if self.stealth {
            args.extend(ANTI_DETECTION_FLAGS.iter().map(|f| f.to_string()));
        }
        if self.disable_images {
            args.push("--blink-settings=imagesEnabled=false".to_string());
        }
        args.push(format!("--user-agent={}", fingerprint.user_agent));
        args.push(format!("--lang={}", fingerprint.locale));
        args.extend(self.chrome_flags.iter().cloned());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::Viewport;

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64)".into(),
            viewport: Viewport {
                width: 1366,
                height: 768,
            },
            locale: "en-GB".into(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = BrowserConfig::default();
        assert!(config.headless);
        assert!(config.stealth);
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_launch_args_carry_fingerprint_and_stealth_flags() {
        let args = BrowserConfig::default().launch_args(&fingerprint());
        assert!(args.iter().any(|f| f.contains("AutomationControlled")));
        assert!(args.contains(&"--user-agent=Mozilla/5.0 (X11; Linux x86_64)".to_string()));
        assert!(args.contains(&"--lang=en-GB".to_string()));
        assert!(!args.iter().any(|f| f.contains("imagesEnabled")));
    }

    #[test]
    fn test_launch_args_without_stealth() {
        let config = BrowserConfig {
            stealth: false,
            disable_images: true,
            chrome_flags: vec!["--mute-audio".into()],
            ..BrowserConfig::default()
        };
        let args = config.launch_args(&fingerprint());
        assert!(!args.iter().any(|f| f.contains("AutomationControlled")));
        assert!(args.contains(&"--blink-settings=imagesEnabled=false".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--mute-audio"));
    }

    #[test]
    fn test_visible_mode() {
        let config = BrowserConfig::default().visible();
        assert!(!config.headless);
    }
}
