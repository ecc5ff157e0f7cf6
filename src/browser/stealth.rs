//! Fingerprint spoofing script evaluated after each navigation.

use crate::throttle::Fingerprint;

/// Script hiding automation markers and matching `navigator` to `fingerprint`.
pub fn stealth_script(fingerprint: &Fingerprint) -> String {
    let primary = fingerprint
        .locale
        .split('-')
        .next()
        .unwrap_or("en")
        .to_string();
    // serde_json gives us properly quoted JS string literals.
    let languages = serde_json::json!([fingerprint.locale, primary]).to_string();

    format!(
        r#"(() => {{
        Object.defineProperty(navigator, 'webdriver', {{
            get: () => undefined
        }});

        // Remove chrome automation flags
        window.chrome = window.chrome || {{ runtime: {{}} }};

        Object.defineProperty(navigator, 'plugins', {{
            get: () => [1, 2, 3, 4, 5]
        }});

        Object.defineProperty(navigator, 'languages', {{
            get: () => {languages}
        }});

        const getParameter = WebGLRenderingContext.prototype.getParameter;
        WebGLRenderingContext.prototype.getParameter = function(parameter) {{
            if (parameter === 37445) {{
                return 'Intel Inc.';
            }}
            if (parameter === 37446) {{
                return 'Intel(R) Iris(TM) Plus Graphics 640';
            }}
            return getParameter.call(this, parameter);
        }};

        delete window.cdc_adoQpoasnfa76pfcZLmcfl_Array;
        delete window.cdc_adoQpoasnfa76pfcZLmcfl_Promise;
        delete window.cdc_adoQpoasnfa76pfcZLmcfl_Symbol;
    }})();"#,
        languages = languages
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::Viewport;

    #[test]
    fn test_script_uses_fingerprint_locale() {
        let script = stealth_script(&Fingerprint {
            user_agent: "ua".into(),
            viewport: Viewport {
                width: 1920,
                height: 1080,
            },
            locale: "en-GB".into(),
        });
        assert!(script.contains(r#"["en-GB","en"]"#));
        assert!(script.contains("'webdriver'"));
    }
}
