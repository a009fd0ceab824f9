use std::env;
use std::sync::OnceLock;

/// Environment variable naming the backend the session activates when none was chosen.
pub(crate) const BACKEND_ENV: &str = "DECODER_RS_BACKEND";

/// Backend name used when the environment does not pick one.
pub(crate) const DEFAULT_BACKEND: &str = "cpu";

static DECODER_RS_BACKEND: OnceLock<String> = OnceLock::new();

fn parse_name(value: &str) -> Option<String> {
    let normalized = value.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

pub(crate) fn default_backend_name() -> &'static str {
    DECODER_RS_BACKEND
        .get_or_init(|| match env::var(BACKEND_ENV) {
            Ok(value) => parse_name(&value).unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            Err(_) => DEFAULT_BACKEND.to_string(),
        })
        .as_str()
}

#[cfg(test)]
mod tests {
    use super::parse_name;

    #[test]
    fn backend_names_are_trimmed_and_lowercased() {
        assert_eq!(parse_name("  Rayon "), Some("rayon".to_string()));
        assert_eq!(parse_name("cpu"), Some("cpu".to_string()));
    }

    #[test]
    fn blank_backend_name_falls_back() {
        assert_eq!(parse_name(""), None);
        assert_eq!(parse_name("   "), None);
    }
}
