use tracing::warn;

/// Output language for prompts and rendered reference text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    En,
    Zh,
}

impl Language {
    /// Parse a language code, falling back to `default` (with a warning) for
    /// anything that is not `en` or `zh`.
    pub fn parse_or(value: &str, default: Language) -> Language {
        match value {
            "en" => Language::En,
            "zh" => Language::Zh,
            other => {
                if !other.is_empty() {
                    warn!(language = other, fallback = default.code(), "Unsupported language");
                }
                default
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Zh => "zh",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_parse() {
        assert_eq!(Language::parse_or("en", Language::Zh), Language::En);
        assert_eq!(Language::parse_or("zh", Language::En), Language::Zh);
    }

    #[test]
    fn unknown_code_falls_back() {
        assert_eq!(Language::parse_or("fr", Language::Zh), Language::Zh);
        assert_eq!(Language::parse_or("", Language::En), Language::En);
    }
}
