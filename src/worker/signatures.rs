// Transient-failure detection in worker output

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Category of a recognized failure signature
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignatureKind {
    /// Network or API transport failures
    Connection,
    /// HTTP 429, quota and overload messages
    RateLimit,
    /// Prompt or conversation too large for the model
    ContextLength,
    /// Pattern supplied by configuration
    Custom,
}

/// Built-in signatures, used as the default `failover.error_patterns`.
///
/// The 429 patterns use word boundaries so ids containing "429" do not match.
pub const DEFAULT_ERROR_PATTERNS: &[(&str, SignatureKind)] = &[
    // Connection / API failures
    (r"(?i)\bECONNRESET\b|\bECONNREFUSED\b|\bETIMEDOUT\b", SignatureKind::Connection),
    (r"(?i)connection\s+(reset|refused|error|closed)", SignatureKind::Connection),
    (r"(?i)\bAPI\s*Error\b", SignatureKind::Connection),
    (r"(?i)internal\s+server\s+error|\b50[234]\b\s+(bad gateway|service unavailable|gateway timeout)", SignatureKind::Connection),
    // Rate limiting
    (r"(?i)rate[_\-\s]?limit(ed|ing)?", SignatureKind::RateLimit),
    (r"(?i)too\s+many\s+requests", SignatureKind::RateLimit),
    (r"(?i)\b429\b", SignatureKind::RateLimit),
    (r"(?i)quota\s*(exceeded|limit)|usage\s+limit\s+(exceeded|reached)", SignatureKind::RateLimit),
    (r"(?i)overloaded", SignatureKind::RateLimit),
    // Context length
    (r"(?i)context[_\s]+(length|window)[_\s]+(exceeded|limit)", SignatureKind::ContextLength),
    (r"(?i)prompt\s+is\s+too\s+long|maximum\s+context\s+length", SignatureKind::ContextLength),
];

/// A signature that matched a line of output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMatch {
    pub kind: SignatureKind,
    pub pattern: String,
    pub line: String,
}

struct CompiledSignature {
    regex: Regex,
    kind: SignatureKind,
}

/// Compiled set of failure signatures
pub struct SignatureSet {
    signatures: Vec<CompiledSignature>,
}

impl SignatureSet {
    /// Compile configured patterns; built-in patterns keep their category
    pub fn compile(patterns: &[String]) -> Result<Self, String> {
        let signatures = patterns
            .iter()
            .map(|pattern| {
                let regex = Regex::new(pattern)
                    .map_err(|e| format!("Invalid error pattern '{}': {}", pattern, e))?;
                let kind = DEFAULT_ERROR_PATTERNS
                    .iter()
                    .find(|(p, _)| *p == pattern.as_str())
                    .map(|(_, kind)| *kind)
                    .unwrap_or(SignatureKind::Custom);
                Ok(CompiledSignature { regex, kind })
            })
            .collect::<Result<Vec<_>, String>>()?;
        Ok(Self { signatures })
    }

    /// First signature matching `line`, in configuration order
    pub fn detect(&self, line: &str) -> Option<SignatureMatch> {
        self.signatures
            .iter()
            .find(|s| s.regex.is_match(line))
            .map(|s| SignatureMatch {
                kind: s.kind,
                pattern: s.regex.as_str().to_string(),
                line: line.trim().to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> SignatureSet {
        let patterns: Vec<String> = DEFAULT_ERROR_PATTERNS
            .iter()
            .map(|(p, _)| p.to_string())
            .collect();
        SignatureSet::compile(&patterns).unwrap()
    }

    #[test]
    fn test_detects_rate_limits() {
        let set = defaults();
        let m = set.detect("Error: Rate limit exceeded, retry later").unwrap();
        assert_eq!(m.kind, SignatureKind::RateLimit);
        assert!(set.detect("HTTP 429 Too Many Requests").is_some());
    }

    #[test]
    fn test_no_false_positive_on_ids() {
        let set = defaults();
        assert!(set.detect("session ses_429f18024ffeVo6UO6EAo2tIHG started").is_none());
        assert!(set.detect("All 12 tests passed").is_none());
    }

    #[test]
    fn test_detects_connection_and_context_errors() {
        let set = defaults();
        assert_eq!(
            set.detect("read ECONNRESET").unwrap().kind,
            SignatureKind::Connection
        );
        assert_eq!(
            set.detect("Error: prompt is too long: 210000 tokens").unwrap().kind,
            SignatureKind::ContextLength
        );
    }

    #[test]
    fn test_custom_patterns() {
        let set = SignatureSet::compile(&["FATAL-[0-9]+".to_string()]).unwrap();
        let m = set.detect("worker died: FATAL-17").unwrap();
        assert_eq!(m.kind, SignatureKind::Custom);
        assert!(SignatureSet::compile(&["(oops".to_string()]).is_err());
    }
}
