use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Network,
    RateLimit,
    Model,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Fatal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub raw_line: String,
}

impl ClassifiedError {
    pub fn is_fatal(&self) -> bool {
        self.severity == ErrorSeverity::Fatal
    }
}

/// Ordered signal table. Matching is case-insensitive substring search over
/// one line; the first entry whose signal list matches wins, so more specific
/// categories come before the generic catch-all. New error kinds are new
/// rows, not new branches.
const PATTERN_TABLE: &[(ErrorKind, ErrorSeverity, &[&str])] = &[
    (
        ErrorKind::Auth,
        ErrorSeverity::Fatal,
        &[
            "authentication failed",
            "not authenticated",
            "please login",
            "please log in",
            "invalid api key",
            "api key not found",
            "unauthorized",
        ],
    ),
    (
        ErrorKind::Network,
        ErrorSeverity::Fatal,
        &[
            "connection refused",
            "connection reset",
            "econnrefused",
            "etimedout",
            "timed out",
            "network timeout",
            "dns",
            "getaddrinfo",
            "certificate",
            "tls handshake",
            "ssl error",
            "network error",
        ],
    ),
    (
        ErrorKind::RateLimit,
        ErrorSeverity::Fatal,
        &[
            "rate limit",
            "quota exceeded",
            "too many requests",
            "429",
        ],
    ),
    (
        ErrorKind::Model,
        ErrorSeverity::Fatal,
        &["model not found", "invalid model", "unknown model"],
    ),
    (
        ErrorKind::Generic,
        ErrorSeverity::Warning,
        &[
            "internal server error",
            "service unavailable",
            "bad gateway",
            "http 500",
            "http 502",
            "http 503",
            "http 504",
            "overloaded",
        ],
    ),
];

/// Incremental, line-buffered classifier for a subprocess error stream.
/// Feed raw chunks as they arrive; complete lines are matched against
/// [`PATTERN_TABLE`] and every hit is recorded in arrival order.
#[derive(Debug, Default)]
pub struct StderrClassifier {
    buffer: String,
    errors: Vec<ClassifiedError>,
}

impl StderrClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, classify every complete line it finishes, and return
    /// the first error detected in this chunk. Later matches in the same
    /// chunk are still recorded.
    pub fn parse_chunk(&mut self, text: &str) -> Option<ClassifiedError> {
        self.buffer.push_str(text);
        let mut first = None;
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(error) = self.classify_line(line)
                && first.is_none()
            {
                first = Some(error);
            }
        }
        first
    }

    /// Flush the trailing partial line at end of stream.
    pub fn parse_remaining(&mut self) -> Option<ClassifiedError> {
        let rest = std::mem::take(&mut self.buffer);
        let line = rest.trim();
        if line.is_empty() {
            return None;
        }
        self.classify_line(line)
    }

    fn classify_line(&mut self, line: &str) -> Option<ClassifiedError> {
        let error = classify_line(line)?;
        self.errors.push(error.clone());
        Some(error)
    }

    /// Every classified error seen so far, in arrival order (append-only
    /// within a task).
    pub fn all_errors(&self) -> &[ClassifiedError] {
        &self.errors
    }

    pub fn first_fatal_error(&self) -> Option<&ClassifiedError> {
        self.errors.iter().find(|error| error.is_fatal())
    }

    /// Clear buffer and recorded errors for reuse across tasks.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.errors.clear();
    }

    /// Cheap upstream filter: does this output line look like forward
    /// progress rather than noise? Recognizes percentage readouts and
    /// common activity verbs.
    pub fn is_progress_indicator(line: &str) -> bool {
        let lowered = line.to_ascii_lowercase();
        const ACTIVITY: &[&str] = &[
            "processing",
            "analyzing",
            "generating",
            "loading",
            "thinking",
            "writing",
            "running",
        ];
        if ACTIVITY.iter().any(|verb| lowered.contains(verb)) {
            return true;
        }
        has_percentage(&lowered)
    }

    /// Pull the most specific error-bearing line out of a raw blob, falling
    /// back to the whole text when no line stands out.
    pub fn extract_error_message(raw_text: &str) -> String {
        for line in raw_text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let lowered = trimmed.to_ascii_lowercase();
            if lowered.contains("error")
                || lowered.contains("failed")
                || classify_line(trimmed).is_some()
            {
                return trimmed.to_string();
            }
        }
        raw_text.trim().to_string()
    }
}

fn classify_line(line: &str) -> Option<ClassifiedError> {
    let lowered = line.to_ascii_lowercase();
    for (kind, severity, signals) in PATTERN_TABLE {
        if signals.iter().any(|signal| lowered.contains(signal)) {
            return Some(ClassifiedError {
                kind: *kind,
                severity: *severity,
                message: line.trim().to_string(),
                raw_line: line.to_string(),
            });
        }
    }
    None
}

fn has_percentage(lowered: &str) -> bool {
    let bytes = lowered.as_bytes();
    bytes.iter().enumerate().any(|(idx, byte)| {
        *byte == b'%' && idx > 0 && bytes[idx - 1].is_ascii_digit()
    })
}

#[cfg(test)]
#[path = "../tests/unit/classifier_tests.rs"]
mod tests;
