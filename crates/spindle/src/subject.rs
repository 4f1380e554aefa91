// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker subject conventions.
//!
//! The stream is configured with the wildcard `{prefix}.>`; data frames are
//! published to the concrete child token `{prefix}.data`. The bare prefix
//! itself does NOT match its own wildcard (`>` requires at least one more
//! token), so publishers must always use a child subject. The edge broker
//! client validates this pairing at startup.

/// Subject pattern the stream is created with.
pub fn stream_pattern(prefix: &str) -> String {
    format!("{prefix}.>")
}

/// Subject data frames are published to.
pub fn data_subject(prefix: &str) -> String {
    format!("{prefix}.data")
}

/// Token-wise subject match with NATS semantics.
///
/// `*` matches exactly one token; `>` matches one or more trailing tokens.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_subject_matches_stream_pattern() {
        let pattern = stream_pattern("TELEMETRY");
        assert!(matches(&pattern, &data_subject("TELEMETRY")));
    }

    #[test]
    fn test_bare_prefix_does_not_match_wildcard() {
        // The historical bug: publishing to the literal prefix while the
        // stream listens on `prefix.>` silently matches nothing.
        assert!(!matches("TELEMETRY.>", "TELEMETRY"));
    }

    #[test]
    fn test_wildcard_matches_deep_subjects() {
        assert!(matches("TELEMETRY.>", "TELEMETRY.data"));
        assert!(matches("TELEMETRY.>", "TELEMETRY.site.a.data"));
        assert!(!matches("TELEMETRY.>", "OTHER.data"));
    }

    #[test]
    fn test_star_matches_exactly_one_token() {
        assert!(matches("TELEMETRY.*", "TELEMETRY.data"));
        assert!(!matches("TELEMETRY.*", "TELEMETRY.data.more"));
        assert!(!matches("TELEMETRY.*", "TELEMETRY"));
    }

    #[test]
    fn test_literal_match() {
        assert!(matches("TELEMETRY.data", "TELEMETRY.data"));
        assert!(!matches("TELEMETRY.data", "TELEMETRY.other"));
    }
}
