//! Glob compilation and matching for `SUBSCRIBE_GLOB` topics (spec §4.3).
//!
//! Patterns are anchored (no implicit prefix/suffix wildcard), `**` is
//! allowed to cross path-separator-like boundaries, and hidden segments
//! (those starting with `.`) are matched like any other segment — none of
//! `globset`'s shell-glob hidden-file suppression applies here, since
//! topics aren't filesystem paths.

use globset::{GlobBuilder, GlobMatcher};

use crate::error::{SessionError, SessionResult};

/// A compiled glob pattern ready to test topics against.
#[derive(Debug, Clone)]
pub struct CompiledGlob {
    pattern: String,
    matcher: GlobMatcher,
}

impl CompiledGlob {
    pub fn compile(pattern: &str) -> SessionResult<Self> {
        // `literal_separator(true)` is what makes a single `*` stop at `/`
        // while `**` is still allowed to cross it — the segment-aware
        // behavior the spec calls for.
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| SessionError::protocol(format!("invalid glob pattern {pattern:?}: {e}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Topics are arbitrary byte strings; matching against anything that
    /// isn't valid UTF-8 always fails rather than panicking or lossily
    /// converting, since a lossy match could let a subscriber receive a
    /// topic that only resembles one it's authorized for.
    pub fn is_match_bytes(&self, topic: &[u8]) -> bool {
        match std::str::from_utf8(topic) {
            Ok(topic) => self.matcher.is_match(topic),
            Err(_) => false,
        }
    }
}
