//! Include/exclude filters for directory transfers.

/// Glob filter applied to paths relative to the transferred directory.
///
/// A path matches a pattern if either its file name or its full relative path
/// (with `/` separators) matches. Exclusion wins over inclusion; an empty
/// include list includes everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferFilter {
    /// Patterns a path must match to be transferred
    pub include: Vec<String>,
    /// Patterns that prevent a path from being transferred
    pub exclude: Vec<String>,
}

impl TransferFilter {
    /// Filter that transfers everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Add an include pattern
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    /// Add an exclude pattern
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    /// Whether `relative_path` should be transferred
    pub fn accepts(&self, relative_path: &str) -> bool {
        let file_name = relative_path.rsplit('/').next().unwrap_or(relative_path);
        let matches = |pattern: &String| {
            glob_match(pattern, file_name) || glob_match(pattern, relative_path)
        };

        if self.exclude.iter().any(matches) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(matches)
    }
}

/// Match `text` against a glob supporting `*` (any run except `/`), `**`
/// (any run) and `?` (one character except `/`).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_from(&pattern, &text)
}

fn match_from(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            let double = pattern.get(1) == Some(&'*');
            let rest = if double { &pattern[2..] } else { &pattern[1..] };
            // Try every split point; a single star stops at the next separator.
            for i in 0..=text.len() {
                if match_from(rest, &text[i..]) {
                    return true;
                }
                if i < text.len() && !double && text[i] == '/' {
                    return false;
                }
            }
            false
        }
        Some('?') => match text.first() {
            Some(c) if *c != '/' => match_from(&pattern[1..], &text[1..]),
            _ => false,
        },
        Some(p) => match text.first() {
            Some(c) if c == p => match_from(&pattern[1..], &text[1..]),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_within_one_component() {
        assert!(glob_match("*.yaml", "cassandra.yaml"));
        assert!(!glob_match("*.yaml", "conf/cassandra.yaml"));
        assert!(glob_match("conf/*.yaml", "conf/cassandra.yaml"));
        assert!(glob_match("**/*.yaml", "a/b/c.yaml"));
        assert!(glob_match("gc.log.?", "gc.log.1"));
        assert!(!glob_match("gc.log.?", "gc.log.10"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let filter = TransferFilter::all().include("*.log").exclude("debug.log");
        assert!(filter.accepts("logs/system.log"));
        assert!(!filter.accepts("logs/debug.log"));
        assert!(!filter.accepts("logs/gc.txt"));
    }

    #[test]
    fn empty_include_accepts_everything_not_excluded() {
        let filter = TransferFilter::all().exclude("*.hprof");
        assert!(filter.accepts("conf/jvm.options"));
        assert!(!filter.accepts("heap/java_pid1.hprof"));
    }
}
