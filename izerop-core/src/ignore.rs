//! Gitignore-style ignore rules, read from `.izeropignore` at the sync root.
//!
//! Rules are evaluated in file order and the last matching rule wins: a path
//! is ignored iff that rule is not negated. A pattern without `/` matches the
//! basename (with the full relative path as a fallback); a pattern with `/`
//! matches the full relative path; a single `**` segment spans any number of
//! path segments.

use globset::{GlobBuilder, GlobMatcher};
use std::path::Path;
use tracing::warn;

pub const IGNORE_FILE: &str = ".izeropignore";

#[derive(Debug)]
enum Matcher {
    /// Tried against the basename first, then the full relative path.
    Basename(GlobMatcher),
    Relative(GlobMatcher),
    /// Literal prefix plus glob suffix around a single `**`.
    Span {
        prefix: String,
        suffix: Option<GlobMatcher>,
    },
}

#[derive(Debug)]
struct Rule {
    negated: bool,
    dir_only: bool,
    matcher: Matcher,
}

impl Rule {
    fn compile(pattern: &str, negated: bool, dir_only: bool) -> Option<Rule> {
        let matcher = match pattern.split("**").collect::<Vec<_>>().as_slice() {
            [_] if pattern.contains('/') => Matcher::Relative(compile_glob(pattern)?),
            [_] => Matcher::Basename(compile_glob(pattern)?),
            [prefix, suffix] => {
                let suffix = suffix.trim_start_matches('/');
                Matcher::Span {
                    prefix: prefix.to_string(),
                    suffix: if suffix.is_empty() {
                        None
                    } else {
                        Some(compile_glob(suffix)?)
                    },
                }
            }
            // more than one `**`: let globset handle it whole
            _ => Matcher::Relative(compile_glob(pattern)?),
        };
        Some(Rule {
            negated,
            dir_only,
            matcher,
        })
    }

    fn matches(&self, rel: &str, name: &str) -> bool {
        match &self.matcher {
            Matcher::Basename(glob) => {
                glob.is_match(Path::new(name)) || glob.is_match(Path::new(rel))
            }
            Matcher::Relative(glob) => glob.is_match(Path::new(rel)),
            Matcher::Span { prefix, suffix } => {
                if !prefix.is_empty() && !rel.starts_with(prefix.as_str()) {
                    return false;
                }
                let Some(suffix) = suffix else {
                    return true;
                };
                let remaining = rel.strip_prefix(prefix.as_str()).unwrap_or(rel);
                let segments: Vec<&str> = remaining.split('/').collect();
                for i in 0..segments.len() {
                    if suffix.is_match(Path::new(&segments[i..].join("/"))) {
                        return true;
                    }
                }
                segments
                    .last()
                    .map(|last| suffix.is_match(Path::new(last)))
                    .unwrap_or(false)
            }
        }
    }
}

fn compile_glob(pattern: &str) -> Option<GlobMatcher> {
    // literal separator keeps `*` within one path segment, shell style
    match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(glob) => Some(glob.compile_matcher()),
        Err(err) => {
            warn!(pattern, %err, "skipping unparseable ignore pattern");
            None
        }
    }
}

/// Parsed contents of an `.izeropignore` file.
#[derive(Debug, Default)]
pub struct IgnoreRules {
    rules: Vec<Rule>,
}

impl IgnoreRules {
    /// Reads the ignore file from the sync root. A missing file means no
    /// rules.
    pub fn load(sync_dir: &Path) -> Self {
        match std::fs::read_to_string(sync_dir.join(IGNORE_FILE)) {
            Ok(text) => Self::parse(&text),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut rules = Vec::new();
        for line in text.lines() {
            let mut line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let negated = line.starts_with('!');
            if negated {
                line = &line[1..];
            }
            let dir_only = line.ends_with('/');
            if dir_only {
                line = line.trim_end_matches('/');
            }
            if line.is_empty() {
                continue;
            }
            if let Some(rule) = Rule::compile(line, negated, dir_only) {
                rules.push(rule);
            }
        }
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `rel_path` is ignored. `is_dir` gates dir-only rules.
    pub fn is_ignored(&self, rel_path: &str, is_dir: bool) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let rel = rel_path.replace('\\', "/");
        let name = rel.rsplit('/').next().unwrap_or(rel.as_str());

        let mut ignored = false;
        for rule in &self.rules {
            if rule.dir_only && !is_dir {
                continue;
            }
            if rule.matches(&rel, name) {
                ignored = !rule.negated;
            }
        }
        ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_patterns() {
        let rules = IgnoreRules::parse("*.log\n");
        assert!(rules.is_ignored("app.log", false));
        assert!(rules.is_ignored("deep/nested/app.log", false));
        assert!(!rules.is_ignored("app.log.txt", false));
    }

    #[test]
    fn dir_only_patterns() {
        let rules = IgnoreRules::parse("build/\n");
        assert!(rules.is_ignored("build", true));
        assert!(!rules.is_ignored("build", false));
    }

    #[test]
    fn negation_last_match_wins() {
        let rules = IgnoreRules::parse("*.log\n!keep.log\n");
        assert!(rules.is_ignored("app.log", false));
        assert!(!rules.is_ignored("keep.log", false));

        let reversed = IgnoreRules::parse("!keep.log\n*.log\n");
        assert!(reversed.is_ignored("keep.log", false));
    }

    #[test]
    fn relative_patterns_stay_anchored() {
        let rules = IgnoreRules::parse("docs/*.md\n");
        assert!(rules.is_ignored("docs/readme.md", false));
        assert!(!rules.is_ignored("docs/sub/readme.md", false));
        assert!(!rules.is_ignored("other/readme.md", false));
    }

    #[test]
    fn double_star_spans_segments() {
        let rules = IgnoreRules::parse("target/**/*.o\n");
        assert!(rules.is_ignored("target/a.o", false));
        assert!(rules.is_ignored("target/debug/deps/a.o", false));
        assert!(!rules.is_ignored("src/a.o", false));

        let bare = IgnoreRules::parse("cache/**\n");
        assert!(bare.is_ignored("cache/anything/at/all", false));
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let rules = IgnoreRules::parse("# build artifacts\n\n*.tmp\n");
        assert!(rules.is_ignored("x.tmp", false));
        assert!(!rules.is_ignored("# build artifacts", false));
    }

    #[test]
    fn empty_rules_match_nothing() {
        let rules = IgnoreRules::parse("");
        assert!(!rules.is_ignored("anything", false));
    }
}
