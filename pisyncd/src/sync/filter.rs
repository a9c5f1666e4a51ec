use glob::{MatchOptions, Pattern};
use thiserror::Error;
use tracing::warn;

use super::conflict::is_conflict_artifact;
use super::transfer::TEMP_SUFFIX;
use crate::config::{SyncMode, SyncSettings};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiles a rule into the glob patterns that implement it. A trailing
/// `**` segment becomes `**/*` so it matches every file below its parent.
/// `**` inside a segment (`src/**.map`) expands into one pattern where the
/// gap stays in the segment (`*`) and one where it crosses directories
/// (`*/**/*`).
fn compile(raw: &str) -> Result<Vec<Pattern>, glob::PatternError> {
    expand(raw).iter().map(|source| Pattern::new(source)).collect()
}

fn expand(raw: &str) -> Vec<String> {
    let segments: Vec<&str> = raw.split('/').collect();
    let last = segments.len() - 1;
    let mut variants = vec![String::new()];
    for (index, segment) in segments.iter().enumerate() {
        let options = segment_variants(segment, index == last);
        variants = variants
            .iter()
            .flat_map(|prefix| {
                options.iter().map(move |option| {
                    if index == 0 {
                        option.clone()
                    } else {
                        format!("{prefix}/{option}")
                    }
                })
            })
            .collect();
    }
    variants
}

fn segment_variants(segment: &str, last: bool) -> Vec<String> {
    let mut segment = segment.to_string();
    while segment.contains("***") {
        segment = segment.replace("***", "**");
    }
    if segment == "**" {
        let whole = if last { "**/*" } else { "**" };
        return vec![whole.to_string()];
    }
    let mut variants = vec![String::new()];
    for (index, part) in segment.split("**").enumerate() {
        if index > 0 {
            variants = variants
                .into_iter()
                .flat_map(|variant| [format!("{variant}*"), format!("{variant}*/**/*")])
                .collect();
        }
        for variant in &mut variants {
            variant.push_str(part);
        }
    }
    variants
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid include pattern {pattern:?}: {source}")]
    Include {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

#[derive(Debug, Clone)]
struct Rule {
    literal: String,
    /// Empty when an exclusion failed to compile; it then matches literally.
    patterns: Vec<Pattern>,
    /// Patterns without `/` are also tried against every path segment.
    per_segment: bool,
}

impl Rule {
    fn matches_glob(&self, relative: &str) -> bool {
        self.patterns.iter().any(|pattern| {
            pattern.matches_with(relative, MATCH_OPTIONS)
                || (self.per_segment
                    && relative
                        .split('/')
                        .any(|segment| pattern.matches_with(segment, MATCH_OPTIONS)))
        })
    }
}

/// Decides which relative paths take part in sync.
#[derive(Debug, Clone)]
pub struct PathFilter {
    exclusions: Vec<Rule>,
    includes: Vec<Rule>,
    mode: SyncMode,
}

impl PathFilter {
    pub fn new(exclusions: &[String], includes: &[String], mode: SyncMode) -> Result<Self, FilterError> {
        let exclusions = exclusions
            .iter()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| {
                let raw = raw.trim();
                let patterns = compile(raw).unwrap_or_else(|err| {
                    warn!("exclusion {raw:?} is not a valid glob, matching literally: {err}");
                    Vec::new()
                });
                Rule {
                    literal: raw.to_string(),
                    patterns,
                    per_segment: !raw.contains('/'),
                }
            })
            .collect();

        let includes = includes
            .iter()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| {
                let raw = raw.trim();
                let patterns = compile(raw).map_err(|source| FilterError::Include {
                    pattern: raw.to_string(),
                    source,
                })?;
                Ok(Rule {
                    literal: raw.to_string(),
                    patterns,
                    per_segment: !raw.contains('/'),
                })
            })
            .collect::<Result<Vec<_>, FilterError>>()?;

        Ok(Self {
            exclusions,
            includes,
            mode,
        })
    }

    /// Mirror mode without rules; only internal paths are rejected.
    pub fn allow_all() -> Self {
        Self {
            exclusions: Vec::new(),
            includes: Vec::new(),
            mode: SyncMode::Mirror,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Result<Self, FilterError> {
        Self::new(&settings.exclusions, &settings.includes, settings.sync_mode)
    }

    /// Temp transfer files and conflict artifacts never sync.
    pub fn is_internal(relative: &str) -> bool {
        relative.split('/').any(|segment| {
            segment.ends_with(TEMP_SUFFIX) || is_conflict_artifact(segment)
        })
    }

    pub fn is_excluded(&self, relative: &str) -> bool {
        if Self::is_internal(relative) {
            return true;
        }
        self.exclusions
            .iter()
            .any(|rule| rule.matches_glob(relative) || relative.contains(&rule.literal))
    }

    /// Selective mode only lets through paths matching an include glob.
    pub fn is_included(&self, relative: &str) -> bool {
        match self.mode {
            SyncMode::Mirror => true,
            SyncMode::Selective => self.includes.iter().any(|rule| rule.matches_glob(relative)),
        }
    }

    /// Whether remote-to-local traffic for `relative` is allowed.
    pub fn should_sync(&self, relative: &str) -> bool {
        !self.is_excluded(relative)
    }

    /// Whether local-to-remote traffic for `relative` is allowed.
    pub fn should_push(&self, relative: &str) -> bool {
        !self.is_excluded(relative) && self.is_included(relative)
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(exclusions: &[&str], includes: &[&str], mode: SyncMode) -> PathFilter {
        let exclusions: Vec<String> = exclusions.iter().map(|s| s.to_string()).collect();
        let includes: Vec<String> = includes.iter().map(|s| s.to_string()).collect();
        PathFilter::new(&exclusions, &includes, mode).unwrap()
    }

    #[test]
    fn excludes_directory_names_and_extensions() {
        let filter = filter(&["node_modules", "*.log"], &[], SyncMode::Mirror);
        assert!(filter.is_excluded("project/node_modules/x.js"));
        assert!(filter.is_excluded("project/debug.log"));
        assert!(!filter.is_excluded("project/src/app.ts"));
    }

    #[test]
    fn star_stays_within_a_segment() {
        let filter = filter(&["build/*.o"], &[], SyncMode::Mirror);
        assert!(filter.is_excluded("build/main.o"));
        assert!(!filter.is_excluded("build/sub/main.o"));
    }

    #[test]
    fn double_star_crosses_segments() {
        let filter = filter(&["dist/**/*.map"], &[], SyncMode::Mirror);
        assert!(filter.is_excluded("dist/js/vendor/app.js.map"));
        assert!(!filter.is_excluded("src/app.js.map"));
    }

    #[test]
    fn double_star_inside_a_segment_matches_at_any_depth() {
        let filter = filter(&["src/**.map"], &[], SyncMode::Mirror);
        assert!(filter.is_excluded("src/a.map"));
        assert!(filter.is_excluded("src/js/a.map"));
        assert!(filter.is_excluded("src/js/vendor/a.map"));
        assert!(!filter.is_excluded("lib/a.map"));
        assert!(!filter.is_excluded("src/js/a.ts"));
    }

    #[test]
    fn include_with_double_star_inside_a_segment_is_valid() {
        let selective = filter(&[], &["assets/img**.png"], SyncMode::Selective);
        assert!(selective.should_push("assets/img-logo.png"));
        assert!(selective.should_push("assets/img/icons/home.png"));
        assert!(!selective.should_push("assets/css/site.css"));
        assert!(!selective.should_push("docs/logo.png"));
    }

    #[test]
    fn exclusion_substring_matches_literally() {
        let filter = filter(&["secret"], &[], SyncMode::Mirror);
        assert!(filter.is_excluded("config/secrets.yaml"));
    }

    #[test]
    fn invalid_exclusion_glob_still_matches_literally() {
        let filter = filter(&["[broken"], &[], SyncMode::Mirror);
        assert!(filter.is_excluded("a/[broken/b.txt"));
        assert!(!filter.is_excluded("a/b.txt"));
    }

    #[test]
    fn internal_files_are_never_synced() {
        let filter = filter(&[], &[], SyncMode::Mirror);
        assert!(filter.is_excluded("src/app.ts.pisync-tmp"));
        assert!(filter.is_excluded("src/app.conflict-local-20240101T000000Z.ts"));
        assert!(filter.is_excluded("notes.conflict-remote-20240101T000000Z"));
        assert!(!filter.is_excluded("src/app.ts"));
    }

    #[test]
    fn includes_apply_only_in_selective_mode() {
        let mirror = filter(&[], &["src/**"], SyncMode::Mirror);
        assert!(mirror.should_push("docs/readme.md"));

        let selective = filter(&[], &["src/**", "*.toml"], SyncMode::Selective);
        assert!(selective.should_push("src/app/main.rs"));
        assert!(selective.should_push("crates/core/Cargo.toml"));
        assert!(!selective.should_push("docs/readme.md"));
        assert!(selective.should_sync("docs/readme.md"));
    }

    #[test]
    fn selective_mode_without_includes_pushes_nothing() {
        let selective = filter(&[], &[], SyncMode::Selective);
        assert!(!selective.should_push("src/app.ts"));
    }

    #[test]
    fn invalid_include_is_an_error() {
        let err = PathFilter::new(&[], &["[oops".to_string()], SyncMode::Selective).unwrap_err();
        assert!(matches!(err, FilterError::Include { .. }));
    }
}
