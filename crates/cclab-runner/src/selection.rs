use std::path::Path;
use thiserror::Error;

/// Matches every scheme or trace.
pub const ALL: &str = "all";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("--reuse-results and --run-full are mutually exclusive")]
    Conflicting,
    #[error("a CSV export covers a single run; use `cclab gather` for --num-runs {0}")]
    MultiRunExport(usize),
    #[error("invalid scheme:trace pattern '{0}'")]
    Pattern(String),
}

/// Which scheme (or scheme/trace pair) gets a fresh run; everything else
/// reuses results already on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RunSelection {
    #[default]
    RunAll,
    Reuse(Vec<String>),
    RunFull(Vec<String>),
}

impl RunSelection {
    pub fn from_options(
        reuse: Option<Vec<String>>,
        run_full: Option<Vec<String>>,
    ) -> Result<Self, SelectionError> {
        match (reuse, run_full) {
            (Some(_), Some(_)) => Err(SelectionError::Conflicting),
            (Some(reuse), None) => Ok(RunSelection::Reuse(reuse)),
            (None, Some(full)) => Ok(RunSelection::RunFull(full)),
            (None, None) => Ok(RunSelection::RunAll),
        }
    }

    /// Schemes to run in full, in `schemes` order.
    pub fn full_run_schemes(&self, schemes: &[String]) -> Vec<String> {
        let listed = |list: &[String], s: &String| list.iter().any(|x| x == ALL || x == s);
        schemes
            .iter()
            .filter(|s| match self {
                RunSelection::RunAll => true,
                RunSelection::Reuse(list) => !listed(list, s),
                RunSelection::RunFull(list) => listed(list, s),
            })
            .cloned()
            .collect()
    }

    /// Scheme/trace pairs to run in full, scheme-major. List entries are
    /// `scheme:trace` patterns where either side may be `all`; a bare scheme
    /// name stands for `scheme:all`.
    pub fn full_run_pairs(
        &self,
        schemes: &[String],
        traces: &[String],
    ) -> Result<Vec<(String, String)>, SelectionError> {
        let patterns = match self {
            RunSelection::RunAll => Vec::new(),
            RunSelection::Reuse(list) | RunSelection::RunFull(list) => list
                .iter()
                .map(|p| PairPattern::parse(p))
                .collect::<Result<Vec<_>, _>>()?,
        };
        let mut pairs = Vec::new();
        for scheme in schemes {
            for trace in traces {
                let listed = patterns.iter().any(|p| p.matches(scheme, trace));
                let full = match self {
                    RunSelection::RunAll => true,
                    RunSelection::Reuse(_) => !listed,
                    RunSelection::RunFull(_) => listed,
                };
                if full {
                    pairs.push((scheme.clone(), trace.clone()));
                }
            }
        }
        Ok(pairs)
    }
}

struct PairPattern {
    scheme: String,
    trace: String,
}

impl PairPattern {
    fn parse(raw: &str) -> Result<Self, SelectionError> {
        let parts: Vec<&str> = raw.split(':').map(str::trim).collect();
        match parts.as_slice() {
            [scheme] if !scheme.is_empty() => Ok(Self {
                scheme: scheme.to_string(),
                trace: ALL.to_string(),
            }),
            [scheme, trace] if !scheme.is_empty() && !trace.is_empty() => Ok(Self {
                scheme: scheme.to_string(),
                trace: trace.to_string(),
            }),
            _ => Err(SelectionError::Pattern(raw.to_string())),
        }
    }

    fn matches(&self, scheme: &str, trace: &str) -> bool {
        (self.scheme == ALL || self.scheme == scheme) && (self.trace == ALL || self.trace == trace)
    }
}

/// A single-shot CSV export cannot represent repeated trials.
pub fn check_export(trial_count: usize, csv_out: Option<&Path>) -> Result<(), SelectionError> {
    if trial_count > 1 && csv_out.is_some() {
        return Err(SelectionError::MultiRunExport(trial_count));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reuse_list_excludes_schemes() {
        let schemes = list(&["a", "b", "c"]);
        assert_eq!(
            RunSelection::Reuse(list(&["b"])).full_run_schemes(&schemes),
            list(&["a", "c"])
        );
        assert!(RunSelection::Reuse(list(&["all"]))
            .full_run_schemes(&schemes)
            .is_empty());
    }

    #[test]
    fn run_full_list_selects_schemes() {
        let schemes = list(&["a", "b", "c"]);
        assert_eq!(
            RunSelection::RunFull(list(&["all"])).full_run_schemes(&schemes),
            schemes
        );
        assert_eq!(
            RunSelection::RunFull(list(&["c", "a"])).full_run_schemes(&schemes),
            list(&["a", "c"])
        );
        assert_eq!(RunSelection::default().full_run_schemes(&schemes), schemes);
    }

    #[test]
    fn both_lists_conflict() {
        assert_eq!(
            RunSelection::from_options(Some(list(&["a"])), Some(list(&["b"]))),
            Err(SelectionError::Conflicting)
        );
        assert_eq!(
            RunSelection::from_options(None, None),
            Ok(RunSelection::RunAll)
        );
    }

    #[test]
    fn pair_patterns_accept_wildcards() {
        let schemes = list(&["abc", "cubic"]);
        let traces = list(&["t1", "t2"]);
        let pairs = RunSelection::Reuse(list(&["abc:all", "all:t2"]))
            .full_run_pairs(&schemes, &traces)
            .expect("pairs");
        assert_eq!(pairs, vec![("cubic".to_string(), "t1".to_string())]);

        let pairs = RunSelection::RunFull(list(&["cubic"]))
            .full_run_pairs(&schemes, &traces)
            .expect("pairs");
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|(s, _)| s == "cubic"));

        assert!(RunSelection::Reuse(list(&["all"]))
            .full_run_pairs(&schemes, &traces)
            .expect("pairs")
            .is_empty());
        assert_eq!(
            RunSelection::RunAll
                .full_run_pairs(&schemes, &traces)
                .expect("pairs")
                .len(),
            4
        );
    }

    #[test]
    fn malformed_pair_pattern_is_rejected() {
        let err = RunSelection::Reuse(list(&["abc:t1:x"]))
            .full_run_pairs(&list(&["abc"]), &list(&["t1"]))
            .expect_err("bad pattern");
        assert_eq!(err, SelectionError::Pattern("abc:t1:x".to_string()));
    }

    #[test]
    fn multi_run_csv_export_is_rejected() {
        assert!(check_export(1, Some(Path::new("out.csv"))).is_ok());
        assert!(check_export(3, None).is_ok());
        assert_eq!(
            check_export(3, Some(Path::new("out.csv"))),
            Err(SelectionError::MultiRunExport(3))
        );
    }
}
