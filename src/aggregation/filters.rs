//! Row filters shared by both aggregation strategies
//!
//! Everything except the deny-list: series, single repository, allow-list,
//! time bounds and repository name patterns. The deny-list is the one
//! filter the strategies apply differently.

use crate::store::schema::REPO_NAMES_TABLE;
use crate::store::Predicates;
use crate::types::SeriesPointsOpts;

/// Filters over the live-points union aliased as `sp`
pub(crate) struct RowFilter {
    /// Predicates and their parameters
    pub preds: Predicates,
    /// Joins to splice after the `FROM` relation
    pub joins: String,
}

impl RowFilter {
    pub(crate) fn new(opts: &SeriesPointsOpts) -> Self {
        let mut preds = Predicates::new();
        let mut joins = String::new();

        if let Some(series_id) = &opts.series_id {
            let p = preds.bind(series_id.clone());
            preds.push(format!("sp.series_id = {}", p));
        }
        if let Some(repo_id) = opts.repo_id {
            let p = preds.bind(repo_id);
            preds.push(format!("sp.repo_id = {}", p));
        }
        preds.time_bounds("sp.time", &opts.bounds);
        if !opts.included.is_empty() {
            let p = preds.bind_ids(&opts.included);
            preds.push(format!("sp.repo_id IN (SELECT value FROM rarray({}))", p));
        }

        let includes: Vec<&String> = opts
            .include_repo_regex
            .iter()
            .filter(|p| !p.is_empty())
            .collect();
        let excludes: Vec<&String> = opts
            .exclude_repo_regex
            .iter()
            .filter(|p| !p.is_empty())
            .collect();

        if !includes.is_empty() || !excludes.is_empty() {
            joins.push_str(&format!(
                " JOIN {} rn ON sp.repo_name_id = rn.id",
                REPO_NAMES_TABLE
            ));
        }
        if !includes.is_empty() {
            let any: Vec<String> = includes
                .into_iter()
                .map(|pattern| format!("rn.name REGEXP {}", preds.bind(pattern.clone())))
                .collect();
            preds.push(format!("({})", any.join(" OR ")));
        }
        for pattern in excludes {
            let p = preds.bind(pattern.clone());
            preds.push(format!("NOT (rn.name REGEXP {})", p));
        }

        Self { preds, joins }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_filters() {
        let filter = RowFilter::new(&SeriesPointsOpts::default());
        assert_eq!(filter.preds.where_clause(), "1 = 1");
        assert!(filter.joins.is_empty());
    }

    #[test]
    fn test_patterns_add_name_join() {
        let mut opts = SeriesPointsOpts::for_series("s1");
        opts.include_repo_regex = vec!["a".into(), String::new(), "b".into()];
        opts.exclude_repo_regex = vec!["c".into()];

        let filter = RowFilter::new(&opts);
        assert!(filter.joins.contains("JOIN repo_names rn"));
        let clause = filter.preds.where_clause();
        assert!(clause.contains("(rn.name REGEXP ?2 OR rn.name REGEXP ?3)"));
        assert!(clause.contains("NOT (rn.name REGEXP ?4)"));
        assert_eq!(filter.preds.param_count(), 4);
    }

    #[test]
    fn test_empty_patterns_skip_join() {
        let mut opts = SeriesPointsOpts::default();
        opts.include_repo_regex = vec![String::new()];
        assert!(RowFilter::new(&opts).joins.is_empty());
    }
}
