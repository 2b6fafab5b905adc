/*! The transition plan: one verdict per unit, grouped into six sets.
*/

use std::collections::BTreeSet;

/// The per-unit verdicts for one activation.
///
/// `start`, `stop`, `restart`, `reload` and `skip` drive execution;
/// `filter` only suppresses log lines for units (restarted targets,
/// mostly) whose mention would be noise. A unit is never in both
/// `restart` and `reload`.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct Plan {
    pub start: BTreeSet<String>,
    pub stop: BTreeSet<String>,
    pub restart: BTreeSet<String>,
    pub reload: BTreeSet<String>,
    pub skip: BTreeSet<String>,
    pub filter: BTreeSet<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty()
            && self.stop.is_empty()
            && self.restart.is_empty()
            && self.reload.is_empty()
            && self.skip.is_empty()
    }

    /// The members of `set` worth mentioning to the operator.
    pub fn displayed<'a>(&'a self, set: &'a BTreeSet<String>) -> Vec<&'a str> {
        set.iter()
            .filter(|unit| !self.filter.contains(*unit))
            .map(String::as_str)
            .collect()
    }
}

/// Log one phase's unit list, with `filter` members suppressed.
pub fn log_units(verb: &str, plan: &Plan, set: &BTreeSet<String>) {
    let displayed = plan.displayed(set);
    if !displayed.is_empty() {
        tracing::info!("{verb} the following units: {}", displayed.join(", "));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filtered_units_are_hidden_from_display_only() {
        let mut plan = Plan::default();
        plan.start.insert("multi-user.target".to_string());
        plan.start.insert("nginx.service".to_string());
        plan.filter.insert("multi-user.target".to_string());

        assert_eq!(plan.displayed(&plan.start), vec!["nginx.service"]);
        // Execution still sees both.
        assert_eq!(plan.start.len(), 2);
    }
}
