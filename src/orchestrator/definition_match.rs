//! Fuzzy binding of a request category to a property's task definition.
//!
//! Classifier labels rarely match provisioned labels exactly, so matching
//! falls through four tiers of decreasing confidence. The first definition
//! that satisfies the highest tier wins.

use serde::Serialize;

use crate::models::definition::TaskDefinition;
use crate::models::task::category_key;

/// How a definition was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    /// Same label, ignoring case and surrounding whitespace.
    Exact,
    /// The label appears inside the category.
    LabelInCategory,
    /// The category appears inside the label.
    CategoryInLabel,
    /// The category's first word starts the label.
    FirstTokenPrefix,
}

/// Resolve the definition for `category`, if any.
#[must_use]
pub fn resolve<'a>(
    category: &str,
    definitions: &'a [TaskDefinition],
) -> Option<(&'a TaskDefinition, MatchTier)> {
    let wanted = category_key(category);
    if wanted.is_empty() {
        return None;
    }

    let labelled: Vec<(&TaskDefinition, String)> = definitions
        .iter()
        .map(|def| (def, category_key(&def.label)))
        .filter(|(_, label)| !label.is_empty())
        .collect();

    let first_token = wanted.split_whitespace().next().unwrap_or_default();

    let tiers: [(MatchTier, &dyn Fn(&str) -> bool); 4] = [
        (MatchTier::Exact, &|label: &str| label == wanted),
        (MatchTier::LabelInCategory, &|label: &str| wanted.contains(label)),
        (MatchTier::CategoryInLabel, &|label: &str| label.contains(wanted.as_str())),
        (MatchTier::FirstTokenPrefix, &|label: &str| {
            !first_token.is_empty() && label.starts_with(first_token)
        }),
    ];

    tiers.iter().find_map(|(tier, matches)| {
        labelled
            .iter()
            .find(|(_, label)| matches(label.as_str()))
            .map(|(def, _)| (*def, *tier))
    })
}
