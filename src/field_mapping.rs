//! Column suggestions for chart roles.
//!
//! Scoring is a pure function of the column's name, its semantic type and the
//! requested role. The weights live in the tables below; ranking is advisory and
//! never blocks query construction.

use crate::chart::{ChartKind, ChartSpec, ShapeError};
use crate::schema::{ColumnDescriptor, SemanticType, TableSchema};
use log::debug;
use std::cmp::Reverse;

const CATEGORY_ROLES: &[&str] = &["x", "labels", "categories", "dimension", "group"];
const VALUE_ROLES: &[&str] = &["y", "values", "metrics", "measure", "value"];

const CATEGORY_HINTS: &[&str] = &[
    "name",
    "category",
    "type",
    "department",
    "group",
    "class",
    "region",
];
const METRIC_HINTS: &[&str] = &[
    "count", "total", "sum", "amount", "price", "cost", "revenue", "profit", "sales",
];

const EXACT_NAME_MATCH: i32 = 100;
const PARTIAL_NAME_MATCH: i32 = 50;
const ID_PENALTY: i32 = -20;

/// Optional roles are only filled by columns scoring at least this much
const STRONG_CANDIDATE: i32 = 50;

/// Scoring rules for one family of roles
struct RoleRules {
    name_hints: &'static [&'static str],
    hint_bonus: i32,
    /// First matching semantic type contributes its weight
    type_weights: &'static [(SemanticType, i32)],
    /// Applied when no entry of `type_weights` matches
    other_type_weight: i32,
    id_penalty: i32,
}

const CATEGORY_RULES: RoleRules = RoleRules {
    name_hints: CATEGORY_HINTS,
    hint_bonus: 30,
    type_weights: &[(SemanticType::Date, 25), (SemanticType::Text, 20)],
    other_type_weight: 0,
    id_penalty: ID_PENALTY,
};

const VALUE_RULES: RoleRules = RoleRules {
    name_hints: METRIC_HINTS,
    hint_bonus: 30,
    type_weights: &[(SemanticType::Numeric, 40)],
    other_type_weight: -50,
    id_penalty: ID_PENALTY,
};

/// Roles outside both families only score on their name
const NAME_ONLY_RULES: RoleRules = RoleRules {
    name_hints: &[],
    hint_bonus: 0,
    type_weights: &[],
    other_type_weight: 0,
    id_penalty: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleFamily {
    Category,
    Value,
    NameOnly,
}

impl RoleFamily {
    fn of(role: &str) -> Self {
        let role = role.to_lowercase();
        if CATEGORY_ROLES.contains(&role.as_str()) {
            RoleFamily::Category
        } else if VALUE_ROLES.contains(&role.as_str()) {
            RoleFamily::Value
        } else {
            RoleFamily::NameOnly
        }
    }

    /// Family used when auto-filling an optional chart role
    fn of_optional(role: &str) -> Self {
        match role {
            "color" | "series" => RoleFamily::Category,
            "size" => RoleFamily::Value,
            _ => RoleFamily::of(role),
        }
    }

    fn rules(&self) -> &'static RoleRules {
        match self {
            RoleFamily::Category => &CATEGORY_RULES,
            RoleFamily::Value => &VALUE_RULES,
            RoleFamily::NameOnly => &NAME_ONLY_RULES,
        }
    }
}

/// Value roles and every scatter axis need numbers to plot
fn needs_numeric(kind: ChartKind, family: RoleFamily) -> bool {
    family == RoleFamily::Value || kind == ChartKind::Scatter
}

fn accepts(column: &ColumnDescriptor, numeric_only: bool) -> bool {
    !numeric_only || column.semantic_type == SemanticType::Numeric
}

fn is_id_column(name: &str) -> bool {
    name == "id" || name.ends_with("_id")
}

fn score_with(column: &ColumnDescriptor, role: &str, rules: &RoleRules) -> i32 {
    let name = column.name.to_lowercase();
    let role = role.to_lowercase();
    let mut score = 0;

    if name == role {
        score += EXACT_NAME_MATCH;
    } else if name.contains(&role) || role.contains(&name) {
        score += PARTIAL_NAME_MATCH;
    }

    if rules.name_hints.iter().any(|hint| name.contains(hint)) {
        score += rules.hint_bonus;
    }

    score += rules
        .type_weights
        .iter()
        .find(|(semantic, _)| *semantic == column.semantic_type)
        .map(|(_, weight)| *weight)
        .unwrap_or(rules.other_type_weight);

    if is_id_column(&name) {
        score += rules.id_penalty;
    }
    score
}

/// Score of `column` for `role`; higher is a better fit
pub fn score(column: &ColumnDescriptor, role: &str) -> i32 {
    score_with(column, role, RoleFamily::of(role).rules())
}

fn rank<'s>(
    schema: &'s TableSchema,
    role: &str,
    family: RoleFamily,
) -> Vec<(i32, &'s ColumnDescriptor)> {
    let mut ranked: Vec<(i32, &ColumnDescriptor)> = schema
        .columns
        .iter()
        .map(|column| (score_with(column, role, family.rules()), column))
        .collect();
    // stable: ties keep catalog order
    ranked.sort_by_key(|(score, _)| Reverse(*score));
    ranked
}

/// Every column of `schema`, best candidate for `role` first
pub fn suggest(schema: &TableSchema, role: &str) -> Vec<ColumnDescriptor> {
    rank(schema, role, RoleFamily::of(role))
        .into_iter()
        .map(|(_, column)| column.clone())
        .collect()
}

/// Build a complete mapping for `kind` from the schema alone.
///
/// Required roles take the best-ranked column no other role uses yet; value
/// roles and scatter axes only accept numeric columns. Optional roles are set
/// only when a strong candidate is left.
pub fn auto_map(schema: &TableSchema, kind: ChartKind) -> Result<ChartSpec, ShapeError> {
    let mut spec = ChartSpec::new(kind);
    let mut used: Vec<&str> = Vec::new();

    for role in kind.required_roles() {
        let family = RoleFamily::of(role);
        let numeric_only = needs_numeric(kind, family);
        let (_, column) = rank(schema, role, family)
            .into_iter()
            .find(|(_, column)| {
                !used.contains(&column.name.as_str()) && accepts(column, numeric_only)
            })
            .ok_or_else(|| ShapeError::MissingMapping(role.to_string()))?;
        used.push(&column.name);
        spec = spec.map(role, &column.name);
    }

    for role in kind.optional_roles() {
        let family = RoleFamily::of_optional(role);
        let numeric_only = family == RoleFamily::Value;
        let candidate = rank(schema, role, family).into_iter().find(|(score, column)| {
            *score >= STRONG_CANDIDATE
                && !used.contains(&column.name.as_str())
                && accepts(column, numeric_only)
        });
        if let Some((_, column)) = candidate {
            used.push(&column.name);
            spec = spec.map(role, &column.name);
        }
    }

    debug!(
        "Auto-mapped {} chart on {}: {:?}",
        kind, schema.table_name, spec.mappings
    );
    Ok(spec)
}
