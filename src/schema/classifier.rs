use super::SemanticType;

const NUMERIC_HINTS: &[&str] = &["int", "float", "double", "decimal", "number", "numeric", "real"];
const TEXT_HINTS: &[&str] = &["text", "char", "string", "var"];
const DATE_HINTS: &[&str] = &["date", "time"];

/// Checked in order; the first rule set with a matching substring wins
const RULES: &[(SemanticType, &[&str])] = &[
    (SemanticType::Numeric, NUMERIC_HINTS),
    (SemanticType::Text, TEXT_HINTS),
    (SemanticType::Date, DATE_HINTS),
];

/// Map a declared column type such as `VARCHAR(40)` or `double precision` to its
/// semantic category. Total: anything unrecognised is [`SemanticType::Unknown`].
pub fn classify(declared_type: &str) -> SemanticType {
    let declared = declared_type.to_lowercase();
    RULES
        .iter()
        .find(|(_, hints)| hints.iter().any(|hint| declared.contains(hint)))
        .map(|(semantic, _)| *semantic)
        .unwrap_or(SemanticType::Unknown)
}
