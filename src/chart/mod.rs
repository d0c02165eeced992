//! Reshaping of flat result rows into chart-ready series.
//!
//! Each chart kind has one pure shaping function, picked by [`ChartKind::shaper`].
//! Shapers never fail on data: non-numeric cells are skipped or rendered as
//! `null`, and an empty row set always yields empty labels and datasets.

mod categorical;
pub mod palette;
mod proportional;
mod radar;
mod scatter;

use crate::data_store::{Row, Value};
use crate::sql_parser::AggregateFunction;
use log::debug;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("Chart mapping is missing the '{0}' role")]
    MissingMapping(String),

    #[error("Unknown chart kind: {0}")]
    InvalidChartKind(String),
}

impl ShapeError {
    pub fn code(&self) -> &'static str {
        match self {
            ShapeError::MissingMapping(_) => "MissingMapping",
            ShapeError::InvalidChartKind(_) => "InvalidChartKind",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ChartKind {
    Bar,
    Line,
    Pie,
    Doughnut,
    Scatter,
    Radar,
}

type ShapeFn = fn(&[Row], &ChartSpec) -> Result<ChartData, ShapeError>;

impl ChartKind {
    pub const ALL: [ChartKind; 6] = [
        ChartKind::Bar,
        ChartKind::Line,
        ChartKind::Pie,
        ChartKind::Doughnut,
        ChartKind::Scatter,
        ChartKind::Radar,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChartKind::Bar => "bar",
            ChartKind::Line => "line",
            ChartKind::Pie => "pie",
            ChartKind::Doughnut => "doughnut",
            ChartKind::Scatter => "scatter",
            ChartKind::Radar => "radar",
        }
    }

    /// Roles that must be mapped to a column before rows can be shaped
    pub fn required_roles(&self) -> &'static [&'static str] {
        match self {
            ChartKind::Bar | ChartKind::Line | ChartKind::Scatter => &["x", "y"],
            ChartKind::Pie | ChartKind::Doughnut | ChartKind::Radar => &["labels", "values"],
        }
    }

    pub fn optional_roles(&self) -> &'static [&'static str] {
        match self {
            ChartKind::Bar | ChartKind::Line => &["color"],
            ChartKind::Pie | ChartKind::Doughnut => &[],
            ChartKind::Scatter => &["size", "color"],
            ChartKind::Radar => &["series"],
        }
    }

    fn shaper(&self) -> ShapeFn {
        match self {
            ChartKind::Bar => categorical::shape_bar,
            ChartKind::Line => categorical::shape_line,
            ChartKind::Pie | ChartKind::Doughnut => proportional::shape,
            ChartKind::Scatter => scatter::shape,
            ChartKind::Radar => radar::shape,
        }
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ChartKind {
    type Err = ShapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        ChartKind::ALL
            .into_iter()
            .find(|kind| kind.name() == lowered)
            .ok_or_else(|| ShapeError::InvalidChartKind(s.to_string()))
    }
}

impl TryFrom<String> for ChartKind {
    type Error = ShapeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Chart kind plus the role to column mapping used to read rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub mappings: BTreeMap<String, String>,
    /// Aggregate applied per role when the shaper groups rows itself
    #[serde(default)]
    pub aggregation: BTreeMap<String, AggregateFunction>,
    /// Rows already come from a SQL-level group-by
    #[serde(default)]
    pub pre_aggregated: bool,
}

impl ChartSpec {
    pub fn new(kind: ChartKind) -> Self {
        ChartSpec {
            kind,
            mappings: BTreeMap::new(),
            aggregation: BTreeMap::new(),
            pre_aggregated: false,
        }
    }

    pub fn map(mut self, role: &str, column: &str) -> Self {
        self.mappings.insert(role.to_string(), column.to_string());
        self
    }

    pub fn aggregate(mut self, role: &str, function: AggregateFunction) -> Self {
        self.aggregation.insert(role.to_string(), function);
        self
    }

    pub fn pre_aggregated(mut self, pre_aggregated: bool) -> Self {
        self.pre_aggregated = pre_aggregated;
        self
    }

    /// Column mapped to `role`; blank mappings count as absent
    pub fn column(&self, role: &str) -> Option<&str> {
        self.mappings
            .get(role)
            .map(|c| c.as_str())
            .filter(|c| !c.trim().is_empty())
    }

    fn required(&self, role: &str) -> Result<&str, ShapeError> {
        self.column(role)
            .ok_or_else(|| ShapeError::MissingMapping(role.to_string()))
    }

    /// Aggregate the shaper should apply for `role`, if it has to group at all
    fn aggregation_for(&self, role: &str) -> Option<AggregateFunction> {
        if self.pre_aggregated {
            None
        } else {
            self.aggregation.get(role).copied()
        }
    }

    fn missing_role(&self) -> Option<&'static str> {
        self.kind
            .required_roles()
            .iter()
            .copied()
            .find(|role| self.column(role).is_none())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScatterPoint {
    pub x: f64,
    pub y: f64,
    pub r: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SeriesData {
    Scalars(Vec<Option<f64>>),
    Points(Vec<ScatterPoint>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub label: String,
    pub data: SeriesData,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub background_color: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub border_color: Option<String>,
}

impl Dataset {
    fn scalars(label: &str, data: Vec<Option<f64>>) -> Self {
        Dataset {
            label: label.to_string(),
            data: SeriesData::Scalars(data),
            background_color: Vec::new(),
            border_color: None,
        }
    }

    fn points(label: &str, points: Vec<ScatterPoint>) -> Self {
        Dataset {
            label: label.to_string(),
            data: SeriesData::Points(points),
            background_color: Vec::new(),
            border_color: None,
        }
    }

    /// One palette color for the whole series
    fn colored(mut self, index: usize) -> Self {
        let color = palette::color(index).to_string();
        self.background_color = vec![color.clone()];
        self.border_color = Some(color);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChartData {
    pub labels: Vec<String>,
    pub datasets: Vec<Dataset>,
}

/// Shape `rows` for `spec.kind`.
///
/// Returns `ShapeError::MissingMapping` naming the first required role without
/// a column. An empty row set short-circuits to empty output before that check.
pub fn shape(rows: &[Row], spec: &ChartSpec) -> Result<ChartData, ShapeError> {
    if rows.is_empty() {
        return Ok(ChartData::default());
    }
    if let Some(role) = spec.missing_role() {
        return Err(ShapeError::MissingMapping(role.to_string()));
    }

    let data = (spec.kind.shaper())(rows, spec)?;
    debug!(
        "Shaped {} rows into {} chart: {} labels, {} datasets",
        rows.len(),
        spec.kind,
        data.labels.len(),
        data.datasets.len()
    );
    Ok(data)
}

fn cell<'r>(row: &'r Row, column: &str) -> &'r Value {
    row.get(column).unwrap_or(&Value::Null)
}

fn numeric(row: &Row, column: &str) -> Option<f64> {
    cell(row, column).as_f64()
}

/// A distinct category value with its numeric reading, used for ordering
#[derive(Debug, Clone)]
struct Category {
    label: String,
    number: Option<f64>,
}

impl Category {
    fn of(value: &Value) -> Self {
        Category {
            label: value.to_string(),
            number: value.as_f64(),
        }
    }
}

/// Numbers ascending first, then everything else by label
fn compare_categories(a: &Category, b: &Category) -> Ordering {
    match (a.number, b.number) {
        (Some(l), Some(r)) => l.total_cmp(&r),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.label.cmp(&b.label),
    }
}

/// Combine every value observed for one cell
fn combine(values: &[Option<f64>], aggregation: Option<AggregateFunction>) -> Option<f64> {
    match aggregation {
        Some(function) => {
            let numeric: Vec<f64> = values.iter().flatten().copied().collect();
            function.reduce(&numeric)
        }
        None => values.first().copied().flatten(),
    }
}

/// Values collected per (series, category), both keyed in first-seen order
#[derive(Debug, Default)]
struct Pivot {
    categories: Vec<Category>,
    category_index: HashMap<String, usize>,
    series: Vec<String>,
    series_index: HashMap<String, usize>,
    cells: HashMap<(usize, usize), Vec<Option<f64>>>,
}

impl Pivot {
    fn add(&mut self, category: &Value, series: String, value: Option<f64>) {
        let category = Category::of(category);
        let c = match self.category_index.get(&category.label) {
            Some(&index) => index,
            None => {
                let index = self.categories.len();
                self.category_index.insert(category.label.clone(), index);
                self.categories.push(category);
                index
            }
        };
        let s = match self.series_index.get(&series) {
            Some(&index) => index,
            None => {
                let index = self.series.len();
                self.series_index.insert(series.clone(), index);
                self.series.push(series);
                index
            }
        };
        self.cells.entry((s, c)).or_default().push(value);
    }

    /// Category positions in emit order
    fn order(&self, sorted: bool) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.categories.len()).collect();
        if sorted {
            order.sort_by(|&a, &b| compare_categories(&self.categories[a], &self.categories[b]));
        }
        order
    }

    fn labels(&self, order: &[usize]) -> Vec<String> {
        order
            .iter()
            .map(|&c| self.categories[c].label.clone())
            .collect()
    }

    /// One series aligned to `order`; cells never observed get `missing`
    fn series_values(
        &self,
        series: usize,
        order: &[usize],
        aggregation: Option<AggregateFunction>,
        missing: Option<f64>,
    ) -> Vec<Option<f64>> {
        order
            .iter()
            .map(|&c| match self.cells.get(&(series, c)) {
                Some(values) => combine(values, aggregation),
                None => missing,
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rstest::*;
    use std::sync::Arc;

    /// Rows over `columns`, one per tuple of values
    pub(crate) fn rows(columns: &[&str], values: Vec<Vec<Value>>) -> Vec<Row> {
        let columns: Arc<[String]> = columns.iter().map(|c| c.to_string()).collect();
        values
            .into_iter()
            .map(|row| Row::new(Arc::clone(&columns), row))
            .collect()
    }

    pub(crate) fn scalars(data: &ChartData, index: usize) -> &[Option<f64>] {
        match &data.datasets[index].data {
            SeriesData::Scalars(values) => values,
            SeriesData::Points(_) => panic!("expected scalar series"),
        }
    }

    #[rstest]
    #[case::bar(ChartKind::Bar)]
    #[case::line(ChartKind::Line)]
    #[case::pie(ChartKind::Pie)]
    #[case::doughnut(ChartKind::Doughnut)]
    #[case::scatter(ChartKind::Scatter)]
    #[case::radar(ChartKind::Radar)]
    fn test_empty_rows_yield_empty_chart(#[case] kind: ChartKind) {
        let data = shape(&[], &ChartSpec::new(kind)).unwrap();
        assert_eq!(data, ChartData::default());
        assert_eq!(
            serde_json::to_string(&data).unwrap(),
            r#"{"labels":[],"datasets":[]}"#
        );
    }

    #[rstest]
    #[case::bar(ChartSpec::new(ChartKind::Bar).map("x", "name"), "y")]
    #[case::pie(ChartSpec::new(ChartKind::Pie).map("values", "count"), "labels")]
    #[case::scatter(ChartSpec::new(ChartKind::Scatter).map("y", "income").map("x", " "), "x")]
    #[case::radar(ChartSpec::new(ChartKind::Radar).map("series", "team"), "labels")]
    fn test_missing_role_is_named(#[case] spec: ChartSpec, #[case] role: &str) {
        let rows = rows(&["name"], vec![vec!["a".into()]]);
        assert_eq!(
            shape(&rows, &spec),
            Err(ShapeError::MissingMapping(role.to_string()))
        );
    }

    #[test]
    fn test_chart_kind_parsing() {
        assert_eq!("Doughnut".parse::<ChartKind>(), Ok(ChartKind::Doughnut));
        assert_eq!(
            "heatmap".parse::<ChartKind>(),
            Err(ShapeError::InvalidChartKind("heatmap".to_string()))
        );
        assert!(serde_json::from_str::<ChartKind>(r#""radar""#).is_ok());
        assert!(serde_json::from_str::<ChartKind>(r#""gantt""#).is_err());
    }

    #[test]
    fn test_chart_spec_from_json() {
        let spec: ChartSpec = serde_json::from_str(
            r#"{
                "kind": "bar",
                "mappings": {"x": "region", "y": "revenue"},
                "aggregation": {"y": "sum"},
                "preAggregated": true
            }"#,
        )
        .unwrap();
        assert_eq!(
            spec,
            ChartSpec::new(ChartKind::Bar)
                .map("x", "region")
                .map("y", "revenue")
                .aggregate("y", AggregateFunction::Sum)
                .pre_aggregated(true)
        );
        assert_eq!(spec.aggregation_for("y"), None);
    }

    #[test]
    fn test_category_order_is_total() {
        let mut categories: Vec<Category> = ["b", "10", "a", "2", "-1.5"]
            .into_iter()
            .map(|s| Category::of(&Value::from(s)))
            .collect();
        categories.sort_by(compare_categories);
        let labels: Vec<&str> = categories.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["-1.5", "2", "10", "a", "b"]);
    }

    #[rstest]
    #[case::first_wins(None, Some(4.0))]
    #[case::sum(Some(AggregateFunction::Sum), Some(10.0))]
    #[case::count_skips_text(Some(AggregateFunction::Count), Some(2.0))]
    fn test_combine(#[case] aggregation: Option<AggregateFunction>, #[case] expected: Option<f64>) {
        assert_eq!(combine(&[Some(4.0), None, Some(6.0)], aggregation), expected);
    }

    #[test]
    fn test_shaping_is_deterministic() {
        let rows = rows(
            &["team", "skill", "score"],
            vec![
                vec!["red".into(), "speed".into(), 3i64.into()],
                vec!["blue".into(), "power".into(), 5i64.into()],
                vec!["green".into(), "speed".into(), 1i64.into()],
                vec!["red".into(), "power".into(), 2i64.into()],
            ],
        );
        let spec = ChartSpec::new(ChartKind::Radar)
            .map("labels", "skill")
            .map("values", "score")
            .map("series", "team");
        let first = serde_json::to_vec(&shape(&rows, &spec).unwrap()).unwrap();
        let second = serde_json::to_vec(&shape(&rows, &spec).unwrap()).unwrap();
        assert_eq!(first, second);
    }
}
