//! Bar and line charts: one label per x value, one dataset per color.

use super::{
    cell, compare_categories, numeric, Category, ChartData, ChartSpec, Dataset, Pivot, ShapeError,
};
use crate::data_store::Row;

pub(super) fn shape_bar(rows: &[Row], spec: &ChartSpec) -> Result<ChartData, ShapeError> {
    shape_categorical(rows, spec, false)
}

/// Line charts emit their x values in ascending order
pub(super) fn shape_line(rows: &[Row], spec: &ChartSpec) -> Result<ChartData, ShapeError> {
    shape_categorical(rows, spec, true)
}

fn shape_categorical(rows: &[Row], spec: &ChartSpec, sorted: bool) -> Result<ChartData, ShapeError> {
    let x = spec.required("x")?;
    let y = spec.required("y")?;
    let color = spec.column("color");
    let aggregation = spec.aggregation_for("y");

    if aggregation.is_none() && color.is_none() {
        return Ok(row_per_label(rows, x, y, sorted));
    }

    let mut pivot = Pivot::default();
    for row in rows {
        let series = match color {
            Some(color) => cell(row, color).to_string(),
            None => y.to_string(),
        };
        pivot.add(cell(row, x), series, numeric(row, y));
    }

    let order = pivot.order(sorted);
    let datasets = pivot
        .series
        .iter()
        .enumerate()
        .map(|(index, label)| {
            let values = pivot.series_values(index, &order, aggregation, None);
            Dataset::scalars(label, values).colored(index)
        })
        .collect();

    Ok(ChartData {
        labels: pivot.labels(&order),
        datasets,
    })
}

/// Rows as-is: every row contributes one label and one value
fn row_per_label(rows: &[Row], x: &str, y: &str, sorted: bool) -> ChartData {
    let mut points: Vec<(Category, Option<f64>)> = rows
        .iter()
        .map(|row| (Category::of(cell(row, x)), numeric(row, y)))
        .collect();
    if sorted {
        points.sort_by(|a, b| compare_categories(&a.0, &b.0));
    }

    let (labels, values): (Vec<String>, Vec<Option<f64>>) = points
        .into_iter()
        .map(|(category, value)| (category.label, value))
        .unzip();

    ChartData {
        labels,
        datasets: vec![Dataset::scalars(y, values).colored(0)],
    }
}
