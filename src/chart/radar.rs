//! Radar charts: every series is aligned to the union of observed labels.

use super::{cell, numeric, ChartData, ChartSpec, Dataset, Pivot, ShapeError};
use crate::data_store::Row;

pub(super) fn shape(rows: &[Row], spec: &ChartSpec) -> Result<ChartData, ShapeError> {
    let labels_column = spec.required("labels")?;
    let values_column = spec.required("values")?;
    let series_column = spec.column("series");
    let aggregation = spec.aggregation_for("values");

    let mut pivot = Pivot::default();
    for row in rows {
        let series = match series_column {
            Some(column) => cell(row, column).to_string(),
            None => values_column.to_string(),
        };
        pivot.add(cell(row, labels_column), series, numeric(row, values_column));
    }

    let order = pivot.order(false);
    let datasets = pivot
        .series
        .iter()
        .enumerate()
        .map(|(index, label)| {
            let values = pivot.series_values(index, &order, aggregation, Some(0.0));
            Dataset::scalars(label, values).colored(index)
        })
        .collect();

    Ok(ChartData {
        labels: pivot.labels(&order),
        datasets,
    })
}
