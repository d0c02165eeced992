//! Pie and doughnut charts: a single dataset with one palette color per slice.

use super::{cell, numeric, palette, ChartData, ChartSpec, Dataset, Pivot, ShapeError};
use crate::data_store::Row;

pub(super) fn shape(rows: &[Row], spec: &ChartSpec) -> Result<ChartData, ShapeError> {
    let labels_column = spec.required("labels")?;
    let values_column = spec.required("values")?;

    let (labels, values) = match spec.aggregation_for("values") {
        Some(aggregation) => {
            let mut pivot = Pivot::default();
            for row in rows {
                pivot.add(
                    cell(row, labels_column),
                    values_column.to_string(),
                    numeric(row, values_column),
                );
            }
            let order = pivot.order(false);
            let values = pivot.series_values(0, &order, Some(aggregation), None);
            (pivot.labels(&order), values)
        }
        None => rows
            .iter()
            .map(|row| {
                (
                    cell(row, labels_column).to_string(),
                    numeric(row, values_column),
                )
            })
            .unzip(),
    };

    let mut dataset = Dataset::scalars(values_column, values);
    dataset.background_color = palette::colors(labels.len());

    Ok(ChartData {
        labels,
        datasets: vec![dataset],
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::{rows, scalars};
    use super::super::{palette, shape, ChartKind, ChartSpec};
    use crate::data_store::Value;
    use crate::sql_parser::AggregateFunction;
    use rstest::*;
    use std::collections::HashSet;

    #[rstest]
    #[case::pie(ChartKind::Pie)]
    #[case::doughnut(ChartKind::Doughnut)]
    fn test_slices_get_distinct_colors(#[case] kind: ChartKind) {
        let rows = rows(
            &["region", "count"],
            vec![
                vec!["East".into(), 5i64.into()],
                vec!["West".into(), 15i64.into()],
            ],
        );
        let spec = ChartSpec::new(kind).map("labels", "region").map("values", "count");
        let data = shape(&rows, &spec).unwrap();

        assert_eq!(data.labels, vec!["East", "West"]);
        assert_eq!(data.datasets.len(), 1);
        assert_eq!(scalars(&data, 0), &[Some(5.0), Some(15.0)]);
        let colors = &data.datasets[0].background_color;
        assert_eq!(colors.len(), 2);
        assert_eq!(colors.iter().collect::<HashSet<_>>().len(), 2);
        assert_eq!(colors[0], palette::color(0));
    }

    #[test]
    fn test_colors_cycle_past_palette_size() {
        let values: Vec<Vec<Value>> = (0..12i64)
            .map(|i| vec![format!("slice {}", i).into(), i.into()])
            .collect();
        let rows = rows(&["name", "share"], values);
        let spec = ChartSpec::new(ChartKind::Pie).map("labels", "name").map("values", "share");
        let data = shape(&rows, &spec).unwrap();
        let colors = &data.datasets[0].background_color;
        assert_eq!(colors.len(), 12);
        assert_eq!(colors[10], colors[0]);
        assert_eq!(colors[11], colors[1]);
    }

    #[test]
    fn test_aggregation_merges_repeated_labels() {
        let rows = rows(
            &["category", "amount"],
            vec![
                vec!["food".into(), 2i64.into()],
                vec!["rent".into(), 10i64.into()],
                vec!["food".into(), 3i64.into()],
            ],
        );
        let spec = ChartSpec::new(ChartKind::Doughnut)
            .map("labels", "category")
            .map("values", "amount")
            .aggregate("values", AggregateFunction::Sum);
        let data = shape(&rows, &spec).unwrap();
        assert_eq!(data.labels, vec!["food", "rent"]);
        assert_eq!(scalars(&data, 0), &[Some(5.0), Some(10.0)]);
        assert_eq!(data.datasets[0].background_color.len(), 2);
    }
}
