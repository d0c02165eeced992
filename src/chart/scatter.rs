//! Scatter charts: `{x, y, r}` points, one dataset per color value.

use super::{cell, numeric, ChartData, ChartSpec, Dataset, ScatterPoint, ShapeError};
use crate::data_store::Row;
use log::debug;
use std::collections::HashMap;

/// Radius used when no size column is mapped or its value is not numeric
pub const DEFAULT_RADIUS: f64 = 5.0;
const SIZE_DIVISOR: f64 = 10.0;
const MIN_RADIUS: f64 = 2.0;

fn radius(size: Option<f64>) -> f64 {
    match size {
        Some(size) => (size / SIZE_DIVISOR).max(MIN_RADIUS),
        None => DEFAULT_RADIUS,
    }
}

pub(super) fn shape(rows: &[Row], spec: &ChartSpec) -> Result<ChartData, ShapeError> {
    let x = spec.required("x")?;
    let y = spec.required("y")?;
    let size = spec.column("size");
    let color = spec.column("color");

    let mut series: Vec<(String, Vec<ScatterPoint>)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut dropped = 0;

    for row in rows {
        let (Some(px), Some(py)) = (numeric(row, x), numeric(row, y)) else {
            dropped += 1;
            continue;
        };
        let point = ScatterPoint {
            x: px,
            y: py,
            r: radius(size.and_then(|size| numeric(row, size))),
        };

        let key = match color {
            Some(color) => cell(row, color).to_string(),
            None => format!("{} vs {}", y, x),
        };
        let index = *positions.entry(key.clone()).or_insert_with(|| {
            series.push((key, Vec::new()));
            series.len() - 1
        });
        series[index].1.push(point);
    }

    if dropped > 0 {
        debug!("Dropped {} scatter rows with non-numeric coordinates", dropped);
    }

    let datasets = series
        .into_iter()
        .enumerate()
        .map(|(index, (label, points))| Dataset::points(&label, points).colored(index))
        .collect();

    Ok(ChartData {
        labels: Vec::new(),
        datasets,
    })
}
