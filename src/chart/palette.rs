//! Fixed categorical palette (Tableau 10).

pub const TABLEAU10: [&str; 10] = [
    "#4e79a7", "#f28e2b", "#e15759", "#76b7b2", "#59a14f", "#edc948", "#b07aa1", "#ff9da7",
    "#9c755f", "#bab0ac",
];

/// Color for the `index`-th slice or series, cycling through the palette
pub fn color(index: usize) -> &'static str {
    TABLEAU10[index % TABLEAU10.len()]
}

pub fn colors(count: usize) -> Vec<String> {
    (0..count).map(|i| color(i).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_palette_has_no_repeats() {
        assert_eq!(TABLEAU10.iter().collect::<HashSet<_>>().len(), TABLEAU10.len());
    }

    #[test]
    fn test_color_cycles() {
        assert_eq!(color(0), color(10));
        assert_eq!(colors(3), vec!["#4e79a7", "#f28e2b", "#e15759"]);
    }
}
