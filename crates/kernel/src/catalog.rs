//! The closed list of formula/escape-mode combinations built at startup.
//!
//! Formulas are WGSL expressions evaluated once per iteration. In scope:
//! `z` (current iterate), `Z` (the pixel's complex coordinate), `c` (the
//! cursor's complex coordinate), `p0`/`p1` (control points) and `ONE`, plus
//! the complex helpers `cmul`, `cdiv`, `cexp`, `csin` and `ccos`.

use serde::Serialize;

use crate::params::ParameterLayout;

/// One catalog entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VariantSpec {
    pub name: String,
    pub formula: String,
    pub uses_escape_iteration: bool,
    pub layout: ParameterLayout,
}

impl VariantSpec {
    pub fn new(
        name: impl Into<String>,
        formula: impl Into<String>,
        uses_escape_iteration: bool,
    ) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
            uses_escape_iteration,
            layout: ParameterLayout::Viewport,
        }
    }

    pub fn with_layout(mut self, layout: ParameterLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn mode(&self) -> &'static str {
        if self.uses_escape_iteration {
            "escape"
        } else {
            "fixed"
        }
    }

    /// `name/mode`, used in logs and pipeline labels.
    pub fn label(&self) -> String {
        format!("{}/{}", self.name, self.mode())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FormulaCatalog {
    entries: Vec<VariantSpec>,
}

impl FormulaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newton, Julia and Mandelbrot formulas with their usual escape modes,
    /// followed by one control-point cubic.
    pub fn standard() -> Self {
        let entries = vec![
            VariantSpec::new(
                "newton-cubic",
                "z - cmul(c, cdiv(cmul(cmul(z, z), z) - ONE, 3.0 * cmul(z, z)))",
                true,
            ),
            VariantSpec::new("newton-reciprocal", "z - cmul(c, 0.5 * z + cdiv(ONE, z))", false),
            VariantSpec::new("newton-cosine", "z - cmul(c, cdiv(ccos(z), -csin(z)))", true),
            VariantSpec::new("julia", "cmul(z, z) + c", true),
            VariantSpec::new("mandelbrot", "cmul(z, z) + Z", true),
            VariantSpec::new("cubic-control", "cmul(cmul(z, z), z) + cmul(p0, z) + p1", true)
                .with_layout(ParameterLayout::ControlPoints { count: 2 }),
        ];
        Self { entries }
    }

    /// Every distinct formula paired with both escape modes, escape first.
    pub fn with_both_escape_modes(&self) -> Self {
        let mut entries: Vec<VariantSpec> = Vec::with_capacity(self.entries.len() * 2);
        for spec in &self.entries {
            for escape in [true, false] {
                let exists = entries.iter().any(|existing| {
                    existing.formula == spec.formula && existing.uses_escape_iteration == escape
                });
                if !exists {
                    entries.push(VariantSpec {
                        uses_escape_iteration: escape,
                        ..spec.clone()
                    });
                }
            }
        }
        Self { entries }
    }

    pub fn push(&mut self, spec: VariantSpec) {
        self.entries.push(spec);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|spec| spec.name == name)
    }

    pub fn entries(&self) -> &[VariantSpec] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, VariantSpec> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a FormulaCatalog {
    type Item = &'a VariantSpec;
    type IntoIter = std::slice::Iter<'a, VariantSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Wrap-around position in a list of `len` variants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VariantCursor {
    index: usize,
    len: usize,
}

impl VariantCursor {
    pub fn new(len: usize) -> Self {
        Self { index: 0, len }
    }

    /// Starts at `index % len`.
    pub fn starting_at(index: usize, len: usize) -> Self {
        Self {
            index: wrap_index(index, len).unwrap_or(0),
            len,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn next(&mut self) -> usize {
        if self.len > 0 {
            self.index = (self.index + 1) % self.len;
        }
        self.index
    }

    pub fn previous(&mut self) -> usize {
        if self.len > 0 {
            self.index = (self.index + self.len - 1) % self.len;
        }
        self.index
    }
}

/// `index % len`, or `None` for an empty list.
pub fn wrap_index(index: usize, len: usize) -> Option<usize> {
    (len > 0).then(|| index % len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_keeps_declaration_order() {
        let catalog = FormulaCatalog::standard();
        let names: Vec<_> = catalog.iter().map(|spec| spec.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "newton-cubic",
                "newton-reciprocal",
                "newton-cosine",
                "julia",
                "mandelbrot",
                "cubic-control"
            ]
        );
        assert!(!catalog.entries()[1].uses_escape_iteration);
        assert!(catalog.contains("julia"));
        assert!(!catalog.contains("julia/escape"));
        assert_eq!(
            catalog.entries()[5].layout,
            ParameterLayout::ControlPoints { count: 2 }
        );
    }

    #[test]
    fn both_modes_is_the_full_product() {
        let catalog = FormulaCatalog::standard().with_both_escape_modes();
        assert_eq!(catalog.len(), 12);
        assert_eq!(catalog.entries()[0].label(), "newton-cubic/escape");
        assert_eq!(catalog.entries()[1].label(), "newton-cubic/fixed");
        assert_eq!(catalog.entries()[11].layout, ParameterLayout::ControlPoints { count: 2 });
    }

    #[test]
    fn both_modes_skips_duplicate_pairs() {
        let mut catalog = FormulaCatalog::new();
        catalog.push(VariantSpec::new("a", "cmul(z, z) + c", true));
        catalog.push(VariantSpec::new("b", "cmul(z, z) + c", false));
        assert_eq!(catalog.with_both_escape_modes().len(), 2);
    }

    #[test]
    fn cursor_wraps_both_ways() {
        let mut cursor = VariantCursor::new(3);
        assert_eq!(cursor.previous(), 2);
        assert_eq!(cursor.next(), 0);
        assert_eq!(cursor.next(), 1);
        assert_eq!(VariantCursor::starting_at(7, 3).index(), 1);
    }

    #[test]
    fn empty_cursor_stays_put() {
        let mut cursor = VariantCursor::new(0);
        assert_eq!(cursor.next(), 0);
        assert_eq!(cursor.previous(), 0);
        assert_eq!(wrap_index(4, 0), None);
        assert_eq!(wrap_index(4, 3), Some(1));
    }
}
