//! Overpass QL generation from category filters

use super::filter::{TagFilter, TagValues};
use crate::types::{BoundingBox, Category};
use serde::{Deserialize, Serialize};

/// A category and the tag filter selecting its features
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFilter {
    /// Category (also the output layer name)
    pub category: Category,
    /// Features belonging to the category
    pub filter: TagFilter,
}

impl CategoryFilter {
    /// Pair a category with its filter
    pub fn new(category: impl Into<Category>, filter: TagFilter) -> Self {
        Self {
            category: category.into(),
            filter,
        }
    }
}

/// Quote a string literal for Overpass QL
fn ql_literal(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Tag selectors (`["key"]`, `["key"="v"]`, `["key"~"^(a|b)$"]`) for one filter entry
fn selectors(key: &str, values: &TagValues) -> Vec<String> {
    let key = ql_literal(key);
    match values {
        TagValues::Any => vec![format!("[{key}]")],
        TagValues::Values { exact, contains } => {
            let mut out = Vec::new();
            match exact.len() {
                0 => {}
                1 => {
                    if let Some(value) = exact.iter().next() {
                        out.push(format!("[{key}={}]", ql_literal(value)));
                    }
                }
                _ => {
                    let alternatives: Vec<String> =
                        exact.iter().map(|v| regex::escape(v)).collect();
                    let pattern = format!("^({})$", alternatives.join("|"));
                    out.push(format!("[{key}~{}]", ql_literal(&pattern)));
                }
            }
            for needle in contains {
                out.push(format!("[{key}~{}]", ql_literal(&regex::escape(needle))));
            }
            out
        }
    }
}

/// Compile filters into one Overpass QL union over `bbox`
///
/// Every selector is applied to nodes and ways; results are returned as XML
/// with metadata and inline geometry.
pub fn overpass_query(bbox: &BoundingBox, filters: &[CategoryFilter], timeout_secs: u32) -> String {
    let area = bbox.to_overpass();
    let mut statements: Vec<String> = Vec::new();

    for category in filters {
        for (key, values) in category.filter.entries() {
            for selector in selectors(key, values) {
                for element in ["node", "way"] {
                    let statement = format!("({element}{selector}({area}););");
                    if !statements.contains(&statement) {
                        statements.push(statement);
                    }
                }
            }
        }
    }

    format!(
        "[out:xml][timeout:{timeout_secs}];\n(\n{}\n);\nout meta geom;\n",
        statements.join("")
    )
}
