//! The JSON report shape emitted at the end of an analysis run. A
//! thin serde layer; all the actual analytical content lives in
//! [`crate::driver`].

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct SimilarEntry {
    pub path: String,
    pub similarity: u32,
}

#[derive(Debug, Serialize, Default)]
pub struct Report {
    pub duplicates: Vec<Vec<String>>,
    pub similars: std::collections::BTreeMap<String, Vec<SimilarEntry>>,
}

impl Report {
    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
