//! Knowledge-graph rendering of the supersede DAG.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::memory::Memory;

impl Memory {
    /// Render the knowledge evolution graph as Mermaid `graph TD`.
    ///
    /// Edges point from a superseded record to its successor. An optional
    /// target filter narrows the graph to one subject key.
    pub fn generate_knowledge_graph(&self, target: Option<&str>) -> Result<String> {
        let rows = self.semantic().meta.list_all()?;

        let mut nodes: BTreeMap<String, (String, String)> = BTreeMap::new();
        let mut edges: Vec<(String, String)> = Vec::new();

        for row in &rows {
            if let Some(filter) = target {
                if row.target != filter {
                    continue;
                }
            }
            let label = if row.title.is_empty() {
                row.target.clone()
            } else {
                row.title.clone()
            };
            nodes.insert(row.fid.clone(), (label, row.status.clone()));
            if let Some(successor) = &row.superseded_by {
                edges.push((row.fid.clone(), successor.clone()));
            }
        }

        let mut out = String::from("graph TD\n");
        for (fid, (label, status)) in &nodes {
            let id = mermaid_id(fid);
            let label = label.replace('"', "'");
            out.push_str(&format!("    {id}[\"{label} ({status})\"]\n"));
        }
        for (from, to) in &edges {
            // Edges to records outside the filter still render their stub
            if !nodes.contains_key(to) {
                out.push_str(&format!("    {}[\"{}\"]\n", mermaid_id(to), to));
            }
            out.push_str(&format!(
                "    {} -->|superseded by| {}\n",
                mermaid_id(from),
                mermaid_id(to)
            ));
        }
        for (fid, (_label, status)) in &nodes {
            if status == "active" {
                out.push_str(&format!(
                    "    style {} fill:#2e7d32,color:#fff\n",
                    mermaid_id(fid)
                ));
            }
        }
        Ok(out)
    }
}

fn mermaid_id(fid: &str) -> String {
    fid.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
