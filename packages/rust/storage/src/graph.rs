//! Knowledge-graph edges between published rules.

use libsql::params;
use regtruth_shared::{EdgeKind, GraphEdge, RegTruthError, Result};

use crate::{Storage, get_parsed, get_string, get_ts};

impl Storage {
    /// Edges touching `rule_id` in either direction.
    pub async fn edges_for_rule(&self, rule_id: &str) -> Result<Vec<GraphEdge>> {
        let mut rows = self
            .conn
            .query(
                "SELECT from_rule, to_rule, kind, created_at FROM graph_edges
                 WHERE from_rule = ?1 OR to_rule = ?1 ORDER BY created_at",
                params![rule_id],
            )
            .await
            .map_err(RegTruthError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            results.push(GraphEdge {
                from_rule: get_string(&row, 0)?,
                to_rule: get_string(&row, 1)?,
                kind: get_parsed::<EdgeKind>(&row, 2)?,
                created_at: get_ts(&row, 3)?,
            });
        }
        Ok(results)
    }
}
