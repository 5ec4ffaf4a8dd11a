//! Foreign-key ordered migration plan.
//!
//! Tables are nodes and every foreign key adds an edge from the referenced
//! table to the referencing one. Strongly connected components are collapsed
//! so a reference cycle becomes a single node, then a Kahn traversal emits
//! the condensed graph. Among tables that are ready at the same time the
//! configured priority decides, then the name, so the order is stable across
//! runs.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::algo;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::schema::Table;

/// Ordered list of tables to copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Every referenced table precedes its referencing tables, except inside
    /// a cycle.
    order: Vec<String>,

    /// Groups of tables whose parents all sit in earlier groups.
    levels: Vec<Vec<String>>,

    /// Reference cycles that had to be broken.
    cycles: Vec<Vec<String>>,
}

impl MigrationPlan {
    /// Build a plan from table descriptors.
    ///
    /// Views are ignored. References to tables outside the set are ignored.
    pub fn build(tables: &[Table], priority: &[String]) -> Self {
        let rank = |name: &str| -> (usize, String) {
            let pos = priority
                .iter()
                .position(|p| p == name)
                .unwrap_or(priority.len());
            (pos, name.to_string())
        };

        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
        for table in tables.iter().filter(|t| t.is_migratable()) {
            let idx = graph.add_node(table.name.clone());
            nodes.insert(table.name.as_str(), idx);
        }
        for table in tables.iter().filter(|t| t.is_migratable()) {
            for parent in table.referenced_tables() {
                if let (Some(&from), Some(&to)) = (nodes.get(parent), nodes.get(table.name.as_str()))
                {
                    graph.update_edge(from, to, ());
                }
            }
        }

        let mut condensed = algo::condensation(graph, true);
        for members in condensed.node_weights_mut() {
            members.sort_by_key(|name| rank(name.as_str()));
        }

        let mut cycles = Vec::new();
        for members in condensed.node_weights() {
            if members.len() > 1 {
                warn!(
                    "Foreign-key cycle between {:?}; ordering by priority",
                    members
                );
                cycles.push(members.clone());
            }
        }

        let mut in_degree: HashMap<NodeIndex, usize> = condensed
            .node_indices()
            .map(|n| (n, condensed.neighbors_directed(n, Direction::Incoming).count()))
            .collect();
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();

        let mut ready = BinaryHeap::new();
        for (&node, &deg) in &in_degree {
            if deg == 0 {
                ready.push(Reverse((rank(condensed[node][0].as_str()), node)));
                depth.insert(node, 0);
            }
        }

        let mut order = Vec::new();
        let mut levels: Vec<Vec<String>> = Vec::new();
        while let Some(Reverse((_, node))) = ready.pop() {
            let level = depth.get(&node).copied().unwrap_or(0);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            for name in &condensed[node] {
                order.push(name.clone());
                levels[level].push(name.clone());
            }

            let children: Vec<NodeIndex> = condensed
                .neighbors_directed(node, Direction::Outgoing)
                .collect();
            for child in children {
                let child_depth = depth.entry(child).or_insert(0);
                *child_depth = (*child_depth).max(level + 1);
                if let Some(deg) = in_degree.get_mut(&child) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse((rank(condensed[child][0].as_str()), child)));
                    }
                }
            }
        }

        Self {
            order,
            levels,
            cycles,
        }
    }

    /// Tables in copy order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Dependency levels for concurrent copy.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Reference cycles found while planning.
    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }

    /// Number of planned tables.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the plan is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Position of a table in the order.
    pub fn position(&self, table: &str) -> Option<usize> {
        self.order.iter().position(|t| t == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{ForeignKey, TableKind};

    fn table(name: &str, refs: &[&str]) -> Table {
        let mut t = Table::new(name, TableKind::Table);
        t.foreign_keys = refs
            .iter()
            .enumerate()
            .map(|(i, r)| ForeignKey {
                id: i as i64,
                columns: vec![format!("{}_id", r)],
                ref_table: r.to_string(),
                ref_columns: vec!["id".to_string()],
                on_delete: "NO ACTION".to_string(),
                on_update: "NO ACTION".to_string(),
            })
            .collect();
        t
    }

    fn app_tables() -> Vec<Table> {
        vec![
            table("payments", &["orders"]),
            table("order_items", &["orders", "slippers"]),
            table("orders", &["users"]),
            table("cart_items", &["carts", "slippers"]),
            table("carts", &["users"]),
            table("slipper_images", &["slippers"]),
            table("slippers", &["categories"]),
            table("users", &[]),
            table("categories", &[]),
        ]
    }

    fn priority() -> Vec<String> {
        crate::config::MigrationConfig::default().table_priority
    }

    #[test]
    fn test_parents_precede_children() {
        let tables = app_tables();
        let plan = MigrationPlan::build(&tables, &priority());
        assert_eq!(plan.len(), 9);
        for t in &tables {
            let pos = plan.position(&t.name).unwrap();
            for parent in t.referenced_tables() {
                assert!(plan.position(parent).unwrap() < pos, "{} before {}", parent, t.name);
            }
        }
        assert!(plan.cycles().is_empty());
    }

    #[test]
    fn test_priority_breaks_ties() {
        let plan = MigrationPlan::build(&app_tables(), &priority());
        assert_eq!(&plan.order()[..2], &["categories".to_string(), "users".to_string()]);
    }

    #[test]
    fn test_no_foreign_keys_uses_priority() {
        let tables: Vec<Table> = ["payments", "users", "orders", "zzz_extra", "categories"]
            .iter()
            .map(|n| table(n, &[]))
            .collect();
        let plan = MigrationPlan::build(&tables, &priority());
        assert_eq!(
            plan.order(),
            &["categories", "users", "orders", "payments", "zzz_extra"]
        );
        assert_eq!(plan.levels().len(), 1);
    }

    #[test]
    fn test_cycle_is_broken_deterministically() {
        let tables = vec![
            table("a", &["b"]),
            table("b", &["a"]),
            table("c", &["a"]),
            table("root", &[]),
        ];
        let plan = MigrationPlan::build(&tables, &[]);
        assert_eq!(plan.cycles(), &[vec!["a".to_string(), "b".to_string()]]);
        assert_eq!(plan.order(), &["a", "b", "c", "root"]);

        let again = MigrationPlan::build(&tables, &[]);
        assert_eq!(plan, again);
    }

    #[test]
    fn test_levels_group_independent_tables() {
        let plan = MigrationPlan::build(&app_tables(), &priority());
        let levels = plan.levels();
        assert_eq!(levels[0], vec!["categories".to_string(), "users".to_string()]);
        assert!(levels[1].contains(&"slippers".to_string()));
        assert!(levels[1].contains(&"carts".to_string()));
        assert!(levels[1].contains(&"orders".to_string()));
        let last = levels.last().unwrap();
        assert!(last.contains(&"order_items".to_string()) || last.contains(&"cart_items".to_string()));
    }

    #[test]
    fn test_views_and_self_references_ignored() {
        let mut view = Table::new("v_sales", TableKind::View);
        view.foreign_keys = vec![];
        let tables = vec![table("categories", &["categories"]), view];
        let plan = MigrationPlan::build(&tables, &[]);
        assert_eq!(plan.order(), &["categories"]);
        assert!(plan.cycles().is_empty());
    }
}
