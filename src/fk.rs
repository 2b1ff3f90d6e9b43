//! FK dependency extraction and topological ordering.

use std::collections::{HashMap, HashSet, VecDeque};

use postgres::GenericClient;

use crate::error::IntegrityError;
use crate::table::Table;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FkDependency {
    pub child_schema: String,
    pub child_table: String,
    pub parent_schema: String,
    pub parent_table: String,
}

/// Reads the declared foreign keys over `tables` from the system catalogs.
/// Returns edges `child -> parent`; only edges where both ends are in
/// `tables` are returned (FKs pointing outside the merge set are not this
/// resolver's concern).
pub fn extract_dependencies<C: GenericClient>(
    client: &mut C,
    tables: &[Table],
) -> anyhow::Result<Vec<FkDependency>> {
    let wanted: HashSet<(String, String)> = tables
        .iter()
        .map(|t| (t.schema.clone().unwrap_or_else(|| "public".into()), t.name.clone()))
        .collect();

    let rows = client.query(
        "SELECT \
            cs.nspname AS child_schema, ct.relname AS child_table, \
            ps.nspname AS parent_schema, pt.relname AS parent_table \
         FROM pg_constraint con \
         JOIN pg_class ct ON ct.oid = con.conrelid \
         JOIN pg_namespace cs ON cs.oid = ct.relnamespace \
         JOIN pg_class pt ON pt.oid = con.confrelid \
         JOIN pg_namespace ps ON ps.oid = pt.relnamespace \
         WHERE con.contype = 'f'",
        &[],
    )?;

    let mut deps = Vec::new();
    for row in rows {
        let child_schema: String = row.get("child_schema");
        let child_table: String = row.get("child_table");
        let parent_schema: String = row.get("parent_schema");
        let parent_table: String = row.get("parent_table");
        if wanted.contains(&(child_schema.clone(), child_table.clone()))
            && wanted.contains(&(parent_schema.clone(), parent_table.clone()))
        {
            deps.push(FkDependency {
                child_schema,
                child_table,
                parent_schema,
                parent_table,
            });
        }
    }
    Ok(deps)
}

fn key(schema: &Option<String>, name: &str) -> String {
    format!("{}.{}", schema.as_deref().unwrap_or("public"), name)
}

/// Orders `tables` so every parent precedes its children (Kahn's
/// algorithm). Rejects cycles with an `IntegrityError::CircularDependency`
/// whose message contains "circular".
pub fn topological_sort(
    tables: &[Table],
    deps: &[FkDependency],
) -> Result<Vec<Table>, IntegrityError> {
    let mut indegree: HashMap<String, usize> = tables
        .iter()
        .map(|t| (key(&t.schema, &t.name), 0))
        .collect();
    let mut children: HashMap<String, Vec<String>> = HashMap::new();

    for dep in deps {
        let parent_key = format!("{}.{}", dep.parent_schema, dep.parent_table);
        let child_key = format!("{}.{}", dep.child_schema, dep.child_table);
        if !indegree.contains_key(&parent_key) || !indegree.contains_key(&child_key) {
            continue;
        }
        children.entry(parent_key.clone()).or_default().push(child_key.clone());
        *indegree.get_mut(&child_key).unwrap() += 1;
    }

    let by_key: HashMap<String, &Table> = tables.iter().map(|t| (key(&t.schema, &t.name), t)).collect();

    let mut queue: VecDeque<String> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(k, _)| k.clone())
        .collect();
    // Deterministic order among independent roots.
    let mut queue: Vec<String> = queue.drain(..).collect();
    queue.sort();
    let mut queue: VecDeque<String> = queue.into();

    let mut ordered = Vec::with_capacity(tables.len());
    let mut remaining_indegree = indegree.clone();

    while let Some(k) = queue.pop_front() {
        ordered.push((*by_key[&k]).clone());
        if let Some(kids) = children.get(&k) {
            let mut newly_free = Vec::new();
            for child in kids {
                let entry = remaining_indegree.get_mut(child).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    newly_free.push(child.clone());
                }
            }
            newly_free.sort();
            for k in newly_free {
                queue.push_back(k);
            }
        }
    }

    if ordered.len() != tables.len() {
        let cyclic: Vec<String> = remaining_indegree
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(k, _)| k)
            .collect();
        return Err(IntegrityError::CircularDependency(cyclic));
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(schema: &str, name: &str) -> Table {
        Table {
            schema: Some(schema.to_string()),
            name: name.to_string(),
        }
    }

    fn dep(child: &str, parent: &str) -> FkDependency {
        FkDependency {
            child_schema: "public".to_string(),
            child_table: child.to_string(),
            parent_schema: "public".to_string(),
            parent_table: parent.to_string(),
        }
    }

    #[test]
    fn parents_precede_children() {
        // A <- B <- C <- D (B depends on A, C on B, D on C)
        let tables = vec![t("public", "d"), t("public", "c"), t("public", "b"), t("public", "a")];
        let deps = vec![dep("b", "a"), dep("c", "b"), dep("d", "c")];
        let sorted = topological_sort(&tables, &deps).unwrap();
        let names: Vec<&str> = sorted.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn cycle_is_rejected_with_circular_in_message() {
        let tables = vec![t("public", "a"), t("public", "b"), t("public", "c")];
        let deps = vec![dep("b", "a"), dep("c", "b"), dep("a", "c")];
        let err = topological_sort(&tables, &deps).unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn independent_tables_with_no_edges_sort_deterministically() {
        let tables = vec![t("public", "z"), t("public", "a")];
        let sorted = topological_sort(&tables, &[]).unwrap();
        let names: Vec<&str> = sorted.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "z"]);
    }
}
