// src/table.rs
// Extracted Table struct and related impls from migration.rs

use anyhow::Result;
use postgres::types::Type;
use postgres::GenericClient;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Table {
    pub schema: Option<String>,
    pub name: String,
}

/// Primary key column name and its SQL type, as reported by `pg_index`/`pg_attribute`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrimaryKeyInfo {
    pub name: String,
    pub ty: Type,
}

impl FromStr for Table {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((schema, name)) = s.split_once('.') {
            Ok(Table {
                schema: Some(schema.to_string()),
                name: name.to_string(),
            })
        } else {
            Ok(Table {
                schema: None,
                name: s.to_string(),
            })
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Table {
    pub fn new(full_name: &str) -> Self {
        full_name.parse().unwrap()
    }

    /// Returns every primary-key column, in key-definition order, so
    /// composite keys (common in bidirectional-merge tables) are fully
    /// represented rather than truncated to the first column found.
    pub fn get_primary_key_info<C: GenericClient>(&self, client: &mut C) -> Result<Vec<crate::PrimaryKeyInfo>> {
        let full_table = self.to_string();
        let rows = client.query(
            "SELECT a.attname, a.atttypid::regtype::text
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             WHERE i.indrelid = ($1)::text::regclass AND i.indisprimary
             ORDER BY array_position(i.indkey, a.attnum)",
            &[&full_table],
        )?;
        if rows.is_empty() {
            anyhow::bail!("table {full_table} has no primary key");
        }
        rows.iter()
            .map(|row| {
                let name: String = row.get(0);
                let type_name: String = row.get(1);
                let ty = sql_type_name_to_pg_type(&type_name)
                    .ok_or_else(|| anyhow::anyhow!("unsupported primary key type: {type_name}"))?;
                Ok(crate::PrimaryKeyInfo { name, ty })
            })
            .collect()
    }

    pub fn get_columns<C: GenericClient>(&self, client: &mut C) -> Result<Vec<String>> {
        let rows = client.query(
            "SELECT column_name FROM information_schema.columns WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
            &[&self.schema.as_deref().unwrap_or("public"), &self.name],
        )?;
        Ok(rows.iter()
            .map(|row| row.get::<_, String>("column_name"))
            .collect())
    }
}

/// Maps the `regtype`-rendered name of a Postgres type to its `postgres`
/// crate `Type` value, for the primary-key types this core expects to see
/// (integers, text/uuid identifiers, and timestamps used as versioning
/// keys). Unrecognized types return `None` rather than panicking; the
/// caller turns that into a descriptive error.
fn sql_type_name_to_pg_type(type_name: &str) -> Option<Type> {
    Some(match type_name {
        "smallint" => Type::INT2,
        "integer" => Type::INT4,
        "bigint" => Type::INT8,
        "text" => Type::TEXT,
        "character varying" | "varchar" => Type::VARCHAR,
        "uuid" => Type::UUID,
        "timestamp with time zone" => Type::TIMESTAMPTZ,
        "timestamp without time zone" => Type::TIMESTAMP,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_display_round_trips_schema_qualified_names() {
        let t: Table = "public.orders".parse().unwrap();
        assert_eq!(t.to_string(), "public.orders");
        let bare: Table = "orders".parse().unwrap();
        assert_eq!(bare.to_string(), "orders");
    }

    #[test]
    fn known_pk_types_map_to_postgres_types() {
        assert_eq!(sql_type_name_to_pg_type("bigint"), Some(Type::INT8));
        assert_eq!(sql_type_name_to_pg_type("uuid"), Some(Type::UUID));
        assert_eq!(sql_type_name_to_pg_type("money"), None);
    }
}
