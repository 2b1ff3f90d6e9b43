//! `steep_repl.coordinator_state` — a JSONB key/value store for small
//! pieces of cluster-wide state, such as the last elected coordinator.

use postgres::GenericClient;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub fn get<C: GenericClient>(client: &mut C, key: &str) -> anyhow::Result<Option<Value>> {
    let rows = client.query(
        "SELECT value FROM steep_repl.coordinator_state WHERE key = $1",
        &[&key],
    )?;
    Ok(rows.into_iter().next().map(|row| row.get("value")))
}

pub fn get_typed<C: GenericClient, T: DeserializeOwned>(
    client: &mut C,
    key: &str,
) -> anyhow::Result<Option<T>> {
    match get(client, key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub fn set<C: GenericClient>(client: &mut C, key: &str, value: &Value) -> anyhow::Result<()> {
    client.execute(
        "INSERT INTO steep_repl.coordinator_state (key, value, updated_at) \
         VALUES ($1, $2, now()) \
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        &[&key, value],
    )?;
    Ok(())
}

pub fn set_typed<C: GenericClient, T: Serialize>(
    client: &mut C,
    key: &str,
    value: &T,
) -> anyhow::Result<()> {
    set(client, key, &serde_json::to_value(value)?)
}
