use turso::{Connection, Row};

#[derive(Debug, Default)]
pub struct Kv {
    pub id: i64,
    pub module: String,
    pub key: String,
    pub value: Option<String>,
}

pub async fn by_module(module: &str, conn: &Connection) -> anyhow::Result<Vec<Kv>> {
    let mut rows = conn
        .query(
            "SELECT id, module, key, value FROM kvs WHERE module = ?1 ORDER BY id",
            (module,),
        )
        .await?;
    let mut kvs = Vec::new();
    while let Some(row) = rows.next().await? {
        if let Some(kv) = row_to_kv(Some(row))? {
            kvs.push(kv);
        }
    }
    Ok(kvs)
}

pub async fn by_module_and_key(
    module: &str,
    key: &str,
    conn: &Connection,
) -> anyhow::Result<Option<Kv>> {
    let mut rows = conn
        .query(
            "SELECT id, module, key, value FROM kvs WHERE module = ?1 AND key = ?2 LIMIT 1",
            (module, key),
        )
        .await?;
    row_to_kv(rows.next().await?)
}

/// Insert or replace the value stored under (module, key).
pub async fn upsert(module: &str, key: &str, value: &str, conn: &Connection) -> anyhow::Result<()> {
    let affected = conn
        .execute(
            "UPDATE kvs SET value = ?1 WHERE module = ?2 AND key = ?3",
            (value, module, key),
        )
        .await?;
    if affected == 0 {
        conn.execute(
            "INSERT INTO kvs (module, key, value) VALUES (?1, ?2, ?3)",
            (module, key, value),
        )
        .await?;
    }
    Ok(())
}

pub async fn delete(module: &str, key: &str, conn: &Connection) -> anyhow::Result<bool> {
    let affected = conn
        .execute(
            "DELETE FROM kvs WHERE module = ?1 AND key = ?2",
            (module, key),
        )
        .await?;
    Ok(affected > 0)
}

fn row_to_kv(row: Option<Row>) -> anyhow::Result<Option<Kv>> {
    if let Some(row) = row {
        let id = row
            .get_value(0)
            .map_err(anyhow::Error::from)?
            .as_integer()
            .ok_or_else(|| anyhow::anyhow!("id is null"))?
            .to_owned();
        let module = row
            .get_value(1)?
            .as_text()
            .ok_or_else(|| anyhow::anyhow!("module is null"))?
            .to_owned();
        let key = row
            .get_value(2)?
            .as_text()
            .ok_or_else(|| anyhow::anyhow!("key is null"))?
            .to_owned();
        let value = row.get_value(3)?.as_text().map(|s| s.to_owned());
        return Ok(Some(Kv {
            id,
            module,
            key,
            value,
        }));
    }

    Ok(None)
}
