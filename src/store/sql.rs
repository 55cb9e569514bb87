// PostgreSQL entry store
//
// One row per entry: the Prefix string as primary key and the attributes as a
// JSONB object. Write transactions run at SERIALIZABLE isolation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Row};
use std::time::Duration;
use tracing::{debug, info};

use super::{Attributes, Entry, Store, Transaction};
use crate::config::StoreConfig;
use crate::dn::{Dn, Prefix};

const SCHEMA: &str = r"CREATE TABLE IF NOT EXISTS entries (
    dn TEXT PRIMARY KEY,
    attributes JSONB NOT NULL
)";

const EXACT_QUERY: &str = r"SELECT dn, attributes FROM entries WHERE dn = $1";

const SUBTREE_QUERY: &str =
    r"SELECT dn, attributes FROM entries WHERE dn = $1 OR dn LIKE $2 ESCAPE '\' ORDER BY dn";

const ALL_QUERY: &str = r"SELECT dn, attributes FROM entries ORDER BY dn";

const UPSERT_QUERY: &str = r"INSERT INTO entries (dn, attributes) VALUES ($1, $2)
    ON CONFLICT (dn) DO UPDATE SET attributes = EXCLUDED.attributes";

const DELETE_QUERY: &str = r"DELETE FROM entries WHERE dn = $1";

pub struct SqlStore {
    pool: PgPool,
}

impl SqlStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("store.url is required for the sql store")?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .context("Failed to apply entries schema")?;
        info!("Connected to PostgreSQL (max {} connections)", config.max_connections);

        Ok(Self { pool })
    }
}

/// LIKE pattern matching strict descendants of `key`.
fn descendant_pattern(key: &str) -> String {
    let mut pattern = String::with_capacity(key.len() + 2);
    for c in key.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str("/%");
    pattern
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<Entry> {
    let key: String = row.try_get("dn").context("Failed to read dn column")?;
    let Json(attributes): Json<Attributes> = row
        .try_get("attributes")
        .with_context(|| format!("Failed to decode attributes of {}", key))?;
    let prefix = Prefix::parse(&key).with_context(|| format!("Invalid stored key {:?}", key))?;
    Ok(Entry {
        dn: prefix.to_dn(),
        attributes,
    })
}

async fn list_with<'e, E>(executor: E, prefix: &Prefix, exact: bool) -> Result<Vec<Entry>>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let key = prefix.to_string();
    let rows = if exact {
        sqlx::query(EXACT_QUERY).bind(&key).fetch_all(executor).await
    } else if prefix.level() == 0 {
        sqlx::query(ALL_QUERY).fetch_all(executor).await
    } else {
        sqlx::query(SUBTREE_QUERY)
            .bind(&key)
            .bind(descendant_pattern(&key))
            .fetch_all(executor)
            .await
    }
    .with_context(|| format!("Failed to list entries under {:?}", key))?;

    rows.iter().map(row_to_entry).collect()
}

#[async_trait]
impl Store for SqlStore {
    async fn list(&self, prefix: &Prefix, exact: bool) -> Result<Vec<Entry>> {
        list_with(&self.pool, prefix, exact).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .context("Failed to set transaction isolation")?;
        Ok(Box::new(SqlTransaction { tx }))
    }
}

pub struct SqlTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for SqlTransaction {
    async fn get(&mut self, dn: &Dn) -> Result<Option<Entry>> {
        Ok(list_with(&mut *self.tx, &dn.prefix(), true).await?.into_iter().next())
    }

    async fn list(&mut self, prefix: &Prefix, exact: bool) -> Result<Vec<Entry>> {
        list_with(&mut *self.tx, prefix, exact).await
    }

    async fn store(&mut self, entry: Entry) -> Result<()> {
        let key = entry.dn.prefix().to_string();
        sqlx::query(UPSERT_QUERY)
            .bind(&key)
            .bind(Json(&entry.attributes))
            .execute(&mut *self.tx)
            .await
            .with_context(|| format!("Failed to store entry {}", entry.dn))?;
        Ok(())
    }

    async fn delete(&mut self, dn: &Dn) -> Result<()> {
        sqlx::query(DELETE_QUERY)
            .bind(dn.prefix().to_string())
            .execute(&mut *self.tx)
            .await
            .with_context(|| format!("Failed to delete entry {}", dn))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("Failed to commit transaction")?;
        debug!("Committed SQL transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descendant_pattern_escapes_wildcards() {
        assert_eq!(descendant_pattern("dc=ovh/dc=teapot"), "dc=ovh/dc=teapot/%");
        assert_eq!(descendant_pattern("dc=ovh/ou=a_b%c"), "dc=ovh/ou=a\\_b\\%c/%");
        assert_eq!(descendant_pattern("dc=ovh/cn=x\\y"), "dc=ovh/cn=x\\\\y/%");
    }

    #[test]
    fn test_subtree_query_matches_key_or_children() {
        assert!(SUBTREE_QUERY.contains("dn = $1 OR dn LIKE $2"));
        assert!(UPSERT_QUERY.contains("ON CONFLICT (dn)"));
    }

    fn entry(raw: &str) -> Entry {
        let attributes: Attributes = [("objectclass", vec!["top".to_string()])].into_iter().collect();
        Entry::new(Dn::parse(raw).unwrap(), attributes)
    }

    fn dns(entries: &[Entry]) -> Vec<String> {
        entries.iter().map(|e| e.dn.to_string()).collect()
    }

    /// Needs a scratch PostgreSQL database, e.g.
    /// `LDAP_DIRECTORY_TEST_DATABASE_URL=postgres://ldap@localhost/ldap_test cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_round_trip_against_postgres() {
        let Ok(url) = std::env::var("LDAP_DIRECTORY_TEST_DATABASE_URL") else {
            return;
        };
        let config = StoreConfig {
            kind: crate::config::StoreKind::Sql,
            url: Some(url),
            max_connections: 2,
        };
        let store = SqlStore::connect(&config).await.unwrap();
        let root = format!("dc=t{}", uuid::Uuid::new_v4().simple());
        let base = format!("dc=teapot,{}", root);
        let alice = format!("cn=alice_1,{}", base);
        let lookalike = format!("dc=teapots,{}", root);

        let mut tx = store.begin().await.unwrap();
        for raw in [&base, &alice, &lookalike] {
            tx.store(entry(raw)).await.unwrap();
        }
        assert!(tx.get(&Dn::parse(&alice).unwrap()).await.unwrap().is_some());
        tx.commit().await.unwrap();

        let base_dn = Dn::parse(&base).unwrap();
        let subtree = store.list(&base_dn.prefix(), false).await.unwrap();
        assert_eq!(dns(&subtree), vec![base.clone(), alice.clone()]);
        let exact = store.list(&base_dn.prefix(), true).await.unwrap();
        assert_eq!(dns(&exact), vec![base.clone()]);
        assert_eq!(exact[0].get("dc"), ["teapot"]);
        assert_eq!(exact[0].get("objectclass"), ["top"]);

        // dropped without commit
        let mut tx = store.begin().await.unwrap();
        tx.delete(&Dn::parse(&alice).unwrap()).await.unwrap();
        drop(tx);
        assert_eq!(store.list(&base_dn.prefix(), false).await.unwrap().len(), 2);

        let mut tx = store.begin().await.unwrap();
        for raw in [&alice, &base, &lookalike] {
            tx.delete(&Dn::parse(raw).unwrap()).await.unwrap();
        }
        tx.commit().await.unwrap();
        let root_dn = Dn::parse(&root).unwrap();
        assert!(store.list(&root_dn.prefix(), false).await.unwrap().is_empty());
    }
}
