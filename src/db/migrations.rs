use std::collections::HashSet;
use std::path::Path;

use deadpool_postgres::Pool;

use super::error::DbError;

/// Apply every `*.sql` file in `dir` not yet recorded in `_migrations`,
/// in file-name order, each inside its own transaction.
pub async fn run(pool: &Pool, dir: &Path) -> Result<(), DbError> {
    let client = pool.get().await?;

    client
        .execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )",
            &[],
        )
        .await?;

    let rows = client.query("SELECT name FROM _migrations", &[]).await?;
    let applied: HashSet<String> = rows.iter().map(|row| row.get(0)).collect();
    drop(client);

    if !dir.exists() {
        return Err(DbError::MigrationError(format!(
            "migrations directory {} does not exist",
            dir.display()
        )));
    }

    let pending: Vec<_> = pending_migrations(dir)?
        .into_iter()
        .filter(|(name, _)| !applied.contains(name))
        .collect();

    for (name, path) in pending {
        let sql = std::fs::read_to_string(&path)?;

        let mut client = pool.get().await?;
        let tx = client.transaction().await?;

        tx.batch_execute(&sql).await.map_err(|e| {
            DbError::MigrationError(format!("Failed to run migration {}: {}", name, e))
        })?;

        tx.execute("INSERT INTO _migrations (name) VALUES ($1)", &[&name])
            .await?;

        tx.commit().await?;

        tracing::info!("Applied migration: {}", name);
    }

    tracing::info!("All migrations up to date");
    Ok(())
}

/// `.sql` files of a directory sorted by file name.
pub(crate) fn pending_migrations(dir: &Path) -> Result<Vec<(String, std::path::PathBuf)>, DbError> {
    let mut entries: Vec<(String, std::path::PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|x| x == "sql").unwrap_or(false))
        .filter_map(|p| {
            let name = p.file_name()?.to_string_lossy().to_string();
            Some((name, p))
        })
        .collect();

    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("002_tokens.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("001_blocks.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("README.md"), "notes").unwrap();

        let names: Vec<String> = pending_migrations(dir.path())
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["001_blocks.sql", "002_tokens.sql"]);
    }
}
