//! Daily SQL aggregation templates.
//!
//! Each `*.sql` file in the template directory runs once per day window with
//! `{start_date}` and `{end_date}` replaced by ISO dates. Templates are
//! expected to delete the window before inserting it, which makes re-runs
//! over the same days idempotent.

use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};

use crate::db::{DbError, DbPool};

#[derive(Debug, Clone)]
pub struct AggregateTemplate {
    pub name: String,
    pub sql: String,
}

impl AggregateTemplate {
    pub fn render(&self, start: NaiveDate, end: NaiveDate) -> String {
        self.sql
            .replace("{start_date}", &start.format("%Y-%m-%d").to_string())
            .replace("{end_date}", &end.format("%Y-%m-%d").to_string())
    }
}

/// Templates of `dir` in file-name order.
pub fn load_templates(dir: &Path) -> Result<Vec<AggregateTemplate>, DbError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("sql"))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let sql = std::fs::read_to_string(&path)?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(AggregateTemplate { name, sql })
        })
        .collect()
}

/// Day windows `[d, d + 1)` covering `[start, end)`.
pub fn day_windows(start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut windows = Vec::new();
    let mut day = start;
    while day < end {
        let next = day + Duration::days(1);
        windows.push((day, next));
        day = next;
    }
    windows
}

/// Run every template for every day; each template/day pair commits on its
/// own.
pub async fn run_aggregates(
    pool: &DbPool,
    dir: &Path,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<usize, DbError> {
    let templates = load_templates(dir)?;
    if templates.is_empty() {
        tracing::warn!("No aggregate templates found in {}", dir.display());
        return Ok(0);
    }

    let mut executed = 0;
    for (day_start, day_end) in day_windows(start, end) {
        for template in &templates {
            pool.execute_script(&template.render(day_start, day_end)).await?;
            executed += 1;
            tracing::info!("Aggregated {} for {}", template.name, day_start);
        }
    }
    Ok(executed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_day_windows_are_half_open() {
        let windows = day_windows(date("2024-02-28"), date("2024-03-02"));
        assert_eq!(
            windows,
            vec![
                (date("2024-02-28"), date("2024-02-29")),
                (date("2024-02-29"), date("2024-03-01")),
                (date("2024-03-01"), date("2024-03-02")),
            ]
        );
        assert!(day_windows(date("2024-03-02"), date("2024-03-02")).is_empty());
    }

    #[test]
    fn test_render_substitutes_dates() {
        let template = AggregateTemplate {
            name: "daily.sql".into(),
            sql: "DELETE FROM d WHERE day >= '{start_date}' AND day < '{end_date}';".into(),
        };
        assert_eq!(
            template.render(date("2024-01-01"), date("2024-01-02")),
            "DELETE FROM d WHERE day >= '2024-01-01' AND day < '2024-01-02';"
        );
    }

    #[test]
    fn test_templates_load_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("02_b.sql"), "SELECT 2").unwrap();
        std::fs::write(dir.path().join("01_a.sql"), "SELECT 1").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let templates = load_templates(dir.path()).unwrap();
        let names: Vec<&str> = templates.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["01_a.sql", "02_b.sql"]);
        assert_eq!(templates[0].sql, "SELECT 1");
    }
}
