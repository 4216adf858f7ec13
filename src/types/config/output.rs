//! Parsing of the comma-separated `--output` flag.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Console,
    /// Connection URL, or `None` for a bare `postgres` that uses the
    /// `--postgres-url` connection.
    Postgres(Option<String>),
    JsonFile(PathBuf),
    CsvFile(PathBuf),
}

impl OutputTarget {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let spec = spec.trim();
        if spec.eq_ignore_ascii_case("console") {
            return Ok(OutputTarget::Console);
        }
        if spec.eq_ignore_ascii_case("postgres") || spec.eq_ignore_ascii_case("postgresql") {
            return Ok(OutputTarget::Postgres(None));
        }
        if spec.starts_with("postgresql://") || spec.starts_with("postgres://") {
            return Ok(OutputTarget::Postgres(Some(spec.to_string())));
        }
        if let Some(dir) = spec.strip_prefix("jsonfile://") {
            return non_empty_dir(dir, spec).map(OutputTarget::JsonFile);
        }
        if let Some(dir) = spec.strip_prefix("csvfile://") {
            return non_empty_dir(dir, spec).map(OutputTarget::CsvFile);
        }
        Err(format!("unsupported output '{}'", spec))
    }

    pub fn is_postgres(&self) -> bool {
        matches!(self, OutputTarget::Postgres(_))
    }

    pub fn postgres_url(&self) -> Option<&str> {
        match self {
            OutputTarget::Postgres(url) => url.as_deref(),
            _ => None,
        }
    }
}

fn non_empty_dir(dir: &str, spec: &str) -> Result<PathBuf, String> {
    if dir.is_empty() {
        Err(format!("output '{}' is missing a directory", spec))
    } else {
        Ok(PathBuf::from(dir))
    }
}

/// Parse every entry of a comma-separated output list.
pub fn parse_outputs(list: &str) -> Result<Vec<OutputTarget>, String> {
    let targets: Vec<OutputTarget> = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(OutputTarget::parse)
        .collect::<Result<_, _>>()?;

    if targets.is_empty() {
        return Err("at least one output is required".to_string());
    }
    Ok(targets)
}
