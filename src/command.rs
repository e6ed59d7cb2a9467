//! Script commands
//!
//! A `Command` is a named SQL script whose parameter shape is derived from its
//! placeholders: bare `$n` makes it positional, `${name}` makes it named. Commands
//! live in a `CommandTree` namespaced by dotted (`reports.daily`) or slash
//! (`reports/daily`) paths, usually loaded from a directory of `.sql` files.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::{DataMapperError, Result};
use crate::sql::Statement;
use crate::sql::criteria::{RawParams, code_only, compile_raw};

static NAMED_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}").expect("named parameter pattern is valid")
});
static POSITIONAL_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([0-9]+)").expect("positional parameter pattern is valid"));

const SCRIPT_EXTENSION: &str = "sql";

/// Parameters a command expects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterShape {
    /// Highest `$n` referenced
    Positional(usize),
    /// Distinct `${name}` references, sorted
    Named(BTreeSet<String>),
}

/// A named SQL script
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    source: String,
    shape: ParameterShape,
}

impl Command {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let source = source.into();
        let shape = parameter_shape(&name, &source)?;
        Ok(Self { name, source, shape })
    }

    /// Load a script; the command is named after the file stem
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| DataMapperError::validation(format!("Invalid script file name {}", path.display())))?;
        let source = std::fs::read_to_string(path)?;
        Self::new(name, source)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn shape(&self) -> &ParameterShape {
        &self.shape
    }

    /// Bind `args` to the script.
    ///
    /// Positional commands take an array (or a single scalar, or null for none);
    /// named commands take an object.
    pub fn statement(&self, args: &Value) -> Result<Statement> {
        let params = match (&self.shape, args) {
            (ParameterShape::Named(_), Value::Object(map)) => RawParams::Named(map.clone()),
            (ParameterShape::Named(names), _) => {
                return Err(DataMapperError::validation(format!(
                    "Command '{}' expects named arguments {:?}",
                    self.name, names
                )));
            }
            (ParameterShape::Positional(_), Value::Array(values)) => RawParams::Positional(values.clone()),
            (ParameterShape::Positional(_), Value::Null) => RawParams::Positional(Vec::new()),
            (ParameterShape::Positional(_), Value::Object(_)) => {
                return Err(DataMapperError::validation(format!(
                    "Command '{}' expects positional arguments",
                    self.name
                )));
            }
            (ParameterShape::Positional(_), scalar) => RawParams::Positional(vec![scalar.clone()]),
        };

        let mut param_offset = 1;
        let (sql, params) = compile_raw(&self.source, &params, &mut param_offset)?;
        Ok(Statement::untyped(sql, params))
    }
}

fn parameter_shape(name: &str, source: &str) -> Result<ParameterShape> {
    let code = code_only(source);
    let named: BTreeSet<String> = NAMED_PARAM
        .captures_iter(&code)
        .map(|caps| caps[1].to_string())
        .collect();
    let positional = POSITIONAL_PARAM
        .captures_iter(&code)
        .filter_map(|caps| caps[1].parse::<usize>().ok())
        .max()
        .unwrap_or(0);

    match (named.is_empty(), positional) {
        (true, n) => Ok(ParameterShape::Positional(n)),
        (false, 0) => Ok(ParameterShape::Named(named)),
        (false, _) => Err(DataMapperError::validation(format!(
            "Command '{}' mixes positional and named parameters",
            name
        ))),
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = path.split(['.', '/']).map(str::trim).collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(DataMapperError::validation(format!("Invalid command path '{}'", path)));
    }
    Ok(parts)
}

/// Commands grouped into nested namespaces
#[derive(Debug, Clone, Default)]
pub struct CommandTree {
    commands: IndexMap<String, Command>,
    namespaces: IndexMap<String, CommandTree>,
}

impl CommandTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.sql` file under `root`; subdirectories become namespaces
    pub fn load_dir(root: impl AsRef<Path>) -> Result<Self> {
        let mut tree = Self::new();
        tree.load_into(root.as_ref(), "")?;
        debug!(commands = tree.len(), "Loaded command scripts");
        Ok(tree)
    }

    fn load_into(&mut self, dir: &Path, prefix: &str) -> Result<()> {
        let mut entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let qualified = if prefix.is_empty() {
                stem
            } else {
                format!("{}.{}", prefix, stem)
            };

            if entry.file_type()?.is_dir() {
                self.load_into(&path, &qualified)?;
            } else if path.extension().and_then(|e| e.to_str()) == Some(SCRIPT_EXTENSION) {
                self.insert(&qualified, Command::from_file(&path)?)?;
            }
        }
        Ok(())
    }

    /// Place `command` at `path`; the last path segment is its key
    pub fn insert(&mut self, path: &str, command: Command) -> Result<()> {
        let parts = split_path(path)?;
        let Some((last, namespaces)) = parts.split_last() else {
            return Err(DataMapperError::validation("Empty command path"));
        };

        let mut node = self;
        for namespace in namespaces {
            node = node.namespaces.entry(namespace.to_string()).or_default();
        }
        if node.commands.contains_key(*last) {
            return Err(DataMapperError::configuration(format!(
                "Duplicate command '{}'",
                path
            )));
        }
        node.commands.insert(last.to_string(), command);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&Command> {
        let parts = split_path(path).ok()?;
        let (last, namespaces) = parts.split_last()?;
        let mut node = self;
        for namespace in namespaces {
            node = node.namespaces.get(*namespace)?;
        }
        node.commands.get(*last)
    }

    /// Dotted paths of every command, namespaces after their own commands
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.commands.keys().cloned().collect();
        for (namespace, child) in &self.namespaces {
            paths.extend(child.paths().into_iter().map(|p| format!("{}.{}", namespace, p)));
        }
        paths
    }

    pub fn len(&self) -> usize {
        self.commands.len() + self.namespaces.values().map(CommandTree::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    // =========================================================================
    // Command Tests
    // =========================================================================

    #[test]
    fn test_shape_positional() {
        let cmd = Command::new("by_age", "SELECT * FROM users WHERE age > $1 AND age < $2").unwrap();
        assert_eq!(cmd.shape(), &ParameterShape::Positional(2));
    }

    #[test]
    fn test_shape_named() {
        let cmd = Command::new(
            "by_name",
            "SELECT * FROM users WHERE name = ${name} OR nick = ${ name } OR team = ${team}",
        )
        .unwrap();
        let expected: BTreeSet<String> = ["name", "team"].iter().map(|s| s.to_string()).collect();
        assert_eq!(cmd.shape(), &ParameterShape::Named(expected));
    }

    #[test]
    fn test_shape_ignores_literals() {
        let cmd = Command::new("price", "SELECT '$5 off' AS label, $1::int AS n").unwrap();
        assert_eq!(cmd.shape(), &ParameterShape::Positional(1));
    }

    #[test]
    fn test_shape_ignores_comments_and_function_bodies() {
        let source = "-- isn't ${name} here\n\
                      CREATE FUNCTION f() RETURNS int AS $body$ SELECT $3 $body$ LANGUAGE sql;\n\
                      SELECT $2 /* $9 */";
        let cmd = Command::new("script", source).unwrap();
        assert_eq!(cmd.shape(), &ParameterShape::Positional(2));
    }

    #[test]
    fn test_mixed_shape_rejected() {
        assert!(Command::new("bad", "SELECT $1, ${name}").is_err());
    }

    #[test]
    fn test_statement_named() {
        let cmd = Command::new("q", "SELECT * FROM t WHERE a = ${a} AND b = ${b} AND c = ${a}").unwrap();
        let stmt = cmd.statement(&json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM t WHERE a = $1 AND b = $2 AND c = $1");
        assert_eq!(stmt.params, vec![json!(1), json!(2)]);
        assert!(stmt.untyped);
    }

    #[test]
    fn test_statement_positional_and_scalar() {
        let cmd = Command::new("q", "SELECT * FROM t WHERE id = $1").unwrap();
        assert_eq!(cmd.statement(&json!([7])).unwrap().params, vec![json!(7)]);
        assert_eq!(cmd.statement(&json!(7)).unwrap().params, vec![json!(7)]);
        assert!(cmd.statement(&json!({"id": 7})).is_err());
        assert!(cmd.statement(&Value::Null).is_err());
    }

    #[test]
    fn test_statement_without_params() {
        let cmd = Command::new("q", "SELECT now()").unwrap();
        let stmt = cmd.statement(&Value::Null).unwrap();
        assert_eq!(stmt.sql, "SELECT now()");
        assert!(stmt.params.is_empty());
    }

    // =========================================================================
    // CommandTree Tests
    // =========================================================================

    #[test]
    fn test_tree_namespaces() {
        let mut tree = CommandTree::new();
        tree.insert("ping", Command::new("ping", "SELECT 1").unwrap()).unwrap();
        tree.insert("reports.daily", Command::new("daily", "SELECT 2").unwrap()).unwrap();
        tree.insert("reports/monthly", Command::new("monthly", "SELECT 3").unwrap()).unwrap();

        assert_eq!(tree.len(), 3);
        assert_eq!(tree.get("reports/daily").unwrap().source(), "SELECT 2");
        assert_eq!(tree.get("reports.monthly").unwrap().name(), "monthly");
        assert!(tree.get("reports").is_none());
        assert!(tree.get("missing.daily").is_none());
        assert_eq!(tree.paths(), vec!["ping", "reports.daily", "reports.monthly"]);
    }

    #[test]
    fn test_tree_rejects_duplicates_and_bad_paths() {
        let mut tree = CommandTree::new();
        tree.insert("a.b", Command::new("b", "SELECT 1").unwrap()).unwrap();
        let err = tree.insert("a/b", Command::new("b", "SELECT 2").unwrap()).unwrap_err();
        assert!(matches!(err, DataMapperError::Configuration(_)));
        assert!(tree.insert("a..c", Command::new("c", "SELECT 1").unwrap()).is_err());
    }

    #[test]
    fn test_load_dir_mirrors_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ping.sql"), "SELECT 1").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join("users")).unwrap();
        std::fs::write(
            dir.path().join("users").join("by_name.sql"),
            "SELECT * FROM users WHERE name = ${name}",
        )
        .unwrap();

        let tree = CommandTree::load_dir(dir.path()).unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree.get("ping").is_some());
        let by_name = tree.get("users.by_name").unwrap();
        assert!(matches!(by_name.shape(), ParameterShape::Named(_)));
    }
}
