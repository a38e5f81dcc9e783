//! Tool catalog service
//!
//! Wraps an immutable [`CatalogSnapshot`] behind a lock so the whole catalog
//! can be swapped on reload. Readers clone an `Arc` and never see a
//! half-built catalog.

mod watcher;

pub use watcher::CatalogWatcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gateway_core::{CatalogDocument, CatalogSnapshot, ToolBinding, ToolDefinition, ToolPermission};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// A snapshot plus its compiled dangerous patterns
#[derive(Debug, Default)]
struct Loaded {
    snapshot: CatalogSnapshot,
    dangerous: HashMap<String, Vec<Regex>>,
}

impl Loaded {
    fn compile(snapshot: CatalogSnapshot) -> Result<Self> {
        let mut dangerous = HashMap::new();
        for tool in snapshot.iter() {
            let Some(permissions) = &tool.permissions else {
                continue;
            };
            if permissions.dangerous_patterns.is_empty() {
                continue;
            }
            let compiled = permissions
                .dangerous_patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        Error::Config(format!(
                            "Tool '{}' has an invalid dangerous pattern '{p}': {e}",
                            tool.logical_name
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            dangerous.insert(tool.logical_name.clone(), compiled);
        }

        for collision in snapshot.collisions() {
            warn!(
                physical_tool = %collision.physical_tool,
                previous = %collision.previous,
                current = %collision.current,
                "Physical tool bound by several logical tools, last declaration wins"
            );
        }

        Ok(Self {
            snapshot,
            dangerous,
        })
    }
}

/// Everything one call needs from the catalog, taken from a single snapshot
#[derive(Debug, Clone)]
pub struct ResolvedTool {
    /// Logical name the caller asked for
    pub logical_name: String,
    /// Binding for the requested environment
    pub binding: ToolBinding,
    /// Access rules, if the tool declares any
    pub permissions: Option<ToolPermission>,
    dangerous: Vec<Regex>,
}

impl ResolvedTool {
    /// Whether `caller` may run the tool
    pub fn allows(&self, caller: &str) -> bool {
        self.permissions.as_ref().is_none_or(|p| p.allows(caller))
    }

    /// First dangerous pattern matched by any string in `params`
    pub fn dangerous_match(&self, params: &Value) -> Option<String> {
        first_dangerous(&self.logical_name, &self.dangerous, params)
    }
}

/// Logical tool catalog
pub struct ToolCatalog {
    path: Option<PathBuf>,
    current: RwLock<Arc<Loaded>>,
}

impl ToolCatalog {
    /// Load the catalog document at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the document is invalid.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let loaded = Self::read(&path)?;
        info!(path = %path.display(), tools = loaded.snapshot.len(), "Tool catalog loaded");
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(loaded)),
        })
    }

    /// Build a catalog from in-memory definitions, without a backing file
    ///
    /// # Errors
    ///
    /// Returns an error if the definitions violate catalog invariants.
    pub fn from_definitions(definitions: Vec<ToolDefinition>) -> Result<Self> {
        let snapshot = CatalogSnapshot::from_definitions(definitions)?;
        Ok(Self {
            path: None,
            current: RwLock::new(Arc::new(Loaded::compile(snapshot)?)),
        })
    }

    /// An empty catalog
    #[must_use]
    pub fn empty() -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(Loaded::default())),
        }
    }

    /// Parse a catalog document without installing it
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the document is invalid.
    pub fn parse_file(path: &Path) -> Result<CatalogSnapshot> {
        Ok(Self::read(path)?.snapshot)
    }

    fn read(path: &Path) -> Result<Loaded> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read catalog {}: {e}", path.display()))
        })?;
        let document: CatalogDocument = if text.trim().is_empty() {
            CatalogDocument::default()
        } else {
            serde_yaml::from_str(&text)?
        };
        Loaded::compile(CatalogSnapshot::from_document(document)?)
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the backing file and swap the snapshot
    ///
    /// On failure the previous snapshot stays live.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog has no backing file or the new
    /// document is invalid.
    pub fn reload(&self) -> Result<usize> {
        let Some(path) = &self.path else {
            return Err(Error::Config("Catalog has no backing file".to_string()));
        };
        let loaded = Self::read(path)?;
        let count = loaded.snapshot.len();
        *self.current.write() = Arc::new(loaded);
        info!(path = %path.display(), tools = count, "Tool catalog reloaded");
        Ok(count)
    }

    /// Replace the catalog with in-memory definitions
    ///
    /// # Errors
    ///
    /// Returns an error if the definitions are invalid; the catalog is unchanged.
    pub fn replace(&self, definitions: Vec<ToolDefinition>) -> Result<usize> {
        let loaded = Loaded::compile(CatalogSnapshot::from_definitions(definitions)?)?;
        let count = loaded.snapshot.len();
        *self.current.write() = Arc::new(loaded);
        Ok(count)
    }

    fn current(&self) -> Arc<Loaded> {
        Arc::clone(&self.current.read())
    }

    /// Look up a tool definition
    pub fn get_tool(&self, logical_name: &str) -> Option<ToolDefinition> {
        self.current().snapshot.get_tool(logical_name).cloned()
    }

    /// Binding and access rules for one call
    ///
    /// All parts come from the same snapshot, so a concurrent reload cannot
    /// pair a binding with another catalog's permissions.
    pub fn resolve(&self, logical_name: &str, environment: &str) -> Option<ResolvedTool> {
        let loaded = self.current();
        let tool = loaded.snapshot.get_tool(logical_name)?;
        let binding = tool.binding_for(environment)?.clone();
        Some(ResolvedTool {
            logical_name: logical_name.to_string(),
            binding,
            permissions: tool.permissions.clone(),
            dangerous: loaded.dangerous.get(logical_name).cloned().unwrap_or_default(),
        })
    }

    /// Resolve the binding for `logical_name` in `environment`
    pub fn get_binding(&self, logical_name: &str, environment: &str) -> Option<ToolBinding> {
        self.current()
            .snapshot
            .get_binding(logical_name, environment)
            .cloned()
    }

    /// Logical tool owning `physical_tool`
    pub fn get_logical_name(&self, physical_tool: &str) -> Option<String> {
        self.current()
            .snapshot
            .get_logical_name(physical_tool)
            .map(str::to_string)
    }

    /// Tools matching `category` exactly and any of `tags`, in declaration order
    pub fn list_tools(&self, category: Option<&str>, tags: &[String]) -> Vec<ToolDefinition> {
        self.current()
            .snapshot
            .list_tools(category, tags)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Number of tools
    pub fn len(&self) -> usize {
        self.current().snapshot.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.current().snapshot.is_empty()
    }

    /// First dangerous pattern of `logical_name` matched by any string in `params`
    pub fn dangerous_match(&self, logical_name: &str, params: &Value) -> Option<String> {
        let loaded = self.current();
        let patterns = loaded.dangerous.get(logical_name)?;
        first_dangerous(logical_name, patterns, params)
    }
}

fn first_dangerous(logical_name: &str, patterns: &[Regex], params: &Value) -> Option<String> {
    if patterns.is_empty() {
        return None;
    }
    let mut strings = Vec::new();
    collect_strings(params, &mut strings);

    for pattern in patterns {
        if let Some(hit) = strings.iter().find(|s| pattern.is_match(s)) {
            debug!(tool = %logical_name, pattern = %pattern, value = %hit, "Dangerous pattern matched");
            return Some(pattern.as_str().to_string());
        }
    }
    None
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}
