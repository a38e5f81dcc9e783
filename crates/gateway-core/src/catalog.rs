//! Logical tool catalog: definitions, bindings and lookup.

use std::collections::HashMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Environment tag used when a binding does not declare one, and the
/// fallback tier of [`CatalogSnapshot::get_binding`].
pub const DEFAULT_ENVIRONMENT: &str = "default";

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}

fn default_priority() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

/// A concrete (server, tool) pair able to fulfil a logical tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolBinding {
    /// Backend server name
    pub mcp_server: String,
    /// Tool name as exposed by the backend
    pub physical_tool: String,
    /// Environment tag
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Higher wins
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Disabled bindings are never resolved
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ToolBinding {
    /// Create an enabled binding in the default environment with priority 1
    pub fn new(mcp_server: impl Into<String>, physical_tool: impl Into<String>) -> Self {
        Self {
            mcp_server: mcp_server.into(),
            physical_tool: physical_tool.into(),
            environment: default_environment(),
            priority: default_priority(),
            enabled: true,
        }
    }

    /// Builder-style environment override
    #[must_use]
    pub fn in_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Builder-style priority override
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Builder-style enabled flag
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Per-tool access rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPermission {
    /// Callers allowed to invoke the tool. Empty means anyone.
    pub allowed_agents: Vec<String>,
    /// Whether a human must confirm the call before it runs
    pub require_confirmation: bool,
    /// Regular expressions that must not match any string parameter
    pub dangerous_patterns: Vec<String>,
}

impl ToolPermission {
    /// Whether `caller` passes the allowed-caller check
    pub fn allows(&self, caller: &str) -> bool {
        self.allowed_agents.is_empty() || self.allowed_agents.iter().any(|a| a == caller)
    }
}

/// A resolved catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Caller-facing name, unique within a catalog
    pub logical_name: String,
    /// Human-readable description
    pub description: String,
    /// Category used by [`CatalogSnapshot::list_tools`]
    pub category: String,
    /// Free-form tags
    pub tags: Vec<String>,
    /// Bindings in declaration order
    pub bindings: Vec<ToolBinding>,
    /// JSON schema of the accepted parameters
    pub input_schema: Value,
    /// Access rules
    pub permissions: Option<ToolPermission>,
}

impl ToolDefinition {
    /// Create a definition with no metadata and the given bindings
    pub fn new(logical_name: impl Into<String>, bindings: Vec<ToolBinding>) -> Self {
        Self {
            logical_name: logical_name.into(),
            description: String::new(),
            category: String::new(),
            tags: Vec::new(),
            bindings,
            input_schema: Value::Object(serde_json::Map::new()),
            permissions: None,
        }
    }

    /// Pick the binding to use for `environment`.
    ///
    /// Enabled bindings of the requested environment are considered first,
    /// then enabled bindings of [`DEFAULT_ENVIRONMENT`]. Within a tier the
    /// highest priority wins and ties go to the earliest declaration.
    pub fn binding_for(&self, environment: &str) -> Option<&ToolBinding> {
        best_binding(&self.bindings, environment)
            .or_else(|| best_binding(&self.bindings, DEFAULT_ENVIRONMENT))
    }
}

fn best_binding<'a>(bindings: &'a [ToolBinding], environment: &str) -> Option<&'a ToolBinding> {
    bindings
        .iter()
        .filter(|b| b.enabled && b.environment == environment)
        .fold(None, |best: Option<&ToolBinding>, b| match best {
            Some(current) if current.priority >= b.priority => Some(current),
            _ => Some(b),
        })
}

/// One tool entry as written in the catalog document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolSpec {
    /// Overrides the map key when present
    pub logical_name: Option<String>,
    /// Human-readable description
    pub description: String,
    /// Category
    pub category: String,
    /// Tags
    pub tags: Vec<String>,
    /// Bindings
    pub bindings: Vec<ToolBinding>,
    /// Parameter schema
    pub input_schema: Option<Value>,
    /// Access rules
    pub permissions: Option<ToolPermission>,
}

impl ToolSpec {
    fn into_definition(self, key: String) -> ToolDefinition {
        ToolDefinition {
            logical_name: self.logical_name.unwrap_or(key),
            description: self.description,
            category: self.category,
            tags: self.tags,
            bindings: self.bindings,
            input_schema: self
                .input_schema
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            permissions: self.permissions,
        }
    }
}

/// Top-level catalog document (`tools:` map keyed by logical name)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogDocument {
    /// Entries in declaration order
    #[serde(default, deserialize_with = "ordered_entries")]
    pub tools: Vec<(String, ToolSpec)>,
}

/// Keep the document's key order; `HashMap` would lose it and the order
/// decides both `list_tools` output and reverse-index collisions.
fn ordered_entries<'de, D>(deserializer: D) -> Result<Vec<(String, ToolSpec)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct EntriesVisitor;

    impl<'de> Visitor<'de> for EntriesVisitor {
        type Value = Vec<(String, ToolSpec)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of logical tool name to tool definition")
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Vec::new())
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((key, spec)) = map.next_entry::<String, ToolSpec>()? {
                entries.push((key, spec));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(EntriesVisitor)
}

/// Catalog construction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// Two entries resolve to the same logical name
    #[error("duplicate logical tool: {0}")]
    DuplicateTool(String),
    /// A binding is missing its server or tool name
    #[error("tool '{tool}' has a binding without {field}")]
    IncompleteBinding {
        /// Logical tool name
        tool: String,
        /// Missing field
        field: &'static str,
    },
    /// A dangerous pattern is an empty string
    #[error("tool '{tool}' has an empty dangerous pattern")]
    EmptyPattern {
        /// Logical tool name
        tool: String,
    },
}

/// A physical tool claimed by more than one logical tool.
///
/// The reverse index keeps the last declaration; the overwritten owner is
/// reported here so the loader can surface it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseIndexCollision {
    /// Physical tool name
    pub physical_tool: String,
    /// Logical tool that lost the mapping
    pub previous: String,
    /// Logical tool that now owns the mapping
    pub current: String,
}

/// Immutable catalog view
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    tools: Vec<ToolDefinition>,
    by_name: HashMap<String, usize>,
    physical_to_logical: HashMap<String, String>,
    collisions: Vec<ReverseIndexCollision>,
}

impl CatalogSnapshot {
    /// Build a snapshot from a parsed document
    pub fn from_document(document: CatalogDocument) -> Result<Self, CatalogError> {
        Self::from_definitions(
            document
                .tools
                .into_iter()
                .map(|(key, spec)| spec.into_definition(key))
                .collect(),
        )
    }

    /// Build a snapshot from definitions in declaration order
    pub fn from_definitions(definitions: Vec<ToolDefinition>) -> Result<Self, CatalogError> {
        let mut snapshot = Self::default();

        for definition in definitions {
            validate(&definition)?;
            if snapshot.by_name.contains_key(&definition.logical_name) {
                return Err(CatalogError::DuplicateTool(definition.logical_name));
            }

            for binding in &definition.bindings {
                let previous = snapshot
                    .physical_to_logical
                    .insert(binding.physical_tool.clone(), definition.logical_name.clone());
                if let Some(previous) = previous {
                    if previous != definition.logical_name {
                        snapshot.collisions.push(ReverseIndexCollision {
                            physical_tool: binding.physical_tool.clone(),
                            previous,
                            current: definition.logical_name.clone(),
                        });
                    }
                }
            }

            snapshot
                .by_name
                .insert(definition.logical_name.clone(), snapshot.tools.len());
            snapshot.tools.push(definition);
        }

        Ok(snapshot)
    }

    /// Look up a definition by logical name
    pub fn get_tool(&self, logical_name: &str) -> Option<&ToolDefinition> {
        self.by_name.get(logical_name).map(|&i| &self.tools[i])
    }

    /// Resolve the binding for a logical tool in `environment`
    pub fn get_binding(&self, logical_name: &str, environment: &str) -> Option<&ToolBinding> {
        self.get_tool(logical_name)?.binding_for(environment)
    }

    /// Reverse lookup: physical tool name to logical name
    pub fn get_logical_name(&self, physical_tool: &str) -> Option<&str> {
        self.physical_to_logical.get(physical_tool).map(String::as_str)
    }

    /// Tools filtered by category and by any-of tags, in declaration order
    pub fn list_tools(&self, category: Option<&str>, tags: &[String]) -> Vec<&ToolDefinition> {
        self.tools
            .iter()
            .filter(|t| category.map_or(true, |c| t.category == c))
            .filter(|t| tags.is_empty() || tags.iter().any(|tag| t.tags.contains(tag)))
            .collect()
    }

    /// Reverse-index collisions found while building
    pub fn collisions(&self) -> &[ReverseIndexCollision] {
        &self.collisions
    }

    /// Number of tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the catalog has no tools
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All definitions in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.iter()
    }
}

fn validate(definition: &ToolDefinition) -> Result<(), CatalogError> {
    for binding in &definition.bindings {
        if binding.mcp_server.trim().is_empty() {
            return Err(CatalogError::IncompleteBinding {
                tool: definition.logical_name.clone(),
                field: "mcp_server",
            });
        }
        if binding.physical_tool.trim().is_empty() {
            return Err(CatalogError::IncompleteBinding {
                tool: definition.logical_name.clone(),
                field: "physical_tool",
            });
        }
    }
    if let Some(permissions) = &definition.permissions {
        if permissions.dangerous_patterns.iter().any(|p| p.is_empty()) {
            return Err(CatalogError::EmptyPattern {
                tool: definition.logical_name.clone(),
            });
        }
    }
    Ok(())
}
