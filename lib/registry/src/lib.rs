//! Registry definition file parser.
//!
//! Parses the XML registry definition file, whose root children are
//! routine definitions, into flat
//! [`RoutineDefinition`] values. This crate only understands the
//! textual shape of the file — it does not resolve dependency names
//! against each other or build the dependency DAG; that happens one
//! layer up in `cadence-scheduler::routine`, which has the full set of
//! routine names available to validate against.

use std::fmt;
use std::path::Path;

/// One `<routine>` element from the registry file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineDefinition {
    /// Unique (within the file) routine name.
    pub name: String,
    /// Path to the script this routine runs, if any.
    pub script: Option<String>,
    /// Raw five-field cron expression, if any.
    pub schedule: Option<String>,
    /// Names of upstream routines this routine depends on.
    pub dependencies: Vec<String>,
}

/// Errors from parsing a registry definition file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryFileError {
    /// The document could not be parsed as XML.
    BadXml { reason: String },
    /// A `<routine>` element had no `name` attribute.
    MissingName,
    /// Two routines in the same file share a name.
    DuplicateRoutine { name: String },
    /// The file could not be read from disk.
    Io { reason: String },
}

impl fmt::Display for RegistryFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadXml { reason } => write!(f, "invalid registry XML: {reason}"),
            Self::MissingName => write!(f, "routine element missing required 'name' attribute"),
            Self::DuplicateRoutine { name } => {
                write!(f, "duplicate routine name in registry file: {name}")
            }
            Self::Io { reason } => write!(f, "failed to read registry file: {reason}"),
        }
    }
}

impl std::error::Error for RegistryFileError {}

/// Parses a registry definition file from disk.
///
/// # Errors
///
/// Returns [`RegistryFileError::Io`] if the file cannot be read, or a
/// parse error if its contents are malformed.
pub fn load_from_path(path: &Path) -> Result<Vec<RoutineDefinition>, RegistryFileError> {
    let contents = std::fs::read_to_string(path).map_err(|e| RegistryFileError::Io {
        reason: e.to_string(),
    })?;
    load_from_str(&contents)
}

/// Parses a registry definition file already loaded into memory.
///
/// # Errors
///
/// Returns [`RegistryFileError::BadXml`] if the document is not valid
/// XML, [`RegistryFileError::MissingName`] if a `<routine>` lacks a
/// `name` attribute, or [`RegistryFileError::DuplicateRoutine`] if two
/// routines share a name.
pub fn load_from_str(xml: &str) -> Result<Vec<RoutineDefinition>, RegistryFileError> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| RegistryFileError::BadXml {
        reason: e.to_string(),
    })?;

    let mut definitions = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for node in doc.root_element().children().filter(|n| n.is_element()) {
        let name = node
            .attribute("name")
            .map(str::to_string)
            .ok_or(RegistryFileError::MissingName)?;

        if !seen.insert(name.clone()) {
            return Err(RegistryFileError::DuplicateRoutine { name });
        }

        let script = node.attribute("script").map(str::to_string);
        let schedule = node.attribute("schedule").map(str::to_string);

        let dependencies = node
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "dependency")
            .filter_map(|n| n.attribute("name").map(str::to_string))
            .collect();

        definitions.push(RoutineDefinition {
            name,
            script,
            schedule,
            dependencies,
        });
    }

    Ok(definitions)
}
