//! Source-qualified entity names.
//!
//! Every entity lives under `name@source`. A reference containing `@` is taken
//! literally; a bare reference resolves within the referencing source first and
//! then against the global alias table.

use std::collections::BTreeMap;

pub const SEPARATOR: char = '@';

/// Build the qualified name of a local entity.
pub fn qualify(name: &str, source: &str) -> String {
    format!("{}{}{}", name, SEPARATOR, source)
}

/// Split a qualified name into `(name, source)`.
pub fn split(qualified: &str) -> Option<(&str, &str)> {
    qualified.rsplit_once(SEPARATOR)
}

/// Check that a local entity or source name can be namespaced.
pub fn check_local_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.contains(SEPARATOR) {
        return Err(format!("name must not contain '{}'", SEPARATOR));
    }
    if name.chars().any(char::is_whitespace) {
        return Err("name must not contain whitespace".to_string());
    }
    Ok(())
}

/// Resolves references against the set of known qualified names.
pub struct Resolver<'a, V> {
    entities: &'a BTreeMap<String, V>,
    aliases: &'a BTreeMap<String, String>,
}

impl<'a, V> Resolver<'a, V> {
    pub fn new(entities: &'a BTreeMap<String, V>, aliases: &'a BTreeMap<String, String>) -> Self {
        Self { entities, aliases }
    }

    /// Resolve `reference` as seen from `source`. Returns the qualified name.
    pub fn resolve(&self, reference: &str, source: &str) -> Option<String> {
        if reference.contains(SEPARATOR) {
            return self
                .entities
                .contains_key(reference)
                .then(|| reference.to_string());
        }

        let local = qualify(reference, source);
        if self.entities.contains_key(&local) {
            return Some(local);
        }

        self.aliases
            .get(reference)
            .filter(|target| self.entities.contains_key(target.as_str()))
            .cloned()
    }
}
