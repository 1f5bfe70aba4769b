//! Permission registry for Gatehouse.
//!
//! Permissions are declared once at boot through [`RegistryBuilder`] in a
//! deterministic module order, producing an immutable [`Registry`] that is
//! threaded through the services that need it. Registration fails loudly on
//! duplicate IDs; [`RegistryBuilder::build`] fails on references to unknown
//! permissions and on `depends_on` cycles.
//!
//! Role assignment expands the dependency closure up front (see
//! [`Registry::closure`]); evaluation never walks the graph.

mod checker;

pub use checker::{EffectiveCapabilities, PermissionChecker};

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::error::PermissionError;

/// Where a permission applies by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Applies everywhere once held.
    Global,
    /// Normally granted per resource.
    Resource,
}

/// A single registered permission.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionDef {
    /// Dotted identifier, e.g. `connection.launch`.
    pub id: String,
    /// Owning module, e.g. `connection`.
    pub module: String,
    pub scope: Scope,
    /// Permissions this one is meaningless without. Pinned on assignment.
    pub depends_on: Vec<String>,
    /// Permissions automatically conferred by holding this one.
    pub implies: Vec<String>,
    pub description: String,
}

impl PermissionDef {
    /// Shorthand constructor used by module registration.
    #[must_use]
    pub fn new(id: &str, module: &str, scope: Scope, description: &str) -> Self {
        Self {
            id: id.to_owned(),
            module: module.to_owned(),
            scope,
            depends_on: Vec::new(),
            implies: Vec::new(),
            description: description.to_owned(),
        }
    }

    /// Add a dependency edge.
    #[must_use]
    pub fn depends_on(mut self, id: &str) -> Self {
        self.depends_on.push(id.to_owned());
        self
    }

    /// Add an implication edge.
    #[must_use]
    pub fn implies(mut self, id: &str) -> Self {
        self.implies.push(id.to_owned());
        self
    }
}

/// The immutable, process-wide permission registry.
///
/// Read-only after [`RegistryBuilder::build`]; no locking on the read path.
#[derive(Debug)]
pub struct Registry {
    permissions: BTreeMap<String, PermissionDef>,
}

impl Registry {
    /// Look up a permission definition.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&PermissionDef> {
        self.permissions.get(id)
    }

    /// Whether the ID is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.permissions.contains_key(id)
    }

    /// All definitions in ID order.
    pub fn iter(&self) -> impl Iterator<Item = &PermissionDef> {
        self.permissions.values()
    }

    /// Number of registered permissions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }

    /// Expand a permission set over `depends_on` and `implies` edges.
    ///
    /// Returns the transitive closure, sorted. This is what gets persisted
    /// on role assignment so evaluation is a set-membership test.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::UnknownPermission`] if any input ID is
    /// not registered.
    pub fn closure<'a, I>(&self, ids: I) -> Result<Vec<String>, PermissionError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = Vec::new();

        for id in ids {
            if !self.permissions.contains_key(id) {
                return Err(PermissionError::UnknownPermission { id: id.to_owned() });
            }
            stack.push(id.to_owned());
        }

        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(def) = self.permissions.get(&id) {
                for edge in def.depends_on.iter().chain(def.implies.iter()) {
                    if !seen.contains(edge) {
                        stack.push(edge.clone());
                    }
                }
            }
        }

        let mut out: Vec<String> = seen.into_iter().collect();
        out.sort();
        Ok(out)
    }
}

/// Builds a [`Registry`], validating as it goes.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    permissions: BTreeMap<String, PermissionDef>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one permission.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::DuplicateId`] if the ID is already taken.
    pub fn register(&mut self, def: PermissionDef) -> Result<&mut Self, PermissionError> {
        if self.permissions.contains_key(&def.id) {
            return Err(PermissionError::DuplicateId { id: def.id });
        }
        self.permissions.insert(def.id.clone(), def);
        Ok(self)
    }

    /// Register a module's permissions in order.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::DuplicateId`] on the first collision.
    pub fn register_all<I>(&mut self, defs: I) -> Result<&mut Self, PermissionError>
    where
        I: IntoIterator<Item = PermissionDef>,
    {
        for def in defs {
            self.register(def)?;
        }
        Ok(self)
    }

    /// Validate cross-references and the dependency graph, producing the
    /// immutable registry.
    ///
    /// # Errors
    ///
    /// - [`PermissionError::UnknownReference`] if a `depends_on` or
    ///   `implies` edge names an unregistered permission.
    /// - [`PermissionError::DependencyCycle`] if `depends_on` is cyclic.
    pub fn build(self) -> Result<Registry, PermissionError> {
        for def in self.permissions.values() {
            for edge in def.depends_on.iter().chain(def.implies.iter()) {
                if !self.permissions.contains_key(edge) {
                    return Err(PermissionError::UnknownReference {
                        id: def.id.clone(),
                        references: edge.clone(),
                    });
                }
            }
        }

        // Cycle detection over depends_on, iterative DFS with colouring.
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }
        let mut colours: BTreeMap<&str, Colour> = self
            .permissions
            .keys()
            .map(|k| (k.as_str(), Colour::White))
            .collect();

        for start in self.permissions.keys() {
            if colours[start.as_str()] != Colour::White {
                continue;
            }
            let mut stack: Vec<(&str, bool)> = vec![(start.as_str(), false)];
            while let Some((node, children_done)) = stack.pop() {
                if children_done {
                    colours.insert(node, Colour::Black);
                    continue;
                }
                colours.insert(node, Colour::Grey);
                stack.push((node, true));
                if let Some(def) = self.permissions.get(node) {
                    for dep in &def.depends_on {
                        match colours[dep.as_str()] {
                            Colour::Grey => {
                                return Err(PermissionError::DependencyCycle {
                                    id: dep.clone(),
                                });
                            }
                            Colour::White => stack.push((dep.as_str(), false)),
                            Colour::Black => {}
                        }
                    }
                }
            }
        }

        Ok(Registry {
            permissions: self.permissions,
        })
    }
}

/// Build the gateway's built-in registry.
///
/// Modules register in a fixed order so two boots of the same binary always
/// produce the same registry.
///
/// # Errors
///
/// Construction of the built-in set is static; an error here is a
/// programming bug surfaced at boot.
pub fn builtin_registry() -> Result<Registry, PermissionError> {
    use Scope::{Global, Resource};

    let mut builder = RegistryBuilder::new();

    builder.register_all([
        PermissionDef::new("user.view", "user", Global, "See user accounts"),
        PermissionDef::new("user.manage", "user", Global, "Create, edit and deactivate users")
            .depends_on("user.view"),
        PermissionDef::new("team.view", "team", Global, "See teams and membership"),
        PermissionDef::new("team.manage", "team", Global, "Create and edit teams")
            .depends_on("team.view"),
        PermissionDef::new("role.view", "role", Global, "See roles and their permissions"),
        PermissionDef::new("role.manage", "role", Global, "Create roles and assign permissions")
            .depends_on("role.view"),
        PermissionDef::new("session.view", "session", Global, "See other users' login sessions"),
        PermissionDef::new("session.manage", "session", Global, "Revoke other users' sessions")
            .depends_on("session.view"),
        PermissionDef::new("vault.view", "vault", Global, "See vault identity metadata"),
        PermissionDef::new("vault.manage", "vault", Global, "Create, edit and delete identities")
            .depends_on("vault.view"),
        PermissionDef::new("vault.share", "vault", Global, "Share identities with users and teams")
            .depends_on("vault.view"),
        PermissionDef::new("connection.view", "connection", Global, "See connection records"),
        PermissionDef::new("connection.manage", "connection", Global, "Create and edit connections")
            .depends_on("connection.view"),
        PermissionDef::new("connection.launch", "connection", Resource, "Open live sessions")
            .depends_on("connection.view"),
        PermissionDef::new("active_session.view", "active_session", Global, "See live sessions"),
        PermissionDef::new(
            "active_session.manage",
            "active_session",
            Global,
            "Join, share and terminate any live session",
        )
        .depends_on("active_session.view"),
        PermissionDef::new("recording.view", "recording", Global, "Replay session recordings")
            .depends_on("active_session.view"),
        PermissionDef::new("audit.view", "audit", Global, "Read the audit log"),
        PermissionDef::new("settings.view", "settings", Global, "See system settings"),
        PermissionDef::new("settings.manage", "settings", Global, "Change system settings")
            .depends_on("settings.view"),
    ])?;

    // Protocol modules: one resource-scoped connect permission per driver.
    builder.register_all([
        PermissionDef::new("ssh.connect", "ssh", Resource, "Connect over SSH")
            .depends_on("connection.launch"),
        PermissionDef::new("tcp.connect", "tcp", Resource, "Connect over raw TCP")
            .depends_on("connection.launch"),
    ])?;

    builder.build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_builds() {
        let registry = builtin_registry().unwrap();
        assert!(registry.contains("connection.launch"));
        assert!(registry.contains("ssh.connect"));
        assert!(!registry.is_empty());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(PermissionDef::new("a.view", "a", Scope::Global, ""))
            .unwrap();
        let err = builder
            .register(PermissionDef::new("a.view", "a", Scope::Global, ""))
            .unwrap_err();
        assert!(matches!(err, PermissionError::DuplicateId { .. }));
    }

    #[test]
    fn unknown_dependency_is_rejected_at_build() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(
                PermissionDef::new("a.manage", "a", Scope::Global, "").depends_on("a.view"),
            )
            .unwrap();
        let err = builder.build().unwrap_err();
        assert!(matches!(err, PermissionError::UnknownReference { .. }));
    }

    #[test]
    fn dependency_cycle_is_rejected_at_build() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(PermissionDef::new("p", "m", Scope::Global, "").depends_on("q"))
            .unwrap();
        builder
            .register(PermissionDef::new("q", "m", Scope::Global, "").depends_on("p"))
            .unwrap();
        let err = builder.build().unwrap_err();
        assert!(matches!(err, PermissionError::DependencyCycle { .. }));
    }

    #[test]
    fn self_cycle_is_rejected() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(PermissionDef::new("p", "m", Scope::Global, "").depends_on("p"))
            .unwrap();
        assert!(builder.build().is_err());
    }

    #[test]
    fn closure_expands_transitive_dependencies() {
        let registry = builtin_registry().unwrap();
        let closure = registry.closure(["ssh.connect"]).unwrap();
        // ssh.connect -> connection.launch -> connection.view
        assert!(closure.contains(&"ssh.connect".to_owned()));
        assert!(closure.contains(&"connection.launch".to_owned()));
        assert!(closure.contains(&"connection.view".to_owned()));
    }

    #[test]
    fn closure_rejects_unknown_permission() {
        let registry = builtin_registry().unwrap();
        let err = registry.closure(["no.such"]).unwrap_err();
        assert!(matches!(err, PermissionError::UnknownPermission { .. }));
    }

    #[test]
    fn closure_is_sorted_and_deduplicated() {
        let registry = builtin_registry().unwrap();
        let closure = registry
            .closure(["connection.manage", "connection.launch"])
            .unwrap();
        let mut sorted = closure.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(closure, sorted);
    }
}
