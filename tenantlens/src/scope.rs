use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Tenant,
    Subscription,
    Workspace,
    Vault,
    Hash,
    Directory,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKind::Tenant => write!(f, "tenant"),
            ScopeKind::Subscription => write!(f, "subscription"),
            ScopeKind::Workspace => write!(f, "workspace"),
            ScopeKind::Vault => write!(f, "vault"),
            ScopeKind::Hash => write!(f, "hash"),
            ScopeKind::Directory => write!(f, "directory"),
        }
    }
}

/// An identifying context under which downstream calls run.
///
/// The id is caller-supplied and untrusted beyond being non-empty; `name`
/// is an optional human label (tenant name, file path) carried into results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub kind: ScopeKind,
    pub id: String,
    pub name: Option<String>,
}

impl Scope {
    pub fn new(kind: ScopeKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            name: None,
        }
    }

    pub fn named(kind: ScopeKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            name: Some(name.into()),
        }
    }

    pub fn tenant(id: impl Into<String>) -> Self {
        Self::new(ScopeKind::Tenant, id)
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_kind() {
        assert_eq!(Scope::tenant("contoso").to_string(), "tenant:contoso");
        assert_eq!(
            Scope::new(ScopeKind::Workspace, "ws-1").to_string(),
            "workspace:ws-1"
        );
    }

    #[test]
    fn label_prefers_name() {
        let scope = Scope::named(ScopeKind::Tenant, "0000-1111", "Contoso");
        assert_eq!(scope.label(), "Contoso");
        assert_eq!(Scope::tenant("0000-1111").label(), "0000-1111");
    }
}
