//! Index resolution: which (index name, index value) pairs a session exhibits.

use crate::record::SessionRecord;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Index name under which sessions are indexed by authenticated principal.
pub const PRINCIPAL_NAME_INDEX_NAME: &str = "principalName";

/// Attribute holding a serialized security context.
pub const SECURITY_CONTEXT_ATTRIBUTE: &str = "SECURITY_CONTEXT";

/// Resolves index values from a session's attributes.
///
/// Index names must not contain `:`; index values may.
pub trait IndexResolver: Send + Sync {
    /// Index name → index value for this session. Empty when unindexed.
    fn resolve_indexes(&self, record: &SessionRecord) -> HashMap<String, String>;
}

impl<F> IndexResolver for F
where
    F: Fn(&SessionRecord) -> HashMap<String, String> + Send + Sync,
{
    fn resolve_indexes(&self, record: &SessionRecord) -> HashMap<String, String> {
        self(record)
    }
}

#[derive(Debug, Deserialize)]
struct SecurityContext {
    authentication: Option<Authentication>,
}

#[derive(Debug, Deserialize)]
struct Authentication {
    name: String,
}

/// Resolves [`PRINCIPAL_NAME_INDEX_NAME`].
///
/// Looks first for a UTF-8 `principalName` attribute, then for a JSON
/// security context of the shape `{"authentication": {"name": "alice"}}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrincipalNameIndexResolver;

impl PrincipalNameIndexResolver {
    fn principal_name(record: &SessionRecord) -> Option<String> {
        if let Some(bytes) = record.attributes.get(PRINCIPAL_NAME_INDEX_NAME) {
            return std::str::from_utf8(bytes).ok().map(str::to_string);
        }

        let bytes = record.attributes.get(SECURITY_CONTEXT_ATTRIBUTE)?;
        match serde_json::from_slice::<SecurityContext>(bytes) {
            Ok(context) => context.authentication.map(|auth| auth.name),
            Err(e) => {
                tracing::debug!(
                    session_id = %record.id,
                    error = %e,
                    "Ignoring unreadable security context"
                );
                None
            }
        }
    }
}

impl IndexResolver for PrincipalNameIndexResolver {
    fn resolve_indexes(&self, record: &SessionRecord) -> HashMap<String, String> {
        Self::principal_name(record)
            .map(|name| HashMap::from([(PRINCIPAL_NAME_INDEX_NAME.to_string(), name)]))
            .unwrap_or_default()
    }
}

/// Merges the output of several resolvers; later resolvers win on name clashes.
#[derive(Clone, Default)]
pub struct DelegatingIndexResolver {
    delegates: Vec<Arc<dyn IndexResolver>>,
}

impl DelegatingIndexResolver {
    /// Create a resolver from delegates.
    #[must_use]
    pub fn new(delegates: Vec<Arc<dyn IndexResolver>>) -> Self {
        Self { delegates }
    }

    /// Add a delegate.
    #[must_use]
    pub fn with(mut self, delegate: Arc<dyn IndexResolver>) -> Self {
        self.delegates.push(delegate);
        self
    }
}

impl IndexResolver for DelegatingIndexResolver {
    fn resolve_indexes(&self, record: &SessionRecord) -> HashMap<String, String> {
        self.delegates
            .iter()
            .flat_map(|delegate| delegate.resolve_indexes(record))
            .collect()
    }
}
