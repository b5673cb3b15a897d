use std::collections::HashSet;

pub(crate) fn metric_name(name: &str) -> String {
    format!("deployment_exposer_{}", name)
}

/// `None` (or an empty set, or one containing `*`) means all namespaces.
pub(crate) fn contains_namespace(namespaces: &Option<HashSet<String>>, namespace: &str) -> bool {
    namespaces
        .as_ref()
        .map_or(true, |v| v.is_empty() || v.contains(namespace) || v.contains("*"))
}
