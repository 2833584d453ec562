use leastpriv_types::{AuditSourceSpec, FilterAction};
use regex::Regex;

use crate::ingest::AuditEvent;
use crate::util::Error;

const SYSTEM_PREFIX: &str = "system:";
const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// The Source's filter chain with patterns compiled up front. A bad pattern
/// fails pipeline startup; evaluation itself cannot fail.
pub struct CompiledFilters {
    ignore_system_users: bool,
    rules: Vec<CompiledRule>,
}

struct CompiledRule {
    action: FilterAction,
    user: Option<Regex>,
    namespace: Option<Regex>,
}

impl CompiledFilters {
    pub fn compile(spec: &AuditSourceSpec) -> Result<Self, Error> {
        let mut rules = Vec::with_capacity(spec.filters.len());
        for rule in &spec.filters {
            rules.push(CompiledRule {
                action: rule.action,
                user: rule.user_pattern.as_deref().map(Regex::new).transpose()?,
                namespace: rule
                    .namespace_pattern
                    .as_deref()
                    .map(Regex::new)
                    .transpose()?,
            });
        }
        Ok(CompiledFilters {
            ignore_system_users: spec.ignore_system_users,
            rules,
        })
    }

    /// First matching rule decides; no match defaults to Allow. System users
    /// (other than service accounts) are rejected up front when configured.
    pub fn allows(&self, event: &AuditEvent) -> bool {
        let username = event.user.username.as_str();
        if self.ignore_system_users
            && username.starts_with(SYSTEM_PREFIX)
            && !username.starts_with(SERVICE_ACCOUNT_PREFIX)
        {
            return false;
        }

        let namespace = event
            .object_ref
            .as_ref()
            .map(|r| r.namespace.as_str())
            .unwrap_or("");
        for rule in &self.rules {
            let user_match = rule.user.as_ref().is_some_and(|re| re.is_match(username));
            let namespace_match = rule
                .namespace
                .as_ref()
                .is_some_and(|re| re.is_match(namespace));
            if user_match || namespace_match {
                return matches!(rule.action, FilterAction::Allow);
            }
        }
        true
    }
}
