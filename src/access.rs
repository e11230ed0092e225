use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::SyncResult;
use crate::models::{AccessScope, Capability, Principal, Role};
use crate::store::OrgDirectory;

/// Computes what a principal may see from its capabilities and the sales
/// hierarchy. Rules are evaluated in order and the first match wins.
pub struct AccessControlResolver {
    directory: Arc<dyn OrgDirectory>,
}

impl AccessControlResolver {
    pub fn new(directory: Arc<dyn OrgDirectory>) -> Self {
        Self { directory }
    }

    #[instrument(skip(self, principal), fields(role = principal.role.as_str(), email = %principal.email))]
    pub async fn resolve(&self, principal: &Principal) -> SyncResult<AccessScope> {
        if principal.role == Role::Admin
            || principal.has(Capability::ViewAllProcesses)
            || principal.has(Capability::CommercialViewGlobal)
        {
            debug!("Global scope");
            return Ok(AccessScope::global());
        }

        if principal.has(Capability::CommercialViewTeam) {
            if let Some(team) = self.directory.find_team_by_lead(&principal.email).await? {
                let identifiers = self
                    .directory
                    .identifiers_assigned_to(&team.subordinate_emails)
                    .await?;
                debug!(
                    subordinates = team.subordinate_emails.len(),
                    identifiers = identifiers.len(),
                    "Team scope"
                );
                return Ok(scope_of(identifiers));
            }
            debug!("Principal leads no team, trying own view");
        }

        if principal.has(Capability::CommercialViewOwn) || principal.has(Capability::ViewOwnProcesses) {
            let mut identifiers = self
                .directory
                .identifiers_assigned_to(std::slice::from_ref(&principal.email))
                .await?;
            identifiers.extend(principal.identifier.iter().cloned());
            debug!(identifiers = identifiers.len(), "Own scope");
            return Ok(scope_of(identifiers));
        }

        debug!("No visibility capability");
        Ok(AccessScope::nothing())
    }
}

fn scope_of(identifiers: Vec<String>) -> AccessScope {
    let allowed_identifiers: BTreeSet<String> = identifiers
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();

    AccessScope {
        is_global: false,
        allowed_identifiers,
    }
}
