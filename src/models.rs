use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bearer token issued by the provider in exchange for the API key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl ExternalToken {
    pub fn new(token: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            token: token.into(),
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
        }
    }

    /// True if the token is still valid for at least `grace` from `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        now + grace < self.expires_at
    }
}

/// Canonical stored representation of one external legal case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub process_id: i64,
    pub case_number: String,
    pub alternate_code: String,
    pub process_class: String,
    pub internal_stage: String,
    pub court_office: String,
    pub plaintiff_name: String,
    pub plaintiff_identifier: String,
    pub defendant_name: String,
    pub defendant_identifier: String,
    pub updated_at: DateTime<Utc>,
}

impl ProcessRecord {
    pub fn new(process_id: i64) -> Self {
        Self {
            process_id,
            case_number: String::new(),
            alternate_code: String::new(),
            process_class: String::new(),
            internal_stage: String::new(),
            court_office: String::new(),
            plaintiff_name: String::new(),
            plaintiff_identifier: String::new(),
            defendant_name: String::new(),
            defendant_identifier: String::new(),
            updated_at: Utc::now(),
        }
    }

    /// Compare everything except `updated_at`
    pub fn same_content(&self, other: &ProcessRecord) -> bool {
        self.process_id == other.process_id
            && self.case_number == other.case_number
            && self.alternate_code == other.alternate_code
            && self.process_class == other.process_class
            && self.internal_stage == other.internal_stage
            && self.court_office == other.court_office
            && self.plaintiff_name == other.plaintiff_name
            && self.plaintiff_identifier == other.plaintiff_identifier
            && self.defendant_name == other.defendant_name
            && self.defendant_identifier == other.defendant_identifier
    }

    /// Identifiers of every subject on the record, skipping blanks
    pub fn subject_identifiers(&self) -> impl Iterator<Item = &str> {
        [
            self.plaintiff_identifier.as_str(),
            self.defendant_identifier.as_str(),
        ]
        .into_iter()
        .filter(|id| !id.trim().is_empty())
    }
}

/// A detected, reportable client-facing stage transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageChangeEvent {
    pub id: Uuid,
    pub process_id: i64,
    pub case_number: String,
    pub process_class: String,
    pub court_office: String,
    pub plaintiff_identifier: String,
    pub defendant_name: String,
    pub defendant_identifier: String,
    pub previous_client_stage: String,
    pub current_client_stage: String,
    pub reported: bool,
    pub reported_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StageChangeEvent {
    pub fn new(record: &ProcessRecord, previous: String, current: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            process_id: record.process_id,
            case_number: record.case_number.clone(),
            process_class: record.process_class.clone(),
            court_office: record.court_office.clone(),
            plaintiff_identifier: record.plaintiff_identifier.clone(),
            defendant_name: record.defendant_name.clone(),
            defendant_identifier: record.defendant_identifier.clone(),
            previous_client_stage: previous,
            current_client_stage: current,
            reported: false,
            reported_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Caller roles as issued by the auth layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    /// Internal operations staff
    Staff,
    /// Client company user
    Client,
    CommercialManager,
    CommercialDirector,
    AccountManager,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Staff => "staff",
            Role::Client => "client",
            Role::CommercialManager => "commercial_manager",
            Role::CommercialDirector => "commercial_director",
            Role::AccountManager => "account_manager",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "staff" => Some(Role::Staff),
            "client" => Some(Role::Client),
            "commercial_manager" => Some(Role::CommercialManager),
            "commercial_director" => Some(Role::CommercialDirector),
            "account_manager" => Some(Role::AccountManager),
            _ => None,
        }
    }

    /// Permissions granted to a role when the auth layer supplies none
    pub fn default_capabilities(&self) -> BTreeSet<Capability> {
        let caps: &[Capability] = match self {
            Role::Admin => &[],
            Role::Staff => &[Capability::ViewAllProcesses],
            Role::Client => &[Capability::ViewOwnProcesses],
            Role::CommercialManager => &[Capability::CommercialViewGlobal],
            Role::CommercialDirector => &[Capability::CommercialViewTeam],
            Role::AccountManager => &[Capability::CommercialViewOwn],
        };
        caps.iter().copied().collect()
    }
}

/// Tagged authorization capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ViewAllProcesses,
    ViewOwnProcesses,
    CommercialViewGlobal,
    CommercialViewTeam,
    CommercialViewOwn,
}

impl Capability {
    /// Parse a permission string such as `procesos:view_all`
    pub fn from_permission(permission: &str) -> Option<Capability> {
        match permission.trim() {
            "procesos:view_all" => Some(Capability::ViewAllProcesses),
            "procesos:view_own" => Some(Capability::ViewOwnProcesses),
            "commercial:view_global" => Some(Capability::CommercialViewGlobal),
            "commercial:view_team" => Some(Capability::CommercialViewTeam),
            "commercial:view_own" => Some(Capability::CommercialViewOwn),
            _ => None,
        }
    }

    pub fn as_permission(&self) -> &'static str {
        match self {
            Capability::ViewAllProcesses => "procesos:view_all",
            Capability::ViewOwnProcesses => "procesos:view_own",
            Capability::CommercialViewGlobal => "commercial:view_global",
            Capability::CommercialViewTeam => "commercial:view_team",
            Capability::CommercialViewOwn => "commercial:view_own",
        }
    }
}

/// Resolved identity and authorization context of a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub role: Role,
    pub capabilities: BTreeSet<Capability>,
    pub email: String,
    pub identifier: Option<String>,
}

impl Principal {
    /// Build a principal from auth-layer claims. Unknown permission strings are
    /// ignored; an empty permission list falls back to the role defaults.
    pub fn from_claims(
        role: Role,
        permissions: &[String],
        email: &str,
        identifier: Option<&str>,
    ) -> Self {
        let capabilities = if permissions.is_empty() {
            role.default_capabilities()
        } else {
            permissions
                .iter()
                .filter_map(|p| Capability::from_permission(p))
                .collect()
        };

        Self {
            role,
            capabilities,
            email: normalize_email(email),
            identifier: identifier
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Visibility scope computed for a principal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessScope {
    pub is_global: bool,
    pub allowed_identifiers: BTreeSet<String>,
}

impl AccessScope {
    pub fn global() -> Self {
        Self {
            is_global: true,
            allowed_identifiers: BTreeSet::new(),
        }
    }

    pub fn nothing() -> Self {
        Self::default()
    }

    /// True when nothing at all is visible; callers must skip the store query
    pub fn is_empty(&self) -> bool {
        !self.is_global && self.allowed_identifiers.is_empty()
    }
}

/// Commercial region of a sales team
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Regions,
    Bogota,
    Antioquia,
    National,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Regions => "regions",
            Region::Bogota => "bogota",
            Region::Antioquia => "antioquia",
            Region::National => "national",
        }
    }

    pub fn parse(s: &str) -> Option<Region> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regions" => Some(Region::Regions),
            "bogota" => Some(Region::Bogota),
            "antioquia" => Some(Region::Antioquia),
            "national" => Some(Region::National),
            _ => None,
        }
    }
}

/// Team lead and the account managers reporting to them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesTeam {
    pub lead_email: String,
    pub lead_role: Role,
    pub subordinate_emails: Vec<String>,
    pub region: Region,
}

/// Client company with its account-manager assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub identifier: String,
    pub name: String,
    pub email: Option<String>,
    pub assigned_account_manager_email: Option<String>,
    pub active: bool,
}

/// One row of a digest: all changes of one process in the period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedChange {
    pub process_id: i64,
    pub case_number: String,
    pub process_class: String,
    pub court_office: String,
    pub defendant_name: String,
    pub defendant_identifier: String,
    pub previous_client_stage: String,
    pub current_client_stage: String,
    pub changed_at: DateTime<Utc>,
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Reduce an identifier to its digits with leading zeros removed, so
/// `"0900.123.456-7"` and `"9001234567"` compare equal.
pub fn normalize_identifier(identifier: &str) -> String {
    let digits: String = identifier.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.trim_start_matches('0').to_string()
}

/// Compare two normalized identifiers. Either may contain the other, but only
/// when both have at least `min_digits` digits; shorter ones must be equal.
pub fn identifier_keys_match(a: &str, b: &str, min_digits: usize) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || (a.len() >= min_digits && b.len() >= min_digits && (a.contains(b) || b.contains(a)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_freshness_respects_grace() {
        let token = ExternalToken {
            token: "t".to_string(),
            expires_at: Utc::now() + Duration::seconds(90),
        };
        assert!(token.is_fresh_at(Utc::now(), Duration::seconds(60)));
        assert!(!token.is_fresh_at(Utc::now() + Duration::seconds(31), Duration::seconds(60)));
    }

    #[test]
    fn test_principal_from_claims_parses_permissions() {
        let principal = Principal::from_claims(
            Role::CommercialDirector,
            &["commercial:view_team".to_string(), "utils:export".to_string()],
            " Lead@Example.com ",
            None,
        );
        assert_eq!(principal.email, "lead@example.com");
        assert!(principal.has(Capability::CommercialViewTeam));
        assert_eq!(principal.capabilities.len(), 1);
    }

    #[test]
    fn test_principal_falls_back_to_role_defaults() {
        let principal = Principal::from_claims(Role::Client, &[], "c@x.co", Some(" 900123456 "));
        assert!(principal.has(Capability::ViewOwnProcesses));
        assert_eq!(principal.identifier.as_deref(), Some("900123456"));
    }

    #[test]
    fn test_region_parse_rejects_unknown() {
        assert_eq!(Region::parse(" Bogota "), Some(Region::Bogota));
        assert_eq!(Region::parse("regions"), Some(Region::Regions));
        assert_eq!(Region::parse("caribe"), None);
        assert_eq!(Capability::from_permission("reports:view"), None);
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier("0900.123.456-7"), "9001234567");
        assert_eq!(normalize_identifier("abc"), "");
    }

    #[test]
    fn test_identifier_keys_match() {
        let key = |id: &str| normalize_identifier(id);
        assert!(identifier_keys_match(&key("900123456"), &key("900123456-7"), 6));
        assert!(identifier_keys_match(&key("0900.123.456"), &key("900123456"), 6));
        assert!(!identifier_keys_match(&key("111111111"), &key("900123456-7"), 6));
        assert!(!identifier_keys_match(&key("12"), &key("9001234567"), 6));
        assert!(identifier_keys_match(&key("12"), &key("9001234567"), 0));
        assert!(identifier_keys_match(&key("12"), &key("0012"), 6));
        assert!(!identifier_keys_match("", "", 0));
    }

    #[test]
    fn test_same_content_ignores_timestamp() {
        let a = ProcessRecord::new(7);
        let mut b = a.clone();
        b.updated_at = a.updated_at + Duration::days(1);
        assert!(a.same_content(&b));
        b.internal_stage = "DEMANDA".to_string();
        assert!(!a.same_content(&b));
    }
}
