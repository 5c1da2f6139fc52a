//! Attribute mapping from identity provider records onto flat directory
//! attribute sets.
//!
//! [`AttributeMapper::map`] first copies a fixed set of basic fields, then
//! applies each entry of a [`FieldMappingTable`] in order. Entries whose
//! source path does not resolve are skipped; the mapper itself never fails.

pub mod path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ConfigError;
use crate::models::{AttributeValue, GroupRecord, IdentityRecord, TargetAttributes};

pub use path::{Segment, SourcePath};

// ---------------------------------------------------------------------------
// Mapping table
// ---------------------------------------------------------------------------

/// One `target attribute <- source path` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub target: String,
    pub source: SourcePath,
}

/// Ordered mapping from target attribute name to source path.
///
/// In TOML it can be written compactly as
/// `"uid:userName,mail:emails[0].value"` or as an array of
/// `{ target = "...", source = "..." }` tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MappingSpec", into = "MappingSpec")]
pub struct FieldMappingTable {
    entries: Vec<FieldMapping>,
}

impl FieldMappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, parsing its source path.
    pub fn push(&mut self, target: &str, source: &str) -> Result<(), ConfigError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(ConfigError::InvalidMapping {
                expr: source.to_string(),
                detail: "target attribute name is empty".into(),
            });
        }
        self.entries.push(FieldMapping {
            target: target.to_string(),
            source: SourcePath::parse(source)?,
        });
        Ok(())
    }

    /// Parse the compact `attr:path,attr:path` form.
    ///
    /// Each pair is split on its first `:`. Blank pairs are ignored.
    pub fn parse_compact(spec: &str) -> Result<Self, ConfigError> {
        let mut table = Self::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (target, source) =
                pair.split_once(':')
                    .ok_or_else(|| ConfigError::InvalidMapping {
                        expr: pair.to_string(),
                        detail: "expected 'attribute:path'".into(),
                    })?;
            table.push(target, source)?;
        }
        Ok(table)
    }

    /// Render back to the compact form.
    pub fn to_compact(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}:{}", e.target, e.source))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn entries(&self) -> &[FieldMapping] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Default user table: `uid`, `mail`, `givenName`, `sn` from SCIM paths.
pub fn default_user_table() -> FieldMappingTable {
    table_from_static(&[
        ("uid", "userName"),
        ("mail", "emails[0].value"),
        ("givenName", "name.givenName"),
        ("sn", "name.familyName"),
    ])
}

/// Default group table: `cn` and `description`.
pub fn default_group_table() -> FieldMappingTable {
    table_from_static(&[("cn", "displayName"), ("description", "description")])
}

fn table_from_static(pairs: &[(&str, &str)]) -> FieldMappingTable {
    FieldMappingTable {
        entries: pairs
            .iter()
            .filter_map(|(target, source)| {
                SourcePath::parse(source).ok().map(|source| FieldMapping {
                    target: (*target).to_string(),
                    source,
                })
            })
            .collect(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum MappingSpec {
    Compact(String),
    Entries(Vec<MappingEntrySpec>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MappingEntrySpec {
    target: String,
    source: String,
}

impl TryFrom<MappingSpec> for FieldMappingTable {
    type Error = ConfigError;

    fn try_from(spec: MappingSpec) -> Result<Self, Self::Error> {
        match spec {
            MappingSpec::Compact(s) => Self::parse_compact(&s),
            MappingSpec::Entries(entries) => {
                let mut table = Self::new();
                for e in entries {
                    table.push(&e.target, &e.source)?;
                }
                Ok(table)
            }
        }
    }
}

impl From<FieldMappingTable> for MappingSpec {
    fn from(table: FieldMappingTable) -> Self {
        MappingSpec::Entries(
            table
                .entries
                .into_iter()
                .map(|e| MappingEntrySpec {
                    target: e.target,
                    source: e.source.to_string(),
                })
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Basic defaults
// ---------------------------------------------------------------------------

/// A typed record field that basic defaults copy from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordField {
    Email,
    GivenName,
    FamilyName,
    DisplayName,
    Description,
}

/// Always-attempted direct copy from a record field to a target attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicField {
    pub target: &'static str,
    pub field: RecordField,
}

pub const USER_BASIC_DEFAULTS: &[BasicField] = &[
    BasicField { target: "mail", field: RecordField::Email },
    BasicField { target: "givenName", field: RecordField::GivenName },
    BasicField { target: "sn", field: RecordField::FamilyName },
    BasicField { target: "displayName", field: RecordField::DisplayName },
];

pub const GROUP_BASIC_DEFAULTS: &[BasicField] = &[
    BasicField { target: "cn", field: RecordField::DisplayName },
    BasicField { target: "description", field: RecordField::Description },
];

/// A record the mapper can read from.
pub trait MappableRecord {
    /// Identifier used only for log context.
    fn label(&self) -> &str;
    fn field(&self, field: RecordField) -> Option<&str>;
    fn raw_attributes(&self) -> &AttributeValue;
}

impl MappableRecord for IdentityRecord {
    fn label(&self) -> &str {
        &self.username
    }

    fn field(&self, field: RecordField) -> Option<&str> {
        match field {
            RecordField::Email => self.email.as_deref(),
            RecordField::GivenName => self.given_name.as_deref(),
            RecordField::FamilyName => self.family_name.as_deref(),
            RecordField::DisplayName => self.display_name.as_deref(),
            RecordField::Description => None,
        }
    }

    fn raw_attributes(&self) -> &AttributeValue {
        &self.raw_attributes
    }
}

impl MappableRecord for GroupRecord {
    fn label(&self) -> &str {
        &self.name
    }

    fn field(&self, field: RecordField) -> Option<&str> {
        match field {
            RecordField::DisplayName => self.display_name.as_deref(),
            RecordField::Description => self.description.as_deref(),
            _ => None,
        }
    }

    fn raw_attributes(&self) -> &AttributeValue {
        &self.raw_attributes
    }
}

// ---------------------------------------------------------------------------
// Mapper
// ---------------------------------------------------------------------------

/// Map one record to a target attribute set.
///
/// Basic defaults are applied first, then table entries in order; a later
/// entry for the same attribute replaces an earlier one. Only non-empty
/// values are kept.
pub fn map<R: MappableRecord + ?Sized>(
    record: &R,
    table: &FieldMappingTable,
    basic_defaults: &[BasicField],
) -> TargetAttributes {
    let mut attrs = TargetAttributes::new();

    for basic in basic_defaults {
        if let Some(value) = record.field(basic.field).filter(|v| !v.is_empty()) {
            attrs.insert(basic.target.to_string(), vec![value.to_string()]);
        }
    }

    for entry in table.entries() {
        let values = entry
            .source
            .resolve(record.raw_attributes())
            .map(AttributeValue::target_values)
            .unwrap_or_default();
        if values.is_empty() {
            debug!(
                key = record.label(),
                attribute = %entry.target,
                path = %entry.source,
                "mapping path did not resolve to a value"
            );
            continue;
        }
        attrs.insert(entry.target.clone(), values);
    }

    attrs
}

/// A mapping table bound to its basic defaults.
#[derive(Debug, Clone)]
pub struct AttributeMapper {
    table: FieldMappingTable,
    defaults: &'static [BasicField],
}

impl AttributeMapper {
    pub fn new(table: FieldMappingTable, defaults: &'static [BasicField]) -> Self {
        Self { table, defaults }
    }

    pub fn for_users(table: FieldMappingTable) -> Self {
        Self::new(table, USER_BASIC_DEFAULTS)
    }

    pub fn for_groups(table: FieldMappingTable) -> Self {
        Self::new(table, GROUP_BASIC_DEFAULTS)
    }

    pub fn table(&self) -> &FieldMappingTable {
        &self.table
    }

    pub fn map<R: MappableRecord + ?Sized>(&self, record: &R) -> TargetAttributes {
        map(record, &self.table, self.defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordSource;

    fn alice() -> IdentityRecord {
        let mut user = IdentityRecord::new("alice", RecordSource::IdentityProvider);
        user.email = Some("alice@example.com".into());
        user.given_name = Some("Alice".into());
        user.family_name = Some(String::new());
        user.display_name = Some("Alice L".into());
        user.raw_attributes = AttributeValue::from(serde_json::json!({
            "userName": "alice",
            "name": {"givenName": "Alice", "familyName": "Liddell"},
            "emails": [{"value": "alice@corp.example.com"}],
            "employeeNumber": 1042,
            "roles": ["dev", "", "ops"],
        }));
        user
    }

    #[test]
    fn test_basic_defaults_skip_empty_values() {
        let attrs = map(&alice(), &FieldMappingTable::new(), USER_BASIC_DEFAULTS);
        assert_eq!(attrs.get("mail"), Some(&vec!["alice@example.com".to_string()]));
        assert_eq!(attrs.get("givenName"), Some(&vec!["Alice".to_string()]));
        assert!(!attrs.contains_key("sn"));
        assert_eq!(attrs.len(), 3);
    }

    #[test]
    fn test_table_entries_override_basics_in_order() {
        let table =
            FieldMappingTable::parse_compact("mail:emails[0].value,sn:name.familyName").unwrap();
        let attrs = map(&alice(), &table, USER_BASIC_DEFAULTS);
        assert_eq!(
            attrs.get("mail"),
            Some(&vec!["alice@corp.example.com".to_string()])
        );
        assert_eq!(attrs.get("sn"), Some(&vec!["Liddell".to_string()]));
    }

    #[test]
    fn test_unresolved_entries_are_absent_and_do_not_block_others() {
        let table = FieldMappingTable::parse_compact(
            "title:title,mobile:phoneNumbers[3].value,employeeNumber:employeeNumber",
        )
        .unwrap();
        let attrs = map(&alice(), &table, &[]);
        assert!(!attrs.contains_key("title"));
        assert!(!attrs.contains_key("mobile"));
        assert_eq!(attrs.get("employeeNumber"), Some(&vec!["1042".to_string()]));
    }

    #[test]
    fn test_list_values_become_multi_valued() {
        let table = FieldMappingTable::parse_compact("businessCategory:roles").unwrap();
        let attrs = map(&alice(), &table, &[]);
        assert_eq!(
            attrs.get("businessCategory"),
            Some(&vec!["dev".to_string(), "ops".to_string()])
        );
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let mapper = AttributeMapper::for_users(default_user_table());
        let user = alice();
        assert_eq!(mapper.map(&user), mapper.map(&user));
        assert_eq!(
            mapper.map(&user).get("uid"),
            Some(&vec!["alice".to_string()])
        );
    }

    #[test]
    fn test_group_defaults() {
        let mut group = GroupRecord::new("eng", RecordSource::IdentityProvider);
        group.display_name = Some("Engineering".into());
        group.description = Some("All engineers".into());
        let attrs = AttributeMapper::for_groups(FieldMappingTable::new()).map(&group);
        assert_eq!(attrs.get("cn"), Some(&vec!["Engineering".to_string()]));
        assert_eq!(attrs.get("description"), Some(&vec!["All engineers".to_string()]));
    }

    #[test]
    fn test_parse_compact_and_back() {
        let table = FieldMappingTable::parse_compact(
            " uid:userName , mail:emails[0].value,,givenName:name.givenName",
        )
        .unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.entries()[1].target, "mail");
        assert_eq!(
            table.to_compact(),
            "uid:userName,mail:emails[0].value,givenName:name.givenName"
        );
    }

    #[test]
    fn test_parse_compact_rejects_missing_colon() {
        assert!(matches!(
            FieldMappingTable::parse_compact("uid"),
            Err(ConfigError::InvalidMapping { .. })
        ));
        assert!(FieldMappingTable::parse_compact(":userName").is_err());
    }

    #[test]
    fn test_deserialize_both_forms() {
        #[derive(Deserialize)]
        struct Wrapper {
            compact: FieldMappingTable,
            entries: FieldMappingTable,
        }
        let w: Wrapper = toml::from_str(
            r#"
compact = "uid:userName,mail:emails[0].value"
entries = [
  { target = "uid", source = "userName" },
  { target = "mail", source = "emails.0.value" },
]
"#,
        )
        .unwrap();
        assert_eq!(w.compact.len(), 2);
        assert_eq!(
            w.compact.entries()[1].source.segments(),
            w.entries.entries()[1].source.segments()
        );
    }

    #[test]
    fn test_default_tables() {
        assert_eq!(
            default_user_table().to_compact(),
            "uid:userName,mail:emails[0].value,givenName:name.givenName,sn:name.familyName"
        );
        assert_eq!(
            default_group_table().to_compact(),
            "cn:displayName,description:description"
        );
    }
}
