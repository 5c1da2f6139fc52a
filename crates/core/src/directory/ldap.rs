//! LDAP directory target backed by `ldap3`.
//!
//! Users live under the configured user container with an RDN of
//! `user_id_attr`; groups live under the group container with an RDN of
//! `group_name_attr` and list members as user DNs in `group_member_attr`.
//!
//! `person` requires `sn` and `groupOfNames` requires `member`. Users the
//! identity provider sends without a family name get their username as
//! surname, both when created and when compared. Groups that would be left
//! without members carry the configured placeholder DN instead.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{
    Ldap, LdapConnAsync, LdapConnSettings, LdapError, Mod, Scope, SearchEntry, SearchResult,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::dn::{child_dn, escape_filter_value, leading_rdn_value};
use super::DirectoryTarget;
use crate::config::DirectoryConfig;
use crate::diff::Modification;
use crate::errors::DirectoryError;
use crate::models::{
    AttributeValue, EntityKind, GroupRecord, IdentityRecord, RecordSource, TargetAttributes,
};

const RC_SUCCESS: u32 = 0;
const RC_TIME_LIMIT: u32 = 3;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_BUSY: u32 = 51;
const RC_UNAVAILABLE: u32 = 52;
const RC_ALREADY_EXISTS: u32 = 68;

/// Attributes fetched for user entries.
const USER_ATTRS: &[&str] = &["mail", "givenName", "sn", "displayName", "memberOf", "cn"];

/// LDAP implementation of [`DirectoryTarget`].
pub struct LdapDirectory {
    config: DirectoryConfig,
    conn: Mutex<Option<Ldap>>,
}

impl std::fmt::Debug for LdapDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapDirectory")
            .field("url", &self.config.url)
            .field("bind_dn", &self.config.bind_dn)
            .field("bind_password", &"[REDACTED]")
            .finish()
    }
}

impl LdapDirectory {
    pub fn new(config: DirectoryConfig) -> Self {
        info!(url = %config.url, user_base = %config.user_base(), "created LdapDirectory");
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn connect(&self) -> Result<Ldap, DirectoryError> {
        let password = self.config.bind_password.as_deref().ok_or_else(|| {
            DirectoryError::Connectivity(format!(
                "bind password for {} is not configured",
                self.config.bind_dn
            ))
        })?;

        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.op_timeout())
            .set_starttls(self.config.starttls);

        debug!(url = %self.config.url, "connecting to LDAP server");
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.config.url)
            .await
            .map_err(|e| map_ldap_error(e, "connect"))?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        let result = ldap
            .with_timeout(self.op_timeout())
            .simple_bind(&self.config.bind_dn, password)
            .await
            .map_err(|e| map_ldap_error(e, "bind"))?;
        if result.rc == RC_INVALID_CREDENTIALS {
            return Err(DirectoryError::Connectivity(format!(
                "invalid credentials for {}",
                self.config.bind_dn
            )));
        }
        check_result(result.rc, &result.text, "bind", &self.config.bind_dn)?;

        info!(url = %self.config.url, "LDAP bind successful");
        Ok(ldap)
    }

    /// Return a handle to the shared connection, connecting on first use.
    async fn handle(&self) -> Result<Ldap, DirectoryError> {
        let mut guard = self.conn.lock().await;
        if let Some(ldap) = guard.as_ref() {
            return Ok(ldap.clone());
        }
        let ldap = self.connect().await?;
        *guard = Some(ldap.clone());
        Ok(ldap)
    }

    /// Drop the shared connection so the next call reconnects.
    async fn reset(&self) {
        *self.conn.lock().await = None;
    }

    async fn run<T, F, Fut>(&self, f: F) -> Result<T, DirectoryError>
    where
        F: FnOnce(Ldap) -> Fut,
        Fut: std::future::Future<Output = Result<T, DirectoryError>>,
    {
        let mut ldap = self.handle().await?;
        ldap.with_timeout(self.op_timeout());
        let result = f(ldap).await;
        if matches!(&result, Err(e) if e.is_connectivity()) {
            self.reset().await;
        }
        result
    }

    fn user_dn(&self, username: &str) -> String {
        child_dn(&self.config.user_id_attr, username, &self.config.user_base())
    }

    fn group_dn(&self, name: &str) -> String {
        child_dn(&self.config.group_name_attr, name, &self.config.group_base())
    }

    fn member_dns(&self, members: &[String]) -> HashSet<String> {
        members.iter().map(|m| self.user_dn(m)).collect()
    }

    async fn search(
        &self,
        base: String,
        filter: String,
        attrs: Vec<String>,
    ) -> Result<Vec<SearchEntry>, DirectoryError> {
        self.run(|mut ldap| async move {
            debug!(base = %base, filter = %filter, "searching directory");
            let (entries, _res) = ldap
                .search(&base, Scope::Subtree, &filter, attrs)
                .await
                .map_err(|e| map_ldap_error(e, "search"))?
                .success()
                .map_err(|e| map_ldap_error(e, "search"))?;
            Ok(entries.into_iter().map(SearchEntry::construct).collect())
        })
        .await
    }

    async fn add_entry(
        &self,
        kind: EntityKind,
        key: &str,
        dn: String,
        entry: Vec<(String, HashSet<String>)>,
    ) -> Result<(), DirectoryError> {
        self.run(|mut ldap| async move {
            let result = ldap
                .add(&dn, entry)
                .await
                .map_err(|e| map_ldap_error(e, "add"))?;
            check_entity_result(result.rc, &result.text, kind, key)
        })
        .await
    }

    async fn modify_entry(
        &self,
        kind: EntityKind,
        key: &str,
        dn: String,
        mods: Vec<Mod<String>>,
    ) -> Result<(), DirectoryError> {
        if mods.is_empty() {
            return Ok(());
        }
        self.run(|mut ldap| async move {
            let result = ldap
                .modify(&dn, mods)
                .await
                .map_err(|e| map_ldap_error(e, "modify"))?;
            check_entity_result(result.rc, &result.text, kind, key)
        })
        .await
    }

    async fn delete_entry(&self, kind: EntityKind, key: &str, dn: String) -> Result<(), DirectoryError> {
        self.run(|mut ldap| async move {
            let result = ldap
                .delete(&dn)
                .await
                .map_err(|e| map_ldap_error(e, "delete"))?;
            check_entity_result(result.rc, &result.text, kind, key)
        })
        .await
    }

    fn to_mods(&self, modifications: &[Modification]) -> Vec<Mod<String>> {
        let member_attr = &self.config.group_member_attr;
        modifications
            .iter()
            .map(|m| match m {
                Modification::Replace {
                    attribute,
                    value: Some(v),
                } => Mod::Replace(attribute.clone(), HashSet::from([v.clone()])),
                Modification::Replace {
                    attribute,
                    value: None,
                } => Mod::Delete(attribute.clone(), HashSet::new()),
                Modification::AddMembers(members) => {
                    Mod::Add(member_attr.clone(), self.member_dns(members))
                }
                Modification::RemoveMembers(members) => {
                    Mod::Delete(member_attr.clone(), self.member_dns(members))
                }
            })
            .collect()
    }

    /// Mods for a group update. When the changes would empty the member
    /// attribute the placeholder is added in the same request.
    fn group_mods(
        &self,
        current_members: &HashSet<String>,
        modifications: &[Modification],
    ) -> Vec<Mod<String>> {
        let mut remaining: HashSet<String> =
            current_members.iter().map(|dn| dn.to_lowercase()).collect();
        for m in modifications {
            match m {
                Modification::AddMembers(members) => remaining.extend(
                    self.member_dns(members).into_iter().map(|dn| dn.to_lowercase()),
                ),
                Modification::RemoveMembers(members) => {
                    for dn in self.member_dns(members) {
                        remaining.remove(&dn.to_lowercase());
                    }
                }
                Modification::Replace { .. } => {}
            }
        }

        let mut mods = Vec::with_capacity(modifications.len() + 1);
        if remaining.is_empty() {
            debug!("group would have no members, adding placeholder");
            mods.push(Mod::Add(
                self.config.group_member_attr.clone(),
                HashSet::from([self.config.placeholder_member()]),
            ));
        }
        mods.extend(self.to_mods(modifications));
        mods
    }

    /// Member DNs currently stored on one group entry.
    async fn current_members(&self, name: &str) -> Result<HashSet<String>, DirectoryError> {
        let dn = self.group_dn(name);
        let member_attr = self.config.group_member_attr.clone();
        self.run(|mut ldap| async move {
            let SearchResult(entries, res) = ldap
                .search(&dn, Scope::Base, "(objectClass=*)", vec![member_attr.clone()])
                .await
                .map_err(|e| map_ldap_error(e, "search"))?;
            check_entity_result(res.rc, &res.text, EntityKind::Group, name)?;
            let key = member_attr.to_lowercase();
            Ok(entries
                .into_iter()
                .map(SearchEntry::construct)
                .flat_map(|e| lowercase_keys(e.attrs).remove(&key).unwrap_or_default())
                .collect())
        })
        .await
    }

    fn is_placeholder(&self, dn: &str) -> bool {
        dn.eq_ignore_ascii_case(&self.config.placeholder_member())
    }

    fn user_from_entry(&self, entry: SearchEntry) -> Option<IdentityRecord> {
        let attrs = lowercase_keys(entry.attrs);
        let username = first(&attrs, &self.config.user_id_attr)
            .or_else(|| leading_rdn_value(&entry.dn, &self.config.user_id_attr))?;

        let group_memberships = attrs
            .get("memberof")
            .map(|dns| {
                dns.iter()
                    .filter_map(|dn| leading_rdn_value(dn, &self.config.group_name_attr))
                    .collect()
            })
            .unwrap_or_default();

        Some(IdentityRecord {
            id: entry.dn,
            email: first(&attrs, "mail"),
            given_name: first(&attrs, "givenName"),
            family_name: first(&attrs, "sn"),
            display_name: first(&attrs, "displayName"),
            group_memberships,
            source: RecordSource::Directory,
            raw_attributes: attrs_to_tree(&attrs),
            username,
        })
    }

    fn group_from_entry(&self, entry: SearchEntry) -> Option<GroupRecord> {
        let attrs = lowercase_keys(entry.attrs);
        let name = first(&attrs, &self.config.group_name_attr)
            .or_else(|| leading_rdn_value(&entry.dn, &self.config.group_name_attr))?;

        let members: BTreeSet<String> = attrs
            .get(&self.config.group_member_attr.to_lowercase())
            .map(|dns| {
                dns.iter()
                    .filter(|dn| !self.is_placeholder(dn))
                    .filter_map(|dn| leading_rdn_value(dn, &self.config.user_id_attr))
                    .collect()
            })
            .unwrap_or_default();

        Some(GroupRecord {
            id: entry.dn,
            display_name: Some(name.clone()),
            description: first(&attrs, "description"),
            members,
            source: RecordSource::Directory,
            raw_attributes: attrs_to_tree(&attrs),
            name,
        })
    }
}

/// Surname stored for users the identity provider sends without one.
fn surname_fallback(username: &str) -> String {
    username.to_string()
}

/// Build the attribute list for a new user entry.
///
/// Object classes come from config, the RDN attribute is forced to the
/// username, and `cn`/`sn` are filled in when the mapping left them out.
pub fn build_user_entry(
    config: &DirectoryConfig,
    username: &str,
    attrs: &TargetAttributes,
) -> Vec<(String, HashSet<String>)> {
    let mut entry: BTreeMap<String, HashSet<String>> = BTreeMap::new();
    entry.insert(
        "objectClass".into(),
        config.user_object_classes.iter().cloned().collect(),
    );
    for (name, values) in attrs {
        if name.eq_ignore_ascii_case("objectClass") || values.is_empty() {
            continue;
        }
        entry.insert(name.clone(), values.iter().cloned().collect());
    }
    entry.insert(
        config.user_id_attr.clone(),
        HashSet::from([username.to_string()]),
    );
    if !entry.contains_key("cn") {
        let cn = attrs
            .get("displayName")
            .and_then(|v| v.first())
            .cloned()
            .unwrap_or_else(|| username.to_string());
        entry.insert("cn".into(), HashSet::from([cn]));
    }
    entry
        .entry("sn".into())
        .or_insert_with(|| HashSet::from([surname_fallback(username)]));
    entry.into_iter().collect()
}

/// Build the attribute list for a new group entry. Members are user DNs; an
/// empty member set is stored as the placeholder DN.
pub fn build_group_entry(
    config: &DirectoryConfig,
    name: &str,
    attrs: &TargetAttributes,
    member_dns: HashSet<String>,
) -> Vec<(String, HashSet<String>)> {
    let mut entry: BTreeMap<String, HashSet<String>> = BTreeMap::new();
    entry.insert(
        "objectClass".into(),
        config.group_object_classes.iter().cloned().collect(),
    );
    for (attr, values) in attrs {
        if attr.eq_ignore_ascii_case("objectClass") || values.is_empty() {
            continue;
        }
        entry.insert(attr.clone(), values.iter().cloned().collect());
    }
    entry.insert(
        config.group_name_attr.clone(),
        HashSet::from([name.to_string()]),
    );
    let members = if member_dns.is_empty() {
        HashSet::from([config.placeholder_member()])
    } else {
        member_dns
    };
    entry.insert(config.group_member_attr.clone(), members);
    entry.into_iter().collect()
}

fn group_filter(config: &DirectoryConfig) -> String {
    let class = config
        .group_object_classes
        .iter()
        .find(|c| !c.eq_ignore_ascii_case("top"))
        .map(String::as_str)
        .unwrap_or("groupOfNames");
    format!(
        "(&(objectClass={})({}=*))",
        escape_filter_value(class),
        config.group_name_attr
    )
}

fn user_filter(config: &DirectoryConfig) -> String {
    format!("({}=*)", config.user_id_attr)
}

fn lowercase_keys(attrs: HashMap<String, Vec<String>>) -> HashMap<String, Vec<String>> {
    attrs
        .into_iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect()
}

fn first(attrs: &HashMap<String, Vec<String>>, name: &str) -> Option<String> {
    attrs
        .get(&name.to_lowercase())
        .and_then(|v| v.first())
        .filter(|v| !v.is_empty())
        .cloned()
}

fn attrs_to_tree(attrs: &HashMap<String, Vec<String>>) -> AttributeValue {
    AttributeValue::Map(
        attrs
            .iter()
            .map(|(k, vs)| {
                let value = match vs.as_slice() {
                    [single] => AttributeValue::String(single.clone()),
                    many => AttributeValue::List(
                        many.iter().cloned().map(AttributeValue::String).collect(),
                    ),
                };
                (k.clone(), value)
            })
            .collect(),
    )
}

fn map_ldap_error(err: LdapError, op: &str) -> DirectoryError {
    match err {
        LdapError::Timeout { .. } => DirectoryError::Timeout(format!("{op}: {err}")),
        LdapError::LdapResult { result } => classify_rc(result.rc, &result.text, op, ""),
        other => DirectoryError::Connectivity(format!("{op}: {other}")),
    }
}

fn classify_rc(rc: u32, text: &str, op: &str, key: &str) -> DirectoryError {
    match rc {
        RC_TIME_LIMIT => DirectoryError::Timeout(format!("{op} {key}: {text}")),
        RC_INVALID_CREDENTIALS | RC_BUSY | RC_UNAVAILABLE => {
            DirectoryError::Connectivity(format!("{op} {key}: rc {rc} {text}"))
        }
        code => DirectoryError::Protocol {
            code,
            detail: format!("{op} {key}: {text}"),
        },
    }
}

fn check_result(rc: u32, text: &str, op: &str, key: &str) -> Result<(), DirectoryError> {
    if rc == RC_SUCCESS {
        Ok(())
    } else {
        Err(classify_rc(rc, text, op, key))
    }
}

fn check_entity_result(
    rc: u32,
    text: &str,
    kind: EntityKind,
    key: &str,
) -> Result<(), DirectoryError> {
    match rc {
        RC_NO_SUCH_OBJECT => Err(DirectoryError::NotFound {
            kind: kind.to_string(),
            key: key.to_string(),
        }),
        RC_ALREADY_EXISTS => Err(DirectoryError::AlreadyExists {
            kind: kind.to_string(),
            key: key.to_string(),
        }),
        _ => check_result(rc, text, &kind.to_string(), key),
    }
}

#[async_trait]
impl DirectoryTarget for LdapDirectory {
    async fn initialize(&self) -> Result<(), DirectoryError> {
        self.handle().await.map(|_| ())
    }

    fn normalize_user(&self, user: &mut IdentityRecord) {
        if user.family_name.is_none() {
            user.family_name = Some(surname_fallback(&user.username));
        }
    }

    #[instrument(skip(self))]
    async fn search_users(&self) -> Result<Vec<IdentityRecord>, DirectoryError> {
        let mut attrs: Vec<String> = USER_ATTRS.iter().map(|s| s.to_string()).collect();
        attrs.push(self.config.user_id_attr.clone());
        let entries = self
            .search(self.config.user_base(), user_filter(&self.config), attrs)
            .await?;
        let users: Vec<IdentityRecord> = entries
            .into_iter()
            .filter_map(|e| self.user_from_entry(e))
            .collect();
        info!(count = users.len(), "retrieved users from directory");
        Ok(users)
    }

    #[instrument(skip(self))]
    async fn search_groups(&self) -> Result<Vec<GroupRecord>, DirectoryError> {
        let attrs = vec![
            self.config.group_name_attr.clone(),
            self.config.group_member_attr.clone(),
            "description".to_string(),
        ];
        let entries = self
            .search(self.config.group_base(), group_filter(&self.config), attrs)
            .await?;
        let groups: Vec<GroupRecord> = entries
            .into_iter()
            .filter_map(|e| self.group_from_entry(e))
            .collect();
        info!(count = groups.len(), "retrieved groups from directory");
        Ok(groups)
    }

    #[instrument(skip(self, attrs))]
    async fn create_user(
        &self,
        username: &str,
        attrs: &TargetAttributes,
    ) -> Result<(), DirectoryError> {
        let dn = self.user_dn(username);
        let entry = build_user_entry(&self.config, username, attrs);
        self.add_entry(EntityKind::User, username, dn, entry).await?;
        info!(username, "created directory user");
        Ok(())
    }

    #[instrument(skip(self, modifications))]
    async fn modify_user(
        &self,
        username: &str,
        modifications: &[Modification],
    ) -> Result<(), DirectoryError> {
        let mods = self.to_mods(modifications);
        self.modify_entry(EntityKind::User, username, self.user_dn(username), mods)
            .await?;
        info!(username, changes = modifications.len(), "updated directory user");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_user(&self, username: &str) -> Result<(), DirectoryError> {
        self.delete_entry(EntityKind::User, username, self.user_dn(username))
            .await?;
        info!(username, "deleted directory user");
        Ok(())
    }

    #[instrument(skip(self, attrs, members))]
    async fn create_group(
        &self,
        name: &str,
        attrs: &TargetAttributes,
        members: &BTreeSet<String>,
    ) -> Result<(), DirectoryError> {
        let member_dns = members.iter().map(|m| self.user_dn(m)).collect();
        let entry = build_group_entry(&self.config, name, attrs, member_dns);
        self.add_entry(EntityKind::Group, name, self.group_dn(name), entry)
            .await?;
        info!(group = name, members = members.len(), "created directory group");
        Ok(())
    }

    #[instrument(skip(self, modifications))]
    async fn modify_group(
        &self,
        name: &str,
        modifications: &[Modification],
    ) -> Result<(), DirectoryError> {
        let removes_members = modifications
            .iter()
            .any(|m| matches!(m, Modification::RemoveMembers(_)));
        let mods = if removes_members {
            let current = self.current_members(name).await?;
            self.group_mods(&current, modifications)
        } else {
            self.to_mods(modifications)
        };
        self.modify_entry(EntityKind::Group, name, self.group_dn(name), mods)
            .await?;
        info!(group = name, changes = modifications.len(), "updated directory group");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_group(&self, name: &str) -> Result<(), DirectoryError> {
        self.delete_entry(EntityKind::Group, name, self.group_dn(name))
            .await?;
        info!(group = name, "deleted directory group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DirectoryConfig {
        crate::config::AppConfig::from_toml_str(
            r#"
[source]
tenant_url = "https://idcs.example.com"
client_id = "c"
client_secret_env = "S"
[directory]
url = "ldap://localhost:389"
bind_dn = "cn=admin,dc=example,dc=com"
bind_password_env = "P"
base_dn = "dc=example,dc=com"
"#,
        )
        .unwrap()
        .directory
    }

    fn entry(dn: &str, attrs: &[(&str, &[&str])]) -> SearchEntry {
        SearchEntry {
            dn: dn.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect(),
            bin_attrs: HashMap::new(),
        }
    }

    fn as_map(entry: Vec<(String, HashSet<String>)>) -> HashMap<String, HashSet<String>> {
        entry.into_iter().collect()
    }

    #[test]
    fn test_build_user_entry_fills_required_attributes() {
        let mut attrs = TargetAttributes::new();
        attrs.insert("mail".into(), vec!["a@x.com".into()]);
        attrs.insert("displayName".into(), vec!["Alice L".into()]);
        attrs.insert("uid".into(), vec!["ignored".into()]);

        let entry = as_map(build_user_entry(&config(), "alice", &attrs));
        assert!(entry["objectClass"].contains("inetOrgPerson"));
        assert_eq!(entry["uid"], HashSet::from(["alice".to_string()]));
        assert_eq!(entry["cn"], HashSet::from(["Alice L".to_string()]));
        assert_eq!(entry["sn"], HashSet::from(["alice".to_string()]));
        assert_eq!(entry["mail"], HashSet::from(["a@x.com".to_string()]));
    }

    #[test]
    fn test_build_group_entry_with_members() {
        let mut attrs = TargetAttributes::new();
        attrs.insert("description".into(), vec!["Engineering".into()]);
        let dns = HashSet::from(["uid=alice,ou=users,dc=example,dc=com".to_string()]);
        let entry = as_map(build_group_entry(&config(), "eng", &attrs, dns));
        assert!(entry["objectClass"].contains("groupOfNames"));
        assert_eq!(entry["cn"], HashSet::from(["eng".to_string()]));
        assert_eq!(entry["member"].len(), 1);

    }

    #[test]
    fn test_empty_group_is_created_with_placeholder_member() {
        let entry = as_map(build_group_entry(
            &config(),
            "empty",
            &TargetAttributes::new(),
            HashSet::new(),
        ));
        assert_eq!(
            entry["member"],
            HashSet::from(["cn=placeholder,dc=example,dc=com".to_string()])
        );

        let dir = LdapDirectory::new(config());
        let group = dir
            .group_from_entry(self::entry(
                "cn=empty,ou=groups,dc=example,dc=com",
                &[
                    ("cn", &["empty"]),
                    ("member", &["cn=placeholder,dc=example,dc=com"]),
                ],
            ))
            .unwrap();
        assert!(group.members.is_empty());
    }

    #[test]
    fn test_removing_every_member_adds_placeholder() {
        let dir = LdapDirectory::new(config());
        let current = HashSet::from([
            "uid=alice,ou=users,dc=example,dc=com".to_string(),
            "uid=bob,ou=users,dc=example,dc=com".to_string(),
        ]);
        let mods = dir.group_mods(
            &current,
            &[Modification::RemoveMembers(vec!["alice".into(), "bob".into()])],
        );
        assert_eq!(mods.len(), 2);
        assert!(matches!(
            &mods[0],
            Mod::Add(a, v) if a == "member" && v.contains("cn=placeholder,dc=example,dc=com")
        ));
        assert!(matches!(&mods[1], Mod::Delete(a, v) if a == "member" && v.len() == 2));
    }

    #[test]
    fn test_partial_removal_or_existing_placeholder_needs_nothing_extra() {
        let dir = LdapDirectory::new(config());
        let remove_alice = [Modification::RemoveMembers(vec!["alice".into()])];

        let current = HashSet::from([
            "uid=alice,ou=users,dc=example,dc=com".to_string(),
            "uid=bob,ou=users,dc=example,dc=com".to_string(),
        ]);
        assert_eq!(dir.group_mods(&current, &remove_alice).len(), 1);

        let current = HashSet::from([
            "uid=alice,ou=users,dc=example,dc=com".to_string(),
            "CN=Placeholder,DC=example,DC=com".to_string(),
        ]);
        assert_eq!(dir.group_mods(&current, &remove_alice).len(), 1);

        // Swapping the last member for a new one keeps the attribute populated.
        let current = HashSet::from(["uid=alice,ou=users,dc=example,dc=com".to_string()]);
        let swap = [
            Modification::AddMembers(vec!["carol".into()]),
            Modification::RemoveMembers(vec!["alice".into()]),
        ];
        assert_eq!(dir.group_mods(&current, &swap).len(), 2);
    }

    #[test]
    fn test_created_user_without_family_name_reads_back_unchanged() {
        use crate::diff::Diffable;
        use crate::mapping::{default_user_table, AttributeMapper};

        let dir = LdapDirectory::new(config());
        let mut source = IdentityRecord::new("alice", RecordSource::IdentityProvider);
        source.email = Some("alice@example.com".into());
        source.raw_attributes = AttributeValue::from(serde_json::json!({
            "userName": "alice",
            "emails": [{"value": "alice@example.com"}]
        }));
        dir.normalize_user(&mut source);
        assert_eq!(source.family_name.as_deref(), Some("alice"));

        let attrs = AttributeMapper::for_users(default_user_table()).map(&source);
        let stored = build_user_entry(&config(), "alice", &attrs);
        let read_back = dir
            .user_from_entry(SearchEntry {
                dn: "uid=alice,ou=users,dc=example,dc=com".into(),
                attrs: stored
                    .into_iter()
                    .map(|(k, vs)| (k, vs.into_iter().collect()))
                    .collect(),
                bin_attrs: HashMap::new(),
            })
            .unwrap();

        assert!(source.modifications_from(&read_back).is_empty());
    }

    #[test]
    fn test_normalize_keeps_real_family_name() {
        let dir = LdapDirectory::new(config());
        let mut user = IdentityRecord::new("alice", RecordSource::IdentityProvider);
        user.family_name = Some("Liddell".into());
        dir.normalize_user(&mut user);
        assert_eq!(user.family_name.as_deref(), Some("Liddell"));
    }

    #[test]
    fn test_user_from_entry() {
        let dir = LdapDirectory::new(config());
        let user = dir
            .user_from_entry(entry(
                "uid=alice,ou=users,dc=example,dc=com",
                &[
                    ("uid", &["alice"]),
                    ("mail", &["a@x.com"]),
                    ("givenname", &["Alice"]),
                    ("memberOf", &["cn=eng,ou=groups,dc=example,dc=com"]),
                ],
            ))
            .unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.given_name.as_deref(), Some("Alice"));
        assert!(user.group_memberships.contains("eng"));
        assert_eq!(user.source, RecordSource::Directory);
    }

    #[test]
    fn test_group_from_entry_maps_member_dns_to_usernames() {
        let dir = LdapDirectory::new(config());
        let group = dir
            .group_from_entry(entry(
                "cn=eng,ou=groups,dc=example,dc=com",
                &[
                    ("cn", &["eng"]),
                    (
                        "member",
                        &[
                            "uid=alice,ou=users,dc=example,dc=com",
                            "uid=bob,ou=users,dc=example,dc=com",
                            "cn=placeholder,dc=example,dc=com",
                        ],
                    ),
                ],
            ))
            .unwrap();
        assert_eq!(group.name, "eng");
        assert_eq!(group.display_name.as_deref(), Some("eng"));
        assert_eq!(group.members.len(), 2);
    }

    #[test]
    fn test_to_mods() {
        let dir = LdapDirectory::new(config());
        let mods = dir.to_mods(&[
            Modification::Replace {
                attribute: "mail".into(),
                value: Some("n@x.com".into()),
            },
            Modification::Replace {
                attribute: "displayName".into(),
                value: None,
            },
            Modification::AddMembers(vec!["bob".into()]),
        ]);
        assert_eq!(mods.len(), 3);
        assert!(matches!(&mods[0], Mod::Replace(a, v) if a == "mail" && v.contains("n@x.com")));
        assert!(matches!(&mods[1], Mod::Delete(a, v) if a == "displayName" && v.is_empty()));
        assert!(matches!(
            &mods[2],
            Mod::Add(a, v) if a == "member" && v.contains("uid=bob,ou=users,dc=example,dc=com")
        ));
    }

    #[test]
    fn test_result_code_mapping() {
        assert!(matches!(
            check_entity_result(32, "", EntityKind::User, "alice"),
            Err(DirectoryError::NotFound { .. })
        ));
        assert!(matches!(
            check_entity_result(68, "", EntityKind::Group, "eng"),
            Err(DirectoryError::AlreadyExists { .. })
        ));
        assert!(matches!(
            check_entity_result(52, "unavailable", EntityKind::User, "alice"),
            Err(DirectoryError::Connectivity(_))
        ));
        assert!(matches!(
            check_entity_result(3, "", EntityKind::User, "alice"),
            Err(DirectoryError::Timeout(_))
        ));
        assert!(matches!(
            check_entity_result(65, "objectClass violation", EntityKind::User, "alice"),
            Err(DirectoryError::Protocol { code: 65, .. })
        ));
        assert!(check_entity_result(0, "", EntityKind::User, "alice").is_ok());
    }

    #[test]
    fn test_filters() {
        let cfg = config();
        assert_eq!(user_filter(&cfg), "(uid=*)");
        assert_eq!(group_filter(&cfg), "(&(objectClass=groupOfNames)(cn=*))");
    }

    #[tokio::test]
    async fn test_missing_bind_password_is_connectivity_error() {
        let dir = LdapDirectory::new(config());
        let err = dir.initialize().await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
