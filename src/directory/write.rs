// Add, Delete, Modify and PasswordModify
//
// Every check that guards a write (existence, parent, children, members) reads
// through the write transaction, so it sees the same state the commit applies to.

use std::collections::BTreeSet;
use tracing::{debug, info};

use super::membership::{membership_add, membership_remove};
use super::{
    check_writable, timestamp, Directory, OpError, OpResult, ATTR_CREATETIMESTAMP,
    ATTR_CREATORSNAME, ATTR_ENTRYUUID, ATTR_MEMBER, ATTR_MEMBEROF, ATTR_MODIFIERSNAME,
    ATTR_MODIFYTIMESTAMP, ATTR_OBJECTCLASS, ATTR_USERPASSWORD,
};
use crate::acl::User;
use crate::dn::Dn;
use crate::ldap_protocol::{
    AddRequest, Attribute, DelRequest, ModifyOperation, ModifyRequest, PasswordModifyRequest,
    ResultCode,
};
use crate::password::hash_default;
use crate::store::{Attributes, Entry, Transaction};

fn attribute_values(attribute: &Attribute) -> OpResult<Vec<String>> {
    attribute
        .attr_values
        .iter()
        .map(|v| {
            String::from_utf8(v.clone()).map_err(|_| {
                OpError::new(
                    ResultCode::InvalidAttributeSyntax,
                    format!("value of {} is not valid UTF-8", attribute.attr_type),
                )
            })
        })
        .collect()
}

fn push_unique(values: &mut Vec<String>, value: String) {
    if !values.contains(&value) {
        values.push(value);
    }
}

async fn exists(tx: &mut dyn Transaction, dn: &Dn) -> OpResult<bool> {
    Ok(tx.get(dn).await?.is_some())
}

impl Directory {
    /// Member values as canonical DNs under the base DN.
    fn canonical_members(&self, values: &[String]) -> OpResult<Vec<Dn>> {
        values.iter().map(|v| self.parse_dn(v, false)).collect()
    }

    pub(super) async fn add(&self, user: &User, req: &AddRequest) -> OpResult<ResultCode> {
        let dn = self.parse_dn(&req.entry, false)?;
        let keys: Vec<String> = req
            .attributes
            .iter()
            .map(|a| a.attr_type.to_lowercase())
            .collect();
        self.check_access(user, "add", &dn, &keys)?;

        let mut attributes = Attributes::new();
        let mut members: Vec<Dn> = Vec::new();
        for attribute in &req.attributes {
            let key = attribute.attr_type.to_lowercase();
            check_writable(&key)?;
            let values = attribute_values(attribute)?;
            if key == ATTR_MEMBER {
                for member in self.canonical_members(&values)? {
                    if !members.contains(&member) {
                        members.push(member);
                    }
                }
            } else {
                let mut merged = attributes.get(&key).to_vec();
                for value in values {
                    push_unique(&mut merged, value);
                }
                attributes.set(&key, merged);
            }
        }
        if !members.is_empty() {
            attributes.set(ATTR_MEMBER, members.iter().map(Dn::to_string).collect());
        }
        if attributes.get(ATTR_OBJECTCLASS).is_empty() {
            attributes.set(ATTR_OBJECTCLASS, vec!["top".to_string()]);
        }
        attributes.set(ATTR_CREATORSNAME, vec![user.dn.clone()]);
        attributes.set(ATTR_CREATETIMESTAMP, vec![timestamp()]);
        attributes.set(ATTR_ENTRYUUID, vec![uuid::Uuid::new_v4().to_string()]);

        let mut tx = self.store.begin().await?;
        if exists(tx.as_mut(), &dn).await? {
            return Err(OpError::new(
                ResultCode::EntryAlreadyExists,
                format!("{} already exists", dn),
            ));
        }
        let parent = dn.parent();
        if !exists(tx.as_mut(), &parent).await? {
            return Err(OpError::new(
                ResultCode::NoSuchObject,
                format!("parent object {} does not exist", parent),
            ));
        }
        for member in &members {
            // a group may list itself
            if *member != dn && !exists(tx.as_mut(), member).await? {
                return Err(OpError::new(
                    ResultCode::NoSuchObject,
                    format!("cannot add {} to members, it does not exist", member),
                ));
            }
        }

        debug!("Adding entry {} with attributes {:?}", dn, keys);
        tx.store(Entry::new(dn.clone(), attributes)).await?;
        for member in &members {
            membership_add(tx.as_mut(), ATTR_MEMBEROF, member, &dn).await?;
        }
        tx.commit().await?;
        Ok(ResultCode::Success)
    }

    pub(super) async fn delete(&self, user: &User, req: &DelRequest) -> OpResult<ResultCode> {
        let dn = self.parse_dn(&req.entry, false)?;
        self.check_access(user, "delete", &dn, &[])?;

        let mut tx = self.store.begin().await?;
        let subtree = tx.list(&dn.prefix(), false).await?;
        if subtree.iter().any(|e| e.dn != dn) {
            return Err(OpError::new(
                ResultCode::NotAllowedOnNonLeaf,
                format!("cannot delete {} as it has children", dn),
            ));
        }
        let Some(entry) = subtree.into_iter().find(|e| e.dn == dn) else {
            return Err(OpError::new(
                ResultCode::NoSuchObject,
                format!("{} does not exist", dn),
            ));
        };

        tx.delete(&dn).await?;

        // drop this entry from the groups it belonged to and from its members
        for group in entry.get(ATTR_MEMBEROF) {
            match Dn::parse(group) {
                Ok(group) => membership_remove(tx.as_mut(), ATTR_MEMBER, &group, &dn).await?,
                Err(e) => info!("Ignoring malformed memberof {:?} on {}: {:#}", group, dn, e),
            }
        }
        for member in entry.get(ATTR_MEMBER) {
            match Dn::parse(member) {
                Ok(member) => membership_remove(tx.as_mut(), ATTR_MEMBEROF, &member, &dn).await?,
                Err(e) => info!("Ignoring malformed member {:?} on {}: {:#}", member, dn, e),
            }
        }

        tx.commit().await?;
        Ok(ResultCode::Success)
    }

    pub(super) async fn modify(&self, user: &User, req: &ModifyRequest) -> OpResult<ResultCode> {
        let dn = self.parse_dn(&req.object, false)?;
        if !self.acl.check(user, "modify", &dn, &[]) && !self.acl.check(user, "modifyAdd", &dn, &[]) {
            return Err(OpError::access_denied(user, "modify", &dn));
        }

        let mut tx = self.store.begin().await?;
        let previous = tx.get(&dn).await?.ok_or_else(|| {
            OpError::new(ResultCode::NoSuchObject, format!("{} does not exist", dn))
        })?;
        let rdn_type = dn.leaf().map(|c| c.typ.clone()).unwrap_or_default();

        let old_members: BTreeSet<Dn> = previous
            .get(ATTR_MEMBER)
            .iter()
            .filter_map(|v| Dn::parse(v).ok())
            .collect();
        let mut attributes = previous.attributes.clone();
        let mut objectclass_touched = false;

        for change in &req.changes {
            let key = change.modification.attr_type.to_lowercase();
            check_writable(&key)?;
            if key == rdn_type {
                return Err(OpError::new(
                    ResultCode::ObjectClassViolation,
                    format!("{} may not be changed as it is part of the entry's DN", key),
                ));
            }

            let attr = std::slice::from_ref(&key);
            let allowed = self.acl.check(user, "modify", &dn, attr)
                || (change.operation == ModifyOperation::Add
                    && self.acl.check(user, "modifyAdd", &dn, attr));
            if !allowed {
                return Err(OpError::access_denied(user, "modify", &dn));
            }

            let mut values = attribute_values(&change.modification)?;
            if key == ATTR_MEMBER {
                values = self
                    .canonical_members(&values)?
                    .iter()
                    .map(Dn::to_string)
                    .collect();
            }
            objectclass_touched |= key == ATTR_OBJECTCLASS;

            let mut current = attributes.get(&key).to_vec();
            match change.operation {
                ModifyOperation::Add => {
                    for value in values {
                        push_unique(&mut current, value);
                    }
                }
                ModifyOperation::Delete if values.is_empty() => current.clear(),
                ModifyOperation::Delete => current.retain(|v| !values.contains(v)),
                ModifyOperation::Replace => {
                    current.clear();
                    for value in values {
                        push_unique(&mut current, value);
                    }
                }
            }
            attributes.set(&key, current);
        }

        if objectclass_touched && attributes.get(ATTR_OBJECTCLASS).is_empty() {
            return Err(OpError::new(
                ResultCode::InsufficientAccessRights,
                "cannot remove all objectclass values",
            ));
        }

        let new_members: BTreeSet<Dn> = attributes
            .get(ATTR_MEMBER)
            .iter()
            .filter_map(|v| Dn::parse(v).ok())
            .collect();
        let added: Vec<&Dn> = new_members.difference(&old_members).collect();
        let removed: Vec<&Dn> = old_members.difference(&new_members).collect();
        for member in &added {
            if **member != dn && !exists(tx.as_mut(), member).await? {
                return Err(OpError::new(
                    ResultCode::NoSuchObject,
                    format!("cannot add member {}, it does not exist", member),
                ));
            }
        }

        attributes.set(ATTR_MODIFIERSNAME, vec![user.dn.clone()]);
        attributes.set(ATTR_MODIFYTIMESTAMP, vec![timestamp()]);
        tx.store(Entry::new(previous.dn, attributes)).await?;

        for member in added {
            membership_add(tx.as_mut(), ATTR_MEMBEROF, member, &dn).await?;
        }
        for member in removed {
            membership_remove(tx.as_mut(), ATTR_MEMBEROF, member, &dn).await?;
        }

        tx.commit().await?;
        Ok(ResultCode::Success)
    }

    pub(super) async fn password_modify(&self, user: &User, value: Option<&[u8]>) -> OpResult<ResultCode> {
        let req = match value {
            Some(value) => PasswordModifyRequest::decode(value).map_err(|e| {
                OpError::new(
                    ResultCode::InvalidAttributeSyntax,
                    format!("malformed PasswordModify request: {:#}", e),
                )
            })?,
            None => PasswordModifyRequest::default(),
        };
        let Some(new_password) = req.new_password else {
            return Err(OpError::new(
                ResultCode::AuthMethodNotSupported,
                "new password is missing",
            ));
        };
        if user.is_anonymous() {
            return Err(OpError::new(ResultCode::InsufficientAccessRights, "not logged in"));
        }

        let target = req.user_identity.as_deref().unwrap_or(&user.dn);
        let dn = self.parse_dn(target, false)?;
        self.check_access(user, "modify", &dn, &[ATTR_USERPASSWORD.to_string()])?;
        if dn == self.base_dn {
            return Err(OpError::new(
                ResultCode::InvalidDnSyntax,
                "root entry password cannot be set",
            ));
        }

        let mut tx = self.store.begin().await?;
        let Entry { dn, mut attributes } = tx.get(&dn).await?.ok_or_else(|| {
            OpError::new(ResultCode::NoSuchObject, format!("{} does not exist", dn))
        })?;
        attributes.set(ATTR_USERPASSWORD, vec![hash_default(&new_password)]);
        attributes.set(ATTR_MODIFIERSNAME, vec![user.dn.clone()]);
        attributes.set(ATTR_MODIFYTIMESTAMP, vec![timestamp()]);
        info!("Updating password of {}", dn);
        tx.store(Entry::new(dn, attributes)).await?;
        tx.commit().await?;
        Ok(ResultCode::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::*;
    use super::*;
    use crate::ldap_protocol::{ExtendedRequest, ModifyChange, ProtocolOp, PASSWORD_MODIFY_OID};
    use crate::server::Principal;

    const ALICE: &str = "cn=alice,ou=users,dc=teapot,dc=ovh";
    const BOB: &str = "cn=bob,ou=users,dc=teapot,dc=ovh";
    const ADMINS: &str = "cn=admins,ou=groups,dc=teapot,dc=ovh";

    fn modify_op(dn: &str, changes: Vec<(ModifyOperation, Attribute)>) -> ProtocolOp {
        ProtocolOp::ModifyRequest(ModifyRequest {
            object: dn.to_string(),
            changes: changes
                .into_iter()
                .map(|(operation, modification)| ModifyChange {
                    operation,
                    modification,
                })
                .collect(),
        })
    }

    fn passwd_op(identity: Option<&str>, new_password: Option<&str>) -> ProtocolOp {
        let value = PasswordModifyRequest {
            user_identity: identity.map(String::from),
            old_password: None,
            new_password: new_password.map(|p| p.as_bytes().to_vec()),
        }
        .encode()
        .unwrap();
        ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: PASSWORD_MODIFY_OID.to_string(),
            request_value: Some(value),
        })
    }

    async fn entry(dir: &Directory, dn: &str) -> Option<Entry> {
        dir.get_entry(&Dn::parse(dn).unwrap()).await.unwrap()
    }

    async fn with_bob_and_group(dir: &Directory, admin: &Principal) {
        let bob = add_op(BOB, vec![attr("userpassword", &[&hash_default(b"bob-pw")])]);
        assert_eq!(code(dir, admin, bob).await, ResultCode::Success);
        let group = add_op(ADMINS, vec![attr("objectclass", &["groupOfNames"]), attr("member", &[BOB])]);
        assert_eq!(code(dir, admin, group).await, ResultCode::Success);
    }

    #[tokio::test]
    async fn test_add_stamps_system_attributes() {
        let (dir, admin) = seeded().await;
        let alice = entry(&dir, ALICE).await.unwrap();
        assert_eq!(alice.get("cn"), ["alice"]);
        assert_eq!(alice.get("objectclass"), ["inetOrgPerson"]);
        assert_eq!(alice.get("creatorsname"), [BASE]);
        assert_eq!(alice.get("createtimestamp")[0].len(), "20260101000000Z".len());
        assert_eq!(alice.get("entryuuid").len(), 1);

        let plain = add_op("cn=plain,ou=users,dc=teapot,dc=ovh", Vec::new());
        assert_eq!(code(&dir, &admin, plain).await, ResultCode::Success);
        let plain = entry(&dir, "cn=plain,ou=users,dc=teapot,dc=ovh").await.unwrap();
        assert_eq!(plain.get("objectclass"), ["top"]);
    }

    #[tokio::test]
    async fn test_add_errors() {
        let (dir, admin) = seeded().await;
        assert_eq!(
            code(&dir, &admin, add_op(ALICE, Vec::new())).await,
            ResultCode::EntryAlreadyExists
        );
        assert_eq!(
            code(&dir, &admin, add_op("cn=x,ou=nowhere,dc=teapot,dc=ovh", Vec::new())).await,
            ResultCode::NoSuchObject
        );
        assert_eq!(
            code(&dir, &admin, add_op("cn=x,dc=example,dc=com", Vec::new())).await,
            ResultCode::InvalidDnSyntax
        );
        assert_eq!(
            code(&dir, &admin, add_op("cn=a/b,ou=users,dc=teapot,dc=ovh", Vec::new())).await,
            ResultCode::InvalidDnSyntax
        );
        assert!(entry(&dir, "cn=a,ou=users,dc=teapot,dc=ovh").await.is_none());
        assert_eq!(
            code(&dir, &admin, add_op(BOB, vec![attr("memberOf", &[ADMINS])])).await,
            ResultCode::ObjectClassViolation
        );
        assert_eq!(
            code(&dir, &admin, add_op(BOB, vec![attr("entryUUID", &["x"])])).await,
            ResultCode::ObjectClassViolation
        );
        assert_eq!(
            code(&dir, &admin, add_op(ADMINS, vec![attr("member", &["cn=ghost,ou=users,dc=teapot,dc=ovh"])])).await,
            ResultCode::NoSuchObject
        );
        assert_eq!(
            code(&dir, &admin, add_op(ADMINS, vec![attr("member", &["cn=x,dc=example,dc=com"])])).await,
            ResultCode::InvalidDnSyntax
        );
        assert!(entry(&dir, ADMINS).await.is_none());
        assert_eq!(
            code(&dir, &Principal::default(), add_op(BOB, Vec::new())).await,
            ResultCode::InsufficientAccessRights
        );
    }

    #[tokio::test]
    async fn test_add_group_sets_memberof() {
        let (dir, admin) = seeded().await;
        let group = add_op(ADMINS, vec![attr("member", &["CN=Alice, OU=Users,dc=teapot,dc=ovh"])]);
        assert_eq!(code(&dir, &admin, group).await, ResultCode::Success);

        let group = entry(&dir, ADMINS).await.unwrap();
        assert_eq!(group.get("member"), [ALICE]);
        let alice = entry(&dir, ALICE).await.unwrap();
        assert_eq!(alice.get("memberof"), [ADMINS]);
    }

    #[tokio::test]
    async fn test_delete_with_children_refused() {
        let (dir, admin) = seeded().await;
        assert_eq!(
            code(&dir, &admin, delete_op("ou=users,dc=teapot,dc=ovh")).await,
            ResultCode::NotAllowedOnNonLeaf
        );
        assert_eq!(
            code(&dir, &admin, delete_op("cn=ghost,ou=users,dc=teapot,dc=ovh")).await,
            ResultCode::NoSuchObject
        );
        assert!(entry(&dir, "ou=users,dc=teapot,dc=ovh").await.is_some());
    }

    #[tokio::test]
    async fn test_delete_member_cleans_groups() {
        let (dir, admin) = seeded().await;
        with_bob_and_group(&dir, &admin).await;
        let modify = modify_op(ADMINS, vec![(ModifyOperation::Add, attr("member", &[ALICE]))]);
        assert_eq!(code(&dir, &admin, modify).await, ResultCode::Success);

        assert_eq!(code(&dir, &admin, delete_op(ALICE)).await, ResultCode::Success);
        assert!(entry(&dir, ALICE).await.is_none());
        let group = entry(&dir, ADMINS).await.unwrap();
        assert_eq!(group.get("member"), [BOB]);
    }

    #[tokio::test]
    async fn test_delete_group_cleans_members() {
        let (dir, admin) = seeded().await;
        with_bob_and_group(&dir, &admin).await;
        assert_eq!(entry(&dir, BOB).await.unwrap().get("memberof"), [ADMINS]);

        assert_eq!(code(&dir, &admin, delete_op(ADMINS)).await, ResultCode::Success);
        let bob = entry(&dir, BOB).await.unwrap();
        assert!(bob.get("memberof").is_empty());
    }

    #[tokio::test]
    async fn test_delete_denied_for_regular_user() {
        let (dir, admin) = seeded().await;
        with_bob_and_group(&dir, &admin).await;
        let session = Principal::default();
        assert_eq!(code(&dir, &session, bind_op(ALICE, "alice-pw")).await, ResultCode::Success);
        assert_eq!(
            code(&dir, &session, delete_op(BOB)).await,
            ResultCode::InsufficientAccessRights
        );
    }

    #[tokio::test]
    async fn test_group_admin_may_delete() {
        let (dir, admin) = seeded().await;
        let group = add_op(
            "cn=admin,ou=groups,dc=teapot,dc=ovh",
            vec![attr("member", &[ALICE])],
        );
        assert_eq!(code(&dir, &admin, group).await, ResultCode::Success);
        let bob = add_op(BOB, Vec::new());
        assert_eq!(code(&dir, &admin, bob).await, ResultCode::Success);

        let session = Principal::default();
        assert_eq!(code(&dir, &session, bind_op(ALICE, "alice-pw")).await, ResultCode::Success);
        assert_eq!(code(&dir, &session, delete_op(BOB)).await, ResultCode::Success);
    }

    #[tokio::test]
    async fn test_modify_member_add_updates_memberof() {
        let (dir, admin) = seeded().await;
        let group = add_op(ADMINS, vec![attr("objectclass", &["groupOfNames"])]);
        assert_eq!(code(&dir, &admin, group).await, ResultCode::Success);

        let modify = modify_op(ADMINS, vec![(ModifyOperation::Add, attr("member", &[ALICE]))]);
        assert_eq!(code(&dir, &admin, modify).await, ResultCode::Success);
        assert_eq!(entry(&dir, ALICE).await.unwrap().get("memberof"), [ADMINS]);
        let group = entry(&dir, ADMINS).await.unwrap();
        assert_eq!(group.get("member"), [ALICE]);
        assert_eq!(group.get("objectclass"), ["groupOfNames"]);
        assert_eq!(group.get("modifiersname"), [BASE]);
    }

    #[tokio::test]
    async fn test_modify_member_replace_and_delete() {
        let (dir, admin) = seeded().await;
        with_bob_and_group(&dir, &admin).await;

        let replace = modify_op(ADMINS, vec![(ModifyOperation::Replace, attr("member", &[ALICE]))]);
        assert_eq!(code(&dir, &admin, replace).await, ResultCode::Success);
        assert_eq!(entry(&dir, ALICE).await.unwrap().get("memberof"), [ADMINS]);
        assert!(entry(&dir, BOB).await.unwrap().get("memberof").is_empty());

        let delete_all = modify_op(ADMINS, vec![(ModifyOperation::Delete, attr("member", &[]))]);
        assert_eq!(code(&dir, &admin, delete_all).await, ResultCode::Success);
        assert!(entry(&dir, ALICE).await.unwrap().get("memberof").is_empty());
        assert!(entry(&dir, ADMINS).await.unwrap().get("member").is_empty());
    }

    #[tokio::test]
    async fn test_modify_delete_then_readd_keeps_memberof() {
        let (dir, admin) = seeded().await;
        with_bob_and_group(&dir, &admin).await;
        let modify = modify_op(
            ADMINS,
            vec![
                (ModifyOperation::Delete, attr("member", &[BOB])),
                (ModifyOperation::Add, attr("member", &[BOB])),
            ],
        );
        assert_eq!(code(&dir, &admin, modify).await, ResultCode::Success);
        assert_eq!(entry(&dir, ADMINS).await.unwrap().get("member"), [BOB]);
        assert_eq!(entry(&dir, BOB).await.unwrap().get("memberof"), [ADMINS]);
    }

    #[tokio::test]
    async fn test_modify_rejects_missing_member() {
        let (dir, admin) = seeded().await;
        with_bob_and_group(&dir, &admin).await;
        let modify = modify_op(
            ADMINS,
            vec![(ModifyOperation::Add, attr("member", &["cn=ghost,ou=users,dc=teapot,dc=ovh"]))],
        );
        assert_eq!(code(&dir, &admin, modify).await, ResultCode::NoSuchObject);
        assert_eq!(entry(&dir, ADMINS).await.unwrap().get("member"), [BOB]);
    }

    #[tokio::test]
    async fn test_modify_restrictions() {
        let (dir, admin) = seeded().await;
        let cases = [
            (ModifyOperation::Replace, attr("cn", &["mallory"]), ResultCode::ObjectClassViolation),
            (ModifyOperation::Add, attr("memberOf", &[ADMINS]), ResultCode::ObjectClassViolation),
            (ModifyOperation::Replace, attr("modifyTimestamp", &["x"]), ResultCode::ObjectClassViolation),
            (ModifyOperation::Delete, attr("objectClass", &[]), ResultCode::InsufficientAccessRights),
        ];
        for (operation, attribute, expected) in cases {
            let modify = modify_op(ALICE, vec![(operation, attribute)]);
            assert_eq!(code(&dir, &admin, modify).await, expected);
        }
        assert_eq!(
            code(&dir, &admin, modify_op("cn=ghost,ou=users,dc=teapot,dc=ovh", Vec::new())).await,
            ResultCode::NoSuchObject
        );
    }

    #[tokio::test]
    async fn test_modify_self_only() {
        let (dir, admin) = seeded().await;
        with_bob_and_group(&dir, &admin).await;
        let session = Principal::default();
        assert_eq!(code(&dir, &session, bind_op(ALICE, "alice-pw")).await, ResultCode::Success);

        let own = modify_op(ALICE, vec![(ModifyOperation::Add, attr("mail", &["alice@teapot.ovh"]))]);
        assert_eq!(code(&dir, &session, own).await, ResultCode::Success);
        let alice = entry(&dir, ALICE).await.unwrap();
        assert_eq!(alice.get("mail"), ["alice@teapot.ovh"]);
        assert_eq!(alice.get("sn"), ["Liddell"]);
        assert_eq!(alice.get("modifiersname"), [ALICE]);

        let other = modify_op(BOB, vec![(ModifyOperation::Add, attr("mail", &["x@teapot.ovh"]))]);
        assert_eq!(code(&dir, &session, other).await, ResultCode::InsufficientAccessRights);
    }

    #[tokio::test]
    async fn test_modify_value_operations() {
        let (dir, admin) = seeded().await;
        let modify = modify_op(
            ALICE,
            vec![
                (ModifyOperation::Add, attr("mail", &["a@x", "b@x", "a@x"])),
                (ModifyOperation::Delete, attr("mail", &["a@x"])),
                (ModifyOperation::Add, attr("description", &["one"])),
                (ModifyOperation::Replace, attr("description", &["two", "three"])),
                (ModifyOperation::Delete, attr("sn", &[])),
            ],
        );
        assert_eq!(code(&dir, &admin, modify).await, ResultCode::Success);
        let alice = entry(&dir, ALICE).await.unwrap();
        assert_eq!(alice.get("mail"), ["b@x"]);
        assert_eq!(alice.get("description"), ["two", "three"]);
        assert!(!alice.attributes.contains("sn"));
    }

    #[tokio::test]
    async fn test_password_modify_own() {
        let (dir, _) = seeded().await;
        let session = Principal::default();
        assert_eq!(code(&dir, &session, bind_op(ALICE, "alice-pw")).await, ResultCode::Success);

        assert_eq!(
            code(&dir, &session, passwd_op(None, Some("rabbit-hole"))).await,
            ResultCode::Success
        );
        let stored = entry(&dir, ALICE).await.unwrap().get("userpassword").to_vec();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].starts_with("{SSHA512}"));

        let fresh = Principal::default();
        assert_eq!(code(&dir, &fresh, bind_op(ALICE, "alice-pw")).await, ResultCode::InvalidCredentials);
        assert_eq!(code(&dir, &fresh, bind_op(ALICE, "rabbit-hole")).await, ResultCode::Success);
    }

    #[tokio::test]
    async fn test_password_modify_errors() {
        let (dir, admin) = seeded().await;
        with_bob_and_group(&dir, &admin).await;
        let session = Principal::default();
        assert_eq!(code(&dir, &session, bind_op(ALICE, "alice-pw")).await, ResultCode::Success);

        assert_eq!(
            code(&dir, &session, passwd_op(None, None)).await,
            ResultCode::AuthMethodNotSupported
        );
        assert_eq!(
            code(&dir, &session, passwd_op(Some(BOB), Some("x"))).await,
            ResultCode::InsufficientAccessRights
        );
        assert_eq!(
            code(&dir, &admin, passwd_op(Some(BASE), Some("x"))).await,
            ResultCode::InvalidDnSyntax
        );
        assert_eq!(
            code(&dir, &admin, passwd_op(Some("cn=ghost,ou=users,dc=teapot,dc=ovh"), Some("x"))).await,
            ResultCode::NoSuchObject
        );

        let garbage = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: PASSWORD_MODIFY_OID.to_string(),
            request_value: Some(vec![0x04, 0x01]),
        });
        assert_eq!(code(&dir, &session, garbage).await, ResultCode::InvalidAttributeSyntax);

        // an administrator may reset someone else's password
        assert_eq!(code(&dir, &admin, passwd_op(Some(BOB), Some("new-bob"))).await, ResultCode::Success);
    }
}
