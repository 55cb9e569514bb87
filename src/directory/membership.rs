// member / memberof back-references
//
// A group lists its members in `member`; every member lists its groups in
// `memberof`. Both sides are only ever changed inside the transaction of the
// operation that touched the group.

use tracing::warn;

use super::{OpError, OpResult};
use crate::dn::Dn;
use crate::ldap_protocol::ResultCode;
use crate::store::{Entry, Transaction};

/// Adds `group` to the `attr` list of `member`. No-op when already present.
pub(super) async fn membership_add(
    tx: &mut dyn Transaction,
    attr: &str,
    member: &Dn,
    group: &Dn,
) -> OpResult<()> {
    let Some(entity) = tx.get(member).await? else {
        return Err(OpError::new(
            ResultCode::NoSuchObject,
            format!("cannot update {} of {}, it does not exist", attr, member),
        ));
    };

    let group = group.to_string();
    let mut values = entity.get(attr).to_vec();
    if values.contains(&group) {
        return Ok(());
    }
    values.push(group);

    let Entry { dn, mut attributes } = entity;
    attributes.set(attr, values);
    tx.store(Entry::new(dn, attributes)).await?;
    Ok(())
}

/// Removes `group` from the `attr` list of `member`. A member that no longer
/// exists has nothing left to clean up and is skipped.
pub(super) async fn membership_remove(
    tx: &mut dyn Transaction,
    attr: &str,
    member: &Dn,
    group: &Dn,
) -> OpResult<()> {
    let Some(entity) = tx.get(member).await? else {
        warn!("Skipping {} cleanup on missing entry {}", attr, member);
        return Ok(());
    };

    let values = entity.get(attr);
    let kept: Vec<String> = values
        .iter()
        .filter(|v| Dn::parse(v).map(|dn| dn != *group).unwrap_or(true))
        .cloned()
        .collect();
    if kept.len() == values.len() {
        return Ok(());
    }

    let Entry { dn, mut attributes } = entity;
    attributes.set(attr, kept);
    tx.store(Entry::new(dn, attributes)).await?;
    Ok(())
}
