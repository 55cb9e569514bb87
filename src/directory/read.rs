// Search and Compare

use tokio::time::{Duration, Instant};
use tracing::debug;

use super::{is_operational_attribute, value_match, Directory, OpError, OpResult};
use crate::acl::User;
use crate::ldap_protocol::{
    Attribute, CompareRequest, Filter, ProtocolOp, ResultCode, SearchRequest, SearchResultEntry,
    SearchScope, Substring, SubstringFilter,
};
use crate::server::{Request, ResponseWriter};
use crate::store::Entry;

const SELECT_ALL: &str = "*";
const SELECT_OPERATIONAL: &str = "+";
const SELECT_NONE: &str = "1.1";

fn lossy(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

/// Rejects filters this server cannot evaluate before any entry is looked at.
pub(super) fn check_filter(filter: &Filter) -> OpResult<()> {
    match filter {
        Filter::And(items) | Filter::Or(items) => items.iter().try_for_each(check_filter),
        Filter::Not(inner) => check_filter(inner),
        Filter::EqualityMatch(_)
        | Filter::Substrings(_)
        | Filter::Present(_)
        | Filter::ApproxMatch(_) => Ok(()),
        Filter::GreaterOrEqual(_) | Filter::LessOrEqual(_) | Filter::ExtensibleMatch(_) => {
            Err(OpError::new(
                ResultCode::UnwillingToPerform,
                format!("unsupported filter {}", filter),
            ))
        }
    }
}

fn substrings_match(sub: &SubstringFilter, value: &str) -> bool {
    let password = sub.attr_type.eq_ignore_ascii_case(super::ATTR_USERPASSWORD);
    let fold = |s: &str| if password { s.to_string() } else { s.to_lowercase() };
    let value = fold(value);
    let mut rest = value.as_str();

    for part in &sub.substrings {
        match part {
            Substring::Initial(v) => match rest.strip_prefix(fold(&lossy(v)).as_str()) {
                Some(tail) => rest = tail,
                None => return false,
            },
            Substring::Any(v) => {
                let needle = fold(&lossy(v));
                match rest.find(needle.as_str()) {
                    Some(pos) => rest = &rest[pos + needle.len()..],
                    None => return false,
                }
            }
            Substring::Final(v) => {
                if !rest.ends_with(fold(&lossy(v)).as_str()) {
                    return false;
                }
            }
        }
    }
    true
}

/// Evaluates `filter` against an entry. Attribute names match case-insensitively.
pub(super) fn matches(entry: &Entry, filter: &Filter) -> bool {
    match filter {
        Filter::And(items) => items.iter().all(|f| matches(entry, f)),
        Filter::Or(items) => items.iter().any(|f| matches(entry, f)),
        Filter::Not(inner) => !matches(entry, inner),
        Filter::Present(attr) => !entry.get(attr).is_empty(),
        Filter::EqualityMatch(ava) | Filter::ApproxMatch(ava) => {
            let asserted = lossy(&ava.assertion_value);
            entry
                .get(&ava.attribute_desc)
                .iter()
                .any(|v| value_match(&ava.attribute_desc, v, &asserted))
        }
        Filter::Substrings(sub) => entry
            .get(&sub.attr_type)
            .iter()
            .any(|v| substrings_match(sub, v)),
        // rejected up front by check_filter
        Filter::GreaterOrEqual(_) | Filter::LessOrEqual(_) | Filter::ExtensibleMatch(_) => false,
    }
}

/// Which attributes of an entry a search asked for.
pub(super) struct Selection {
    all: bool,
    operational: bool,
    named: Vec<String>,
}

impl Selection {
    pub(super) fn new(requested: &[String]) -> Self {
        if requested.is_empty() {
            return Self {
                all: true,
                operational: false,
                named: Vec::new(),
            };
        }
        if requested.len() == 1 && requested[0] == SELECT_NONE {
            return Self {
                all: false,
                operational: false,
                named: Vec::new(),
            };
        }
        Self {
            all: requested.iter().any(|a| a == SELECT_ALL),
            operational: requested.iter().any(|a| a == SELECT_OPERATIONAL),
            named: requested.iter().map(|a| a.to_lowercase()).collect(),
        }
    }

    pub(super) fn includes(&self, attr: &str) -> bool {
        let operational = is_operational_attribute(attr);
        (self.all && !operational)
            || (self.operational && operational)
            || self.named.iter().any(|n| n == attr)
    }
}

impl Directory {
    fn result_entry(&self, user: &User, entry: &Entry, selection: &Selection, types_only: bool) -> SearchResultEntry {
        let attributes = entry
            .attributes
            .iter()
            .filter(|(name, _)| selection.includes(name))
            .filter(|(name, _)| {
                self.acl
                    .check(user, "read", &entry.dn, std::slice::from_ref(*name))
            })
            .map(|(name, values)| Attribute {
                attr_type: name.clone(),
                attr_values: if types_only {
                    Vec::new()
                } else {
                    values.iter().map(|v| v.as_bytes().to_vec()).collect()
                },
            })
            .collect();

        SearchResultEntry {
            object_name: entry.dn.to_string(),
            attributes,
        }
    }

    pub(super) async fn search(
        &self,
        request: &Request,
        req: &SearchRequest,
        writer: &ResponseWriter,
    ) -> OpResult<ResultCode> {
        let user = request.user();
        let base = self.parse_dn(&req.base_object, true)?;
        check_filter(&req.filter)?;
        if !self.acl.check(&user, "read", &base, &[]) {
            return Err(OpError::new(
                ResultCode::InsufficientAccessRights,
                "please specify a base object on which you have read rights",
            ));
        }

        let deadline = (req.time_limit > 0)
            .then(|| Instant::now() + Duration::from_secs(req.time_limit as u64));
        let size_limit = usize::try_from(req.size_limit).unwrap_or(0);

        let exact = req.scope == SearchScope::BaseObject;
        let entries = self.store.list(&base.prefix(), exact).await?;
        debug!("Retrieved {} candidate entries under {}", entries.len(), base);

        let selection = Selection::new(&req.attributes);
        let mut sent = 0usize;
        for entry in &entries {
            if request.is_cancelled() {
                return Err(OpError::new(ResultCode::Other, "abandoned"));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(OpError::code(ResultCode::TimeLimitExceeded));
            }
            if req.scope == SearchScope::SingleLevel && entry.dn.level() != base.level() + 1 {
                continue;
            }
            if !matches(entry, &req.filter) {
                continue;
            }
            if !self.acl.check(&user, "read", &entry.dn, &[]) {
                continue;
            }
            if size_limit > 0 && sent == size_limit {
                return Err(OpError::code(ResultCode::SizeLimitExceeded));
            }

            let result = self.result_entry(&user, entry, &selection, req.types_only);
            writer
                .write(ProtocolOp::SearchResultEntry(result))
                .await
                .map_err(|_| OpError::new(ResultCode::OperationsError, "connection closed"))?;
            sent += 1;
        }

        debug!("SEARCH returned {} entries from {}", sent, base);
        Ok(ResultCode::Success)
    }

    pub(super) async fn compare(&self, user: &User, req: &CompareRequest) -> OpResult<ResultCode> {
        let dn = self.parse_dn(&req.entry, false)?;
        let attr = req.ava.attribute_desc.to_lowercase();
        self.check_access(user, "read", &dn, std::slice::from_ref(&attr))?;

        let entry = self.get_entry(&dn).await?.ok_or_else(|| {
            OpError::new(ResultCode::NoSuchObject, format!("{} does not exist", dn))
        })?;

        let asserted = lossy(&req.ava.assertion_value);
        if entry.get(&attr).iter().any(|v| value_match(&attr, v, &asserted)) {
            Ok(ResultCode::CompareTrue)
        } else {
            Ok(ResultCode::CompareFalse)
        }
    }
}
