// Directory engine
//
// Every LDAP operation runs as the session's principal, is checked against the
// ACL and ends in exactly one result code. Storage failures become
// operationsError with a generic diagnostic; the cause goes to the log only.

mod membership;
mod read;
mod write;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::acl::{Acl, User};
use crate::config::DirectoryConfig;
use crate::dn::Dn;
use crate::ldap_protocol::{
    BindAuthentication, BindRequest, BindResponse, ExtendedRequest, ExtendedResponse, LdapResult,
    ProtocolOp, ResultCode, PASSWORD_MODIFY_OID, START_TLS_OID, WHO_AM_I_OID,
};
use crate::password::{hash_default, verify_password};
use crate::server::{Handler, Request, ResponseWriter};
use crate::store::{Attributes, Entry, Store};

// System managed attributes, never writable by clients.
pub const ATTR_MEMBEROF: &str = "memberof";
pub const ATTR_ENTRYUUID: &str = "entryuuid";
pub const ATTR_CREATORSNAME: &str = "creatorsname";
pub const ATTR_CREATETIMESTAMP: &str = "createtimestamp";
pub const ATTR_MODIFIERSNAME: &str = "modifiersname";
pub const ATTR_MODIFYTIMESTAMP: &str = "modifytimestamp";
pub const ATTR_ENTRYCSN: &str = "entrycsn";

pub const ATTR_OBJECTCLASS: &str = "objectclass";
pub const ATTR_MEMBER: &str = "member";
pub const ATTR_USERPASSWORD: &str = "userpassword";

/// Returned only when explicitly requested with `+`.
pub const OPERATIONAL_ATTRIBUTES: [&str; 6] = [
    ATTR_ENTRYUUID,
    ATTR_CREATORSNAME,
    ATTR_CREATETIMESTAMP,
    ATTR_MODIFIERSNAME,
    ATTR_MODIFYTIMESTAMP,
    ATTR_ENTRYCSN,
];

const STORAGE_ERROR_MESSAGE: &str = "internal storage error";
const BIND_FAILED_MESSAGE: &str = "invalid credentials";

pub fn is_operational_attribute(attr: &str) -> bool {
    OPERATIONAL_ATTRIBUTES
        .iter()
        .any(|op| op.eq_ignore_ascii_case(attr))
}

/// Whether a client may write `attr` directly.
fn check_writable(attr: &str) -> OpResult<()> {
    if attr.eq_ignore_ascii_case(ATTR_MEMBEROF) {
        return Err(OpError::new(
            ResultCode::ObjectClassViolation,
            "memberOf cannot be defined directly, membership must be specified in the group itself",
        ));
    }
    if is_operational_attribute(attr) {
        return Err(OpError::new(
            ResultCode::ObjectClassViolation,
            format!("attribute {} is restricted and may only be set by the system", attr),
        ));
    }
    Ok(())
}

/// Password values compare byte for byte, everything else case-insensitively.
pub fn value_match(attr: &str, stored: &str, asserted: &str) -> bool {
    if attr.eq_ignore_ascii_case(ATTR_USERPASSWORD) {
        stored == asserted
    } else {
        stored.to_lowercase() == asserted.to_lowercase()
    }
}

fn timestamp() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%SZ").to_string()
}

/// A failed operation: the result code sent to the client plus its diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpError {
    pub code: ResultCode,
    pub message: String,
}

impl OpError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(code: ResultCode) -> Self {
        Self::new(code, String::new())
    }

    fn access_denied(user: &User, action: &str, dn: &Dn) -> Self {
        Self::new(
            ResultCode::InsufficientAccessRights,
            format!("{} may not {} {}", user.dn, action, dn),
        )
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// Store errors surface as operationsError; the cause is logged, never sent.
impl From<anyhow::Error> for OpError {
    fn from(err: anyhow::Error) -> Self {
        error!("Storage failure: {:#}", err);
        Self::new(ResultCode::OperationsError, STORAGE_ERROR_MESSAGE)
    }
}

impl From<OpError> for LdapResult {
    fn from(err: OpError) -> Self {
        LdapResult::with_message(err.code, err.message)
    }
}

pub type OpResult<T> = std::result::Result<T, OpError>;

/// Logs the outcome of an operation and turns it into the LDAPResult to send.
fn finish(op: &str, target: &str, outcome: OpResult<ResultCode>) -> LdapResult {
    match outcome {
        Ok(code) => {
            info!("{} successful for: {} ({})", op, target, code.name());
            LdapResult::new(code)
        }
        Err(err) => {
            info!("{} failed for: {}: {}", op, target, err);
            err.into()
        }
    }
}

pub struct Directory {
    base_dn: Dn,
    root_password_hash: Option<String>,
    acl: Acl,
    store: Arc<dyn Store>,
    initialized: AtomicBool,
}

impl Directory {
    pub fn new(config: &DirectoryConfig, store: Arc<dyn Store>) -> Result<Self> {
        let base_dn = Dn::parse(&config.base_dn)
            .with_context(|| format!("Invalid base DN {:?}", config.base_dn))?;
        let acl = Acl::parse(config.acl.as_slice()).context("Failed to parse ACL")?;
        if acl.is_empty() {
            warn!("ACL is empty, every operation will be denied");
        }
        let root_password_hash = config
            .root_password
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| hash_default(p.as_bytes()));
        if root_password_hash.is_none() {
            info!("No root password configured, root bind is disabled");
        }

        Ok(Self {
            base_dn,
            root_password_hash,
            acl,
            store,
            initialized: AtomicBool::new(false),
        })
    }

    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    /// True once `init` has made sure the root entry exists.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Creates the root entry when the store does not have it yet.
    pub async fn init(&self) -> Result<()> {
        let mut tx = self.store.begin().await?;
        if tx.get(&self.base_dn).await?.is_some() {
            debug!("Base entry {} already present", self.base_dn);
        } else {
            let attributes: Attributes = [
                (ATTR_OBJECTCLASS, vec!["top".to_string(), "dcObject".to_string(), "organization".to_string()]),
                ("structuralobjectclass", vec!["organization".to_string()]),
                (ATTR_CREATORSNAME, vec![self.base_dn.to_string()]),
                (ATTR_CREATETIMESTAMP, vec![timestamp()]),
                (ATTR_ENTRYUUID, vec![uuid::Uuid::new_v4().to_string()]),
            ]
            .into_iter()
            .collect();
            tx.store(Entry::new(self.base_dn.clone(), attributes)).await?;
            tx.commit().await.context("Failed to create base entry")?;
            info!("Initialized base entry {}", self.base_dn);
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Parses a client supplied DN and checks it lies under the base DN.
    /// With `allow_prefix` an ancestor of the base DN is clamped to the base DN.
    fn parse_dn(&self, raw: &str, allow_prefix: bool) -> OpResult<Dn> {
        let dn = Dn::parse(raw)
            .map_err(|e| OpError::new(ResultCode::InvalidDnSyntax, format!("{:#}", e)))?;
        let base = self.base_dn.prefix();
        let prefix = dn.prefix();
        if base.is_prefix_of(&prefix) {
            return Ok(dn);
        }
        if allow_prefix && prefix.is_prefix_of(&base) {
            return Ok(self.base_dn.clone());
        }
        Err(OpError::new(
            ResultCode::InvalidDnSyntax,
            format!("DN {} is not under the base DN {}", dn, self.base_dn),
        ))
    }

    fn check_access(&self, user: &User, action: &str, dn: &Dn, attributes: &[String]) -> OpResult<()> {
        if self.acl.check(user, action, dn, attributes) {
            Ok(())
        } else {
            Err(OpError::access_denied(user, action, dn))
        }
    }

    async fn get_entry(&self, dn: &Dn) -> OpResult<Option<Entry>> {
        let entries = self.store.list(&dn.prefix(), true).await?;
        Ok(entries.into_iter().next())
    }

    async fn bind(&self, request: &Request, req: &BindRequest) -> OpResult<ResultCode> {
        // A bind always starts from scratch, whatever its outcome.
        request.set_user(User::anonymous());

        if req.version != 3 {
            return Err(OpError::new(
                ResultCode::ProtocolError,
                format!("unsupported LDAP version {}", req.version),
            ));
        }
        let password = match &req.authentication {
            BindAuthentication::Simple(password) => password,
            BindAuthentication::Sasl { mechanism, .. } => {
                return Err(OpError::new(
                    ResultCode::AuthMethodNotSupported,
                    format!("SASL mechanism {} is not supported", mechanism),
                ));
            }
        };
        if req.name.is_empty() && password.is_empty() {
            return Ok(ResultCode::Success);
        }
        if password.is_empty() {
            return Err(OpError::new(
                ResultCode::UnwillingToPerform,
                "unauthenticated bind is not allowed",
            ));
        }

        let dn = self.parse_dn(&req.name, false)?;
        let anonymous = User::anonymous();
        let denied = || OpError::new(ResultCode::InvalidCredentials, BIND_FAILED_MESSAGE);

        if !self.acl.check(&anonymous, "bind", &dn, &[]) {
            debug!("Bind to {} not permitted by ACL", dn);
            return Err(denied());
        }

        let entry = self.get_entry(&dn).await?;
        let hashes: Vec<String> = if dn == self.base_dn {
            self.root_password_hash.iter().cloned().collect()
        } else {
            match &entry {
                Some(entry) => entry.get(ATTR_USERPASSWORD).to_vec(),
                None => Vec::new(),
            }
        };

        for hash in &hashes {
            match verify_password(hash, password.as_bytes()) {
                Ok(true) => {
                    let groups = entry
                        .as_ref()
                        .map(|e| e.get(ATTR_MEMBEROF).to_vec())
                        .unwrap_or_default();
                    request.set_user(User::new(dn.to_string(), groups));
                    return Ok(ResultCode::Success);
                }
                Ok(false) => {}
                Err(e) => warn!("Skipping unusable password hash on {}: {:#}", dn, e),
            }
        }
        Err(denied())
    }

    fn who_am_i(&self, request: &Request) -> ExtendedResponse {
        let user = request.user();
        let value = if user.is_anonymous() {
            Vec::new()
        } else {
            format!("dn:{}", user.dn).into_bytes()
        };
        ExtendedResponse {
            result: LdapResult::success(),
            response_name: None,
            response_value: Some(value),
        }
    }

    async fn extended(&self, request: &Request, req: &ExtendedRequest) -> ExtendedResponse {
        match req.request_name.as_str() {
            PASSWORD_MODIFY_OID => {
                debug!("Handling EXTENDED PasswordModify request");
                let user = request.user();
                let outcome = self.password_modify(&user, req.request_value.as_deref()).await;
                ExtendedResponse {
                    result: finish("PASSWD", &user.dn, outcome),
                    response_name: Some(PASSWORD_MODIFY_OID.to_string()),
                    response_value: None,
                }
            }
            WHO_AM_I_OID => {
                debug!("Handling EXTENDED WhoAmI request");
                self.who_am_i(request)
            }
            START_TLS_OID => ExtendedResponse {
                result: LdapResult::with_message(
                    ResultCode::ProtocolError,
                    "StartTLS must be handled by the session",
                ),
                response_name: Some(START_TLS_OID.to_string()),
                response_value: None,
            },
            other => {
                info!("Unsupported extended operation {}", other);
                ExtendedResponse {
                    result: LdapResult::with_message(
                        ResultCode::ProtocolError,
                        format!("unsupported extended operation {}", other),
                    ),
                    response_name: None,
                    response_value: None,
                }
            }
        }
    }
}

#[async_trait]
impl Handler for Directory {
    async fn handle(&self, request: Request, writer: ResponseWriter) -> Result<()> {
        if let Some(control) = request.controls.iter().find(|c| c.criticality) {
            if let Some(response) = request.op.response_with(LdapResult::with_message(
                ResultCode::UnavailableCriticalExtension,
                format!("critical control {} is not supported", control.control_type),
            )) {
                writer.write(response).await?;
            }
            return Ok(());
        }

        let response = match &request.op {
            ProtocolOp::BindRequest(req) => {
                debug!("Handling BIND request for: {}", req.name);
                let outcome = self.bind(&request, req).await;
                ProtocolOp::BindResponse(BindResponse {
                    result: finish("BIND", &req.name, outcome),
                    server_sasl_creds: None,
                })
            }
            ProtocolOp::SearchRequest(req) => {
                debug!(
                    "Handling SEARCH request: base={}, filter={}",
                    req.base_object, req.filter
                );
                let outcome = self.search(&request, req, &writer).await;
                if request.is_cancelled() {
                    debug!("SEARCH abandoned: msgid={}", request.message_id);
                    return Ok(());
                }
                ProtocolOp::SearchResultDone(finish("SEARCH", &req.base_object, outcome))
            }
            ProtocolOp::CompareRequest(req) => {
                debug!(
                    "Handling COMPARE request: dn={}, attr={}",
                    req.entry, req.ava.attribute_desc
                );
                let outcome = self.compare(&request.user(), req).await;
                ProtocolOp::CompareResponse(finish("COMPARE", &req.entry, outcome))
            }
            ProtocolOp::AddRequest(req) => {
                debug!("Handling ADD request: dn={}", req.entry);
                let outcome = self.add(&request.user(), req).await;
                ProtocolOp::AddResponse(finish("ADD", &req.entry, outcome))
            }
            ProtocolOp::DelRequest(req) => {
                debug!("Handling DELETE request: dn={}", req.entry);
                let outcome = self.delete(&request.user(), req).await;
                ProtocolOp::DelResponse(finish("DELETE", &req.entry, outcome))
            }
            ProtocolOp::ModifyRequest(req) => {
                debug!("Handling MODIFY request: dn={}", req.object);
                let outcome = self.modify(&request.user(), req).await;
                ProtocolOp::ModifyResponse(finish("MODIFY", &req.object, outcome))
            }
            ProtocolOp::ModifyDNRequest(req) => {
                debug!("Handling MODIFYDN request: dn={}, newrdn={}", req.entry, req.new_rdn);
                ProtocolOp::ModifyDNResponse(LdapResult::with_message(
                    ResultCode::UnwillingToPerform,
                    "modify DN is not supported",
                ))
            }
            ProtocolOp::ExtendedRequest(req) => {
                ProtocolOp::ExtendedResponse(self.extended(&request, req).await)
            }
            ProtocolOp::UnbindRequest | ProtocolOp::AbandonRequest(_) => return Ok(()),
            ProtocolOp::BindResponse(_)
            | ProtocolOp::SearchResultEntry(_)
            | ProtocolOp::SearchResultDone(_)
            | ProtocolOp::ModifyResponse(_)
            | ProtocolOp::AddResponse(_)
            | ProtocolOp::DelResponse(_)
            | ProtocolOp::ModifyDNResponse(_)
            | ProtocolOp::CompareResponse(_)
            | ProtocolOp::ExtendedResponse(_) => {
                warn!(
                    "Ignoring {} response sent by client: msgid={}",
                    request.op.name(),
                    request.message_id
                );
                return Ok(());
            }
        };

        writer.write(response).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::default_acl;
    use crate::ldap_protocol::{
        Attribute, Control, DelRequest, Filter, LdapMessage, ModifyDNRequest, PasswordModifyRequest,
    };
    use crate::server::Principal;
    use crate::store::mem::MemStore;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    pub(crate) const BASE: &str = "dc=teapot,dc=ovh";
    pub(crate) const ROOT_PASSWORD: &str = "root-secret";

    pub(crate) async fn directory() -> Directory {
        let config = DirectoryConfig {
            base_dn: BASE.to_string(),
            root_password: Some(ROOT_PASSWORD.to_string()),
            acl: default_acl(),
        };
        let dir = Directory::new(&config, Arc::new(MemStore::new())).unwrap();
        dir.init().await.unwrap();
        dir
    }

    pub(crate) async fn call_with(
        dir: &Directory,
        principal: &Principal,
        op: ProtocolOp,
        controls: Vec<Control>,
    ) -> Vec<ProtocolOp> {
        let (tx, mut rx) = mpsc::channel::<LdapMessage>(256);
        let request = Request::new(7, op, controls, principal.clone(), CancellationToken::new());
        dir.handle(request, ResponseWriter::new(7, tx)).await.unwrap();
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            assert_eq!(msg.message_id, 7);
            out.push(msg.protocol_op);
        }
        out
    }

    pub(crate) async fn call(dir: &Directory, principal: &Principal, op: ProtocolOp) -> Vec<ProtocolOp> {
        call_with(dir, principal, op, Vec::new()).await
    }

    /// The result code of the single final response.
    pub(crate) async fn code(dir: &Directory, principal: &Principal, op: ProtocolOp) -> ResultCode {
        let responses = call(dir, principal, op).await;
        responses
            .last()
            .and_then(|r| r.result())
            .map(|r| r.result_code)
            .unwrap()
    }

    pub(crate) fn attr(name: &str, values: &[&str]) -> Attribute {
        Attribute {
            attr_type: name.to_string(),
            attr_values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        }
    }

    pub(crate) fn bind_op(name: &str, password: &str) -> ProtocolOp {
        ProtocolOp::BindRequest(BindRequest {
            version: 3,
            name: name.to_string(),
            authentication: BindAuthentication::Simple(password.to_string()),
        })
    }

    pub(crate) fn add_op(dn: &str, attributes: Vec<Attribute>) -> ProtocolOp {
        ProtocolOp::AddRequest(crate::ldap_protocol::AddRequest {
            entry: dn.to_string(),
            attributes,
        })
    }

    pub(crate) fn delete_op(dn: &str) -> ProtocolOp {
        ProtocolOp::DelRequest(DelRequest { entry: dn.to_string() })
    }

    /// A session bound as the root entry.
    pub(crate) async fn root(dir: &Directory) -> Principal {
        let principal = Principal::default();
        assert_eq!(code(dir, &principal, bind_op(BASE, ROOT_PASSWORD)).await, ResultCode::Success);
        principal
    }

    /// Seeds ou=users, ou=groups and alice with `alice-pw`.
    pub(crate) async fn seeded() -> (Directory, Principal) {
        let dir = directory().await;
        let admin = root(&dir).await;
        for ou in ["ou=users,dc=teapot,dc=ovh", "ou=groups,dc=teapot,dc=ovh"] {
            let op = add_op(ou, vec![attr("objectclass", &["organizationalUnit"])]);
            assert_eq!(code(&dir, &admin, op).await, ResultCode::Success);
        }
        let alice = add_op(
            "cn=alice,ou=users,dc=teapot,dc=ovh",
            vec![
                attr("objectclass", &["inetOrgPerson"]),
                attr("sn", &["Liddell"]),
                attr("userpassword", &[&hash_default(b"alice-pw")]),
            ],
        );
        assert_eq!(code(&dir, &admin, alice).await, ResultCode::Success);
        (dir, admin)
    }

    #[tokio::test]
    async fn test_init_creates_root_entry_once() {
        let dir = directory().await;
        assert!(dir.is_initialized());
        let root = dir.get_entry(dir.base_dn()).await.unwrap().unwrap();
        assert_eq!(root.get(ATTR_OBJECTCLASS), ["top", "dcObject", "organization"]);
        assert_eq!(root.get("dc"), ["teapot"]);
        let uuid = root.get(ATTR_ENTRYUUID).to_vec();

        dir.init().await.unwrap();
        let again = dir.get_entry(dir.base_dn()).await.unwrap().unwrap();
        assert_eq!(again.get(ATTR_ENTRYUUID), uuid.as_slice());
    }

    #[tokio::test]
    async fn test_root_bind() {
        let dir = directory().await;
        let principal = Principal::default();
        assert_eq!(code(&dir, &principal, bind_op(BASE, ROOT_PASSWORD)).await, ResultCode::Success);
        let user = principal.get();
        assert_eq!(user.dn, BASE);
        assert!(user.groups.is_empty());

        assert_eq!(
            code(&dir, &principal, bind_op(BASE, "wrong")).await,
            ResultCode::InvalidCredentials
        );
        assert!(principal.get().is_anonymous());
    }

    #[tokio::test]
    async fn test_bind_canonicalises_principal() {
        let dir = directory().await;
        let principal = Principal::default();
        let op = bind_op("DC=Teapot, DC=OVH", ROOT_PASSWORD);
        assert_eq!(code(&dir, &principal, op).await, ResultCode::Success);
        assert_eq!(principal.get().dn, BASE);
    }

    #[tokio::test]
    async fn test_user_bind_carries_groups() {
        let (dir, admin) = seeded().await;
        let group = add_op(
            "cn=admin,ou=groups,dc=teapot,dc=ovh",
            vec![attr("member", &["cn=alice,ou=users,dc=teapot,dc=ovh"])],
        );
        assert_eq!(code(&dir, &admin, group).await, ResultCode::Success);

        let session = Principal::default();
        let op = bind_op("cn=alice,ou=users,dc=teapot,dc=ovh", "alice-pw");
        assert_eq!(code(&dir, &session, op).await, ResultCode::Success);
        assert_eq!(session.get().groups, vec!["cn=admin,ou=groups,dc=teapot,dc=ovh"]);
    }

    #[tokio::test]
    async fn test_bind_failures_do_not_reveal_stage() {
        let (dir, _) = seeded().await;
        let session = Principal::default();

        // missing entry, wrong password and ACL denial look the same
        for op in [
            bind_op("cn=nobody,ou=users,dc=teapot,dc=ovh", "x"),
            bind_op("cn=alice,ou=users,dc=teapot,dc=ovh", "wrong"),
            bind_op("ou=groups,dc=teapot,dc=ovh", "x"),
        ] {
            let responses = call(&dir, &session, op).await;
            let result = responses[0].result().unwrap();
            assert_eq!(result.result_code, ResultCode::InvalidCredentials);
            assert_eq!(result.diagnostic_message, BIND_FAILED_MESSAGE);
        }
    }

    #[tokio::test]
    async fn test_bind_edge_cases() {
        let dir = directory().await;
        let session = Principal::default();

        assert_eq!(code(&dir, &session, bind_op("", "")).await, ResultCode::Success);
        assert!(session.get().is_anonymous());
        assert_eq!(
            code(&dir, &session, bind_op(BASE, "")).await,
            ResultCode::UnwillingToPerform
        );
        assert_eq!(
            code(&dir, &session, bind_op("dc=example,dc=com", "x")).await,
            ResultCode::InvalidDnSyntax
        );

        let v2 = ProtocolOp::BindRequest(BindRequest {
            version: 2,
            name: BASE.to_string(),
            authentication: BindAuthentication::Simple(ROOT_PASSWORD.to_string()),
        });
        assert_eq!(code(&dir, &session, v2).await, ResultCode::ProtocolError);

        let sasl = ProtocolOp::BindRequest(BindRequest {
            version: 3,
            name: String::new(),
            authentication: BindAuthentication::Sasl {
                mechanism: "EXTERNAL".to_string(),
                credentials: None,
            },
        });
        assert_eq!(code(&dir, &session, sasl).await, ResultCode::AuthMethodNotSupported);
    }

    #[tokio::test]
    async fn test_failed_bind_resets_principal() {
        let dir = directory().await;
        let session = root(&dir).await;
        assert_eq!(
            code(&dir, &session, bind_op(BASE, "nope")).await,
            ResultCode::InvalidCredentials
        );
        assert!(session.get().is_anonymous());
    }

    #[tokio::test]
    async fn test_disabled_root_password() {
        let config = DirectoryConfig {
            root_password: Some(String::new()),
            ..DirectoryConfig::default()
        };
        let dir = Directory::new(&config, Arc::new(MemStore::new())).unwrap();
        dir.init().await.unwrap();
        assert_eq!(
            code(&dir, &Principal::default(), bind_op(BASE, "anything")).await,
            ResultCode::InvalidCredentials
        );
    }

    #[tokio::test]
    async fn test_critical_control_rejected() {
        let dir = directory().await;
        let control = Control {
            control_type: "1.2.840.113556.1.4.319".to_string(),
            criticality: true,
            control_value: None,
        };
        let responses = call_with(&dir, &Principal::default(), delete_op(BASE), vec![control]).await;
        assert_eq!(responses.len(), 1);
        assert!(matches!(&responses[0], ProtocolOp::DelResponse(r)
            if r.result_code == ResultCode::UnavailableCriticalExtension));

        let lenient = Control {
            control_type: "1.2.840.113556.1.4.319".to_string(),
            criticality: false,
            control_value: None,
        };
        let responses = call_with(&dir, &Principal::default(), bind_op("", ""), vec![lenient]).await;
        assert_eq!(responses[0].result().unwrap().result_code, ResultCode::Success);
    }

    #[tokio::test]
    async fn test_modify_dn_unsupported() {
        let dir = directory().await;
        let session = root(&dir).await;
        let op = ProtocolOp::ModifyDNRequest(ModifyDNRequest {
            entry: "ou=users,dc=teapot,dc=ovh".to_string(),
            new_rdn: "ou=people".to_string(),
            delete_old_rdn: true,
            new_superior: None,
        });
        assert_eq!(code(&dir, &session, op).await, ResultCode::UnwillingToPerform);
    }

    #[tokio::test]
    async fn test_extended_operations() {
        let dir = directory().await;
        let anonymous = Principal::default();
        let who = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: WHO_AM_I_OID.to_string(),
            request_value: None,
        });

        let responses = call(&dir, &anonymous, who.clone()).await;
        match &responses[0] {
            ProtocolOp::ExtendedResponse(resp) => {
                assert_eq!(resp.result.result_code, ResultCode::Success);
                assert_eq!(resp.response_value, Some(Vec::new()));
            }
            other => panic!("unexpected response {:?}", other),
        }

        let admin = root(&dir).await;
        let responses = call(&dir, &admin, who).await;
        match &responses[0] {
            ProtocolOp::ExtendedResponse(resp) => {
                assert_eq!(resp.response_value, Some(b"dn:dc=teapot,dc=ovh".to_vec()));
            }
            other => panic!("unexpected response {:?}", other),
        }

        let unknown = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: "1.2.3.4".to_string(),
            request_value: None,
        });
        assert_eq!(code(&dir, &anonymous, unknown).await, ResultCode::ProtocolError);
    }

    #[tokio::test]
    async fn test_anonymous_password_modify_denied() {
        let dir = directory().await;
        let value = PasswordModifyRequest {
            user_identity: None,
            old_password: None,
            new_password: Some(b"new".to_vec()),
        }
        .encode()
        .unwrap();
        let op = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: PASSWORD_MODIFY_OID.to_string(),
            request_value: Some(value),
        });
        let responses = call(&dir, &Principal::default(), op).await;
        match &responses[0] {
            ProtocolOp::ExtendedResponse(resp) => {
                assert_eq!(resp.result.result_code, ResultCode::InsufficientAccessRights);
                assert_eq!(resp.response_name.as_deref(), Some(PASSWORD_MODIFY_OID));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_parse_dn_rules() {
        let dir = directory().await;
        assert_eq!(
            dir.parse_dn("CN=Bob, OU=Users,dc=teapot,dc=ovh", false).unwrap().to_string(),
            "cn=bob,ou=users,dc=teapot,dc=ovh"
        );
        assert_eq!(dir.parse_dn("dc=ovh", true).unwrap(), dir.base_dn().clone());
        assert_eq!(dir.parse_dn("", true).unwrap(), dir.base_dn().clone());
        assert_eq!(
            dir.parse_dn("dc=ovh", false).unwrap_err().code,
            ResultCode::InvalidDnSyntax
        );
        assert_eq!(
            dir.parse_dn("cn=x,dc=teapots,dc=ovh", true).unwrap_err().code,
            ResultCode::InvalidDnSyntax
        );
        assert_eq!(
            dir.parse_dn("cn=a=b,dc=teapot,dc=ovh", false).unwrap_err().code,
            ResultCode::InvalidDnSyntax
        );
    }

    #[test]
    fn test_value_match() {
        assert!(value_match("cn", "Alice", "alice"));
        assert!(!value_match("userPassword", "Secret", "secret"));
        assert!(value_match("userpassword", "secret", "secret"));
    }

    #[test]
    fn test_restricted_attributes() {
        assert!(check_writable("cn").is_ok());
        assert!(check_writable("member").is_ok());
        assert_eq!(
            check_writable("memberOf").unwrap_err().code,
            ResultCode::ObjectClassViolation
        );
        assert_eq!(
            check_writable("EntryUUID").unwrap_err().code,
            ResultCode::ObjectClassViolation
        );
    }

    #[test]
    fn test_filter_is_displayable() {
        // handlers log filters through Display
        let f = Filter::Present("objectClass".to_string());
        assert_eq!(f.to_string(), "(objectClass=*)");
    }
}
