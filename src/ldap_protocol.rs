// LDAP protocol handling with BER encoding/decoding
// Implements the LDAPv3 message grammar (RFC 4511) used by the directory server

use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::io::{Cursor, Read};

/// StartTLS extended operation (RFC 4511 4.14).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
/// Password Modify extended operation (RFC 3062).
pub const PASSWORD_MODIFY_OID: &str = "1.3.6.1.4.1.4203.1.11.1";
/// Unsolicited Notice of Disconnection (RFC 4511 4.4.1).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.2003";
/// "Who am I?" extended operation (RFC 4532).
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// Upper bound for every INTEGER field (messageID, sizeLimit, timeLimit, ...).
pub const MAX_INT: i32 = i32::MAX;
/// Largest LDAPMessage accepted off the wire.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
/// Filters nested deeper than this are rejected instead of recursing further.
pub const MAX_FILTER_DEPTH: usize = 64;

macro_rules! result_codes {
    ($($variant:ident = $code:literal => $name:literal,)*) => {
        /// LDAPResult resultCode. Decoding rejects anything outside this set.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ResultCode {
            $($variant = $code,)*
        }

        impl ResultCode {
            pub fn code(self) -> u32 {
                self as u32
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(ResultCode::$variant => $name,)*
                }
            }
        }

        impl TryFrom<i64> for ResultCode {
            type Error = anyhow::Error;
            fn try_from(value: i64) -> Result<Self> {
                match value {
                    $($code => Ok(ResultCode::$variant),)*
                    _ => bail!("Invalid result code: {}", value),
                }
            }
        }
    };
}

result_codes! {
    Success = 0 => "success",
    OperationsError = 1 => "operationsError",
    ProtocolError = 2 => "protocolError",
    TimeLimitExceeded = 3 => "timeLimitExceeded",
    SizeLimitExceeded = 4 => "sizeLimitExceeded",
    CompareFalse = 5 => "compareFalse",
    CompareTrue = 6 => "compareTrue",
    AuthMethodNotSupported = 7 => "authMethodNotSupported",
    StrongerAuthRequired = 8 => "strongerAuthRequired",
    Referral = 10 => "referral",
    AdminLimitExceeded = 11 => "adminLimitExceeded",
    UnavailableCriticalExtension = 12 => "unavailableCriticalExtension",
    ConfidentialityRequired = 13 => "confidentialityRequired",
    SaslBindInProgress = 14 => "saslBindInProgress",
    NoSuchAttribute = 16 => "noSuchAttribute",
    UndefinedAttributeType = 17 => "undefinedAttributeType",
    InappropriateMatching = 18 => "inappropriateMatching",
    ConstraintViolation = 19 => "constraintViolation",
    AttributeOrValueExists = 20 => "attributeOrValueExists",
    InvalidAttributeSyntax = 21 => "invalidAttributeSyntax",
    NoSuchObject = 32 => "noSuchObject",
    AliasProblem = 33 => "aliasProblem",
    InvalidDnSyntax = 34 => "invalidDNSyntax",
    InvalidCredentials = 49 => "invalidCredentials",
    InsufficientAccessRights = 50 => "insufficientAccessRights",
    Busy = 51 => "busy",
    Unavailable = 52 => "unavailable",
    UnwillingToPerform = 53 => "unwillingToPerform",
    LoopDetect = 54 => "loopDetect",
    NamingViolation = 64 => "namingViolation",
    ObjectClassViolation = 65 => "objectClassViolation",
    NotAllowedOnNonLeaf = 66 => "notAllowedOnNonLeaf",
    NotAllowedOnRdn = 67 => "notAllowedOnRDN",
    EntryAlreadyExists = 68 => "entryAlreadyExists",
    ObjectClassModsProhibited = 69 => "objectClassModsProhibited",
    AffectsMultipleDsas = 71 => "affectsMultipleDSAs",
    Other = 80 => "other",
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

// LDAP Control (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub control_type: String,
    pub criticality: bool,
    pub control_value: Option<Vec<u8>>,
}

// LDAP Message structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Vec<Control>,
}

impl LdapMessage {
    pub fn new(message_id: i32, protocol_op: ProtocolOp) -> Self {
        Self {
            message_id,
            protocol_op,
            controls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    ModifyDNRequest(ModifyDNRequest),
    ModifyDNResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
}

impl ProtocolOp {
    /// Short operation name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) | ProtocolOp::BindResponse(_) => "bind",
            ProtocolOp::UnbindRequest => "unbind",
            ProtocolOp::SearchRequest(_)
            | ProtocolOp::SearchResultEntry(_)
            | ProtocolOp::SearchResultDone(_) => "search",
            ProtocolOp::ModifyRequest(_) | ProtocolOp::ModifyResponse(_) => "modify",
            ProtocolOp::AddRequest(_) | ProtocolOp::AddResponse(_) => "add",
            ProtocolOp::DelRequest(_) | ProtocolOp::DelResponse(_) => "delete",
            ProtocolOp::ModifyDNRequest(_) | ProtocolOp::ModifyDNResponse(_) => "modify_dn",
            ProtocolOp::CompareRequest(_) | ProtocolOp::CompareResponse(_) => "compare",
            ProtocolOp::AbandonRequest(_) => "abandon",
            ProtocolOp::ExtendedRequest(_) | ProtocolOp::ExtendedResponse(_) => "extended",
        }
    }

    /// The LDAPResult carried by a final response, if this is one.
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::BindResponse(resp) => Some(&resp.result),
            ProtocolOp::ExtendedResponse(resp) => Some(&resp.result),
            ProtocolOp::SearchResultDone(result)
            | ProtocolOp::ModifyResponse(result)
            | ProtocolOp::AddResponse(result)
            | ProtocolOp::DelResponse(result)
            | ProtocolOp::ModifyDNResponse(result)
            | ProtocolOp::CompareResponse(result) => Some(result),
            ProtocolOp::BindRequest(_)
            | ProtocolOp::UnbindRequest
            | ProtocolOp::SearchRequest(_)
            | ProtocolOp::SearchResultEntry(_)
            | ProtocolOp::ModifyRequest(_)
            | ProtocolOp::AddRequest(_)
            | ProtocolOp::DelRequest(_)
            | ProtocolOp::ModifyDNRequest(_)
            | ProtocolOp::CompareRequest(_)
            | ProtocolOp::AbandonRequest(_)
            | ProtocolOp::ExtendedRequest(_) => None,
        }
    }

    /// Builds the final response a request of this kind is answered with.
    /// None for operations that never get a response (Unbind, Abandon) and for responses.
    pub fn response_with(&self, result: LdapResult) -> Option<ProtocolOp> {
        match self {
            ProtocolOp::BindRequest(_) => Some(ProtocolOp::BindResponse(BindResponse {
                result,
                server_sasl_creds: None,
            })),
            ProtocolOp::SearchRequest(_) => Some(ProtocolOp::SearchResultDone(result)),
            ProtocolOp::ModifyRequest(_) => Some(ProtocolOp::ModifyResponse(result)),
            ProtocolOp::AddRequest(_) => Some(ProtocolOp::AddResponse(result)),
            ProtocolOp::DelRequest(_) => Some(ProtocolOp::DelResponse(result)),
            ProtocolOp::ModifyDNRequest(_) => Some(ProtocolOp::ModifyDNResponse(result)),
            ProtocolOp::CompareRequest(_) => Some(ProtocolOp::CompareResponse(result)),
            ProtocolOp::ExtendedRequest(_) => Some(ProtocolOp::ExtendedResponse(ExtendedResponse {
                result,
                response_name: None,
                response_value: None,
            })),
            ProtocolOp::UnbindRequest
            | ProtocolOp::AbandonRequest(_)
            | ProtocolOp::BindResponse(_)
            | ProtocolOp::SearchResultEntry(_)
            | ProtocolOp::SearchResultDone(_)
            | ProtocolOp::ModifyResponse(_)
            | ProtocolOp::AddResponse(_)
            | ProtocolOp::DelResponse(_)
            | ProtocolOp::ModifyDNResponse(_)
            | ProtocolOp::CompareResponse(_)
            | ProtocolOp::ExtendedResponse(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
}

impl LdapResult {
    pub fn new(result_code: ResultCode) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: String::new(),
        }
    }

    pub fn with_message(result_code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: message.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<i64> for SearchScope {
    type Error = anyhow::Error;
    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => bail!("Invalid search scope: {}", value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBaseObj = 2,
    Always = 3,
}

impl TryFrom<i64> for DerefAliases {
    type Error = anyhow::Error;
    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBaseObj),
            3 => Ok(DerefAliases::Always),
            _ => bail!("Invalid derefAliases: {}", value),
        }
    }
}

/// Search filter (RFC 4511 4.5.1.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch(AttributeValueAssertion),
    Substrings(SubstringFilter),
    GreaterOrEqual(AttributeValueAssertion),
    LessOrEqual(AttributeValueAssertion),
    Present(String),
    ApproxMatch(AttributeValueAssertion),
    ExtensibleMatch(MatchingRuleAssertion),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeValueAssertion {
    pub attribute_desc: String,
    pub assertion_value: Vec<u8>,
}

/// At least one substring; Initial only first, Final only last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstringFilter {
    pub attr_type: String,
    pub substrings: Vec<Substring>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Substring {
    Initial(Vec<u8>),
    Any(Vec<u8>),
    Final(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingRuleAssertion {
    pub matching_rule: Option<String>,
    pub attr_type: Option<String>,
    pub match_value: Vec<u8>,
    pub dn_attributes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

impl TryFrom<i64> for ModifyOperation {
    type Error = anyhow::Error;
    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(ModifyOperation::Add),
            1 => Ok(ModifyOperation::Delete),
            2 => Ok(ModifyOperation::Replace),
            _ => bail!("Invalid modify operation: {}", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDNRequest {
    pub entry: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub entry: String,
    pub ava: AttributeValueAssertion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

/// PasswdModifyRequestValue (RFC 3062).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PasswordModifyRequest {
    pub user_identity: Option<String>,
    pub old_password: Option<Vec<u8>>,
    pub new_password: Option<Vec<u8>>,
}

impl PasswordModifyRequest {
    pub fn decode(value: &[u8]) -> Result<Self> {
        let mut outer = BerReader::new(value);
        let mut reader = outer.read_sequence("PasswdModifyRequestValue")?;
        outer.expect_end("PasswdModifyRequestValue")?;
        let user_identity = match reader.peek_tag() {
            Some(PASSWD_TAG_USER_IDENTITY) => {
                Some(reader.read_string_tagged(PASSWD_TAG_USER_IDENTITY, "userIdentity")?)
            }
            _ => None,
        };
        let old_password = match reader.peek_tag() {
            Some(PASSWD_TAG_OLD) => Some(reader.read_octet_string_tagged(PASSWD_TAG_OLD, "oldPasswd")?),
            _ => None,
        };
        let new_password = match reader.peek_tag() {
            Some(PASSWD_TAG_NEW) => Some(reader.read_octet_string_tagged(PASSWD_TAG_NEW, "newPasswd")?),
            _ => None,
        };
        reader.expect_end("PasswdModifyRequestValue")?;
        Ok(Self {
            user_identity,
            old_password,
            new_password,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = BerWriter::new();
        writer.write_sequence(|w| {
            if let Some(ref identity) = self.user_identity {
                w.write_string_tagged(PASSWD_TAG_USER_IDENTITY, identity);
            }
            if let Some(ref old) = self.old_password {
                w.write_octet_string_tagged(PASSWD_TAG_OLD, old);
            }
            if let Some(ref new) = self.new_password {
                w.write_octet_string_tagged(PASSWD_TAG_NEW, new);
            }
            Ok(())
        })?;
        Ok(writer.into_vec())
    }
}

/// PasswdModifyResponseValue (RFC 3062).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PasswordModifyResponse {
    pub gen_password: Option<Vec<u8>>,
}

impl PasswordModifyResponse {
    pub fn decode(value: &[u8]) -> Result<Self> {
        let mut outer = BerReader::new(value);
        let mut reader = outer.read_sequence("PasswdModifyResponseValue")?;
        outer.expect_end("PasswdModifyResponseValue")?;
        let gen_password = match reader.peek_tag() {
            Some(PASSWD_TAG_GEN) => Some(reader.read_octet_string_tagged(PASSWD_TAG_GEN, "genPasswd")?),
            _ => None,
        };
        reader.expect_end("PasswdModifyResponseValue")?;
        Ok(Self { gen_password })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = BerWriter::new();
        writer.write_sequence(|w| {
            if let Some(ref generated) = self.gen_password {
                w.write_octet_string_tagged(PASSWD_TAG_GEN, generated);
            }
            Ok(())
        })?;
        Ok(writer.into_vec())
    }
}

// BER parsing utilities
pub(crate) struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        let len = self.cursor.get_ref().len();
        len.saturating_sub(pos)
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Look at the next tag without consuming it.
    fn peek_tag(&self) -> Option<u8> {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().get(pos).copied()
    }

    /// Peek the next tag, failing on end of input.
    fn read_tag_peeked(&self) -> Result<u8> {
        self.peek_tag()
            .ok_or_else(|| anyhow!("BER truncated: expected tag, 0 bytes remaining"))
    }

    fn read_tag(&mut self) -> Result<u8> {
        if self.is_empty() {
            bail!("BER truncated: expected tag, 0 bytes remaining");
        }
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_length(&mut self) -> Result<usize> {
        if self.is_empty() {
            bail!("BER truncated: expected length, 0 bytes remaining");
        }
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        let first_byte = buf[0];

        if (first_byte & 0x80) == 0 {
            // Short form
            Ok(first_byte as usize)
        } else {
            // Long form
            let length_bytes = (first_byte & 0x7F) as usize;
            if length_bytes == 0 {
                bail!("Indefinite length not supported");
            }
            if length_bytes > 4 {
                bail!("Length too large: {} bytes", length_bytes);
            }
            if self.remaining() < length_bytes {
                bail!(
                    "BER truncated: length encoding needs {} bytes, {} remaining",
                    length_bytes,
                    self.remaining()
                );
            }
            let mut length = 0u32;
            for _ in 0..length_bytes {
                self.cursor.read_exact(&mut buf)?;
                length = (length << 8) | buf[0] as u32;
            }
            Ok(length as usize)
        }
    }

    fn read_raw_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!("BER truncated: need {} bytes, {} remaining", n, self.remaining());
        }
        let data: &'a [u8] = *self.cursor.get_ref();
        let start = self.cursor.position() as usize;
        self.cursor.set_position((start + n) as u64);
        Ok(&data[start..start + n])
    }

    /// Read one TLV with the given tag and return its content octets.
    fn read_element(&mut self, tag: u8, what: &str) -> Result<&'a [u8]> {
        let actual = self.read_tag()?;
        if actual != tag {
            bail!("Expected {} tag 0x{:02X}, got: 0x{:02X}", what, tag, actual);
        }
        let length = self.read_length()?;
        self.read_raw_bytes(length)
            .with_context(|| format!("{} content", what))
    }

    /// Read a constructed TLV and return a reader bounded to its content.
    fn read_constructed(&mut self, tag: u8, what: &str) -> Result<BerReader<'a>> {
        Ok(BerReader::new(self.read_element(tag, what)?))
    }

    fn read_sequence(&mut self, what: &str) -> Result<BerReader<'a>> {
        self.read_constructed(TAG_SEQUENCE, what)
    }

    fn read_integer(&mut self, what: &str) -> Result<i32> {
        self.read_integer_tagged(TAG_INTEGER, what)
    }

    fn read_integer_tagged(&mut self, tag: u8, what: &str) -> Result<i32> {
        let content = self.read_element(tag, what)?;
        bounded_integer(decode_integer(content)?).with_context(|| what.to_string())
    }

    fn read_enumerated(&mut self, what: &str) -> Result<i64> {
        let content = self.read_element(TAG_ENUMERATED, what)?;
        decode_integer(content).with_context(|| what.to_string())
    }

    fn read_boolean(&mut self, what: &str) -> Result<bool> {
        self.read_boolean_tagged(TAG_BOOLEAN, what)
    }

    fn read_boolean_tagged(&mut self, tag: u8, what: &str) -> Result<bool> {
        let content = self.read_element(tag, what)?;
        if content.len() != 1 {
            bail!("Boolean value must be 1 byte, got: {}", content.len());
        }
        Ok(content[0] != 0)
    }

    fn read_octet_string(&mut self, what: &str) -> Result<Vec<u8>> {
        self.read_octet_string_tagged(TAG_OCTET_STRING, what)
    }

    fn read_octet_string_tagged(&mut self, tag: u8, what: &str) -> Result<Vec<u8>> {
        Ok(self.read_element(tag, what)?.to_vec())
    }

    fn read_string(&mut self, what: &str) -> Result<String> {
        self.read_string_tagged(TAG_OCTET_STRING, what)
    }

    fn read_string_tagged(&mut self, tag: u8, what: &str) -> Result<String> {
        let bytes = self.read_octet_string_tagged(tag, what)?;
        String::from_utf8(bytes).with_context(|| format!("Invalid UTF-8 string in {}", what))
    }

    fn expect_end(&self, what: &str) -> Result<()> {
        if !self.is_empty() {
            bail!("{}: {} unexpected trailing bytes", what, self.remaining());
        }
        Ok(())
    }
}

fn decode_integer(content: &[u8]) -> Result<i64> {
    if content.is_empty() {
        bail!("INTEGER with zero length");
    }
    if content.len() > 8 {
        bail!("Integer too large: {} bytes", content.len());
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in content {
        value = (value << 8) | byte as i64;
    }
    Ok(value)
}

fn bounded_integer(value: i64) -> Result<i32> {
    if !(0..=MAX_INT as i64).contains(&value) {
        bail!("INTEGER {} out of range 0..={}", value, MAX_INT);
    }
    Ok(value as i32)
}

/// Minimal two's complement content octets.
fn encode_integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn ensure_integer(value: i32, what: &str) -> Result<()> {
    if value < 0 {
        bail!("{} must be within 0..={}, got {}", what, MAX_INT, value);
    }
    Ok(())
}

// BER encoding utilities.
// Children are encoded into their own buffer first, so every length is known
// before its header is written.
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl Default for BerWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            // Short form
            self.buffer.push(length as u8);
        } else {
            // Long form
            let mut bytes = Vec::new();
            let mut len = length;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    pub fn write_element(&mut self, tag: u8, content: &[u8]) {
        self.write_tag(tag);
        self.write_length(content.len());
        self.buffer.extend_from_slice(content);
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_integer_tagged(TAG_INTEGER, value);
    }

    pub fn write_integer_tagged(&mut self, tag: u8, value: i32) {
        self.write_element(tag, &encode_integer(value as i64));
    }

    pub fn write_enumerated(&mut self, value: u32) {
        self.write_element(TAG_ENUMERATED, &encode_integer(value as i64));
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_boolean_tagged(TAG_BOOLEAN, value);
    }

    pub fn write_boolean_tagged(&mut self, tag: u8, value: bool) {
        self.write_element(tag, &[if value { 0xFF } else { 0x00 }]);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_element(TAG_OCTET_STRING, data);
    }

    pub fn write_octet_string_tagged(&mut self, tag: u8, data: &[u8]) {
        self.write_element(tag, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_string_tagged(&mut self, tag: u8, s: &str) {
        self.write_element(tag, s.as_bytes());
    }

    /// Encode the content with `build`, then emit tag, length and content.
    pub fn write_constructed<F>(&mut self, tag: u8, build: F) -> Result<()>
    where
        F: FnOnce(&mut BerWriter) -> Result<()>,
    {
        let mut inner = BerWriter::new();
        build(&mut inner)?;
        self.write_element(tag, &inner.buffer);
        Ok(())
    }

    pub fn write_sequence<F>(&mut self, build: F) -> Result<()>
    where
        F: FnOnce(&mut BerWriter) -> Result<()>,
    {
        self.write_constructed(TAG_SEQUENCE, build)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

// Universal tags
const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_ENUMERATED: u8 = 0x0A;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;

/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;

const AUTH_TAG_SIMPLE: u8 = 0x80;
const AUTH_TAG_SASL: u8 = 0xA3;
const BIND_TAG_SERVER_SASL_CREDS: u8 = 0x87;
const RESULT_TAG_REFERRAL: u8 = 0xA3;
const MODIFY_DN_TAG_NEW_SUPERIOR: u8 = 0x80;
const EXTENDED_TAG_REQUEST_NAME: u8 = 0x80;
const EXTENDED_TAG_REQUEST_VALUE: u8 = 0x81;
const EXTENDED_TAG_RESPONSE_NAME: u8 = 0x8A;
const EXTENDED_TAG_RESPONSE_VALUE: u8 = 0x8B;

const FILTER_TAG_AND: u8 = 0xA0;
const FILTER_TAG_OR: u8 = 0xA1;
const FILTER_TAG_NOT: u8 = 0xA2;
const FILTER_TAG_EQUALITY: u8 = 0xA3;
const FILTER_TAG_SUBSTRINGS: u8 = 0xA4;
const FILTER_TAG_GREATER_OR_EQUAL: u8 = 0xA5;
const FILTER_TAG_LESS_OR_EQUAL: u8 = 0xA6;
const FILTER_TAG_PRESENT: u8 = 0x87;
const FILTER_TAG_APPROX: u8 = 0xA8;
const FILTER_TAG_EXTENSIBLE: u8 = 0xA9;

const SUBSTRING_TAG_INITIAL: u8 = 0x80;
const SUBSTRING_TAG_ANY: u8 = 0x81;
const SUBSTRING_TAG_FINAL: u8 = 0x82;

const MATCHING_RULE_TAG_RULE: u8 = 0x81;
const MATCHING_RULE_TAG_TYPE: u8 = 0x82;
const MATCHING_RULE_TAG_VALUE: u8 = 0x83;
const MATCHING_RULE_TAG_DN_ATTRIBUTES: u8 = 0x84;

const PASSWD_TAG_USER_IDENTITY: u8 = 0x80;
const PASSWD_TAG_OLD: u8 = 0x81;
const PASSWD_TAG_NEW: u8 = 0x82;
const PASSWD_TAG_GEN: u8 = 0x80;

/// Total size of the first LDAPMessage in `buf`, or None while its header is incomplete.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    if first != TAG_SEQUENCE {
        bail!("Expected LDAPMessage SEQUENCE tag (0x30), got: 0x{:02X}", first);
    }
    let Some(&length_byte) = buf.get(1) else {
        return Ok(None);
    };
    let (header_len, content_len) = if length_byte & 0x80 == 0 {
        (2, length_byte as usize)
    } else {
        let length_bytes = (length_byte & 0x7F) as usize;
        if length_bytes == 0 {
            bail!("Indefinite length not supported");
        }
        if length_bytes > 4 {
            bail!("Length too large: {} bytes", length_bytes);
        }
        if buf.len() < 2 + length_bytes {
            return Ok(None);
        }
        let length = buf[2..2 + length_bytes]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (2 + length_bytes, length)
    };
    if content_len > MAX_MESSAGE_SIZE {
        bail!("LDAPMessage of {} bytes exceeds limit of {}", content_len, MAX_MESSAGE_SIZE);
    }
    Ok(Some(header_len + content_len))
}

/// Decode the first LDAPMessage of `buf`. Ok(None) means more bytes are needed.
pub fn try_decode_message(buf: &[u8]) -> Result<Option<(LdapMessage, usize)>> {
    match frame_length(buf)? {
        Some(total) if buf.len() >= total => {
            let message = parse_ldap_message(&buf[..total])?;
            Ok(Some((message, total)))
        }
        _ => Ok(None),
    }
}

/// Decode the first LDAPMessage of `data`, returning it with the number of bytes consumed.
pub fn decode_message(data: &[u8]) -> Result<(LdapMessage, usize)> {
    try_decode_message(data)?
        .ok_or_else(|| anyhow!("BER truncated: incomplete LDAPMessage ({} bytes)", data.len()))
}

pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut outer = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let mut reader = outer.read_sequence("LDAPMessage")?;
    outer.expect_end("LDAPMessage")?;

    let message_id = reader.read_integer("messageID")?;
    let tag = reader
        .peek_tag()
        .ok_or_else(|| anyhow!("BER truncated: LDAPMessage has no protocolOp"))?;
    let protocol_op = parse_protocol_op(&mut reader, tag)
        .with_context(|| format!("Failed to parse protocolOp 0x{:02X} (msgid {})", tag, message_id))?;

    let controls = if reader.peek_tag() == Some(LDAP_CONTEXT_CONTROLS) {
        let sub = reader.read_constructed(LDAP_CONTEXT_CONTROLS, "controls")?;
        parse_controls(sub).with_context(|| format!("Failed to parse controls (msgid {})", message_id))?
    } else {
        Vec::new()
    };
    reader.expect_end("LDAPMessage")?;

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

fn parse_protocol_op(reader: &mut BerReader, tag: u8) -> Result<ProtocolOp> {
    let op = match tag {
        LDAP_TAG_BIND_REQUEST => {
            ProtocolOp::BindRequest(parse_bind_request(reader.read_constructed(tag, "BindRequest")?)?)
        }
        LDAP_TAG_BIND_RESPONSE => {
            ProtocolOp::BindResponse(parse_bind_response(reader.read_constructed(tag, "BindResponse")?)?)
        }
        LDAP_TAG_UNBIND_REQUEST => {
            let content = reader.read_element(tag, "UnbindRequest")?;
            if !content.is_empty() {
                bail!("UnbindRequest must be empty, got {} bytes", content.len());
            }
            ProtocolOp::UnbindRequest
        }
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(
            reader.read_constructed(tag, "SearchRequest")?,
        )?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => ProtocolOp::SearchResultEntry(parse_search_result_entry(
            reader.read_constructed(tag, "SearchResultEntry")?,
        )?),
        LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(parse_result_only(
            reader.read_constructed(tag, "SearchResultDone")?,
            "SearchResultDone",
        )?),
        LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyRequest(parse_modify_request(
            reader.read_constructed(tag, "ModifyRequest")?,
        )?),
        LDAP_TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(parse_result_only(
            reader.read_constructed(tag, "ModifyResponse")?,
            "ModifyResponse",
        )?),
        LDAP_TAG_ADD_REQUEST => {
            ProtocolOp::AddRequest(parse_add_request(reader.read_constructed(tag, "AddRequest")?)?)
        }
        LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(parse_result_only(
            reader.read_constructed(tag, "AddResponse")?,
            "AddResponse",
        )?),
        LDAP_TAG_DEL_REQUEST => {
            // [APPLICATION 10] LDAPDN, primitive
            let entry = reader.read_string_tagged(tag, "DelRequest")?;
            ProtocolOp::DelRequest(DelRequest { entry })
        }
        LDAP_TAG_DEL_RESPONSE => ProtocolOp::DelResponse(parse_result_only(
            reader.read_constructed(tag, "DelResponse")?,
            "DelResponse",
        )?),
        LDAP_TAG_MODIFY_DN_REQUEST => ProtocolOp::ModifyDNRequest(parse_modify_dn_request(
            reader.read_constructed(tag, "ModifyDNRequest")?,
        )?),
        LDAP_TAG_MODIFY_DN_RESPONSE => ProtocolOp::ModifyDNResponse(parse_result_only(
            reader.read_constructed(tag, "ModifyDNResponse")?,
            "ModifyDNResponse",
        )?),
        LDAP_TAG_COMPARE_REQUEST => ProtocolOp::CompareRequest(parse_compare_request(
            reader.read_constructed(tag, "CompareRequest")?,
        )?),
        LDAP_TAG_COMPARE_RESPONSE => ProtocolOp::CompareResponse(parse_result_only(
            reader.read_constructed(tag, "CompareResponse")?,
            "CompareResponse",
        )?),
        LDAP_TAG_ABANDON_REQUEST => {
            // [APPLICATION 16] MessageID, primitive
            ProtocolOp::AbandonRequest(reader.read_integer_tagged(tag, "AbandonRequest")?)
        }
        LDAP_TAG_EXTENDED_REQUEST => ProtocolOp::ExtendedRequest(parse_extended_request(
            reader.read_constructed(tag, "ExtendedRequest")?,
        )?),
        LDAP_TAG_EXTENDED_RESPONSE => ProtocolOp::ExtendedResponse(parse_extended_response(
            reader.read_constructed(tag, "ExtendedResponse")?,
        )?),
        _ => bail!("Unsupported LDAP operation tag: 0x{:02X}", tag),
    };
    Ok(op)
}

/// Controls ::= SEQUENCE OF Control { controlType, criticality DEFAULT FALSE, controlValue OPTIONAL }
fn parse_controls(mut reader: BerReader) -> Result<Vec<Control>> {
    let mut controls = Vec::new();
    while !reader.is_empty() {
        let mut control = reader.read_sequence("Control")?;
        let control_type = control.read_string("controlType")?;
        let criticality = if control.peek_tag() == Some(TAG_BOOLEAN) {
            control.read_boolean("criticality")?
        } else {
            false
        };
        let control_value = if control.peek_tag() == Some(TAG_OCTET_STRING) {
            Some(control.read_octet_string("controlValue")?)
        } else {
            None
        };
        control.expect_end("Control")?;
        controls.push(Control {
            control_type,
            criticality,
            control_value,
        });
    }
    Ok(controls)
}

fn parse_bind_request(mut reader: BerReader) -> Result<BindRequest> {
    let version = reader.read_integer("BindRequest version")?;
    if !(1..=127).contains(&version) {
        bail!("BindRequest version {} out of range 1..=127", version);
    }
    let name = reader.read_string("BindRequest name")?;

    let authentication = match reader.peek_tag() {
        Some(AUTH_TAG_SIMPLE) => {
            BindAuthentication::Simple(reader.read_string_tagged(AUTH_TAG_SIMPLE, "simple credentials")?)
        }
        Some(AUTH_TAG_SASL) => {
            let mut sasl = reader.read_constructed(AUTH_TAG_SASL, "SaslCredentials")?;
            let mechanism = sasl.read_string("SASL mechanism")?;
            let credentials = if sasl.is_empty() {
                None
            } else {
                Some(sasl.read_octet_string("SASL credentials")?)
            };
            sasl.expect_end("SaslCredentials")?;
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            }
        }
        Some(other) => bail!("Invalid bind authentication tag: 0x{:02X}", other),
        None => bail!("BER truncated: BindRequest has no authentication"),
    };
    reader.expect_end("BindRequest")?;

    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_bind_response(mut reader: BerReader) -> Result<BindResponse> {
    let result = parse_ldap_result(&mut reader)?;
    let server_sasl_creds = if reader.peek_tag() == Some(BIND_TAG_SERVER_SASL_CREDS) {
        Some(reader.read_octet_string_tagged(BIND_TAG_SERVER_SASL_CREDS, "serverSaslCreds")?)
    } else {
        None
    };
    reader.expect_end("BindResponse")?;
    Ok(BindResponse {
        result,
        server_sasl_creds,
    })
}

/// LDAPResult ::= SEQUENCE { resultCode ENUMERATED, matchedDN, diagnosticMessage, referral [3] OPTIONAL }
fn parse_ldap_result(reader: &mut BerReader) -> Result<LdapResult> {
    let result_code = ResultCode::try_from(reader.read_enumerated("resultCode")?)?;
    let matched_dn = reader.read_string("matchedDN")?;
    let diagnostic_message = reader.read_string("diagnosticMessage")?;
    if reader.peek_tag() == Some(RESULT_TAG_REFERRAL) {
        // referrals are never produced by this server
        reader.read_element(RESULT_TAG_REFERRAL, "referral")?;
    }
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
    })
}

fn parse_result_only(mut reader: BerReader, what: &str) -> Result<LdapResult> {
    let result = parse_ldap_result(&mut reader)?;
    reader.expect_end(what)?;
    Ok(result)
}

fn parse_search_request(mut reader: BerReader) -> Result<SearchRequest> {
    let base_object = reader.read_string("baseObject")?;
    let scope = SearchScope::try_from(reader.read_enumerated("scope")?)?;
    let deref_aliases = DerefAliases::try_from(reader.read_enumerated("derefAliases")?)?;
    let size_limit = reader.read_integer("sizeLimit")?;
    let time_limit = reader.read_integer("timeLimit")?;
    let types_only = reader.read_boolean("typesOnly")?;
    let filter = parse_filter(&mut reader, 0).context("Failed to parse search filter")?;

    let mut attrs = reader.read_sequence("attributes")?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(attrs.read_string("attribute selector")?);
    }
    reader.expect_end("SearchRequest")?;

    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_filter(reader: &mut BerReader, depth: usize) -> Result<Filter> {
    if depth > MAX_FILTER_DEPTH {
        bail!("Filter nested deeper than {} levels", MAX_FILTER_DEPTH);
    }
    let tag = reader
        .peek_tag()
        .ok_or_else(|| anyhow!("BER truncated: expected filter"))?;
    let filter = match tag {
        FILTER_TAG_AND | FILTER_TAG_OR => {
            let mut set = reader.read_constructed(tag, "filter set")?;
            let mut items = Vec::new();
            while !set.is_empty() {
                items.push(parse_filter(&mut set, depth + 1)?);
            }
            if tag == FILTER_TAG_AND {
                Filter::And(items)
            } else {
                Filter::Or(items)
            }
        }
        FILTER_TAG_NOT => {
            let mut inner = reader.read_constructed(tag, "not filter")?;
            let filter = parse_filter(&mut inner, depth + 1)?;
            inner.expect_end("not filter")?;
            Filter::Not(Box::new(filter))
        }
        FILTER_TAG_EQUALITY => Filter::EqualityMatch(parse_ava(reader.read_constructed(tag, "equalityMatch")?)?),
        FILTER_TAG_SUBSTRINGS => Filter::Substrings(parse_substring_filter(reader.read_constructed(tag, "substrings")?)?),
        FILTER_TAG_GREATER_OR_EQUAL => Filter::GreaterOrEqual(parse_ava(reader.read_constructed(tag, "greaterOrEqual")?)?),
        FILTER_TAG_LESS_OR_EQUAL => Filter::LessOrEqual(parse_ava(reader.read_constructed(tag, "lessOrEqual")?)?),
        FILTER_TAG_PRESENT => Filter::Present(reader.read_string_tagged(tag, "present")?),
        FILTER_TAG_APPROX => Filter::ApproxMatch(parse_ava(reader.read_constructed(tag, "approxMatch")?)?),
        FILTER_TAG_EXTENSIBLE => Filter::ExtensibleMatch(parse_matching_rule_assertion(
            reader.read_constructed(tag, "extensibleMatch")?,
        )?),
        _ => bail!("Invalid filter tag: 0x{:02X}", tag),
    };
    Ok(filter)
}

fn parse_ava(mut reader: BerReader) -> Result<AttributeValueAssertion> {
    let attribute_desc = reader.read_string("attributeDesc")?;
    let assertion_value = reader.read_octet_string("assertionValue")?;
    reader.expect_end("AttributeValueAssertion")?;
    Ok(AttributeValueAssertion {
        attribute_desc,
        assertion_value,
    })
}

fn parse_substring_filter(mut reader: BerReader) -> Result<SubstringFilter> {
    let attr_type = reader.read_string("substrings type")?;
    let mut parts = reader.read_sequence("substrings")?;
    reader.expect_end("SubstringFilter")?;

    let mut substrings = Vec::new();
    let mut seen_final = false;
    while !parts.is_empty() {
        if seen_final {
            bail!("Substring filter: final must be the last substring");
        }
        let tag = parts.read_tag_peeked()?;
        let substring = match tag {
            SUBSTRING_TAG_INITIAL => {
                if !substrings.is_empty() {
                    bail!("Substring filter: initial must be the first substring");
                }
                Substring::Initial(parts.read_octet_string_tagged(tag, "initial")?)
            }
            SUBSTRING_TAG_ANY => Substring::Any(parts.read_octet_string_tagged(tag, "any")?),
            SUBSTRING_TAG_FINAL => {
                seen_final = true;
                Substring::Final(parts.read_octet_string_tagged(tag, "final")?)
            }
            _ => bail!("Invalid substring tag: 0x{:02X}", tag),
        };
        substrings.push(substring);
    }
    if substrings.is_empty() {
        bail!("Substring filter must contain at least one substring");
    }
    Ok(SubstringFilter {
        attr_type,
        substrings,
    })
}

fn parse_matching_rule_assertion(mut reader: BerReader) -> Result<MatchingRuleAssertion> {
    let matching_rule = if reader.peek_tag() == Some(MATCHING_RULE_TAG_RULE) {
        Some(reader.read_string_tagged(MATCHING_RULE_TAG_RULE, "matchingRule")?)
    } else {
        None
    };
    let attr_type = if reader.peek_tag() == Some(MATCHING_RULE_TAG_TYPE) {
        Some(reader.read_string_tagged(MATCHING_RULE_TAG_TYPE, "type")?)
    } else {
        None
    };
    if matching_rule.is_none() && attr_type.is_none() {
        bail!("MatchingRuleAssertion needs a matchingRule or a type");
    }
    let match_value = reader.read_octet_string_tagged(MATCHING_RULE_TAG_VALUE, "matchValue")?;
    let dn_attributes = if reader.peek_tag() == Some(MATCHING_RULE_TAG_DN_ATTRIBUTES) {
        reader.read_boolean_tagged(MATCHING_RULE_TAG_DN_ATTRIBUTES, "dnAttributes")?
    } else {
        false
    };
    reader.expect_end("MatchingRuleAssertion")?;
    Ok(MatchingRuleAssertion {
        matching_rule,
        attr_type,
        match_value,
        dn_attributes,
    })
}

fn parse_search_result_entry(mut reader: BerReader) -> Result<SearchResultEntry> {
    let object_name = reader.read_string("objectName")?;
    let mut attrs = reader.read_sequence("attributes")?;
    reader.expect_end("SearchResultEntry")?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(parse_attribute(&mut attrs)?);
    }
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

fn parse_modify_request(mut reader: BerReader) -> Result<ModifyRequest> {
    let object = reader.read_string("object")?;
    let mut list = reader.read_sequence("changes")?;
    reader.expect_end("ModifyRequest")?;

    let mut changes = Vec::new();
    while !list.is_empty() {
        let mut change = list.read_sequence("change")?;
        let operation = ModifyOperation::try_from(change.read_enumerated("operation")?)?;
        let modification = parse_attribute(&mut change)?;
        change.expect_end("change")?;
        changes.push(ModifyChange {
            operation,
            modification,
        });
    }

    Ok(ModifyRequest { object, changes })
}

fn parse_add_request(mut reader: BerReader) -> Result<AddRequest> {
    let entry = reader.read_string("entry")?;
    let mut list = reader.read_sequence("attributes")?;
    reader.expect_end("AddRequest")?;

    let mut attributes = Vec::new();
    while !list.is_empty() {
        attributes.push(parse_attribute(&mut list)?);
    }

    Ok(AddRequest { entry, attributes })
}

/// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE { entry, newrdn, deleteoldrdn, newSuperior [0] OPTIONAL }
fn parse_modify_dn_request(mut reader: BerReader) -> Result<ModifyDNRequest> {
    let entry = reader.read_string("entry")?;
    let new_rdn = reader.read_string("newrdn")?;
    let delete_old_rdn = reader.read_boolean("deleteoldrdn")?;
    let new_superior = if reader.peek_tag() == Some(MODIFY_DN_TAG_NEW_SUPERIOR) {
        Some(reader.read_string_tagged(MODIFY_DN_TAG_NEW_SUPERIOR, "newSuperior")?)
    } else {
        None
    };
    reader.expect_end("ModifyDNRequest")?;
    Ok(ModifyDNRequest {
        entry,
        new_rdn,
        delete_old_rdn,
        new_superior,
    })
}

/// CompareRequest ::= [APPLICATION 14] SEQUENCE { entry, ava AttributeValueAssertion }
fn parse_compare_request(mut reader: BerReader) -> Result<CompareRequest> {
    let entry = reader.read_string("entry")?;
    let ava = parse_ava(reader.read_sequence("ava")?)?;
    reader.expect_end("CompareRequest")?;
    Ok(CompareRequest { entry, ava })
}

fn parse_extended_request(mut reader: BerReader) -> Result<ExtendedRequest> {
    let request_name = reader.read_string_tagged(EXTENDED_TAG_REQUEST_NAME, "requestName")?;
    let request_value = if reader.peek_tag() == Some(EXTENDED_TAG_REQUEST_VALUE) {
        Some(reader.read_octet_string_tagged(EXTENDED_TAG_REQUEST_VALUE, "requestValue")?)
    } else {
        None
    };
    reader.expect_end("ExtendedRequest")?;
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

fn parse_extended_response(mut reader: BerReader) -> Result<ExtendedResponse> {
    let result = parse_ldap_result(&mut reader)?;
    let response_name = if reader.peek_tag() == Some(EXTENDED_TAG_RESPONSE_NAME) {
        Some(reader.read_string_tagged(EXTENDED_TAG_RESPONSE_NAME, "responseName")?)
    } else {
        None
    };
    let response_value = if reader.peek_tag() == Some(EXTENDED_TAG_RESPONSE_VALUE) {
        Some(reader.read_octet_string_tagged(EXTENDED_TAG_RESPONSE_VALUE, "responseValue")?)
    } else {
        None
    };
    reader.expect_end("ExtendedResponse")?;
    Ok(ExtendedResponse {
        result,
        response_name,
        response_value,
    })
}

/// PartialAttribute ::= SEQUENCE { type, vals SET OF value }
fn parse_attribute(reader: &mut BerReader) -> Result<Attribute> {
    let mut attr = reader.read_sequence("Attribute")?;
    let attr_type = attr.read_string("attribute type")?;

    let mut vals = attr.read_constructed(TAG_SET, "attribute values")?;
    attr.expect_end("Attribute")?;
    let mut attr_values = Vec::new();
    while !vals.is_empty() {
        attr_values.push(vals.read_octet_string("attribute value")?);
    }

    Ok(Attribute {
        attr_type,
        attr_values,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    ensure_integer(message.message_id, "messageID")?;
    let mut writer = BerWriter::new();
    writer.write_sequence(|w| {
        w.write_integer(message.message_id);
        encode_protocol_op(w, &message.protocol_op)?;
        if !message.controls.is_empty() {
            w.write_constructed(LDAP_CONTEXT_CONTROLS, |w| {
                for control in &message.controls {
                    encode_control(w, control)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    })?;
    Ok(writer.into_vec())
}

fn encode_protocol_op(writer: &mut BerWriter, op: &ProtocolOp) -> Result<()> {
    match op {
        ProtocolOp::BindRequest(req) => encode_bind_request(writer, req),
        ProtocolOp::BindResponse(resp) => writer.write_constructed(LDAP_TAG_BIND_RESPONSE, |w| {
            encode_ldap_result(w, &resp.result);
            if let Some(ref creds) = resp.server_sasl_creds {
                w.write_octet_string_tagged(BIND_TAG_SERVER_SASL_CREDS, creds);
            }
            Ok(())
        }),
        ProtocolOp::UnbindRequest => {
            writer.write_element(LDAP_TAG_UNBIND_REQUEST, &[]);
            Ok(())
        }
        ProtocolOp::SearchRequest(req) => encode_search_request(writer, req),
        ProtocolOp::SearchResultEntry(entry) => writer.write_constructed(LDAP_TAG_SEARCH_RESULT_ENTRY, |w| {
            w.write_string(&entry.object_name);
            w.write_sequence(|w| {
                for attr in &entry.attributes {
                    encode_attribute(w, attr)?;
                }
                Ok(())
            })
        }),
        ProtocolOp::SearchResultDone(result) => encode_result_only(writer, LDAP_TAG_SEARCH_RESULT_DONE, result),
        ProtocolOp::ModifyRequest(req) => writer.write_constructed(LDAP_TAG_MODIFY_REQUEST, |w| {
            w.write_string(&req.object);
            w.write_sequence(|w| {
                for change in &req.changes {
                    w.write_sequence(|w| {
                        w.write_enumerated(change.operation as u32);
                        encode_attribute(w, &change.modification)
                    })?;
                }
                Ok(())
            })
        }),
        ProtocolOp::ModifyResponse(result) => encode_result_only(writer, LDAP_TAG_MODIFY_RESPONSE, result),
        ProtocolOp::AddRequest(req) => writer.write_constructed(LDAP_TAG_ADD_REQUEST, |w| {
            w.write_string(&req.entry);
            w.write_sequence(|w| {
                for attr in &req.attributes {
                    encode_attribute(w, attr)?;
                }
                Ok(())
            })
        }),
        ProtocolOp::AddResponse(result) => encode_result_only(writer, LDAP_TAG_ADD_RESPONSE, result),
        ProtocolOp::DelRequest(req) => {
            writer.write_string_tagged(LDAP_TAG_DEL_REQUEST, &req.entry);
            Ok(())
        }
        ProtocolOp::DelResponse(result) => encode_result_only(writer, LDAP_TAG_DEL_RESPONSE, result),
        ProtocolOp::ModifyDNRequest(req) => writer.write_constructed(LDAP_TAG_MODIFY_DN_REQUEST, |w| {
            w.write_string(&req.entry);
            w.write_string(&req.new_rdn);
            w.write_boolean(req.delete_old_rdn);
            if let Some(ref superior) = req.new_superior {
                w.write_string_tagged(MODIFY_DN_TAG_NEW_SUPERIOR, superior);
            }
            Ok(())
        }),
        ProtocolOp::ModifyDNResponse(result) => encode_result_only(writer, LDAP_TAG_MODIFY_DN_RESPONSE, result),
        ProtocolOp::CompareRequest(req) => writer.write_constructed(LDAP_TAG_COMPARE_REQUEST, |w| {
            w.write_string(&req.entry);
            w.write_sequence(|w| {
                encode_ava(w, &req.ava);
                Ok(())
            })
        }),
        ProtocolOp::CompareResponse(result) => encode_result_only(writer, LDAP_TAG_COMPARE_RESPONSE, result),
        ProtocolOp::AbandonRequest(id) => {
            ensure_integer(*id, "AbandonRequest messageID")?;
            writer.write_integer_tagged(LDAP_TAG_ABANDON_REQUEST, *id);
            Ok(())
        }
        ProtocolOp::ExtendedRequest(req) => writer.write_constructed(LDAP_TAG_EXTENDED_REQUEST, |w| {
            w.write_string_tagged(EXTENDED_TAG_REQUEST_NAME, &req.request_name);
            if let Some(ref value) = req.request_value {
                w.write_octet_string_tagged(EXTENDED_TAG_REQUEST_VALUE, value);
            }
            Ok(())
        }),
        ProtocolOp::ExtendedResponse(resp) => writer.write_constructed(LDAP_TAG_EXTENDED_RESPONSE, |w| {
            encode_ldap_result(w, &resp.result);
            if let Some(ref name) = resp.response_name {
                w.write_string_tagged(EXTENDED_TAG_RESPONSE_NAME, name);
            }
            if let Some(ref value) = resp.response_value {
                w.write_octet_string_tagged(EXTENDED_TAG_RESPONSE_VALUE, value);
            }
            Ok(())
        }),
    }
}

fn encode_control(writer: &mut BerWriter, control: &Control) -> Result<()> {
    writer.write_sequence(|w| {
        w.write_string(&control.control_type);
        if control.criticality {
            w.write_boolean(true);
        }
        if let Some(ref value) = control.control_value {
            w.write_octet_string(value);
        }
        Ok(())
    })
}

fn encode_bind_request(writer: &mut BerWriter, req: &BindRequest) -> Result<()> {
    if !(1..=127).contains(&req.version) {
        bail!("BindRequest version {} out of range 1..=127", req.version);
    }
    writer.write_constructed(LDAP_TAG_BIND_REQUEST, |w| {
        w.write_integer(req.version);
        w.write_string(&req.name);
        match &req.authentication {
            BindAuthentication::Simple(password) => {
                w.write_string_tagged(AUTH_TAG_SIMPLE, password);
                Ok(())
            }
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            } => w.write_constructed(AUTH_TAG_SASL, |w| {
                w.write_string(mechanism);
                if let Some(creds) = credentials {
                    w.write_octet_string(creds);
                }
                Ok(())
            }),
        }
    })
}

fn encode_search_request(writer: &mut BerWriter, req: &SearchRequest) -> Result<()> {
    ensure_integer(req.size_limit, "sizeLimit")?;
    ensure_integer(req.time_limit, "timeLimit")?;
    writer.write_constructed(LDAP_TAG_SEARCH_REQUEST, |w| {
        w.write_string(&req.base_object);
        w.write_enumerated(req.scope as u32);
        w.write_enumerated(req.deref_aliases as u32);
        w.write_integer(req.size_limit);
        w.write_integer(req.time_limit);
        w.write_boolean(req.types_only);
        encode_filter(w, &req.filter, 0)?;
        w.write_sequence(|w| {
            for attr in &req.attributes {
                w.write_string(attr);
            }
            Ok(())
        })
    })
}

fn encode_filter(writer: &mut BerWriter, filter: &Filter, depth: usize) -> Result<()> {
    if depth > MAX_FILTER_DEPTH {
        bail!("Filter nested deeper than {} levels", MAX_FILTER_DEPTH);
    }
    match filter {
        Filter::And(items) | Filter::Or(items) => {
            let tag = if matches!(filter, Filter::And(_)) {
                FILTER_TAG_AND
            } else {
                FILTER_TAG_OR
            };
            writer.write_constructed(tag, |w| {
                for item in items {
                    encode_filter(w, item, depth + 1)?;
                }
                Ok(())
            })
        }
        Filter::Not(inner) => writer.write_constructed(FILTER_TAG_NOT, |w| encode_filter(w, inner, depth + 1)),
        Filter::EqualityMatch(ava) => encode_ava_filter(writer, FILTER_TAG_EQUALITY, ava),
        Filter::Substrings(sub) => {
            validate_substrings(&sub.substrings)?;
            writer.write_constructed(FILTER_TAG_SUBSTRINGS, |w| {
                w.write_string(&sub.attr_type);
                w.write_sequence(|w| {
                    for part in &sub.substrings {
                        match part {
                            Substring::Initial(v) => w.write_octet_string_tagged(SUBSTRING_TAG_INITIAL, v),
                            Substring::Any(v) => w.write_octet_string_tagged(SUBSTRING_TAG_ANY, v),
                            Substring::Final(v) => w.write_octet_string_tagged(SUBSTRING_TAG_FINAL, v),
                        }
                    }
                    Ok(())
                })
            })
        }
        Filter::GreaterOrEqual(ava) => encode_ava_filter(writer, FILTER_TAG_GREATER_OR_EQUAL, ava),
        Filter::LessOrEqual(ava) => encode_ava_filter(writer, FILTER_TAG_LESS_OR_EQUAL, ava),
        Filter::Present(attr) => {
            writer.write_string_tagged(FILTER_TAG_PRESENT, attr);
            Ok(())
        }
        Filter::ApproxMatch(ava) => encode_ava_filter(writer, FILTER_TAG_APPROX, ava),
        Filter::ExtensibleMatch(mra) => {
            if mra.matching_rule.is_none() && mra.attr_type.is_none() {
                bail!("MatchingRuleAssertion needs a matchingRule or a type");
            }
            writer.write_constructed(FILTER_TAG_EXTENSIBLE, |w| {
                if let Some(ref rule) = mra.matching_rule {
                    w.write_string_tagged(MATCHING_RULE_TAG_RULE, rule);
                }
                if let Some(ref attr) = mra.attr_type {
                    w.write_string_tagged(MATCHING_RULE_TAG_TYPE, attr);
                }
                w.write_octet_string_tagged(MATCHING_RULE_TAG_VALUE, &mra.match_value);
                if mra.dn_attributes {
                    w.write_boolean_tagged(MATCHING_RULE_TAG_DN_ATTRIBUTES, true);
                }
                Ok(())
            })
        }
    }
}

fn validate_substrings(substrings: &[Substring]) -> Result<()> {
    if substrings.is_empty() {
        bail!("Substring filter must contain at least one substring");
    }
    let last = substrings.len() - 1;
    for (i, part) in substrings.iter().enumerate() {
        match part {
            Substring::Initial(_) if i != 0 => bail!("Substring filter: initial must be the first substring"),
            Substring::Final(_) if i != last => bail!("Substring filter: final must be the last substring"),
            _ => {}
        }
    }
    Ok(())
}

fn encode_ava_filter(writer: &mut BerWriter, tag: u8, ava: &AttributeValueAssertion) -> Result<()> {
    writer.write_constructed(tag, |w| {
        encode_ava(w, ava);
        Ok(())
    })
}

fn encode_ava(writer: &mut BerWriter, ava: &AttributeValueAssertion) {
    writer.write_string(&ava.attribute_desc);
    writer.write_octet_string(&ava.assertion_value);
}

fn encode_ldap_result(writer: &mut BerWriter, result: &LdapResult) {
    writer.write_enumerated(result.result_code.code());
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.diagnostic_message);
}

fn encode_result_only(writer: &mut BerWriter, tag: u8, result: &LdapResult) -> Result<()> {
    writer.write_constructed(tag, |w| {
        encode_ldap_result(w, result);
        Ok(())
    })
}

fn encode_attribute(writer: &mut BerWriter, attr: &Attribute) -> Result<()> {
    writer.write_sequence(|w| {
        w.write_string(&attr.attr_type);
        w.write_constructed(TAG_SET, |w| {
            for value in &attr.attr_values {
                w.write_octet_string(value);
            }
            Ok(())
        })
    })
}

/// RFC 4515 string form, for logs.
impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(items) => {
                write!(f, "(&")?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Filter::Or(items) => {
                write!(f, "(|")?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::EqualityMatch(ava) => write!(f, "({}={})", ava.attribute_desc, EscapedValue(&ava.assertion_value)),
            Filter::Substrings(sub) => {
                write!(f, "({}=", sub.attr_type)?;
                if !matches!(sub.substrings.first(), Some(Substring::Initial(_))) {
                    write!(f, "*")?;
                }
                for part in &sub.substrings {
                    match part {
                        Substring::Initial(v) => write!(f, "{}*", EscapedValue(v))?,
                        Substring::Any(v) => write!(f, "{}*", EscapedValue(v))?,
                        Substring::Final(v) => write!(f, "{}", EscapedValue(v))?,
                    }
                }
                write!(f, ")")
            }
            Filter::GreaterOrEqual(ava) => write!(f, "({}>={})", ava.attribute_desc, EscapedValue(&ava.assertion_value)),
            Filter::LessOrEqual(ava) => write!(f, "({}<={})", ava.attribute_desc, EscapedValue(&ava.assertion_value)),
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::ApproxMatch(ava) => write!(f, "({}~={})", ava.attribute_desc, EscapedValue(&ava.assertion_value)),
            Filter::ExtensibleMatch(mra) => {
                write!(f, "(")?;
                if let Some(ref attr) = mra.attr_type {
                    write!(f, "{}", attr)?;
                }
                if mra.dn_attributes {
                    write!(f, ":dn")?;
                }
                if let Some(ref rule) = mra.matching_rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", EscapedValue(&mra.match_value))
            }
        }
    }
}

struct EscapedValue<'a>(&'a [u8]);

impl fmt::Display for EscapedValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(self.0) {
            Ok(s) => {
                for c in s.chars() {
                    match c {
                        '*' | '(' | ')' | '\\' | '\0' => write!(f, "\\{:02x}", c as u32)?,
                        _ => write!(f, "{}", c)?,
                    }
                }
                Ok(())
            }
            Err(_) => {
                for b in self.0 {
                    write!(f, "\\{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eq(attr: &str, value: &str) -> Filter {
        Filter::EqualityMatch(AttributeValueAssertion {
            attribute_desc: attr.to_string(),
            assertion_value: value.as_bytes().to_vec(),
        })
    }

    #[test]
    fn test_search_scope_try_from() {
        assert_eq!(SearchScope::try_from(0).unwrap(), SearchScope::BaseObject);
        assert_eq!(SearchScope::try_from(1).unwrap(), SearchScope::SingleLevel);
        assert_eq!(SearchScope::try_from(2).unwrap(), SearchScope::WholeSubtree);
        assert!(SearchScope::try_from(3).is_err());
    }

    #[test]
    fn test_result_code_allow_set() {
        assert_eq!(ResultCode::try_from(66).unwrap(), ResultCode::NotAllowedOnNonLeaf);
        assert_eq!(ResultCode::NotAllowedOnNonLeaf.name(), "notAllowedOnNonLeaf");
        // 9 and 15 are unassigned
        assert!(ResultCode::try_from(9).is_err());
        assert!(ResultCode::try_from(15).is_err());
        assert!(ResultCode::try_from(-1).is_err());
    }

    #[test]
    fn test_ber_writer_integer() {
        let mut writer = BerWriter::new();
        writer.write_integer(0);
        writer.write_integer(127);
        writer.write_integer(128);
        writer.write_integer(MAX_INT);
        assert_eq!(
            writer.into_vec(),
            vec![
                0x02, 0x01, 0x00, //
                0x02, 0x01, 0x7F, //
                0x02, 0x02, 0x00, 0x80, //
                0x02, 0x04, 0x7F, 0xFF, 0xFF, 0xFF,
            ]
        );
    }

    #[test]
    fn test_ber_writer_long_length() {
        let mut writer = BerWriter::new();
        writer
            .write_sequence(|w| {
                w.write_octet_string(&[0x41; 300]);
                Ok(())
            })
            .unwrap();
        let data = writer.into_vec();
        // SEQUENCE, long form 2 bytes (304 = 0x0130); OCTET STRING long form (300 = 0x012C)
        assert_eq!(&data[..4], &[0x30, 0x82, 0x01, 0x30]);
        assert_eq!(&data[4..8], &[0x04, 0x82, 0x01, 0x2C]);
        assert_eq!(data.len(), 4 + 304);
    }

    #[test]
    fn test_parse_simple_bind_request() {
        // msgid 1, BindRequest v3 "cn=admin" simple "secret"
        let data = [
            0x30, 0x1A, 0x02, 0x01, 0x01, 0x60, 0x15, 0x02, 0x01, 0x03, 0x04, 0x08, b'c', b'n', b'=', b'a',
            b'd', b'm', b'i', b'n', 0x80, 0x06, b's', b'e', b'c', b'r', b'e', b't',
        ];
        let (msg, consumed) = decode_message(&data).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(msg.message_id, 1);
        assert!(msg.controls.is_empty());
        match msg.protocol_op {
            ProtocolOp::BindRequest(req) => {
                assert_eq!(req.version, 3);
                assert_eq!(req.name, "cn=admin");
                assert_eq!(req.authentication, BindAuthentication::Simple("secret".to_string()));
            }
            _ => panic!("expected BindRequest"),
        }
    }

    #[test]
    fn test_parse_bind_request_rejects_unknown_auth_tag() {
        // simple credentials sent with a non-standard 0x41 tag
        let data = [
            0x30, 0x0E, 0x02, 0x01, 0x01, 0x60, 0x09, 0x02, 0x01, 0x03, 0x04, 0x00, 0x41, 0x02, b'p', b'w',
        ];
        assert!(decode_message(&data).is_err());
    }

    #[test]
    fn test_encode_bind_response() {
        let msg = LdapMessage::new(
            1,
            ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::success(),
                server_sasl_creds: None,
            }),
        );
        let data = encode_ldap_message(&msg).unwrap();
        assert_eq!(
            data,
            vec![0x30, 0x0C, 0x02, 0x01, 0x01, 0x61, 0x07, 0x0A, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00]
        );
    }

    #[test]
    fn test_parse_unbind_and_abandon() {
        let unbind = [0x30, 0x05, 0x02, 0x01, 0x03, 0x42, 0x00];
        let (msg, _) = decode_message(&unbind).unwrap();
        assert_eq!(msg.protocol_op, ProtocolOp::UnbindRequest);

        let abandon = [0x30, 0x06, 0x02, 0x01, 0x05, 0x50, 0x01, 0x03];
        let (msg, _) = decode_message(&abandon).unwrap();
        assert_eq!(msg.message_id, 5);
        assert_eq!(msg.protocol_op, ProtocolOp::AbandonRequest(3));
    }

    #[test]
    fn test_message_id_out_of_range() {
        // negative message id
        let negative = [0x30, 0x05, 0x02, 0x01, 0xFF, 0x42, 0x00];
        assert!(decode_message(&negative).is_err());
        // 2^31 does not fit
        let too_big = [0x30, 0x09, 0x02, 0x05, 0x00, 0x80, 0x00, 0x00, 0x00, 0x42, 0x00];
        assert!(decode_message(&too_big).is_err());
        // and is refused on the way out too
        let msg = LdapMessage::new(-1, ProtocolOp::UnbindRequest);
        assert!(encode_ldap_message(&msg).is_err());
    }

    #[test]
    fn test_parse_search_request_present_filter() {
        // msgid 2, base "dc=x", subtree, never, 0, 0, false, (objectClass=*), attrs ["cn"]
        let data = [
            0x30, 0x2D, 0x02, 0x01, 0x02, 0x63, 0x28, 0x04, 0x04, b'd', b'c', b'=', b'x', 0x0A, 0x01, 0x02,
            0x0A, 0x01, 0x00, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x01, 0x01, 0x00, 0x87, 0x0B, b'o', b'b',
            b'j', b'e', b'c', b't', b'C', b'l', b'a', b's', b's', 0x30, 0x04, 0x04, 0x02, b'c', b'n',
        ];
        let (msg, consumed) = decode_message(&data).unwrap();
        assert_eq!(consumed, data.len());
        match msg.protocol_op {
            ProtocolOp::SearchRequest(req) => {
                assert_eq!(req.base_object, "dc=x");
                assert_eq!(req.scope, SearchScope::WholeSubtree);
                assert_eq!(req.deref_aliases, DerefAliases::Never);
                assert!(!req.types_only);
                assert_eq!(req.filter, Filter::Present("objectClass".to_string()));
                assert_eq!(req.attributes, vec!["cn".to_string()]);
            }
            _ => panic!("expected SearchRequest"),
        }
    }

    #[test]
    fn test_search_request_invalid_scope_is_rejected() {
        // same as above with scope 3
        let data = [
            0x30, 0x2D, 0x02, 0x01, 0x02, 0x63, 0x28, 0x04, 0x04, b'd', b'c', b'=', b'x', 0x0A, 0x01, 0x03,
            0x0A, 0x01, 0x00, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x01, 0x01, 0x00, 0x87, 0x0B, b'o', b'b',
            b'j', b'e', b'c', b't', b'C', b'l', b'a', b's', b's', 0x30, 0x04, 0x04, 0x02, b'c', b'n',
        ];
        let err = decode_message(&data).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid search scope"));
    }

    #[test]
    fn test_search_request_with_nested_filter_survives_encoding() {
        let req = SearchRequest {
            base_object: "ou=users,dc=teapot,dc=ovh".to_string(),
            scope: SearchScope::SingleLevel,
            deref_aliases: DerefAliases::Always,
            size_limit: 10,
            time_limit: 30,
            types_only: false,
            filter: Filter::And(vec![
                eq("objectClass", "person"),
                Filter::Not(Box::new(Filter::Or(vec![
                    Filter::Present("description".to_string()),
                    Filter::Substrings(SubstringFilter {
                        attr_type: "cn".to_string(),
                        substrings: vec![
                            Substring::Initial(b"al".to_vec()),
                            Substring::Any(b"i".to_vec()),
                            Substring::Final(b"ce".to_vec()),
                        ],
                    }),
                ]))),
            ]),
            attributes: vec!["cn".to_string(), "+".to_string()],
        };
        let msg = LdapMessage {
            message_id: 42,
            protocol_op: ProtocolOp::SearchRequest(req),
            controls: vec![Control {
                control_type: "1.2.840.113556.1.4.319".to_string(),
                criticality: true,
                control_value: Some(vec![0x30, 0x00]),
            }],
        };
        let data = encode_ldap_message(&msg).unwrap();
        let (decoded, consumed) = decode_message(&data).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_search_result_entry_uses_set_of_values() {
        let msg = LdapMessage::new(
            3,
            ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: "cn=a".to_string(),
                attributes: vec![Attribute {
                    attr_type: "cn".to_string(),
                    attr_values: vec![b"a".to_vec()],
                }],
            }),
        );
        let data = encode_ldap_message(&msg).unwrap();
        assert_eq!(
            data,
            vec![
                0x30, 0x18, 0x02, 0x01, 0x03, 0x64, 0x13, 0x04, 0x04, b'c', b'n', b'=', b'a', 0x30, 0x0B, 0x30,
                0x09, 0x04, 0x02, b'c', b'n', 0x31, 0x03, 0x04, 0x01, b'a',
            ]
        );
    }

    #[test]
    fn test_substring_filter_ordering_is_enforced() {
        let bad = Filter::Substrings(SubstringFilter {
            attr_type: "cn".to_string(),
            substrings: vec![Substring::Final(b"x".to_vec()), Substring::Any(b"y".to_vec())],
        });
        let mut writer = BerWriter::new();
        assert!(encode_filter(&mut writer, &bad, 0).is_err());

        // (cn=*) written as a substring filter with no parts
        let empty = [0xA4, 0x06, 0x04, 0x02, b'c', b'n', 0x30, 0x00];
        let mut reader = BerReader::new(&empty);
        assert!(parse_filter(&mut reader, 0).is_err());

        // any, then initial
        let misplaced = [0xA4, 0x0C, 0x04, 0x02, b'c', b'n', 0x30, 0x06, 0x81, 0x01, b'a', 0x80, 0x01, b'b'];
        let mut reader = BerReader::new(&misplaced);
        assert!(parse_filter(&mut reader, 0).is_err());
    }

    #[test]
    fn test_filter_depth_limit() {
        let mut filter = Filter::Present("cn".to_string());
        for _ in 0..(MAX_FILTER_DEPTH + 1) {
            filter = Filter::Not(Box::new(filter));
        }
        let mut writer = BerWriter::new();
        assert!(encode_filter(&mut writer, &filter, 0).is_err());
    }

    #[test]
    fn test_trailing_bytes_inside_pdu_are_rejected() {
        // DelRequest followed by an extra NULL inside the LDAPMessage
        let data = [0x30, 0x09, 0x02, 0x01, 0x01, 0x4A, 0x02, b'c', b'n', 0x05, 0x00];
        assert!(decode_message(&data).is_err());
    }

    #[test]
    fn test_try_decode_incomplete_and_garbage() {
        let msg = LdapMessage::new(7, ProtocolOp::DelRequest(DelRequest { entry: "cn=x,dc=y".to_string() }));
        let data = encode_ldap_message(&msg).unwrap();
        assert!(try_decode_message(&data[..1]).unwrap().is_none());
        assert!(try_decode_message(&data[..data.len() - 1]).unwrap().is_none());
        let (decoded, consumed) = try_decode_message(&data).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(consumed, data.len());

        assert!(try_decode_message(&[0x04, 0x00]).is_err());
        assert!(frame_length(&[0x30, 0x80]).is_err());
        assert!(frame_length(&[0x30, 0x84, 0x7F, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_two_messages_in_one_buffer() {
        let first = encode_ldap_message(&LdapMessage::new(1, ProtocolOp::AbandonRequest(9))).unwrap();
        let second = encode_ldap_message(&LdapMessage::new(2, ProtocolOp::UnbindRequest)).unwrap();
        let mut buf = first.clone();
        buf.extend_from_slice(&second);
        let (msg, consumed) = decode_message(&buf).unwrap();
        assert_eq!(msg.protocol_op, ProtocolOp::AbandonRequest(9));
        assert_eq!(consumed, first.len());
        let (msg, _) = decode_message(&buf[consumed..]).unwrap();
        assert_eq!(msg.protocol_op, ProtocolOp::UnbindRequest);
    }

    #[test]
    fn test_encode_extended_response_context_tags() {
        let msg = LdapMessage::new(
            0,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::with_message(ResultCode::UnwillingToPerform, "bye"),
                response_name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
                response_value: None,
            }),
        );
        let data = encode_ldap_message(&msg).unwrap();
        let name_pos = data.len() - NOTICE_OF_DISCONNECTION_OID.len() - 2;
        assert_eq!(data[name_pos], 0x8A);
        assert_eq!(data[name_pos + 1] as usize, NOTICE_OF_DISCONNECTION_OID.len());
        let (decoded, _) = decode_message(&data).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_extended_request_requires_context_name_tag() {
        // requestName sent as a universal OCTET STRING
        let data = [0x30, 0x09, 0x02, 0x01, 0x01, 0x77, 0x04, 0x04, 0x02, b'1', b'2'];
        assert!(decode_message(&data).is_err());
    }

    #[test]
    fn test_parse_controls_criticality_default() {
        let msg = LdapMessage {
            message_id: 4,
            protocol_op: ProtocolOp::DelRequest(DelRequest { entry: "cn=a".to_string() }),
            controls: vec![Control {
                control_type: "1.3.6.1.1.12".to_string(),
                criticality: false,
                control_value: None,
            }],
        };
        let data = encode_ldap_message(&msg).unwrap();
        // criticality FALSE is left out (DEFAULT)
        assert!(!data.windows(3).any(|w| w == [0x01, 0x01, 0x00]));
        let (decoded, _) = decode_message(&data).unwrap();
        assert!(!decoded.controls[0].criticality);
        assert_eq!(decoded.controls[0].control_type, "1.3.6.1.1.12");
    }

    #[test]
    fn test_password_modify_request_value() {
        // SEQUENCE { [0] "cn=a", [2] "new" }
        let value = [0x30, 0x0B, 0x80, 0x04, b'c', b'n', b'=', b'a', 0x82, 0x03, b'n', b'e', b'w'];
        let req = PasswordModifyRequest::decode(&value).unwrap();
        assert_eq!(req.user_identity.as_deref(), Some("cn=a"));
        assert_eq!(req.old_password, None);
        assert_eq!(req.new_password.as_deref(), Some(&b"new"[..]));
        assert_eq!(req.encode().unwrap(), value.to_vec());

        assert_eq!(PasswordModifyRequest::decode(&[0x30, 0x00]).unwrap(), PasswordModifyRequest::default());
        // fields out of order
        let reversed = [0x30, 0x06, 0x82, 0x01, b'x', 0x80, 0x01, b'y'];
        assert!(PasswordModifyRequest::decode(&reversed).is_err());
    }

    #[test]
    fn test_response_with_maps_request_to_response() {
        let req = ProtocolOp::CompareRequest(CompareRequest {
            entry: "cn=a".to_string(),
            ava: AttributeValueAssertion {
                attribute_desc: "cn".to_string(),
                assertion_value: b"a".to_vec(),
            },
        });
        let resp = req.response_with(LdapResult::new(ResultCode::OperationsError)).unwrap();
        assert_eq!(resp.name(), "compare");
        assert_eq!(resp.result().unwrap().result_code, ResultCode::OperationsError);
        assert!(ProtocolOp::UnbindRequest.response_with(LdapResult::success()).is_none());
        assert!(ProtocolOp::AbandonRequest(1).response_with(LdapResult::success()).is_none());
    }

    #[test]
    fn test_filter_display() {
        let filter = Filter::And(vec![
            eq("cn", "a*b"),
            Filter::Present("mail".to_string()),
            Filter::Substrings(SubstringFilter {
                attr_type: "sn".to_string(),
                substrings: vec![Substring::Any(b"mid".to_vec()), Substring::Final(b"end".to_vec())],
            }),
        ]);
        assert_eq!(filter.to_string(), "(&(cn=a\\2ab)(mail=*)(sn=*mid*end))");
    }
}
