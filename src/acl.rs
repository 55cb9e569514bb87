// Access control rules
//
// A rule is `user:requiredGroups:actions:target:attributes`. Fields hold glob
// patterns; space separated tokens are alternatives and a `!` prefix on an
// attribute token excludes it. Access is granted when any rule matches.

use anyhow::{bail, Result};

use crate::dn::Dn;

pub const ANONYMOUS_USER: &str = "ANONYMOUS";

const SELF_TOKEN: &str = "SELF";

/// The principal an operation runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub dn: String,
    pub groups: Vec<String>,
}

impl User {
    pub fn new(dn: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            dn: dn.into(),
            groups,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS_USER, Vec::new())
    }

    pub fn is_anonymous(&self) -> bool {
        self.dn == ANONYMOUS_USER
    }
}

impl Default for User {
    fn default() -> Self {
        Self::anonymous()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    pub user: String,
    pub required_groups: Vec<String>,
    pub actions: Vec<String>,
    /// `SELF` stands for the principal's own DN.
    pub target: String,
    pub attributes: Vec<String>,
    pub excluded_attributes: Vec<String>,
}

fn split_tokens(field: &str) -> Vec<String> {
    field
        .split(' ')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl AclEntry {
    pub fn parse(rule: &str) -> Result<Self> {
        let parts: Vec<&str> = rule.split(':').collect();
        if parts.len() != 5 {
            bail!("invalid ACL entry {:?}: expected 5 colon-separated fields, got {}", rule, parts.len());
        }

        let mut attributes = Vec::new();
        let mut excluded_attributes = Vec::new();
        for token in split_tokens(parts[4]) {
            match token.strip_prefix('!') {
                Some(excluded) => excluded_attributes.push(excluded.to_lowercase()),
                None => attributes.push(token.to_lowercase()),
            }
        }

        Ok(Self {
            user: parts[0].to_string(),
            required_groups: split_tokens(parts[1]),
            actions: split_tokens(parts[2]),
            target: parts[3].to_string(),
            attributes,
            excluded_attributes,
        })
    }

    fn matches_target(&self, user: &User, target: &str) -> bool {
        if glob_match(&self.target, target) {
            return true;
        }
        match target.strip_suffix(user.dn.as_str()) {
            Some(head) => glob_match(&self.target, &format!("{}{}", head, SELF_TOKEN)),
            None => false,
        }
    }

    pub fn check(&self, user: &User, action: &str, target: &str, attributes: &[String]) -> bool {
        if !glob_match(&self.user, &user.dn) {
            return false;
        }

        let groups_ok = self
            .required_groups
            .iter()
            .all(|pattern| user.groups.iter().any(|group| glob_match(pattern, group)));
        if !groups_ok {
            return false;
        }

        if !self.matches_target(user, target) {
            return false;
        }

        if !self.actions.iter().any(|pattern| glob_match(pattern, action)) {
            return false;
        }

        let allowed = attributes
            .iter()
            .all(|attr| self.attributes.iter().any(|pattern| glob_match(pattern, attr)));
        if !allowed {
            return false;
        }

        // exclusions win over any allow pattern
        !self
            .excluded_attributes
            .iter()
            .any(|pattern| attributes.iter().any(|attr| glob_match(pattern, attr)))
    }
}

/// Ordered rule list; an empty list denies everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl(Vec<AclEntry>);

impl Acl {
    pub fn parse<S: AsRef<str>>(rules: &[S]) -> Result<Self> {
        let entries = rules
            .iter()
            .map(|rule| AclEntry::parse(rule.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(entries))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn check(&self, user: &User, action: &str, target: &Dn, attributes: &[String]) -> bool {
        let target = target.to_string();
        self.0
            .iter()
            .any(|entry| entry.check(user, action, &target, attributes))
    }
}

/// Shell-style match over '/'-separated names, case-insensitive.
/// `*` and `?` never match '/'; `[...]` classes support `^` negation and ranges;
/// `\` escapes. A malformed pattern matches nothing.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let value: Vec<char> = value.to_lowercase().chars().collect();
    is_valid_pattern(&pattern) && match_here(&pattern, &value)
}

fn is_valid_pattern(mut p: &[char]) -> bool {
    while let Some(&c) = p.first() {
        p = match c {
            '\\' => match p.get(1) {
                Some(_) => &p[2..],
                None => return false,
            },
            '[' => match parse_class(&p[1..]) {
                Some((_, rest)) => rest,
                None => return false,
            },
            _ => &p[1..],
        };
    }
    true
}

fn match_here(p: &[char], t: &[char]) -> bool {
    let Some(&c) = p.first() else {
        return t.is_empty();
    };
    match c {
        '*' => {
            let rest = &p[1..];
            for i in 0..=t.len() {
                if match_here(rest, &t[i..]) {
                    return true;
                }
                if i < t.len() && t[i] == '/' {
                    break;
                }
            }
            false
        }
        '?' => match t.first() {
            Some(&ch) if ch != '/' => match_here(&p[1..], &t[1..]),
            _ => false,
        },
        '[' => match (parse_class(&p[1..]), t.first()) {
            (Some((class, rest)), Some(&ch)) if class.contains(ch) => match_here(rest, &t[1..]),
            _ => false,
        },
        '\\' => match (p.get(1), t.first()) {
            (Some(a), Some(b)) if a == b => match_here(&p[2..], &t[1..]),
            _ => false,
        },
        _ => match t.first() {
            Some(&ch) if ch == c => match_here(&p[1..], &t[1..]),
            _ => false,
        },
    }
}

struct CharClass {
    negated: bool,
    ranges: Vec<(char, char)>,
}

impl CharClass {
    fn contains(&self, c: char) -> bool {
        let inside = self.ranges.iter().any(|(lo, hi)| *lo <= c && c <= *hi);
        inside != self.negated
    }
}

/// Parse a class body (after '['); returns it with the pattern after ']'.
fn parse_class(p: &[char]) -> Option<(CharClass, &[char])> {
    let negated = p.first() == Some(&'^');
    let mut i = usize::from(negated);
    let mut ranges = Vec::new();
    loop {
        match p.get(i) {
            None => return None,
            Some(']') if !ranges.is_empty() => {
                return Some((CharClass { negated, ranges }, &p[i + 1..]));
            }
            _ => {}
        }
        let (lo, next) = class_char(p, i)?;
        i = next;
        let mut hi = lo;
        if p.get(i) == Some(&'-') {
            let (h, next) = class_char(p, i + 1)?;
            hi = h;
            i = next;
        }
        ranges.push((lo, hi));
    }
}

fn class_char(p: &[char], i: usize) -> Option<(char, usize)> {
    match *p.get(i)? {
        '-' | ']' => None,
        '\\' => p.get(i + 1).map(|c| (*c, i + 2)),
        c => Some((c, i + 1)),
    }
}
