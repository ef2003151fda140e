//! Per-directory permission files and their evaluation.
//!
//! A permission file is a YAML list of rules living at a well-known name
//! (`syftperm.yaml`) inside any directory of a datasite. Rules grant or
//! revoke `{read, create, write, admin}` for a user (or `*`) on a glob
//! pattern relative to the file's directory. Deeper files override
//! shallower ones; within one file, later rules override earlier ones
//! unless an earlier rule latched a kind as `terminal`.
//!
//! This module is shared verbatim between the client and the server; both
//! sides must compute identical answers.

use globset::GlobBuilder;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;
use crate::sync_path::{SyncPath, PERM_FILE};

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+$").unwrap();
}

pub fn is_valid_email(s: &str) -> bool {
    EMAIL_RE.is_match(s)
}

pub const USEREMAIL_TOKEN: &str = "{useremail}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionKind {
    Read,
    Create,
    Write,
    Admin,
}

pub const ALL_KINDS: [PermissionKind; 4] = [
    PermissionKind::Read,
    PermissionKind::Create,
    PermissionKind::Write,
    PermissionKind::Admin,
];

impl PermissionKind {
    pub fn name(self) -> &'static str {
        match self {
            PermissionKind::Read => "read",
            PermissionKind::Create => "create",
            PermissionKind::Write => "write",
            PermissionKind::Admin => "admin",
        }
    }

    pub fn from_name(s: &str) -> Option<PermissionKind> {
        match s {
            "read" => Some(PermissionKind::Read),
            "create" => Some(PermissionKind::Create),
            "write" => Some(PermissionKind::Write),
            "admin" => Some(PermissionKind::Admin),
            _ => None,
        }
    }
}

/// Four booleans, one per permission kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermissionSet {
    pub read: bool,
    pub create: bool,
    pub write: bool,
    pub admin: bool,
}

impl PermissionSet {
    pub const ALL: PermissionSet = PermissionSet { read: true, create: true, write: true, admin: true };

    pub fn get(&self, kind: PermissionKind) -> bool {
        match kind {
            PermissionKind::Read => self.read,
            PermissionKind::Create => self.create,
            PermissionKind::Write => self.write,
            PermissionKind::Admin => self.admin,
        }
    }

    pub fn set(&mut self, kind: PermissionKind, value: bool) {
        match kind {
            PermissionKind::Read => self.read = value,
            PermissionKind::Create => self.create = value,
            PermissionKind::Write => self.write = value,
            PermissionKind::Admin => self.admin = value,
        }
    }

    /// The kinds that are set, in canonical order.
    pub fn kinds(&self) -> impl Iterator<Item = PermissionKind> + '_ {
        ALL_KINDS.into_iter().filter(|k| self.get(*k))
    }

    pub fn names(&self) -> Vec<String> {
        self.kinds().map(|k| k.name().to_string()).collect()
    }
}

/// The YAML form of one rule, exactly as it appears in a permission file.
/// Unknown keys are a parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDoc {
    pub path: String,
    pub user: String,
    pub permissions: PermissionNames,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub rule_type: Option<RuleType>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub terminal: bool,
}

fn is_false(b: &bool) -> bool {
    !b
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Allow,
    Disallow,
}

/// `permissions:` accepts either a single name or a list of names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionNames {
    One(String),
    Many(Vec<String>),
}

impl PermissionNames {
    fn to_set(&self) -> Result<PermissionSet, String> {
        let names: Vec<&str> = match self {
            PermissionNames::One(s) => vec![s.as_str()],
            PermissionNames::Many(v) => v.iter().map(|s| s.as_str()).collect(),
        };
        let mut set = PermissionSet::default();
        for name in names {
            match PermissionKind::from_name(name) {
                Some(kind) => set.set(kind, true),
                None => return Err(format!("unknown permission '{name}'")),
            }
        }
        Ok(set)
    }
}

/// A rule compiled against the permission file it came from: owning
/// directory, depth in the tree, and position in the file. This is also
/// the flat row shape the server persists.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRule {
    /// Directory of the owning permission file, relative to the datasites
    /// root (e.g. `alice@example.com/shared`).
    pub dir: String,
    /// Segment count of the permission file path itself. Deeper wins.
    pub depth: u32,
    /// Position within the file. Later wins, unless latched terminal.
    pub priority: u32,
    pub pattern: String,
    pub user: String,
    pub perms: PermissionSet,
    pub allow: bool,
    pub terminal: bool,
}

impl PermissionRule {
    pub fn permfile_path(&self) -> String {
        format!("{}/{}", self.dir, PERM_FILE)
    }

    pub fn has_email_template(&self) -> bool {
        self.pattern.contains(USEREMAIL_TOKEN)
    }

    fn user_matches(&self, user: &str) -> bool {
        self.user == "*" || self.user == user
    }

    /// Whether this rule's pattern covers `path` when evaluated for `user`.
    /// Patterns are relative to the rule's directory; `{useremail}` is
    /// substituted with the candidate's email before matching.
    pub fn applies_to(&self, user: &str, path: &SyncPath) -> bool {
        if !self.user_matches(user) {
            return false;
        }
        let rel = match path.strip_dir(&self.dir) {
            Some(rel) => rel,
            None => return false,
        };
        let pattern = self.pattern.replace(USEREMAIL_TOKEN, user);
        glob_matches(&pattern, rel)
    }

    /// Superset test used to build the rule→file link table: true whenever
    /// `applies_to` could be true for *some* user. Template rules link to
    /// every file under their directory, since the substituted email is
    /// not known until evaluation time; the exact check runs on top.
    pub fn may_apply_to(&self, path: &SyncPath) -> bool {
        let rel = match path.strip_dir(&self.dir) {
            Some(rel) => rel,
            None => return false,
        };
        if self.has_email_template() {
            return true;
        }
        glob_matches(&self.pattern, rel)
    }
}

fn glob_matches(pattern: &str, rel: &str) -> bool {
    match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(glob) => glob.compile_matcher().is_match(rel),
        // Pattern validity was checked at parse time; a rule that still
        // fails to compile grants nothing.
        Err(_) => false,
    }
}

/// One parsed permission file.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionFile {
    /// Path of the file itself, relative to the datasites root.
    pub path: SyncPath,
    pub rules: Vec<PermissionRule>,
}

impl PermissionFile {
    /// Parses and validates YAML content. Errors name the file and the
    /// offending rule. `path` must be the permission file's own relative
    /// path (its directory becomes the rules' owning directory).
    pub fn parse(content: &str, path: &SyncPath) -> Result<PermissionFile, SyncError> {
        let err = |message: String| SyncError::PermissionParse { file: path.to_string(), message };

        if !path.is_permission_file() {
            return Err(err(format!("not a {PERM_FILE} file")));
        }
        let dir = path.parent().map(|p| p.to_string()).unwrap_or_default();
        if dir.is_empty() {
            return Err(err("permission file must live inside a datasite".to_string()));
        }

        let docs: Vec<RuleDoc> = serde_yaml::from_str(content).map_err(|e| err(e.to_string()))?;

        let mut rules = Vec::with_capacity(docs.len());
        for (i, doc) in docs.into_iter().enumerate() {
            let rule = compile_rule(&dir, path.depth(), i as u32, doc)
                .map_err(|m| err(format!("rule {i}: {m}")))?;
            rules.push(rule);
        }

        Ok(PermissionFile { path: path.clone(), rules })
    }

    pub fn to_yaml(&self) -> String {
        let docs: Vec<RuleDoc> = self
            .rules
            .iter()
            .map(|r| RuleDoc {
                path: r.pattern.clone(),
                user: r.user.clone(),
                permissions: PermissionNames::Many(r.perms.names()),
                rule_type: if r.allow { None } else { Some(RuleType::Disallow) },
                terminal: r.terminal,
            })
            .collect();
        serde_yaml::to_string(&docs).expect("rule docs always serialize")
    }

    /// The default rule set written into a freshly created datasite: the
    /// owner holds everything, and `public/` is world-readable.
    pub fn default_for_owner(email: &str) -> PermissionFile {
        let path = SyncPath::try_from(format!("{email}/{PERM_FILE}").as_str())
            .expect("owner email forms a valid path");
        let dir = email.to_string();
        let depth = path.depth();
        PermissionFile {
            path,
            rules: vec![
                PermissionRule {
                    dir: dir.clone(),
                    depth,
                    priority: 0,
                    pattern: "**".to_string(),
                    user: email.to_string(),
                    perms: PermissionSet::ALL,
                    allow: true,
                    terminal: false,
                },
                PermissionRule {
                    dir,
                    depth,
                    priority: 1,
                    pattern: "public/**".to_string(),
                    user: "*".to_string(),
                    perms: PermissionSet { read: true, ..Default::default() },
                    allow: true,
                    terminal: false,
                },
            ],
        }
    }
}

fn compile_rule(dir: &str, depth: u32, priority: u32, doc: RuleDoc) -> Result<PermissionRule, String> {
    if doc.user != "*" && !is_valid_email(&doc.user) {
        return Err(format!("user '{}' is not a valid email or *", doc.user));
    }
    if doc.path.starts_with('/') {
        return Err("pattern must be relative to the permission file's directory".to_string());
    }
    if doc.path.starts_with("../") || doc.path.split('/').any(|s| s == "..") {
        return Err("pattern refers to a location above the permission file".to_string());
    }
    if let Some(t) = doc.path.find(USEREMAIL_TOKEN) {
        if let Some(d) = doc.path.rfind("**") {
            if d > t {
                return Err(format!("** can never appear after {USEREMAIL_TOKEN}"));
            }
        }
    }
    // Check the glob compiles now so matching can't fail later
    let probe = doc.path.replace(USEREMAIL_TOKEN, "probe@example.com");
    GlobBuilder::new(&probe)
        .literal_separator(true)
        .build()
        .map_err(|e| format!("invalid pattern: {e}"))?;

    let perms = doc.permissions.to_set()?;

    Ok(PermissionRule {
        dir: dir.to_string(),
        depth,
        priority,
        pattern: doc.path,
        user: doc.user,
        perms,
        allow: doc.rule_type != Some(RuleType::Disallow),
        terminal: doc.terminal,
    })
}

/// The result of folding every applicable rule for one `(user, path)`
/// pair: four permission bits, plus which of them have been latched by a
/// terminal rule.
#[derive(Debug, Clone)]
pub struct ComputedPermission {
    pub user: String,
    pub path: SyncPath,
    perms: PermissionSet,
    terminal: PermissionSet,
}

impl ComputedPermission {
    /// Folds rules in override order: shallowest directory first, then
    /// ascending priority within each file, so that deeper and later rules
    /// overwrite earlier ones — except for kinds a terminal rule latched.
    pub fn evaluate<'a, I>(rules: I, user: &str, path: &SyncPath) -> ComputedPermission
    where
        I: IntoIterator<Item = &'a PermissionRule>,
    {
        let mut ordered: Vec<&PermissionRule> = rules.into_iter().collect();
        ordered.sort_by(|a, b| {
            (a.depth, a.dir.as_str(), a.priority).cmp(&(b.depth, b.dir.as_str(), b.priority))
        });

        let mut computed = ComputedPermission {
            user: user.to_string(),
            path: path.clone(),
            perms: PermissionSet::default(),
            terminal: PermissionSet::default(),
        };
        for rule in ordered {
            computed.apply(rule);
        }
        computed
    }

    fn apply(&mut self, rule: &PermissionRule) {
        if !rule.applies_to(&self.user, &self.path) {
            return;
        }
        for kind in rule.perms.kinds() {
            if !self.terminal.get(kind) {
                self.perms.set(kind, rule.allow);
            }
            if rule.terminal {
                self.terminal.set(kind, true);
            }
        }
    }

    /// The datasite owner always holds every permission on their own tree,
    /// and `admin` implies everything.
    pub fn has_permission(&self, kind: PermissionKind) -> bool {
        if self.path.owner() == self.user {
            return true;
        }
        if self.perms.admin {
            return true;
        }
        self.perms.get(kind)
    }

    pub fn perms(&self) -> PermissionSet {
        self.perms
    }
}
