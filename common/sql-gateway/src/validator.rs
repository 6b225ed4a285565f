//! Read-only query certification
//!
//! The validator decides from the token stream alone whether a candidate
//! query is a single read-only SELECT. It is pure: the verdict depends only
//! on the SQL text, the configuration, and the schema snapshot passed in.
//!
//! Table extraction is lexical and therefore approximate. Under
//! [`UnknownTablePolicy::Warn`] a miss is logged and reported in
//! [`ApprovedQuery::unverified_tables`] instead of rejecting the query.

use std::collections::HashSet;

use serde::Serialize;

use crate::config::{UnknownTablePolicy, ValidatorConfig};
use crate::error::{GatewayError, RejectReason};
use crate::lexer::{self, LexError, Token, TokenKind};
use crate::schema::SchemaSnapshot;

/// Keywords that never belong in a read-only query
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE",
    "REPLACE", "MERGE", "EXEC", "EXECUTE", "CALL", "DECLARE", "INTO", "ATTACH", "DETACH",
    "PRAGMA", "VACUUM", "REINDEX", "ANALYZE", "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "COPY",
];

/// Functions that read files, load code, or touch server state
const FORBIDDEN_FUNCTIONS: &[&str] = &[
    // SQLite
    "load_extension",
    "readfile",
    "writefile",
    "edit",
    "fts3_tokenizer",
    "sqlite_compileoption_get",
    "sqlite_compileoption_used",
    // PostgreSQL family
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_stat_file",
    "pg_sleep",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "pg_rotate_logfile",
    "lo_import",
    "lo_export",
    "lo_get",
    "set_config",
    "current_setting",
    "dblink",
    "dblink_exec",
];

/// Words that end a FROM list or cannot be a table name
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "FETCH", "UNION", "INTERSECT",
    "EXCEPT", "WINDOW", "SELECT", "RETURNING", "VALUES",
];

/// Words that may follow a table name without being an alias
const NON_ALIAS_KEYWORDS: &[&str] = &[
    "ON", "USING", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "NATURAL",
    "INDEXED", "NOT", "AS",
];

/// Functions whose argument syntax uses FROM
const FROM_ARGUMENT_FUNCTIONS: &[&str] = &["extract", "substring", "trim", "overlay", "position"];

const MAX_FRAGMENT_CHARS: usize = 60;

// ============================================================================
// Verdict Types
// ============================================================================

/// A query certified for read-only execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovedQuery {
    /// Normalized SQL to execute
    pub sql: String,
    /// Whether the default LIMIT was appended
    pub limit_injected: bool,
    /// Tables named in FROM/JOIN clauses, lowercased
    pub tables: Vec<String>,
    /// Referenced tables missing from the schema (warn policy only)
    pub unverified_tables: Vec<String>,
}

/// A query that passed the lexical checks, tables not yet resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectedQuery {
    /// Normalized SQL with the default LIMIT applied
    pub sql: String,
    pub limit_injected: bool,
    /// Tables named in FROM/JOIN clauses, lowercased
    pub tables: Vec<String>,
}

impl InspectedQuery {
    fn approve(self, unverified_tables: Vec<String>) -> ApprovedQuery {
        ApprovedQuery {
            sql: self.sql,
            limit_injected: self.limit_injected,
            tables: self.tables,
            unverified_tables,
        }
    }

    /// Approve without a schema lookup when no tables are named
    ///
    /// Hands the query back otherwise.
    pub fn approve_tableless(self) -> Result<ApprovedQuery, InspectedQuery> {
        if self.tables.is_empty() {
            Ok(self.approve(Vec::new()))
        } else {
            Err(self)
        }
    }
}

/// Why a query was refused and which fragment triggered it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub fragment: String,
}

impl From<Rejection> for GatewayError {
    fn from(rejection: Rejection) -> Self {
        GatewayError::rejected(rejection.reason, rejection.fragment)
    }
}

/// Outcome of [`QueryValidator::validate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ValidationVerdict {
    Approved(ApprovedQuery),
    Rejected(Rejection),
}

impl ValidationVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, ValidationVerdict::Approved(_))
    }

    /// Reject reason, if any
    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            ValidationVerdict::Approved(_) => None,
            ValidationVerdict::Rejected(rejection) => Some(rejection.reason),
        }
    }

    pub fn into_result(self) -> Result<ApprovedQuery, GatewayError> {
        match self {
            ValidationVerdict::Approved(query) => Ok(query),
            ValidationVerdict::Rejected(rejection) => Err(rejection.into()),
        }
    }
}

fn rejection(reason: RejectReason, fragment: &str) -> Rejection {
    let fragment: String = fragment.trim().chars().take(MAX_FRAGMENT_CHARS).collect();
    Rejection { reason, fragment }
}

fn reject(reason: RejectReason, fragment: &str) -> ValidationVerdict {
    ValidationVerdict::Rejected(rejection(reason, fragment))
}

// ============================================================================
// Validator
// ============================================================================

/// Certifies candidate SQL as a single read-only statement
#[derive(Debug, Clone)]
pub struct QueryValidator {
    default_limit: u64,
    unknown_tables: UnknownTablePolicy,
}

impl QueryValidator {
    pub fn new(config: &ValidatorConfig) -> Self {
        Self {
            default_limit: config.default_limit,
            unknown_tables: config.unknown_tables,
        }
    }

    pub fn validate(&self, sql: &str, schema: &SchemaSnapshot) -> ValidationVerdict {
        match self.inspect(sql) {
            Ok(inspected) => self.check_tables(inspected, schema),
            Err(rejection) => ValidationVerdict::Rejected(rejection),
        }
    }

    /// Lexical checks that need no schema
    ///
    /// Covers emptiness, statement stacking, forbidden keywords and
    /// functions, and table extraction. Callers fetch a schema snapshot
    /// only when this passes and [`InspectedQuery::tables`] is non-empty.
    pub fn inspect(&self, sql: &str) -> Result<InspectedQuery, Rejection> {
        if sql.trim().is_empty() {
            return Err(rejection(RejectReason::EmptyQuery, ""));
        }

        let lexed = lexer::tokenize(sql).map_err(|err| malformed(sql, err))?;
        let mut tokens = lexed.tokens;
        if tokens.is_empty() {
            return Err(rejection(RejectReason::EmptyQuery, ""));
        }

        // Statement stacking: at most one terminator, and only at the end
        let terminators: Vec<usize> = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_punct(';'))
            .map(|(idx, _)| idx)
            .collect();
        if let Some(&first) = terminators.first() {
            if terminators.len() > 1 || first + 1 != tokens.len() {
                return Err(rejection(RejectReason::MultipleStatements, &sql[tokens[first].offset..]));
            }
            tokens.truncate(first);
        }
        if tokens.is_empty() {
            return Err(rejection(RejectReason::EmptyQuery, ""));
        }

        if let Some(token) = find_forbidden_keyword(&tokens) {
            return Err(rejection(RejectReason::ForbiddenStatement, token.text));
        }

        match tokens.iter().find(|t| !t.is_punct('(')) {
            Some(lead) if lead.is_word("SELECT") || lead.is_word("WITH") => {}
            Some(lead) => return Err(rejection(RejectReason::ForbiddenStatement, lead.text)),
            None => return Err(rejection(RejectReason::ForbiddenStatement, sql)),
        }

        if let Some(token) = find_forbidden_function(&tokens) {
            return Err(rejection(RejectReason::ForbiddenFunction, token.text));
        }

        let scan = scan_tables(&tokens);
        let statement = lexed
            .normalized
            .trim_end()
            .trim_end_matches(';')
            .trim_end();
        let limit_injected = !scan.has_top_level_limit;
        let sql = if limit_injected {
            format!("{} LIMIT {}", statement, self.default_limit)
        } else {
            statement.to_string()
        };

        Ok(InspectedQuery {
            sql,
            limit_injected,
            tables: scan.tables,
        })
    }

    /// Apply the unknown-table policy to an inspected query
    pub fn check_tables(&self, inspected: InspectedQuery, schema: &SchemaSnapshot) -> ValidationVerdict {
        let unknown: Vec<String> = inspected
            .tables
            .iter()
            .filter(|table| !schema.has_table(table))
            .cloned()
            .collect();
        if let Some(first) = unknown.first() {
            match self.unknown_tables {
                UnknownTablePolicy::Reject => return reject(RejectReason::UnknownTable, first),
                UnknownTablePolicy::Warn => {
                    tracing::warn!(tables = ?unknown, "Query references tables outside the schema snapshot");
                }
            }
        }
        ValidationVerdict::Approved(inspected.approve(unknown))
    }
}

fn malformed(sql: &str, err: LexError) -> Rejection {
    rejection(RejectReason::MalformedQuery, &sql[err.offset()..])
}

fn find_forbidden_keyword<'a>(tokens: &[Token<'a>]) -> Option<Token<'a>> {
    tokens.iter().enumerate().find_map(|(idx, token)| {
        if token.kind != TokenKind::Word {
            return None;
        }
        // `t.update` is a column reference, not a statement
        if idx > 0 && tokens[idx - 1].is_punct('.') {
            return None;
        }
        let upper = token.text.to_ascii_uppercase();
        if !FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
            return None;
        }
        // replace(str, from, to) is a scalar function
        if upper == "REPLACE" && tokens.get(idx + 1).is_some_and(|t| t.is_punct('(')) {
            return None;
        }
        Some(*token)
    })
}

fn find_forbidden_function<'a>(tokens: &[Token<'a>]) -> Option<Token<'a>> {
    tokens.windows(2).find_map(|pair| {
        let (name, next) = (pair[0], pair[1]);
        let callee = name.ident_name()?;
        (next.is_punct('(') && FORBIDDEN_FUNCTIONS.contains(&callee.as_str())).then_some(name)
    })
}

// ============================================================================
// Table Extraction
// ============================================================================

struct TableScan {
    tables: Vec<String>,
    has_top_level_limit: bool,
}

/// Parenthesis nesting level during the scan
struct Frame {
    /// Function being called, when the parenthesis follows a word
    callee: Option<String>,
    in_from_list: bool,
}

fn is_keyword_in(token: &Token<'_>, list: &[&str]) -> bool {
    token.kind == TokenKind::Word && list.iter().any(|kw| token.text.eq_ignore_ascii_case(kw))
}

/// Names introduced by `WITH name AS (...)` or `WITH name(cols) AS (...)`
fn cte_names(tokens: &[Token<'_>]) -> HashSet<String> {
    let mut names = HashSet::new();
    for idx in 1..tokens.len() {
        let prev = &tokens[idx - 1];
        if !(prev.is_word("WITH") || prev.is_word("RECURSIVE") || prev.is_punct(',')) {
            continue;
        }
        let Some(name) = tokens[idx].ident_name() else {
            continue;
        };

        let mut next = idx + 1;
        if tokens.get(next).is_some_and(|t| t.is_punct('(')) {
            let mut depth = 0usize;
            while let Some(token) = tokens.get(next) {
                if token.is_punct('(') {
                    depth += 1;
                } else if token.is_punct(')') {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                next += 1;
            }
            next += 1;
        }
        if !tokens.get(next).is_some_and(|t| t.is_word("AS")) {
            continue;
        }
        next += 1;
        while tokens
            .get(next)
            .is_some_and(|t| t.is_word("NOT") || t.is_word("MATERIALIZED"))
        {
            next += 1;
        }
        if tokens.get(next).is_some_and(|t| t.is_punct('(')) {
            names.insert(name);
        }
    }
    names
}

fn scan_tables(tokens: &[Token<'_>]) -> TableScan {
    let ctes = cte_names(tokens);
    let mut tables: Vec<String> = Vec::new();
    let mut has_top_level_limit = false;
    let mut frames = vec![Frame {
        callee: None,
        in_from_list: false,
    }];
    let mut expect_table = false;
    let mut idx = 0;

    while idx < tokens.len() {
        let token = tokens[idx];
        let prev = idx.checked_sub(1).map(|p| tokens[p]);
        let depth = frames.len();

        if token.is_punct('(') {
            let callee = prev
                .filter(|p| p.kind == TokenKind::Word)
                .map(|p| p.text.to_ascii_lowercase());
            // `FROM (t)` and `JOIN (a JOIN b)` still name tables; `FROM (SELECT ...)` does not
            let subquery = tokens
                .get(idx + 1)
                .is_some_and(|t| t.is_word("SELECT") || t.is_word("WITH") || t.is_word("VALUES"));
            let table_group = expect_table && !subquery;
            frames.push(Frame {
                callee,
                in_from_list: table_group,
            });
            expect_table = table_group;
            idx += 1;
            continue;
        }

        if token.is_punct(')') {
            if frames.len() > 1 {
                frames.pop();
            }
            expect_table = false;
            idx += 1;
            continue;
        }

        let Some(frame) = frames.last_mut() else {
            break;
        };

        if token.is_word("FROM") {
            let in_call = frame
                .callee
                .as_deref()
                .is_some_and(|callee| FROM_ARGUMENT_FUNCTIONS.contains(&callee));
            let distinct_from = prev.is_some_and(|p| p.is_word("DISTINCT"));
            if !in_call && !distinct_from {
                frame.in_from_list = true;
                expect_table = true;
            }
            idx += 1;
            continue;
        }

        if token.is_word("JOIN") {
            frame.in_from_list = true;
            expect_table = true;
            idx += 1;
            continue;
        }

        if is_keyword_in(&token, CLAUSE_KEYWORDS) {
            frame.in_from_list = false;
            expect_table = false;
            if depth == 1 && (token.is_word("LIMIT") || token.is_word("FETCH")) {
                has_top_level_limit = true;
            }
            idx += 1;
            continue;
        }

        if token.is_punct(',') && frame.in_from_list {
            expect_table = true;
            idx += 1;
            continue;
        }

        if expect_table {
            if token.is_word("LATERAL") || token.is_word("ONLY") {
                idx += 1;
                continue;
            }
            expect_table = false;
            if is_keyword_in(&token, NON_ALIAS_KEYWORDS) {
                idx += 1;
                continue;
            }
            if let Some(mut name) = token.ident_name() {
                idx += 1;
                // schema.table: keep the last segment
                while tokens.get(idx).is_some_and(|t| t.is_punct('.')) {
                    match tokens.get(idx + 1).and_then(|t| t.ident_name()) {
                        Some(segment) => {
                            name = segment;
                            idx += 2;
                        }
                        None => break,
                    }
                }
                let table_function = tokens.get(idx).is_some_and(|t| t.is_punct('('));
                if !table_function && !ctes.contains(&name) && !tables.contains(&name) {
                    tables.push(name);
                }
                continue;
            }
        }

        idx += 1;
    }

    TableScan {
        tables,
        has_top_level_limit,
    }
}
