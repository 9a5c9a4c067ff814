//! SQL Safety Validator
//!
//! Static acceptance gate for generated SQL. Every candidate moves through
//! RECEIVED -> PARSED -> CHECKED and ends ACCEPTED or REJECTED with a reason
//! from a closed set. `AcceptedQuery` can only be built here, and the executor
//! only takes an `AcceptedQuery`.

use crate::security::schema_allowlist::SchemaAllowlist;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    visit_expressions, Expr, Ident, ObjectName, Query, SetExpr, Statement, TableFactor,
    TableWithJoins, Value, Visit, Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::ControlFlow;
use tracing::{debug, warn};

/// Statement keywords that never appear in a read-only query.
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE",
    "MERGE", "COPY", "EXEC", "EXECUTE", "CALL", "VACUUM",
];

/// Functions a generated query may call. Anything else is rejected, since
/// functions such as `query_to_xml` or `current_setting` read data the table
/// allowlist never sees. Extend with `SqlValidator::with_extra_functions`.
pub const ALLOWED_FUNCTIONS: &[&str] = &[
    // aggregates
    "count", "sum", "avg", "min", "max", "stddev", "stddev_pop", "stddev_samp", "variance",
    "var_pop", "var_samp", "string_agg", "array_agg", "bool_and", "bool_or", "every",
    "percentile_cont", "percentile_disc", "mode",
    // window
    "row_number", "rank", "dense_rank", "percent_rank", "cume_dist", "ntile", "lag", "lead",
    "first_value", "last_value", "nth_value",
    // date and time
    "now", "current_date", "current_time", "current_timestamp", "localtime", "localtimestamp",
    "date_trunc", "date_part", "extract", "age", "to_char", "to_date", "to_timestamp",
    "make_date", "make_interval", "justify_days", "justify_interval",
    // string
    "lower", "upper", "initcap", "length", "char_length", "character_length", "trim", "btrim",
    "ltrim", "rtrim", "substring", "substr", "left", "right", "concat", "concat_ws", "replace",
    "split_part", "strpos", "position", "lpad", "rpad", "reverse",
    // numeric
    "abs", "round", "ceil", "ceiling", "floor", "trunc", "sign", "mod", "power", "sqrt",
    "greatest", "least",
    // conditional and conversion
    "coalesce", "nullif", "cast",
];

/// SQL value functions written without parentheses.
const NILADIC_FUNCTIONS: &[&str] = &[
    "current_date",
    "current_time",
    "current_timestamp",
    "localtime",
    "localtimestamp",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    Empty,
    Unparseable(String),
    MultipleStatements,
    ForbiddenKeyword(String),
    NotReadOnly,
    UnknownTable(String),
    UnknownColumn(String),
    NonLiteralLimit,
}

impl RejectionReason {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::Empty => "empty",
            RejectionReason::Unparseable(_) => "unparseable",
            RejectionReason::MultipleStatements => "multiple_statements",
            RejectionReason::ForbiddenKeyword(_) => "forbidden_keyword",
            RejectionReason::NotReadOnly => "not_read_only",
            RejectionReason::UnknownTable(_) => "unknown_table",
            RejectionReason::UnknownColumn(_) => "unknown_column",
            RejectionReason::NonLiteralLimit => "non_literal_limit",
        }
    }

    /// Instruction for the next generation attempt.
    pub fn repair_hint(&self) -> String {
        match self {
            RejectionReason::Empty => "The previous answer contained no SQL. Return exactly one SELECT statement.".to_string(),
            RejectionReason::Unparseable(detail) => format!(
                "The previous SQL could not be parsed ({}). Return one syntactically valid PostgreSQL SELECT statement.",
                detail
            ),
            RejectionReason::MultipleStatements => "The previous SQL contained more than one statement. Return exactly one SELECT statement with no semicolon-separated statements.".to_string(),
            RejectionReason::ForbiddenKeyword(kw) => format!(
                "The previous SQL used the forbidden operation {}. Only read-only SELECT queries are allowed.",
                kw
            ),
            RejectionReason::NotReadOnly => "The previous SQL was not a read-only SELECT. Do not use SELECT INTO, row locks or data-modifying statements.".to_string(),
            RejectionReason::UnknownTable(t) => format!(
                "The previous SQL referenced table {} which does not exist. Use only the tables listed in the schema context.",
                t
            ),
            RejectionReason::UnknownColumn(c) => format!(
                "The previous SQL referenced column {} which does not exist. Use only the columns listed in the schema context.",
                c
            ),
            RejectionReason::NonLiteralLimit => "The previous SQL used a row limit that is not a plain integer. Use LIMIT with an integer literal.".to_string(),
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Empty => write!(f, "empty query"),
            RejectionReason::Unparseable(detail) => write!(f, "unparseable query: {}", detail),
            RejectionReason::MultipleStatements => write!(f, "more than one statement"),
            RejectionReason::ForbiddenKeyword(kw) => write!(f, "forbidden keyword {}", kw),
            RejectionReason::NotReadOnly => write!(f, "not a read-only SELECT"),
            RejectionReason::UnknownTable(t) => write!(f, "unknown table {}", t),
            RejectionReason::UnknownColumn(c) => write!(f, "unknown column {}", c),
            RejectionReason::NonLiteralLimit => write!(f, "row limit is not an integer literal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    Received,
    Parsed,
    Checked,
}

/// A query that passed every check. Fields are private so the only way to
/// obtain one is `SqlValidator::validate`.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedQuery {
    sql: String,
    tables: Vec<String>,
    columns: Vec<String>,
    filter_numbers: Vec<f64>,
    limit: u64,
    limit_injected: bool,
    limit_clamped: bool,
}

impl AcceptedQuery {
    /// Re-rendered SQL including the enforced LIMIT.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Numeric literals from WHERE and HAVING clauses (not LIMIT).
    pub fn filter_numbers(&self) -> &[f64] {
        &self.filter_numbers
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn limit_injected(&self) -> bool {
        self.limit_injected
    }

    pub fn limit_clamped(&self) -> bool {
        self.limit_clamped
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationVerdict {
    Accepted(AcceptedQuery),
    Rejected {
        reason: RejectionReason,
        stage: ValidationStage,
    },
}

impl ValidationVerdict {
    fn rejected(reason: RejectionReason, stage: ValidationStage) -> Self {
        ValidationVerdict::Rejected { reason, stage }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationVerdict::Accepted(_))
    }
}

pub struct SqlValidator {
    allowlist: SchemaAllowlist,
    row_cap: u64,
    functions: BTreeSet<String>,
}

impl SqlValidator {
    pub fn new(allowlist: SchemaAllowlist, row_cap: u64) -> Self {
        Self {
            allowlist,
            row_cap,
            functions: ALLOWED_FUNCTIONS.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Allow more function names on top of `ALLOWED_FUNCTIONS`.
    pub fn with_extra_functions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.functions
            .extend(names.into_iter().map(|n| n.as_ref().trim().to_lowercase()));
        self
    }

    pub fn allows_function(&self, name: &str) -> bool {
        self.functions.contains(&name.to_lowercase())
    }

    pub fn row_cap(&self) -> u64 {
        self.row_cap
    }

    pub fn allowlist(&self) -> &SchemaAllowlist {
        &self.allowlist
    }

    pub fn validate(&self, candidate: &str) -> ValidationVerdict {
        let verdict = self.run(candidate);
        match &verdict {
            ValidationVerdict::Accepted(q) => {
                debug!(tables = ?q.tables, limit = q.limit, "SQL accepted");
            }
            ValidationVerdict::Rejected { reason, stage } => {
                warn!(reason = %reason, stage = ?stage, "SQL rejected");
            }
        }
        verdict
    }

    fn run(&self, candidate: &str) -> ValidationVerdict {
        use ValidationStage::*;

        // RECEIVED: lexical checks
        let sql = candidate.trim();
        if sql.is_empty() {
            return ValidationVerdict::rejected(RejectionReason::Empty, Received);
        }

        let dialect = PostgreSqlDialect {};
        let tokens = match Tokenizer::new(&dialect, sql).tokenize() {
            Ok(tokens) => tokens,
            Err(e) => {
                return ValidationVerdict::rejected(RejectionReason::Unparseable(e.to_string()), Received)
            }
        };
        if let Err(reason) = lexical_check(&tokens) {
            return ValidationVerdict::rejected(reason, Received);
        }

        // PARSED: exactly one read-only query
        let mut statements = match Parser::parse_sql(&dialect, sql) {
            Ok(statements) => statements,
            Err(e) => {
                return ValidationVerdict::rejected(RejectionReason::Unparseable(e.to_string()), Received)
            }
        };
        if statements.len() > 1 {
            return ValidationVerdict::rejected(RejectionReason::MultipleStatements, Parsed);
        }
        let Some(statement) = statements.pop() else {
            return ValidationVerdict::rejected(RejectionReason::Empty, Parsed);
        };
        let Statement::Query(mut query) = statement else {
            return ValidationVerdict::rejected(RejectionReason::NotReadOnly, Parsed);
        };
        if !is_read_only(&query) {
            return ValidationVerdict::rejected(RejectionReason::NotReadOnly, Parsed);
        }

        // CHECKED: references and row limit
        let mut refs = References::default();
        let _ = query.visit(&mut refs);

        let (tables, columns) = match self.check_references(&refs) {
            Ok(found) => found,
            Err(reason) => return ValidationVerdict::rejected(reason, Checked),
        };

        let (limit, limit_injected, limit_clamped) = match self.enforce_limit(&mut query) {
            Ok(limit) => limit,
            Err(reason) => return ValidationVerdict::rejected(reason, Checked),
        };

        ValidationVerdict::Accepted(AcceptedQuery {
            sql: Statement::Query(query).to_string(),
            tables,
            columns,
            filter_numbers: refs.filter_numbers,
            limit,
            limit_injected,
            limit_clamped,
        })
    }

    fn check_references(
        &self,
        refs: &References,
    ) -> Result<(Vec<String>, Vec<String>), RejectionReason> {
        // qualified names such as pg_catalog.current_setting never match
        if let Some(function) = refs.functions.iter().find(|f| !self.functions.contains(*f)) {
            return Err(RejectionReason::ForbiddenKeyword(function.to_uppercase()));
        }

        let mut tables = BTreeSet::new();
        for relation in &refs.relations {
            if refs.cte_names.contains(relation) {
                continue;
            }
            match self.allowlist.table(relation) {
                Some(table) => {
                    tables.insert(table.name.clone());
                }
                None => return Err(RejectionReason::UnknownTable(relation.clone())),
            }
        }

        let mut columns = BTreeSet::new();
        for column in &refs.columns {
            if self.allowlist.has_column(column) {
                columns.insert(column.clone());
            } else if !refs.aliases.contains(column) && !NILADIC_FUNCTIONS.contains(&column.as_str())
            {
                return Err(RejectionReason::UnknownColumn(column.clone()));
            }
        }

        Ok((tables.into_iter().collect(), columns.into_iter().collect()))
    }

    /// Returns `(limit, injected, clamped)`.
    fn enforce_limit(&self, query: &mut Query) -> Result<(u64, bool, bool), RejectionReason> {
        if query.fetch.is_some() {
            return Err(RejectionReason::NonLiteralLimit);
        }
        match &query.limit {
            None => {
                query.limit = Some(limit_literal(self.row_cap));
                Ok((self.row_cap, true, false))
            }
            Some(Expr::Value(Value::Number(raw, _))) => {
                let requested: u64 = raw.parse().map_err(|_| RejectionReason::NonLiteralLimit)?;
                if requested > self.row_cap {
                    query.limit = Some(limit_literal(self.row_cap));
                    Ok((self.row_cap, false, true))
                } else {
                    Ok((requested, false, false))
                }
            }
            Some(_) => Err(RejectionReason::NonLiteralLimit),
        }
    }
}

fn limit_literal(n: u64) -> Expr {
    Expr::Value(Value::Number(n.to_string(), false))
}

/// One statement, no unquoted forbidden keyword.
fn lexical_check(tokens: &[Token]) -> Result<(), RejectionReason> {
    let mut seen_terminator = false;
    let mut has_content = false;
    for token in tokens {
        match token {
            Token::Whitespace(_) | Token::EOF => {}
            Token::SemiColon => seen_terminator = true,
            _ if seen_terminator => return Err(RejectionReason::MultipleStatements),
            Token::Word(word) => {
                has_content = true;
                if word.quote_style.is_none() {
                    let upper = word.value.to_uppercase();
                    if FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
                        return Err(RejectionReason::ForbiddenKeyword(upper));
                    }
                }
            }
            _ => has_content = true,
        }
    }
    if has_content {
        Ok(())
    } else {
        Err(RejectionReason::Empty)
    }
}

fn is_read_only(query: &Query) -> bool {
    if !query.locks.is_empty() {
        return false;
    }
    if let Some(with) = &query.with {
        if !with.cte_tables.iter().all(|cte| is_read_only(&cte.query)) {
            return false;
        }
    }
    set_expr_is_read_only(&query.body)
}

fn set_expr_is_read_only(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => is_read_only(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_is_read_only(left) && set_expr_is_read_only(right)
        }
        SetExpr::Values(_) => true,
        _ => false,
    }
}

/// Names referenced anywhere in the statement, lowercased.
#[derive(Debug, Default)]
struct References {
    relations: BTreeSet<String>,
    cte_names: BTreeSet<String>,
    columns: BTreeSet<String>,
    /// Projection, CTE and derived-table column aliases.
    aliases: BTreeSet<String>,
    /// Full dotted names.
    functions: BTreeSet<String>,
    filter_numbers: Vec<f64>,
}

fn ident_key(ident: &Ident) -> String {
    ident.value.to_lowercase()
}

fn object_key(name: &ObjectName) -> String {
    name.0.iter().map(ident_key).collect::<Vec<_>>().join(".")
}

/// Numeric literals inside a filter expression.
fn collect_numbers(expr: &Expr, out: &mut Vec<f64>) {
    let _ = visit_expressions(expr, |e| {
        if let Expr::Value(Value::Number(raw, _)) = e {
            if let Ok(n) = raw.parse::<f64>() {
                out.push(n);
            }
        }
        ControlFlow::<()>::Continue(())
    });
}

impl References {
    fn collect_aliases(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for filter in select.selection.iter().chain(select.having.iter()) {
                    collect_numbers(filter, &mut self.filter_numbers);
                }
                for item in &select.projection {
                    if let sqlparser::ast::SelectItem::ExprWithAlias { alias, .. } = item {
                        self.aliases.insert(ident_key(alias));
                    }
                }
                for from in &select.from {
                    self.collect_table_aliases(from);
                }
            }
            SetExpr::Query(query) => self.collect_aliases(&query.body),
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_aliases(left);
                self.collect_aliases(right);
            }
            _ => {}
        }
    }

    fn collect_table_aliases(&mut self, from: &TableWithJoins) {
        let factors = std::iter::once(&from.relation).chain(from.joins.iter().map(|j| &j.relation));
        for factor in factors {
            match factor {
                TableFactor::Table { alias: Some(alias), .. }
                | TableFactor::Derived { alias: Some(alias), .. } => {
                    for column in &alias.columns {
                        self.aliases.insert(ident_key(column));
                    }
                }
                TableFactor::NestedJoin { table_with_joins, .. } => {
                    self.collect_table_aliases(table_with_joins);
                }
                _ => {}
            }
        }
    }
}

impl Visitor for References {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(ident_key(&cte.alias.name));
                for column in &cte.alias.columns {
                    self.aliases.insert(ident_key(column));
                }
            }
        }
        self.collect_aliases(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.relations.insert(object_key(relation));
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        if let TableFactor::Function { name, .. } = factor {
            self.functions.insert(object_key(name));
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => {
                self.columns.insert(ident_key(ident));
            }
            Expr::CompoundIdentifier(parts) => {
                if let Some(last) = parts.last() {
                    self.columns.insert(ident_key(last));
                }
            }
            Expr::Function(function) => {
                self.functions.insert(object_key(&function.name));
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
