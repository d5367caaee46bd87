//! Structured predicates and queries over typed column tokens.
//!
//! Predicates are trees built from [`ColumnRef`] methods and compiled to SQL
//! with `?` placeholders. Values are never interpolated into the SQL text.
//!
//! ```
//! use roost_core::{ColumnRef, Query, Value};
//!
//! struct Post;
//! const ID: ColumnRef<Post> = ColumnRef::new("id");
//! const TITLE: ColumnRef<Post> = ColumnRef::new("title");
//!
//! let predicate = TITLE.like("a%").and(ID.is_in([1, 2]).not());
//! let (sql, args) = predicate.to_sql();
//! assert_eq!(sql, "(\"title\" LIKE ? AND NOT (\"id\" IN (?, ?)))");
//! assert_eq!(args, vec![Value::from("a%"), Value::Integer(1), Value::Integer(2)]);
//!
//! let query = Query::matching(ID.gt(10)).order_by(TITLE.descending()).limit(5);
//! assert_eq!(query.clauses().0, " WHERE \"id\" > ? ORDER BY \"title\" DESC LIMIT 5");
//! ```

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::marker::PhantomData;

use crate::model::ColumnRef;
use crate::row::PrimaryKey;
use crate::value::Value;

/// Quotes an SQL identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn operator(self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Ne => "!=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Compare {
        column: &'static str,
        op: Comparison,
        value: Value,
    },
    Like {
        column: &'static str,
        pattern: String,
    },
    In {
        column: &'static str,
        values: Vec<Value>,
    },
    Null {
        column: &'static str,
        negated: bool,
    },
    Not(Box<Node>),
    And(Vec<Node>),
    Or(Vec<Node>),
}

impl Node {
    fn write_sql(&self, sql: &mut String, args: &mut Vec<Value>) {
        match self {
            Node::Compare { column, op, value } => {
                // `= NULL` never matches; compile to the null tests instead.
                match (op, value) {
                    (Comparison::Eq, Value::Null) => {
                        let _ = write!(sql, "{} IS NULL", quote_identifier(column));
                    }
                    (Comparison::Ne, Value::Null) => {
                        let _ = write!(sql, "{} IS NOT NULL", quote_identifier(column));
                    }
                    _ => {
                        let _ = write!(sql, "{} {} ?", quote_identifier(column), op.operator());
                        args.push(value.clone());
                    }
                }
            }
            Node::Like { column, pattern } => {
                let _ = write!(sql, "{} LIKE ?", quote_identifier(column));
                args.push(Value::Text(pattern.clone()));
            }
            Node::In { values, .. } if values.is_empty() => sql.push('0'),
            Node::In { column, values } => {
                let _ = write!(sql, "{} IN ({})", quote_identifier(column), placeholders(values.len()));
                args.extend(values.iter().cloned());
            }
            Node::Null { column, negated } => {
                let test = if *negated { "IS NOT NULL" } else { "IS NULL" };
                let _ = write!(sql, "{} {test}", quote_identifier(column));
            }
            Node::Not(inner) => {
                sql.push_str("NOT (");
                inner.write_sql(sql, args);
                sql.push(')');
            }
            Node::And(nodes) => write_group(nodes, " AND ", "1", sql, args),
            Node::Or(nodes) => write_group(nodes, " OR ", "0", sql, args),
        }
    }

    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            Node::Compare { column, .. }
            | Node::Like { column, .. }
            | Node::In { column, .. }
            | Node::Null { column, .. } => {
                out.insert((*column).to_string());
            }
            Node::Not(inner) => inner.collect_columns(out),
            Node::And(nodes) | Node::Or(nodes) => {
                for node in nodes {
                    node.collect_columns(out);
                }
            }
        }
    }
}

fn write_group(nodes: &[Node], separator: &str, empty: &str, sql: &mut String, args: &mut Vec<Value>) {
    if nodes.is_empty() {
        sql.push_str(empty);
        return;
    }
    sql.push('(');
    for (i, node) in nodes.iter().enumerate() {
        if i > 0 {
            sql.push_str(separator);
        }
        node.write_sql(sql, args);
    }
    sql.push(')');
}

/// `?, ?, ?` with `count` placeholders.
pub fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// A boolean condition over the columns of model `M`.
pub struct Predicate<M> {
    node: Node,
    _model: PhantomData<fn() -> M>,
}

impl<M> Predicate<M> {
    fn from_node(node: Node) -> Self {
        Self {
            node,
            _model: PhantomData,
        }
    }

    /// Both conditions hold. Nested `AND`s are flattened.
    pub fn and(self, other: Predicate<M>) -> Self {
        Self::from_node(match (self.node, other.node) {
            (Node::And(mut left), Node::And(right)) => {
                left.extend(right);
                Node::And(left)
            }
            (Node::And(mut left), right) => {
                left.push(right);
                Node::And(left)
            }
            (left, right) => Node::And(vec![left, right]),
        })
    }

    /// Either condition holds. Nested `OR`s are flattened.
    pub fn or(self, other: Predicate<M>) -> Self {
        Self::from_node(match (self.node, other.node) {
            (Node::Or(mut left), Node::Or(right)) => {
                left.extend(right);
                Node::Or(left)
            }
            (Node::Or(mut left), right) => {
                left.push(right);
                Node::Or(left)
            }
            (left, right) => Node::Or(vec![left, right]),
        })
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::from_node(Node::Not(Box::new(self.node)))
    }

    /// All of `predicates`; true when empty.
    pub fn all(predicates: impl IntoIterator<Item = Predicate<M>>) -> Self {
        Self::from_node(Node::And(predicates.into_iter().map(|p| p.node).collect()))
    }

    /// Any of `predicates`; false when empty.
    pub fn any(predicates: impl IntoIterator<Item = Predicate<M>>) -> Self {
        Self::from_node(Node::Or(predicates.into_iter().map(|p| p.node).collect()))
    }

    /// Compiles to an SQL expression and its positional arguments.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut args = Vec::new();
        self.node.write_sql(&mut sql, &mut args);
        (sql, args)
    }

    /// Every column the predicate reads.
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.node.collect_columns(&mut out);
        out
    }
}

impl<M> Clone for Predicate<M> {
    fn clone(&self) -> Self {
        Self::from_node(self.node.clone())
    }
}

impl<M> std::fmt::Debug for Predicate<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Predicate").field(&self.to_sql().0).finish()
    }
}

#[allow(clippy::should_implement_trait)]
impl<M> ColumnRef<M> {
    fn compare(self, op: Comparison, value: impl Into<Value>) -> Predicate<M> {
        Predicate::from_node(Node::Compare {
            column: self.name(),
            op,
            value: value.into(),
        })
    }

    pub fn eq(self, value: impl Into<Value>) -> Predicate<M> {
        self.compare(Comparison::Eq, value)
    }

    pub fn ne(self, value: impl Into<Value>) -> Predicate<M> {
        self.compare(Comparison::Ne, value)
    }

    pub fn lt(self, value: impl Into<Value>) -> Predicate<M> {
        self.compare(Comparison::Lt, value)
    }

    pub fn le(self, value: impl Into<Value>) -> Predicate<M> {
        self.compare(Comparison::Le, value)
    }

    pub fn gt(self, value: impl Into<Value>) -> Predicate<M> {
        self.compare(Comparison::Gt, value)
    }

    pub fn ge(self, value: impl Into<Value>) -> Predicate<M> {
        self.compare(Comparison::Ge, value)
    }

    /// SQL `LIKE` with `%` and `_` wildcards.
    pub fn like(self, pattern: impl Into<String>) -> Predicate<M> {
        Predicate::from_node(Node::Like {
            column: self.name(),
            pattern: pattern.into(),
        })
    }

    /// Membership test. An empty list matches nothing.
    pub fn is_in<I, V>(self, values: I) -> Predicate<M>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Predicate::from_node(Node::In {
            column: self.name(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn is_null(self) -> Predicate<M> {
        Predicate::from_node(Node::Null {
            column: self.name(),
            negated: false,
        })
    }

    pub fn is_not_null(self) -> Predicate<M> {
        Predicate::from_node(Node::Null {
            column: self.name(),
            negated: true,
        })
    }

    pub fn ascending(self) -> OrderBy<M> {
        OrderBy {
            column: self.name(),
            descending: false,
            _model: PhantomData,
        }
    }

    pub fn descending(self) -> OrderBy<M> {
        OrderBy {
            column: self.name(),
            descending: true,
            _model: PhantomData,
        }
    }
}

/// One `ORDER BY` term.
pub struct OrderBy<M> {
    column: &'static str,
    descending: bool,
    _model: PhantomData<fn() -> M>,
}

impl<M> OrderBy<M> {
    pub fn column(&self) -> &'static str {
        self.column
    }

    pub fn is_descending(&self) -> bool {
        self.descending
    }
}

impl<M> Clone for OrderBy<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for OrderBy<M> {}

impl<M> std::fmt::Debug for OrderBy<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderBy")
            .field("column", &self.column)
            .field("descending", &self.descending)
            .finish()
    }
}

/// Predicate, ordering and paging for a read.
pub struct Query<M> {
    predicate: Option<Predicate<M>>,
    order: Vec<OrderBy<M>>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl<M> Default for Query<M> {
    fn default() -> Self {
        Self {
            predicate: None,
            order: Vec::new(),
            limit: None,
            offset: None,
        }
    }
}

impl<M> Clone for Query<M> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            order: self.order.clone(),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

impl<M> std::fmt::Debug for Query<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("predicate", &self.predicate)
            .field("order", &self.order)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .finish()
    }
}

impl<M> From<Predicate<M>> for Query<M> {
    fn from(predicate: Predicate<M>) -> Self {
        Query::matching(predicate)
    }
}

impl<M> Query<M> {
    /// Every row of the table.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matching(predicate: Predicate<M>) -> Self {
        Self {
            predicate: Some(predicate),
            ..Self::default()
        }
    }

    pub fn order_by(mut self, order: OrderBy<M>) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn predicate(&self) -> Option<&Predicate<M>> {
        self.predicate.as_ref()
    }

    /// The `WHERE`/`ORDER BY`/`LIMIT` suffix and its arguments. Empty when
    /// the query has no clauses.
    pub fn clauses(&self) -> (String, Vec<Value>) {
        let (mut sql, args) = match &self.predicate {
            Some(predicate) => {
                let (expr, args) = predicate.to_sql();
                (format!(" WHERE {expr}"), args)
            }
            None => (String::new(), Vec::new()),
        };
        if !self.order.is_empty() {
            let terms: Vec<String> = self
                .order
                .iter()
                .map(|o| {
                    let dir = if o.descending { "DESC" } else { "ASC" };
                    format!("{} {dir}", quote_identifier(o.column))
                })
                .collect();
            let _ = write!(sql, " ORDER BY {}", terms.join(", "));
        }
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => {
                let _ = write!(sql, " LIMIT {limit} OFFSET {offset}");
            }
            (Some(limit), None) => {
                let _ = write!(sql, " LIMIT {limit}");
            }
            (None, Some(offset)) => {
                let _ = write!(sql, " LIMIT -1 OFFSET {offset}");
            }
            (None, None) => {}
        }
        (sql, args)
    }

    /// Columns whose changes can alter this query's result: predicate and
    /// ordering columns. `None` when the query has no predicate, meaning
    /// any change matters.
    pub fn dependent_columns(&self) -> Option<BTreeSet<String>> {
        let predicate = self.predicate.as_ref()?;
        let mut columns = predicate.columns();
        columns.extend(self.order.iter().map(|o| o.column.to_string()));
        Some(columns)
    }
}

/// Column assignments for a bulk update.
pub struct Assignments<M> {
    values: Vec<(&'static str, Value)>,
    _model: PhantomData<fn() -> M>,
}

impl<M> Default for Assignments<M> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            _model: PhantomData,
        }
    }
}

impl<M> Assignments<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `column` to `value`. A later assignment to the same column
    /// replaces the earlier one.
    pub fn set(mut self, column: ColumnRef<M>, value: impl Into<Value>) -> Self {
        let value = value.into();
        match self.values.iter_mut().find(|(c, _)| *c == column.name()) {
            Some(slot) => slot.1 = value,
            None => self.values.push((column.name(), value)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> BTreeSet<String> {
        self.values.iter().map(|(c, _)| (*c).to_string()).collect()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.iter().any(|(c, _)| *c == column)
    }

    /// `"a" = ?, "b" = ?` and the assigned values.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let sql = self
            .values
            .iter()
            .map(|(c, _)| format!("{} = ?", quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ");
        (sql, self.values.iter().map(|(_, v)| v.clone()).collect())
    }
}

impl<M> std::fmt::Debug for Assignments<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.values.iter().map(|(c, v)| (c, v))).finish()
    }
}

/// Rows a bulk update applies to.
#[derive(Debug)]
pub enum UpdateTarget<M> {
    Matching(Predicate<M>),
    PrimaryKeys(Vec<PrimaryKey>),
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Post;
    const ID: ColumnRef<Post> = ColumnRef::new("id");
    const TITLE: ColumnRef<Post> = ColumnRef::new("title");
    const BODY: ColumnRef<Post> = ColumnRef::new("body");

    #[test]
    fn test_comparisons_bind_values() {
        let (sql, args) = ID.ge(3).and(TITLE.ne("x")).to_sql();
        assert_eq!(sql, "(\"id\" >= ? AND \"title\" != ?)");
        assert_eq!(args, vec![Value::Integer(3), Value::Text("x".into())]);
    }

    #[test]
    fn test_and_or_flatten() {
        let (sql, _) = ID.eq(1).or(ID.eq(2)).or(ID.eq(3)).to_sql();
        assert_eq!(sql, "(\"id\" = ? OR \"id\" = ? OR \"id\" = ?)");
        let (sql, _) = ID.eq(1).and(TITLE.eq("a").or(BODY.is_null())).to_sql();
        assert_eq!(sql, "(\"id\" = ? AND (\"title\" = ? OR \"body\" IS NULL))");
    }

    #[test]
    fn test_null_comparisons_use_is() {
        let (sql, args) = BODY.eq(Value::Null).to_sql();
        assert_eq!(sql, "\"body\" IS NULL");
        assert!(args.is_empty());
        assert_eq!(BODY.ne(None::<String>).to_sql().0, "\"body\" IS NOT NULL");
    }

    #[test]
    fn test_empty_in_and_groups() {
        assert_eq!(ID.is_in(Vec::<i64>::new()).to_sql().0, "0");
        assert_eq!(Predicate::<Post>::all([]).to_sql().0, "1");
        assert_eq!(Predicate::<Post>::any([]).to_sql().0, "0");
    }

    #[test]
    fn test_identifiers_are_quoted() {
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[test]
    fn test_predicate_columns() {
        let p = ID.eq(1).and(TITLE.like("%a").not());
        let cols: Vec<_> = p.columns().into_iter().collect();
        assert_eq!(cols, ["id", "title"]);
    }

    #[test]
    fn test_query_clauses() {
        let q = Query::matching(TITLE.eq("a"))
            .order_by(ID.ascending())
            .order_by(BODY.descending())
            .offset(4);
        let (sql, args) = q.clauses();
        assert_eq!(sql, " WHERE \"title\" = ? ORDER BY \"id\" ASC, \"body\" DESC LIMIT -1 OFFSET 4");
        assert_eq!(args.len(), 1);
        assert_eq!(Query::<Post>::all().clauses().0, "");
    }

    #[test]
    fn test_dependent_columns() {
        assert!(Query::<Post>::all().order_by(ID.ascending()).dependent_columns().is_none());
        let q = Query::matching(TITLE.eq("a")).order_by(BODY.ascending());
        let cols: Vec<_> = q.dependent_columns().unwrap().into_iter().collect();
        assert_eq!(cols, ["body", "title"]);
    }

    #[test]
    fn test_assignments_replace_duplicates() {
        let a = Assignments::new().set(TITLE, "a").set(BODY, "b").set(TITLE, "c");
        let (sql, args) = a.to_sql();
        assert_eq!(sql, "\"title\" = ?, \"body\" = ?");
        assert_eq!(args, vec![Value::from("c"), Value::from("b")]);
        assert!(a.contains("body"));
    }
}
