//! The SQL dialect understood by the reference store.
//!
//! Supported statements:
//!
//! ```text
//! CREATE [OR REPLACE] MAPPING [IF NOT EXISTS] name [(col TYPE, ...)] TYPE IMAP OPTIONS ('k' = 'v', ...)
//! DROP MAPPING [IF EXISTS] name
//! SHOW MAPPINGS
//! INSERT INTO name [(col, ...)] VALUES (expr, ...), ...
//! SINK INTO name [(col, ...)] VALUES (expr, ...), ...
//! SELECT * | col, ... FROM name [WHERE col op expr [AND ...]] [ORDER BY col [ASC | DESC]] [LIMIT n]
//! DELETE FROM name [WHERE col op expr [AND ...]]
//! ```
//!
//! `?` markers bind positional parameters left to right. A comparison may
//! put the column on either side.

use std::cmp::Ordering;

use sqlparser::ast as sql_ast;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser as SqlParser;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::protocol::{ErrorCode, SqlColumnType};
use crate::serialization::{Data, DataKind};

use super::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
}

impl CmpOp {
  fn from_ast(op: &sql_ast::BinaryOperator) -> Result<Self, StoreError> {
    match op {
      sql_ast::BinaryOperator::Eq => Ok(CmpOp::Eq),
      sql_ast::BinaryOperator::NotEq => Ok(CmpOp::Ne),
      sql_ast::BinaryOperator::Lt => Ok(CmpOp::Lt),
      sql_ast::BinaryOperator::LtEq => Ok(CmpOp::Le),
      sql_ast::BinaryOperator::Gt => Ok(CmpOp::Gt),
      sql_ast::BinaryOperator::GtEq => Ok(CmpOp::Ge),
      other => Err(syntax(format!("unsupported operator {other}"))),
    }
  }

  /// The operator with its operands swapped: `1 < x` is `x > 1`.
  fn reversed(self) -> Self {
    match self {
      CmpOp::Lt => CmpOp::Gt,
      CmpOp::Le => CmpOp::Ge,
      CmpOp::Gt => CmpOp::Lt,
      CmpOp::Ge => CmpOp::Le,
      other => other,
    }
  }

  fn matches(self, ordering: Ordering) -> bool {
    match self {
      CmpOp::Eq => ordering == Ordering::Equal,
      CmpOp::Ne => ordering != Ordering::Equal,
      CmpOp::Lt => ordering == Ordering::Less,
      CmpOp::Le => ordering != Ordering::Greater,
      CmpOp::Gt => ordering == Ordering::Greater,
      CmpOp::Ge => ordering != Ordering::Less,
    }
  }
}

fn syntax(msg: impl Into<String>) -> StoreError {
  StoreError::new(ErrorCode::SqlSyntax, msg)
}

/// A literal or parameter reference.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
  Null,
  Bool(bool),
  Int(i64),
  Double(f64),
  Str(String),
  Param(usize),
}

impl Expr {
  /// Resolves the expression to wire data.
  pub(crate) fn eval(&self, params: &[Data]) -> Result<Data, StoreError> {
    Ok(match self {
      Expr::Null => Data::null(),
      Expr::Bool(b) => Data::from_bool(*b),
      Expr::Int(i) => Data::from_i64(*i),
      Expr::Double(d) => Data::from_f64(*d),
      Expr::Str(s) => Data::from_string(s),
      Expr::Param(n) => params
        .get(*n)
        .cloned()
        .ok_or_else(|| syntax(format!("missing value for parameter #{}", n + 1)))?,
    })
  }
}

/// Column types accepted in mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnType {
  Integer,
  Bigint,
  Varchar,
  Boolean,
  Double,
  Object,
}

impl ColumnType {
  fn parse(name: &str) -> Result<Self, StoreError> {
    match name.to_ascii_uppercase().as_str() {
      "INT" | "INTEGER" => Ok(Self::Integer),
      "BIGINT" => Ok(Self::Bigint),
      "VARCHAR" => Ok(Self::Varchar),
      "BOOLEAN" => Ok(Self::Boolean),
      "DOUBLE" => Ok(Self::Double),
      "OBJECT" => Ok(Self::Object),
      other => Err(syntax(format!("unknown column type {other}"))),
    }
  }

  pub(crate) fn sql_type(self) -> SqlColumnType {
    match self {
      ColumnType::Integer => SqlColumnType::Integer,
      ColumnType::Bigint => SqlColumnType::Bigint,
      ColumnType::Varchar => SqlColumnType::Varchar,
      ColumnType::Boolean => SqlColumnType::Boolean,
      ColumnType::Double => SqlColumnType::Double,
      ColumnType::Object => SqlColumnType::Object,
    }
  }

  /// Converts data to this column type, widening or narrowing integers when
  /// the value fits.
  pub(crate) fn coerce(self, data: Data, column: &str) -> Result<Data, StoreError> {
    if data.is_null() {
      return Ok(data);
    }
    let mismatch = || {
      StoreError::new(
        ErrorCode::SqlTypeMismatch,
        format!("cannot convert {} to {:?} for column {column}", data.kind(), self),
      )
    };
    match (self, data.kind()) {
      (ColumnType::Object, _) => Ok(data),
      (ColumnType::Integer, DataKind::Int32) => Ok(data),
      (ColumnType::Integer, DataKind::Int64) => {
        let v = data.as_i64().map_err(|_| mismatch())?;
        i32::try_from(v).map(Data::from_i32).map_err(|_| mismatch())
      }
      (ColumnType::Bigint, DataKind::Int32 | DataKind::Int64) => {
        data.as_i64().map(Data::from_i64).map_err(|_| mismatch())
      }
      (ColumnType::Double, DataKind::Int32 | DataKind::Int64 | DataKind::Float64) => {
        data.as_f64().map(Data::from_f64).map_err(|_| mismatch())
      }
      (ColumnType::Varchar, DataKind::String) => Ok(data),
      (ColumnType::Boolean, DataKind::Boolean) => Ok(data),
      _ => Err(mismatch()),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Predicate {
  pub column: String,
  pub op: CmpOp,
  pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CreateMapping {
  pub name: String,
  pub replace: bool,
  pub if_not_exists: bool,
  pub columns: Vec<(String, ColumnType)>,
  pub options: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Statement {
  CreateMapping(CreateMapping),
  DropMapping {
    name: String,
    if_exists: bool,
  },
  ShowMappings,
  Insert {
    table: String,
    columns: Option<Vec<String>>,
    rows: Vec<Vec<Expr>>,
    overwrite: bool,
  },
  Select {
    projection: Option<Vec<String>>,
    table: String,
    filter: Vec<Predicate>,
    order_by: Option<(String, bool)>,
    limit: Option<Expr>,
  },
  Delete {
    table: String,
    filter: Vec<Predicate>,
  },
}

impl Statement {
  pub(crate) fn produces_rows(&self) -> bool {
    matches!(self, Statement::Select { .. } | Statement::ShowMappings)
  }
}

/// Parses one statement and returns it with its parameter count.
///
/// Mapping DDL is read directly from the token stream. Everything else goes
/// through the sqlparser AST. `SINK INTO` parses as an overwriting insert.
pub(crate) fn parse(sql: &str) -> Result<(Statement, usize), StoreError> {
  let dialect = GenericDialect {};
  let mut tokens: Vec<Token> = Tokenizer::new(&dialect, sql)
    .tokenize()
    .map_err(|e| syntax(e.to_string()))?
    .into_iter()
    .filter(|token| !matches!(token, Token::Whitespace(_)))
    .collect();
  let Some(first) = tokens.first() else {
    return Err(syntax("empty statement"));
  };
  let overwrite = is_word(first, "SINK");
  if names_mapping(&tokens) {
    let statement = MappingParser { tokens, pos: 0 }.parse()?;
    return Ok((statement, 0));
  }
  if overwrite {
    tokens[0] = Token::make_keyword("INSERT");
  }
  let mut statements = SqlParser::new(&dialect)
    .with_tokens(tokens)
    .parse_statements()
    .map_err(|e| syntax(e.to_string()))?;
  if statements.len() != 1 {
    return Err(syntax(format!("expected one statement, found {}", statements.len())));
  }

  let mut binder = Binder::default();
  let statement = binder.statement(statements.remove(0), overwrite)?;
  Ok((statement, binder.params))
}

fn is_word(token: &Token, keyword: &str) -> bool {
  matches!(token, Token::Word(w) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(keyword))
}

fn names_mapping(tokens: &[Token]) -> bool {
  match tokens.first() {
    Some(t) if is_word(t, "SHOW") => true,
    Some(t) if is_word(t, "CREATE") || is_word(t, "DROP") => {
      tokens.iter().take(4).any(|t| is_word(t, "MAPPING"))
    }
    _ => false,
  }
}

/// Reads `CREATE MAPPING`, `DROP MAPPING` and `SHOW MAPPINGS`, which have no
/// sqlparser statement.
struct MappingParser {
  tokens: Vec<Token>,
  pos: usize,
}

impl MappingParser {
  fn parse(mut self) -> Result<Statement, StoreError> {
    let statement = if self.keyword("SHOW") {
      self.expect_keyword("MAPPINGS")?;
      Statement::ShowMappings
    } else if self.keyword("DROP") {
      self.expect_keyword("MAPPING")?;
      let if_exists = self.keyword("IF");
      if if_exists {
        self.expect_keyword("EXISTS")?;
      }
      Statement::DropMapping {
        name: self.ident()?,
        if_exists,
      }
    } else {
      self.expect_keyword("CREATE")?;
      Statement::CreateMapping(self.create_mapping()?)
    };
    self.finish()?;
    Ok(statement)
  }

  fn create_mapping(&mut self) -> Result<CreateMapping, StoreError> {
    let replace = self.keyword("OR");
    if replace {
      self.expect_keyword("REPLACE")?;
    }
    self.expect_keyword("MAPPING")?;
    let if_not_exists = self.keyword("IF");
    if if_not_exists {
      self.expect_keyword("NOT")?;
      self.expect_keyword("EXISTS")?;
    }
    let name = self.ident()?;

    let mut columns = Vec::new();
    if self.eat(&Token::LParen) {
      loop {
        let column = self.ident()?;
        let column_type = ColumnType::parse(&self.ident()?)?;
        columns.push((column, column_type));
        if !self.eat(&Token::Comma) {
          break;
        }
      }
      self.expect(&Token::RParen)?;
    }

    self.expect_keyword("TYPE")?;
    let kind = self.ident()?;
    if !kind.eq_ignore_ascii_case("IMAP") {
      return Err(syntax(format!("unsupported mapping type {kind}")));
    }

    let mut options = Vec::new();
    if self.keyword("OPTIONS") {
      self.expect(&Token::LParen)?;
      if !self.eat(&Token::RParen) {
        loop {
          let key = self.string()?;
          self.expect(&Token::Eq)?;
          options.push((key, self.string()?));
          if !self.eat(&Token::Comma) {
            break;
          }
        }
        self.expect(&Token::RParen)?;
      }
    }

    Ok(CreateMapping {
      name,
      replace,
      if_not_exists,
      columns,
      options,
    })
  }

  fn next(&mut self) -> Option<&Token> {
    let token = self.tokens.get(self.pos);
    if token.is_some() {
      self.pos += 1;
    }
    token
  }

  fn found(&self) -> String {
    match self.tokens.get(self.pos) {
      Some(token) => format!("found {token}"),
      None => "found end of statement".to_string(),
    }
  }

  fn eat(&mut self, expected: &Token) -> bool {
    if self.tokens.get(self.pos) == Some(expected) {
      self.pos += 1;
      return true;
    }
    false
  }

  fn expect(&mut self, expected: &Token) -> Result<(), StoreError> {
    if self.eat(expected) {
      return Ok(());
    }
    Err(syntax(format!("expected {expected}, {}", self.found())))
  }

  fn keyword(&mut self, keyword: &str) -> bool {
    if self.tokens.get(self.pos).is_some_and(|t| is_word(t, keyword)) {
      self.pos += 1;
      return true;
    }
    false
  }

  fn expect_keyword(&mut self, keyword: &str) -> Result<(), StoreError> {
    if self.keyword(keyword) {
      return Ok(());
    }
    Err(syntax(format!("expected {keyword}, {}", self.found())))
  }

  fn ident(&mut self) -> Result<String, StoreError> {
    let found = self.found();
    match self.next() {
      Some(Token::Word(w)) => Ok(w.value.clone()),
      _ => Err(syntax(format!("expected identifier, {found}"))),
    }
  }

  fn string(&mut self) -> Result<String, StoreError> {
    let found = self.found();
    match self.next() {
      Some(Token::SingleQuotedString(s)) => Ok(s.clone()),
      _ => Err(syntax(format!("expected string literal, {found}"))),
    }
  }

  fn finish(&mut self) -> Result<(), StoreError> {
    self.eat(&Token::SemiColon);
    match self.tokens.get(self.pos) {
      None => Ok(()),
      Some(token) => Err(syntax(format!("unexpected {token} after statement"))),
    }
  }
}

/// Converts the sqlparser AST, numbering `?` markers left to right.
#[derive(Default)]
struct Binder {
  params: usize,
}

impl Binder {
  fn statement(
    &mut self,
    statement: sql_ast::Statement,
    overwrite: bool,
  ) -> Result<Statement, StoreError> {
    match statement {
      sql_ast::Statement::Query(query) if !overwrite => self.query(*query),
      sql_ast::Statement::Insert {
        table_name,
        columns,
        source,
        ..
      } => self.insert(table_name, columns, source, overwrite),
      sql_ast::Statement::Delete {
        from, selection, ..
      } if !overwrite => Ok(Statement::Delete {
        table: single_table(from)?,
        filter: self.filter(selection)?,
      }),
      other => Err(syntax(format!("unsupported statement: {other}"))),
    }
  }

  fn query(&mut self, query: sql_ast::Query) -> Result<Statement, StoreError> {
    if query.with.is_some() || query.offset.is_some() || query.fetch.is_some() {
      return Err(syntax("WITH, OFFSET and FETCH are not supported"));
    }
    let select = match *query.body {
      sql_ast::SetExpr::Select(select) => *select,
      other => return Err(syntax(format!("unsupported query: {other}"))),
    };
    let grouped = match &select.group_by {
      sql_ast::GroupByExpr::Expressions(exprs) => !exprs.is_empty(),
      sql_ast::GroupByExpr::All => true,
    };
    if select.distinct.is_some() || grouped || select.having.is_some() {
      return Err(syntax("DISTINCT, GROUP BY and HAVING are not supported"));
    }

    let projection = projection(select.projection)?;
    let table = single_table(select.from)?;
    let filter = self.filter(select.selection)?;

    if query.order_by.len() > 1 {
      return Err(syntax("ORDER BY takes a single column"));
    }
    let order_by = match query.order_by.into_iter().next() {
      Some(order) => Some((column_name(order.expr)?, order.asc == Some(false))),
      None => None,
    };
    let limit = query.limit.map(|limit| self.value(limit)).transpose()?;

    Ok(Statement::Select {
      projection,
      table,
      filter,
      order_by,
      limit,
    })
  }

  fn insert(
    &mut self,
    table_name: sql_ast::ObjectName,
    columns: Vec<sql_ast::Ident>,
    source: Option<Box<sql_ast::Query>>,
    overwrite: bool,
  ) -> Result<Statement, StoreError> {
    let table = object_name(table_name)?;
    let columns = if columns.is_empty() {
      None
    } else {
      Some(columns.into_iter().map(|ident| ident.value).collect())
    };
    let values = match source.map(|query| *query.body) {
      Some(sql_ast::SetExpr::Values(values)) => values,
      _ => return Err(syntax("INSERT takes a VALUES list")),
    };

    let mut rows = Vec::with_capacity(values.rows.len());
    for row in values.rows {
      let mut exprs = Vec::with_capacity(row.len());
      for expr in row {
        exprs.push(self.value(expr)?);
      }
      rows.push(exprs);
    }

    Ok(Statement::Insert {
      table,
      columns,
      rows,
      overwrite,
    })
  }

  /// Flattens a conjunction of comparisons into predicates.
  fn filter(&mut self, selection: Option<sql_ast::Expr>) -> Result<Vec<Predicate>, StoreError> {
    let mut predicates = Vec::new();
    if let Some(expr) = selection {
      self.conjunction(expr, &mut predicates)?;
    }
    Ok(predicates)
  }

  fn conjunction(
    &mut self,
    expr: sql_ast::Expr,
    predicates: &mut Vec<Predicate>,
  ) -> Result<(), StoreError> {
    match expr {
      sql_ast::Expr::Nested(inner) => self.conjunction(*inner, predicates),
      sql_ast::Expr::BinaryOp {
        left,
        op: sql_ast::BinaryOperator::And,
        right,
      } => {
        self.conjunction(*left, predicates)?;
        self.conjunction(*right, predicates)
      }
      sql_ast::Expr::BinaryOp { left, op, right } => {
        let op = CmpOp::from_ast(&op)?;
        let predicate = if is_column(&left) {
          Predicate {
            column: column_name(*left)?,
            op,
            value: self.value(*right)?,
          }
        } else {
          let value = self.value(*left)?;
          Predicate {
            column: column_name(*right)?,
            op: op.reversed(),
            value,
          }
        };
        predicates.push(predicate);
        Ok(())
      }
      other => Err(syntax(format!("unsupported condition {other}"))),
    }
  }

  fn value(&mut self, expr: sql_ast::Expr) -> Result<Expr, StoreError> {
    match expr {
      sql_ast::Expr::Nested(inner) => self.value(*inner),
      sql_ast::Expr::UnaryOp {
        op: sql_ast::UnaryOperator::Minus,
        expr,
      } => match *expr {
        sql_ast::Expr::Value(sql_ast::Value::Number(n, _)) => number(&format!("-{n}")),
        other => Err(syntax(format!("cannot negate {other}"))),
      },
      sql_ast::Expr::Value(value) => match value {
        sql_ast::Value::Null => Ok(Expr::Null),
        sql_ast::Value::Boolean(b) => Ok(Expr::Bool(b)),
        sql_ast::Value::Number(n, _) => number(&n),
        sql_ast::Value::SingleQuotedString(s) => Ok(Expr::Str(s)),
        sql_ast::Value::Placeholder(p) if p == "?" => {
          self.params += 1;
          Ok(Expr::Param(self.params - 1))
        }
        other => Err(syntax(format!("unsupported literal {other}"))),
      },
      other => Err(syntax(format!("expected a literal or ?, found {other}"))),
    }
  }
}

fn number(text: &str) -> Result<Expr, StoreError> {
  if let Ok(i) = text.parse::<i64>() {
    return Ok(Expr::Int(i));
  }
  text
    .parse::<f64>()
    .map(Expr::Double)
    .map_err(|_| syntax(format!("invalid number {text}")))
}

fn is_column(expr: &sql_ast::Expr) -> bool {
  matches!(
    expr,
    sql_ast::Expr::Identifier(_) | sql_ast::Expr::CompoundIdentifier(_)
  )
}

/// The column an expression names; a qualified name uses its last part.
fn column_name(expr: sql_ast::Expr) -> Result<String, StoreError> {
  match expr {
    sql_ast::Expr::Identifier(ident) => Ok(ident.value),
    sql_ast::Expr::CompoundIdentifier(mut parts) => parts
      .pop()
      .map(|ident| ident.value)
      .ok_or_else(|| syntax("empty column name")),
    other => Err(syntax(format!("expected a column, found {other}"))),
  }
}

fn projection(items: Vec<sql_ast::SelectItem>) -> Result<Option<Vec<String>>, StoreError> {
  if let [sql_ast::SelectItem::Wildcard(_)] = items.as_slice() {
    return Ok(None);
  }
  let mut columns = Vec::with_capacity(items.len());
  for item in items {
    match item {
      sql_ast::SelectItem::UnnamedExpr(expr) => columns.push(column_name(expr)?),
      other => return Err(syntax(format!("unsupported select item {other}"))),
    }
  }
  Ok(Some(columns))
}

fn single_table(from: Vec<sql_ast::TableWithJoins>) -> Result<String, StoreError> {
  let mut from = from.into_iter();
  let (Some(table), None) = (from.next(), from.next()) else {
    return Err(syntax("expected exactly one table"));
  };
  if !table.joins.is_empty() {
    return Err(syntax("joins are not supported"));
  }
  match table.relation {
    sql_ast::TableFactor::Table { name, .. } => object_name(name),
    other => Err(syntax(format!("unsupported table {other}"))),
  }
}

fn object_name(name: sql_ast::ObjectName) -> Result<String, StoreError> {
  let mut parts = name.0;
  match (parts.pop(), parts.is_empty()) {
    (Some(ident), true) => Ok(ident.value),
    _ => Err(syntax("qualified names are not supported")),
  }
}

/// A comparable view of a value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Scalar {
  Null,
  Bool(bool),
  Int(i64),
  Double(f64),
  Str(String),
  Opaque(Data),
}

impl Scalar {
  pub(crate) fn from_data(data: &Data) -> Self {
    match data.kind() {
      DataKind::Null => Scalar::Null,
      DataKind::Boolean => data.as_bool().map(Scalar::Bool).unwrap_or(Scalar::Null),
      DataKind::Int32 | DataKind::Int64 => data.as_i64().map(Scalar::Int).unwrap_or(Scalar::Null),
      DataKind::Float64 => data.as_f64().map(Scalar::Double).unwrap_or(Scalar::Null),
      DataKind::String => data
        .as_str()
        .map(|s| Scalar::Str(s.to_string()))
        .unwrap_or(Scalar::Null),
      DataKind::Json | DataKind::Compact => Scalar::Opaque(data.clone()),
    }
  }

  /// SQL comparison; `None` when either side is null or the kinds differ.
  pub(crate) fn compare(&self, other: &Scalar) -> Option<Ordering> {
    match (self, other) {
      (Scalar::Null, _) | (_, Scalar::Null) => None,
      (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
      (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
      (Scalar::Int(a), Scalar::Double(b)) => (*a as f64).partial_cmp(b),
      (Scalar::Double(a), Scalar::Int(b)) => a.partial_cmp(&(*b as f64)),
      (Scalar::Double(a), Scalar::Double(b)) => a.partial_cmp(b),
      (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
      (Scalar::Opaque(a), Scalar::Opaque(b)) => Some(a.cmp(b)),
      _ => None,
    }
  }

  /// Total order for sorting: nulls first, then by value.
  pub(crate) fn sort_cmp(&self, other: &Scalar) -> Ordering {
    match (self, other) {
      (Scalar::Null, Scalar::Null) => Ordering::Equal,
      (Scalar::Null, _) => Ordering::Less,
      (_, Scalar::Null) => Ordering::Greater,
      _ => self.compare(other).unwrap_or(Ordering::Equal),
    }
  }
}

impl Predicate {
  pub(crate) fn matches(&self, column_value: &Data, params: &[Data]) -> Result<bool, StoreError> {
    let expected = Scalar::from_data(&self.value.eval(params)?);
    Ok(
      Scalar::from_data(column_value)
        .compare(&expected)
        .map(|ordering| self.op.matches(ordering))
        .unwrap_or(false),
    )
  }
}
