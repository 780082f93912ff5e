//! SQL parser
//!
//! A recursive-descent parser producing the AST the compiler walks.
//! Expression precedence follows the engine's dialect: OR < AND < NOT <
//! comparison < bitwise < additive < multiplicative < concatenation <
//! unary.

use crate::error::{Error, ErrorCode, Result};
use crate::parser::ast::*;
use crate::parser::tokenizer::{tokenize, Token, TokenKind};
use crate::schema::{ConflictAction, TriggerEvent, TriggerTime};
use crate::types::DataType;

// ============================================================================
// Parser
// ============================================================================

pub struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Result<Self> {
        Ok(Self {
            source,
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self, ahead: usize) -> TokenKind {
        self.tokens
            .get(self.pos + ahead)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(&format!(
                "near \"{}\": syntax error",
                if self.current().text.is_empty() {
                    "end of input"
                } else {
                    &self.current().text
                }
            )))
        }
    }

    fn error(&self, msg: &str) -> Error {
        Error::with_message(ErrorCode::Error, msg.to_string())
    }

    pub fn is_eof(&self) -> bool {
        self.check(TokenKind::Eof)
    }

    /// Byte offset just past the most recently consumed token.
    fn tail_offset(&self) -> usize {
        self.current().pos
    }

    /// Source text from `start` to the current token, trimmed.
    fn span_from(&self, start: usize) -> String {
        self.source[start..self.tail_offset().min(self.source.len())]
            .trim()
            .trim_end_matches(';')
            .trim()
            .to_string()
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Parse one statement; returns it plus the byte offset where the
    /// unconsumed tail begins. `explain` is reported separately.
    pub fn parse_statement(&mut self) -> Result<(Option<Stmt>, bool, usize)> {
        while self.match_token(TokenKind::Semi) {}
        if self.is_eof() {
            return Ok((None, false, self.source.len()));
        }
        let explain = self.match_token(TokenKind::Explain);
        let stmt = self.parse_stmt_body()?;
        self.match_token(TokenKind::Semi);
        Ok((Some(stmt), explain, self.tail_offset()))
    }

    fn parse_stmt_body(&mut self) -> Result<Stmt> {
        let start = self.current().pos;
        match self.current().kind {
            TokenKind::Select => Ok(Stmt::Select(self.parse_select()?)),
            TokenKind::Insert | TokenKind::Replace => self.parse_insert(),
            TokenKind::Delete => self.parse_delete(),
            TokenKind::Update => self.parse_update(),
            TokenKind::Create => self.parse_create(start),
            TokenKind::Drop => self.parse_drop(),
            TokenKind::Begin => {
                self.advance();
                self.match_token(TokenKind::Transaction);
                let mut on_error = ConflictAction::Abort;
                if self.check(TokenKind::On) {
                    on_error = self.parse_conflict_clause()?;
                }
                Ok(Stmt::Begin(on_error))
            }
            TokenKind::Commit | TokenKind::End => {
                self.advance();
                self.match_token(TokenKind::Transaction);
                Ok(Stmt::CommitTxn)
            }
            TokenKind::Rollback => {
                self.advance();
                self.match_token(TokenKind::Transaction);
                Ok(Stmt::RollbackTxn)
            }
            TokenKind::Copy => self.parse_copy(),
            TokenKind::Pragma => self.parse_pragma(),
            TokenKind::Attach => {
                self.advance();
                self.match_token(TokenKind::Database);
                let filename = self.parse_expr()?;
                self.expect(TokenKind::As)?;
                let db_name = self.expect_name()?;
                Ok(Stmt::Attach { filename, db_name })
            }
            TokenKind::Detach => {
                self.advance();
                self.match_token(TokenKind::Database);
                Ok(Stmt::Detach(self.expect_name()?))
            }
            _ => Err(self.error(&format!(
                "near \"{}\": syntax error",
                self.current().text
            ))),
        }
    }

    fn expect_name(&mut self) -> Result<String> {
        match self.current().kind {
            TokenKind::Id | TokenKind::DqString | TokenKind::String => Ok(self.advance().text),
            // Several keywords double as object names in practice.
            TokenKind::Key | TokenKind::Row | TokenKind::Offset | TokenKind::Temp => {
                Ok(self.advance().text)
            }
            _ => Err(self.error(&format!(
                "near \"{}\": syntax error",
                self.current().text
            ))),
        }
    }

    fn parse_qual_name(&mut self) -> Result<QualName> {
        let first = self.expect_name()?;
        if self.match_token(TokenKind::Dot) {
            let second = self.expect_name()?;
            Ok(QualName {
                database: Some(first),
                name: second,
            })
        } else {
            Ok(QualName::bare(&first))
        }
    }

    // ------------------------------------------------------------------
    // SELECT
    // ------------------------------------------------------------------

    pub fn parse_select(&mut self) -> Result<Select> {
        let mut sel = self.parse_one_select()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Union => {
                    self.advance();
                    if self.match_token(TokenKind::All) {
                        CompoundOp::UnionAll
                    } else {
                        CompoundOp::Union
                    }
                }
                TokenKind::Intersect => {
                    self.advance();
                    CompoundOp::Intersect
                }
                TokenKind::Except => {
                    self.advance();
                    CompoundOp::Except
                }
                _ => break,
            };
            let mut rhs = self.parse_one_select()?;
            rhs.op = op;
            rhs.prior = Some(Box::new(sel));
            sel = rhs;
        }
        if self.match_token(TokenKind::Order) {
            self.expect(TokenKind::By)?;
            sel.order_by = Some(self.parse_order_terms()?);
        }
        if self.match_token(TokenKind::Limit) {
            sel.limit = self.parse_signed_integer()?;
            if self.match_token(TokenKind::Offset) {
                sel.offset = self.parse_signed_integer()?;
            } else if self.match_token(TokenKind::Comma) {
                // LIMIT n,m means OFFSET n LIMIT m.
                sel.offset = sel.limit;
                sel.limit = self.parse_signed_integer()?;
            }
        }
        Ok(sel)
    }

    fn parse_signed_integer(&mut self) -> Result<i64> {
        let neg = self.match_token(TokenKind::Minus);
        if !neg {
            self.match_token(TokenKind::Plus);
        }
        let t = self.expect(TokenKind::Integer)?;
        let v = crate::util::strings::str_to_int(&t.text);
        Ok(if neg { -v } else { v })
    }

    fn parse_one_select(&mut self) -> Result<Select> {
        self.expect(TokenKind::Select)?;
        let distinct = if self.match_token(TokenKind::Distinct) {
            true
        } else {
            self.match_token(TokenKind::All);
            false
        };
        let result = self.parse_result_columns()?;
        let src = if self.match_token(TokenKind::From) {
            self.parse_src_list()?
        } else {
            SrcList::default()
        };
        let mut sel = Select::new(result, src);
        sel.distinct = distinct;
        if self.match_token(TokenKind::Where) {
            sel.where_expr = Some(Box::new(self.parse_expr()?));
        }
        if self.match_token(TokenKind::Group) {
            self.expect(TokenKind::By)?;
            let mut list = ExprList::new();
            loop {
                list.append(self.parse_expr()?, None);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
            sel.group_by = Some(list);
        }
        if self.match_token(TokenKind::Having) {
            sel.having = Some(Box::new(self.parse_expr()?));
        }
        Ok(sel)
    }

    fn parse_result_columns(&mut self) -> Result<ExprList> {
        let mut list = ExprList::new();
        if self.check(TokenKind::Star) {
            self.advance();
            return Ok(list);
        }
        loop {
            let start = self.current().pos;
            // T.* keeps the dotted-star shape for later expansion.
            let expr = if self.check(TokenKind::Id)
                && self.peek_kind(1) == TokenKind::Dot
                && self.peek_kind(2) == TokenKind::Star
            {
                let t = self.advance();
                self.advance();
                self.advance();
                Expr::new(
                    ExprOp::Dot,
                    Some(Expr::leaf(ExprOp::Id, &t.text)),
                    Some(Expr::leaf(ExprOp::Id, "*")),
                    ".",
                )
            } else {
                self.parse_expr()?
            };
            let mut expr = expr;
            expr.set_span(&self.span_from(start));
            let name = if self.match_token(TokenKind::As) {
                Some(self.expect_name()?)
            } else if matches!(self.current().kind, TokenKind::Id | TokenKind::DqString) {
                Some(self.advance().text)
            } else {
                None
            };
            list.append(expr, name);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        Ok(list)
    }

    fn parse_order_terms(&mut self) -> Result<ExprList> {
        let mut list = ExprList::new();
        loop {
            let expr = self.parse_expr()?;
            let mut item = ExprItem::new(expr);
            if self.match_token(TokenKind::Desc) {
                item.desc = true;
            } else {
                self.match_token(TokenKind::Asc);
            }
            list.items.push(item);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        Ok(list)
    }

    fn parse_src_list(&mut self) -> Result<SrcList> {
        let mut src = SrcList::default();
        src.items.push(self.parse_src_item()?);
        // Connectors: commas or JOIN clauses, each introducing one more
        // term whose jointype describes how it attaches to the left.
        loop {
            if self.match_token(TokenKind::Comma) {
                src.items.push(self.parse_src_item()?);
                continue;
            }
            let mut jt = JoinType::empty();
            if self.match_token(TokenKind::Natural) {
                jt |= JoinType::NATURAL;
            }
            match self.current().kind {
                TokenKind::Left => {
                    self.advance();
                    self.match_token(TokenKind::Outer);
                    jt |= JoinType::LEFT | JoinType::OUTER;
                }
                TokenKind::Right | TokenKind::Full => {
                    return Err(self.error("RIGHT and FULL OUTER JOINs are not currently supported"));
                }
                TokenKind::Inner => {
                    self.advance();
                    jt |= JoinType::INNER;
                }
                TokenKind::Cross => {
                    self.advance();
                    jt |= JoinType::CROSS;
                }
                _ => {}
            }
            if !self.match_token(TokenKind::Join) {
                if jt.is_empty() {
                    break;
                }
                return Err(self.error("expected JOIN"));
            }
            let mut item = self.parse_src_item()?;
            item.jointype = jt | JoinType::INNER;
            if self.match_token(TokenKind::On) {
                item.on_expr = Some(Box::new(self.parse_expr()?));
            } else if self.match_token(TokenKind::Using) {
                self.expect(TokenKind::LParen)?;
                item.using = Some(self.parse_id_list()?);
                self.expect(TokenKind::RParen)?;
            }
            src.items.push(item);
        }
        Ok(src)
    }

    fn parse_src_item(&mut self) -> Result<SrcItem> {
        if self.match_token(TokenKind::LParen) {
            let select = self.parse_select()?;
            self.expect(TokenKind::RParen)?;
            let alias = if self.match_token(TokenKind::As) {
                Some(self.expect_name()?)
            } else if self.check(TokenKind::Id) {
                Some(self.advance().text)
            } else {
                None
            };
            let mut item = SrcItem::named(None, "");
            item.select = Some(Box::new(select));
            item.alias = alias;
            return Ok(item);
        }
        let qn = self.parse_qual_name()?;
        let mut item = SrcItem::named(qn.database, &qn.name);
        if self.match_token(TokenKind::As) {
            item.alias = Some(self.expect_name()?);
        } else if self.check(TokenKind::Id) {
            item.alias = Some(self.advance().text);
        }
        Ok(item)
    }

    fn parse_id_list(&mut self) -> Result<IdList> {
        let mut ids = IdList::default();
        loop {
            ids.names.push(self.expect_name()?);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // DML
    // ------------------------------------------------------------------

    fn parse_insert(&mut self) -> Result<Stmt> {
        let on_error = if self.check(TokenKind::Replace) {
            self.advance();
            ConflictAction::Replace
        } else {
            self.expect(TokenKind::Insert)?;
            if self.match_token(TokenKind::Or) {
                self.parse_conflict_action()?
            } else {
                ConflictAction::Abort
            }
        };
        self.expect(TokenKind::Into)?;
        let table = self.parse_qual_name()?;
        let columns = if self.match_token(TokenKind::LParen) {
            let ids = self.parse_id_list()?;
            self.expect(TokenKind::RParen)?;
            Some(ids)
        } else {
            None
        };
        let source = if self.match_token(TokenKind::Values) {
            self.expect(TokenKind::LParen)?;
            let mut values = ExprList::new();
            loop {
                values.append(self.parse_expr()?, None);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
            InsertSource::Values(values)
        } else {
            InsertSource::Select(Box::new(self.parse_select()?))
        };
        Ok(Stmt::Insert {
            on_error,
            table,
            columns,
            source,
        })
    }

    fn parse_delete(&mut self) -> Result<Stmt> {
        self.expect(TokenKind::Delete)?;
        self.expect(TokenKind::From)?;
        let table = self.parse_qual_name()?;
        let where_expr = if self.match_token(TokenKind::Where) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        Ok(Stmt::Delete { table, where_expr })
    }

    fn parse_update(&mut self) -> Result<Stmt> {
        self.expect(TokenKind::Update)?;
        let on_error = if self.match_token(TokenKind::Or) {
            self.parse_conflict_action()?
        } else {
            ConflictAction::Abort
        };
        let table = self.parse_qual_name()?;
        self.expect(TokenKind::Set)?;
        let mut sets = Vec::new();
        loop {
            let col = self.expect_name()?;
            self.expect(TokenKind::Eq)?;
            sets.push((col, self.parse_expr()?));
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        let where_expr = if self.match_token(TokenKind::Where) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        Ok(Stmt::Update {
            on_error,
            table,
            sets,
            where_expr,
        })
    }

    fn parse_copy(&mut self) -> Result<Stmt> {
        self.expect(TokenKind::Copy)?;
        let on_error = if self.match_token(TokenKind::Or) {
            self.parse_conflict_action()?
        } else {
            ConflictAction::Abort
        };
        let table = self.parse_qual_name()?;
        self.expect(TokenKind::From)?;
        let file = match self.current().kind {
            TokenKind::String | TokenKind::DqString | TokenKind::Id => self.advance().text,
            _ => return Err(self.error("expected file name")),
        };
        let delimiter = if self.match_token(TokenKind::Using) {
            self.expect(TokenKind::Delimiters)?;
            Some(self.expect(TokenKind::String)?.text)
        } else {
            None
        };
        Ok(Stmt::Copy {
            on_error,
            table,
            file,
            delimiter,
        })
    }

    fn parse_pragma(&mut self) -> Result<Stmt> {
        self.expect(TokenKind::Pragma)?;
        let name = self.expect_name()?;
        let value = if self.match_token(TokenKind::Eq) {
            Some(self.parse_expr()?)
        } else if self.match_token(TokenKind::LParen) {
            let v = self.parse_expr()?;
            self.expect(TokenKind::RParen)?;
            Some(v)
        } else {
            None
        };
        Ok(Stmt::Pragma { name, value })
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    fn parse_conflict_action(&mut self) -> Result<ConflictAction> {
        let action = match self.current().kind {
            TokenKind::Rollback => ConflictAction::Rollback,
            TokenKind::Abort => ConflictAction::Abort,
            TokenKind::Fail => ConflictAction::Fail,
            TokenKind::Ignore => ConflictAction::Ignore,
            TokenKind::Replace => ConflictAction::Replace,
            _ => return Err(self.error("expected conflict resolution")),
        };
        self.advance();
        Ok(action)
    }

    /// `ON CONFLICT <action>`; absent clause means Abort.
    fn parse_conflict_clause(&mut self) -> Result<ConflictAction> {
        if self.match_token(TokenKind::On) {
            self.expect(TokenKind::Conflict)?;
            self.parse_conflict_action()
        } else {
            Ok(ConflictAction::Abort)
        }
    }

    fn parse_create(&mut self, start: usize) -> Result<Stmt> {
        self.expect(TokenKind::Create)?;
        match self.current().kind {
            TokenKind::Temp => {
                self.advance();
                match self.current().kind {
                    TokenKind::Table => self.parse_create_table(true, start),
                    TokenKind::View => self.parse_create_view(true, start),
                    _ => Err(self.error("expected TABLE or VIEW after TEMPORARY")),
                }
            }
            TokenKind::Table => self.parse_create_table(false, start),
            TokenKind::View => self.parse_create_view(false, start),
            TokenKind::Unique | TokenKind::Index => {
                let unique = if self.match_token(TokenKind::Unique) {
                    Some(ConflictAction::Abort)
                } else {
                    None
                };
                self.parse_create_index(unique, start)
            }
            TokenKind::Trigger => self.parse_create_trigger(start),
            _ => Err(self.error("expected TABLE, VIEW, INDEX, or TRIGGER")),
        }
    }

    fn parse_create_table(&mut self, temp: bool, start: usize) -> Result<Stmt> {
        self.expect(TokenKind::Table)?;
        let name = self.parse_qual_name()?;
        if self.match_token(TokenKind::As) {
            let select = self.parse_select()?;
            return Ok(Stmt::CreateTable {
                temp,
                name,
                columns: Vec::new(),
                constraints: Vec::new(),
                as_select: Some(Box::new(select)),
                sql: self.span_from(start),
            });
        }
        self.expect(TokenKind::LParen)?;
        let mut columns = Vec::new();
        let mut constraints = Vec::new();
        loop {
            match self.current().kind {
                TokenKind::Primary
                | TokenKind::Unique
                | TokenKind::Check
                | TokenKind::Foreign
                | TokenKind::Constraint => {
                    if let Some(c) = self.parse_table_constraint()? {
                        constraints.push(c);
                    }
                }
                _ => columns.push(self.parse_column_def()?),
            }
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(Stmt::CreateTable {
            temp,
            name,
            columns,
            constraints,
            as_select: None,
            sql: self.span_from(start),
        })
    }

    fn parse_column_def(&mut self) -> Result<ColumnDef> {
        let name = self.expect_name()?;
        let mut def = ColumnDef::new(&name);
        // Declared type: a run of identifiers, optionally sized.
        let mut type_text = String::new();
        while self.check(TokenKind::Id) {
            if !type_text.is_empty() {
                type_text.push(' ');
            }
            type_text.push_str(&self.advance().text);
        }
        if !type_text.is_empty() && self.match_token(TokenKind::LParen) {
            type_text.push('(');
            let mut first = true;
            loop {
                if self.check(TokenKind::RParen) {
                    break;
                }
                if !first {
                    type_text.push(',');
                }
                first = false;
                let t = self.advance();
                type_text.push_str(&t.text);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
            type_text.push(')');
        }
        if !type_text.is_empty() {
            def.decl_type = Some(type_text);
        }
        // Column constraints in any order.
        loop {
            match self.current().kind {
                TokenKind::Primary => {
                    self.advance();
                    self.expect(TokenKind::Key)?;
                    self.match_token(TokenKind::Asc);
                    self.match_token(TokenKind::Desc);
                    def.primary_key = true;
                    def.pk_conflict = self.parse_conflict_clause()?;
                }
                TokenKind::Not => {
                    self.advance();
                    self.expect(TokenKind::Null)?;
                    def.not_null = true;
                    self.parse_conflict_clause()?;
                }
                TokenKind::Null => {
                    self.advance();
                }
                TokenKind::Unique => {
                    self.advance();
                    def.unique = true;
                    self.parse_conflict_clause()?;
                }
                TokenKind::Default => {
                    self.advance();
                    let neg = self.match_token(TokenKind::Minus);
                    let mut e = self.parse_primary_expr()?;
                    if neg {
                        e = Expr::new(ExprOp::UMinus, Some(e), None, "-");
                    }
                    def.default_value = Some(e);
                }
                TokenKind::Check => {
                    self.advance();
                    self.expect(TokenKind::LParen)?;
                    let _ = self.parse_expr()?;
                    self.expect(TokenKind::RParen)?;
                }
                TokenKind::Collate => {
                    self.advance();
                    let coll = self.expect_name()?;
                    def.collate = Some(if coll.eq_ignore_ascii_case("text") {
                        DataType::Text
                    } else {
                        DataType::Numeric
                    });
                }
                TokenKind::References => {
                    let (table, cols, _, _, _) = self.parse_references()?;
                    def.references = Some((table, cols));
                }
                TokenKind::Constraint => {
                    self.advance();
                    let _ = self.expect_name()?;
                }
                _ => break,
            }
        }
        Ok(def)
    }

    fn parse_references(
        &mut self,
    ) -> Result<(String, IdList, ConflictAction, ConflictAction, bool)> {
        self.expect(TokenKind::References)?;
        let table = self.expect_name()?;
        let cols = if self.match_token(TokenKind::LParen) {
            let ids = self.parse_id_list()?;
            self.expect(TokenKind::RParen)?;
            ids
        } else {
            IdList::default()
        };
        let mut on_delete = ConflictAction::Abort;
        let mut on_update = ConflictAction::Abort;
        let mut deferred = false;
        loop {
            if self.match_token(TokenKind::On) {
                let is_delete = if self.match_token(TokenKind::Delete) {
                    true
                } else if self.match_token(TokenKind::Update) {
                    false
                } else {
                    return Err(self.error("expected DELETE or UPDATE"));
                };
                let action = match self.current().kind {
                    TokenKind::Cascade => {
                        self.advance();
                        ConflictAction::Replace
                    }
                    TokenKind::Restrict => {
                        self.advance();
                        ConflictAction::Abort
                    }
                    TokenKind::Set => {
                        self.advance();
                        // SET NULL / SET DEFAULT
                        if !self.match_token(TokenKind::Null) {
                            self.expect(TokenKind::Default)?;
                        }
                        ConflictAction::Ignore
                    }
                    TokenKind::Id => {
                        // NO ACTION
                        self.advance();
                        self.match_token(TokenKind::Id);
                        ConflictAction::Abort
                    }
                    _ => ConflictAction::Abort,
                };
                if is_delete {
                    on_delete = action;
                } else {
                    on_update = action;
                }
            } else if self.match_token(TokenKind::Deferrable) {
                if self.match_token(TokenKind::Initially) {
                    deferred = self.match_token(TokenKind::Deferred);
                    if !deferred {
                        self.expect(TokenKind::Immediate)?;
                    }
                }
            } else if self.check(TokenKind::Not) && self.peek_kind(1) == TokenKind::Deferrable {
                self.advance();
                self.advance();
                deferred = false;
            } else {
                break;
            }
        }
        Ok((table, cols, on_delete, on_update, deferred))
    }

    fn parse_table_constraint(&mut self) -> Result<Option<TableConstraint>> {
        if self.match_token(TokenKind::Constraint) {
            let _ = self.expect_name()?;
        }
        match self.current().kind {
            TokenKind::Primary => {
                self.advance();
                self.expect(TokenKind::Key)?;
                self.expect(TokenKind::LParen)?;
                let ids = self.parse_id_list()?;
                self.expect(TokenKind::RParen)?;
                let action = self.parse_conflict_clause()?;
                Ok(Some(TableConstraint::PrimaryKey(ids, action)))
            }
            TokenKind::Unique => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let ids = self.parse_id_list()?;
                self.expect(TokenKind::RParen)?;
                let action = self.parse_conflict_clause()?;
                Ok(Some(TableConstraint::Unique(ids, action)))
            }
            TokenKind::Check => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let _ = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(None)
            }
            TokenKind::Foreign => {
                self.advance();
                self.expect(TokenKind::Key)?;
                self.expect(TokenKind::LParen)?;
                let columns = self.parse_id_list()?;
                self.expect(TokenKind::RParen)?;
                let (to_table, to_columns, on_delete, on_update, deferred) =
                    self.parse_references()?;
                Ok(Some(TableConstraint::ForeignKey {
                    columns,
                    to_table,
                    to_columns,
                    on_delete,
                    on_update,
                    deferred,
                }))
            }
            _ => Err(self.error("expected table constraint")),
        }
    }

    fn parse_create_view(&mut self, temp: bool, start: usize) -> Result<Stmt> {
        self.expect(TokenKind::View)?;
        let name = self.parse_qual_name()?;
        self.expect(TokenKind::As)?;
        let select = self.parse_select()?;
        Ok(Stmt::CreateView {
            temp,
            name,
            select: Box::new(select),
            sql: self.span_from(start),
        })
    }

    fn parse_create_index(
        &mut self,
        unique: Option<ConflictAction>,
        start: usize,
    ) -> Result<Stmt> {
        self.expect(TokenKind::Index)?;
        let name = self.parse_qual_name()?;
        self.expect(TokenKind::On)?;
        let table = self.expect_name()?;
        self.expect(TokenKind::LParen)?;
        let mut columns = IdList::default();
        loop {
            columns.names.push(self.expect_name()?);
            self.match_token(TokenKind::Asc);
            self.match_token(TokenKind::Desc);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        let unique = match unique {
            Some(_) => Some(self.parse_conflict_clause()?),
            None => None,
        };
        Ok(Stmt::CreateIndex {
            unique,
            name,
            table,
            columns,
            sql: self.span_from(start),
        })
    }

    fn parse_create_trigger(&mut self, start: usize) -> Result<Stmt> {
        self.expect(TokenKind::Trigger)?;
        let name = self.parse_qual_name()?;
        let time = match self.current().kind {
            TokenKind::Before => {
                self.advance();
                TriggerTime::Before
            }
            TokenKind::After => {
                self.advance();
                TriggerTime::After
            }
            _ => TriggerTime::Before,
        };
        let (event, columns) = match self.current().kind {
            TokenKind::Delete => {
                self.advance();
                (TriggerEvent::Delete, None)
            }
            TokenKind::Insert => {
                self.advance();
                (TriggerEvent::Insert, None)
            }
            TokenKind::Update => {
                self.advance();
                let cols = if self.match_token(TokenKind::Of) {
                    Some(self.parse_id_list()?)
                } else {
                    None
                };
                (TriggerEvent::Update, cols)
            }
            _ => return Err(self.error("expected DELETE, INSERT, or UPDATE")),
        };
        self.expect(TokenKind::On)?;
        let table = self.expect_name()?;
        if self.match_token(TokenKind::For) {
            self.expect(TokenKind::Each)?;
            self.expect(TokenKind::Row)?;
        }
        if self.match_token(TokenKind::When) {
            let _ = self.parse_expr()?;
        }
        self.expect(TokenKind::Begin)?;
        // The body is kept as text and recompiled when the trigger is
        // reloaded from the catalog.
        let mut depth = 1;
        while depth > 0 {
            match self.current().kind {
                TokenKind::Begin | TokenKind::Case => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::End => {
                    depth -= 1;
                    self.advance();
                }
                TokenKind::Eof => return Err(self.error("unterminated trigger body")),
                _ => {
                    self.advance();
                }
            }
        }
        Ok(Stmt::CreateTrigger {
            name,
            time,
            event,
            columns,
            table,
            sql: self.span_from(start),
        })
    }

    fn parse_drop(&mut self) -> Result<Stmt> {
        self.expect(TokenKind::Drop)?;
        match self.current().kind {
            TokenKind::Table => {
                self.advance();
                Ok(Stmt::DropTable(self.parse_qual_name()?))
            }
            TokenKind::View => {
                self.advance();
                Ok(Stmt::DropView(self.parse_qual_name()?))
            }
            TokenKind::Index => {
                self.advance();
                Ok(Stmt::DropIndex(self.parse_qual_name()?))
            }
            TokenKind::Trigger => {
                self.advance();
                Ok(Stmt::DropTrigger(self.parse_qual_name()?))
            }
            _ => Err(self.error("expected TABLE, VIEW, INDEX, or TRIGGER")),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub fn parse_expr(&mut self) -> Result<Expr> {
        let start = self.current().pos;
        let mut e = self.parse_and_expr()?;
        while self.check(TokenKind::Or) {
            self.advance();
            let rhs = self.parse_and_expr()?;
            e = Expr::new(ExprOp::Or, Some(e), Some(rhs), "OR");
            e.set_span(&self.span_from(start));
        }
        if e.span.is_empty() || e.span == e.token {
            e.set_span(&self.span_from(start));
        }
        Ok(e)
    }

    fn parse_and_expr(&mut self) -> Result<Expr> {
        let mut e = self.parse_not_expr()?;
        while self.check(TokenKind::And) {
            self.advance();
            let rhs = self.parse_not_expr()?;
            e = Expr::new(ExprOp::And, Some(e), Some(rhs), "AND");
        }
        Ok(e)
    }

    fn parse_not_expr(&mut self) -> Result<Expr> {
        if self.match_token(TokenKind::Not) {
            let inner = self.parse_not_expr()?;
            return Ok(Expr::new(ExprOp::Not, Some(inner), None, "NOT"));
        }
        self.parse_cmp_expr()
    }

    fn parse_cmp_expr(&mut self) -> Result<Expr> {
        let mut e = self.parse_bit_expr()?;
        loop {
            let negated = if self.check(TokenKind::Not)
                && matches!(
                    self.peek_kind(1),
                    TokenKind::Like | TokenKind::Glob | TokenKind::Between | TokenKind::In
                ) {
                self.advance();
                true
            } else {
                false
            };
            let op = match self.current().kind {
                TokenKind::Eq => Some(ExprOp::Eq),
                TokenKind::Ne => Some(ExprOp::Ne),
                TokenKind::Lt => Some(ExprOp::Lt),
                TokenKind::Le => Some(ExprOp::Le),
                TokenKind::Gt => Some(ExprOp::Gt),
                TokenKind::Ge => Some(ExprOp::Ge),
                _ => None,
            };
            if let Some(op) = op {
                let t = self.advance();
                let rhs = self.parse_bit_expr()?;
                e = Expr::new(op, Some(e), Some(rhs), &t.text);
                continue;
            }
            match self.current().kind {
                TokenKind::IsNull => {
                    self.advance();
                    e = Expr::new(ExprOp::IsNull, Some(e), None, "ISNULL");
                }
                TokenKind::NotNull => {
                    self.advance();
                    e = Expr::new(ExprOp::NotNull, Some(e), None, "NOTNULL");
                }
                TokenKind::Is => {
                    self.advance();
                    let neg = self.match_token(TokenKind::Not);
                    self.expect(TokenKind::Null)?;
                    e = Expr::new(
                        if neg { ExprOp::NotNull } else { ExprOp::IsNull },
                        Some(e),
                        None,
                        "IS",
                    );
                }
                TokenKind::Like | TokenKind::Glob => {
                    let name = if self.check(TokenKind::Like) {
                        "like"
                    } else {
                        "glob"
                    };
                    self.advance();
                    let pattern = self.parse_bit_expr()?;
                    let mut args = ExprList::new();
                    args.append(pattern, None);
                    args.append(e, None);
                    let mut f = Expr::function(name, Some(args));
                    if negated {
                        f = Expr::new(ExprOp::Not, Some(f), None, "NOT");
                    }
                    e = f;
                }
                TokenKind::Between => {
                    self.advance();
                    let low = self.parse_bit_expr()?;
                    self.expect(TokenKind::And)?;
                    let high = self.parse_bit_expr()?;
                    let mut list = ExprList::new();
                    list.append(low, None);
                    list.append(high, None);
                    let mut b = Expr::new(ExprOp::Between, Some(e), None, "BETWEEN");
                    b.list = Some(list);
                    if negated {
                        b = Expr::new(ExprOp::Not, Some(b), None, "NOT");
                    }
                    e = b;
                }
                TokenKind::In => {
                    self.advance();
                    self.expect(TokenKind::LParen)?;
                    let mut i = Expr::new(ExprOp::In, Some(e), None, "IN");
                    if self.check(TokenKind::Select) {
                        i.select = Some(Box::new(self.parse_select()?));
                    } else {
                        let mut list = ExprList::new();
                        loop {
                            list.append(self.parse_expr()?, None);
                            if !self.match_token(TokenKind::Comma) {
                                break;
                            }
                        }
                        i.list = Some(list);
                    }
                    self.expect(TokenKind::RParen)?;
                    if negated {
                        i = Expr::new(ExprOp::Not, Some(i), None, "NOT");
                    }
                    e = i;
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn parse_bit_expr(&mut self) -> Result<Expr> {
        let mut e = self.parse_add_expr()?;
        loop {
            let op = match self.current().kind {
                TokenKind::BitAnd => ExprOp::BitAnd,
                TokenKind::BitOr => ExprOp::BitOr,
                TokenKind::LShift => ExprOp::LShift,
                TokenKind::RShift => ExprOp::RShift,
                _ => break,
            };
            let t = self.advance();
            let rhs = self.parse_add_expr()?;
            e = Expr::new(op, Some(e), Some(rhs), &t.text);
        }
        Ok(e)
    }

    fn parse_add_expr(&mut self) -> Result<Expr> {
        let mut e = self.parse_mul_expr()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Plus => ExprOp::Plus,
                TokenKind::Minus => ExprOp::Minus,
                _ => break,
            };
            let t = self.advance();
            let rhs = self.parse_mul_expr()?;
            e = Expr::new(op, Some(e), Some(rhs), &t.text);
        }
        Ok(e)
    }

    fn parse_mul_expr(&mut self) -> Result<Expr> {
        let mut e = self.parse_concat_expr()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Star => ExprOp::Star,
                TokenKind::Slash => ExprOp::Slash,
                TokenKind::Percent => ExprOp::Rem,
                _ => break,
            };
            let t = self.advance();
            let rhs = self.parse_concat_expr()?;
            e = Expr::new(op, Some(e), Some(rhs), &t.text);
        }
        Ok(e)
    }

    fn parse_concat_expr(&mut self) -> Result<Expr> {
        let mut e = self.parse_unary_expr()?;
        while self.check(TokenKind::Concat) {
            self.advance();
            let rhs = self.parse_unary_expr()?;
            e = Expr::new(ExprOp::Concat, Some(e), Some(rhs), "||");
        }
        Ok(e)
    }

    fn parse_unary_expr(&mut self) -> Result<Expr> {
        match self.current().kind {
            TokenKind::Minus => {
                self.advance();
                let inner = self.parse_unary_expr()?;
                Ok(Expr::new(ExprOp::UMinus, Some(inner), None, "-"))
            }
            TokenKind::Plus => {
                self.advance();
                let inner = self.parse_unary_expr()?;
                Ok(Expr::new(ExprOp::UPlus, Some(inner), None, "+"))
            }
            TokenKind::BitNot => {
                self.advance();
                let inner = self.parse_unary_expr()?;
                Ok(Expr::new(ExprOp::BitNot, Some(inner), None, "~"))
            }
            _ => self.parse_primary_expr(),
        }
    }

    fn parse_primary_expr(&mut self) -> Result<Expr> {
        let start = self.current().pos;
        let mut e = match self.current().kind {
            TokenKind::Integer => Expr::leaf(ExprOp::Integer, &self.advance().text),
            TokenKind::Float => Expr::leaf(ExprOp::Float, &self.advance().text),
            TokenKind::String => Expr::leaf(ExprOp::String, &self.advance().text),
            TokenKind::DqString => {
                // Double-quoted text: an identifier unless resolution
                // finds no matching column.
                Expr::leaf(ExprOp::QString, &self.advance().text)
            }
            TokenKind::Null => {
                self.advance();
                Expr::leaf(ExprOp::Null, "NULL")
            }
            TokenKind::Variable => {
                self.advance();
                Expr::leaf(ExprOp::Variable, "?")
            }
            TokenKind::LParen => {
                self.advance();
                if self.check(TokenKind::Select) {
                    let select = self.parse_select()?;
                    self.expect(TokenKind::RParen)?;
                    let mut e = Expr::leaf(ExprOp::Select, "SELECT");
                    e.select = Some(Box::new(select));
                    e
                } else {
                    let inner = self.parse_expr()?;
                    self.expect(TokenKind::RParen)?;
                    inner
                }
            }
            TokenKind::Exists => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let select = self.parse_select()?;
                self.expect(TokenKind::RParen)?;
                let mut e = Expr::leaf(ExprOp::Exists, "EXISTS");
                e.select = Some(Box::new(select));
                e
            }
            TokenKind::Case => {
                self.advance();
                let operand = if !self.check(TokenKind::When) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                let mut pairs = ExprList::new();
                while self.match_token(TokenKind::When) {
                    let w = self.parse_expr()?;
                    self.expect(TokenKind::Then)?;
                    let t = self.parse_expr()?;
                    pairs.append(w, None);
                    pairs.append(t, None);
                }
                let else_expr = if self.match_token(TokenKind::Else) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                self.expect(TokenKind::End)?;
                let mut c = Expr::new(ExprOp::Case, operand, else_expr, "CASE");
                c.list = Some(pairs);
                c
            }
            TokenKind::Id | TokenKind::Key | TokenKind::Row | TokenKind::Offset => {
                let t = self.advance();
                if self.check(TokenKind::LParen) {
                    self.advance();
                    // Function call, possibly f(*) or f().
                    let mut args = ExprList::new();
                    let mut star = false;
                    if self.match_token(TokenKind::Star) {
                        star = true;
                    } else if !self.check(TokenKind::RParen) {
                        loop {
                            args.append(self.parse_expr()?, None);
                            if !self.match_token(TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                    let mut f =
                        Expr::function(&t.text, if star { None } else { Some(args) });
                    if star {
                        f.column_idx = -1;
                    }
                    f
                } else if self.check(TokenKind::Dot) {
                    self.advance();
                    let second = self.expect_name()?;
                    if self.match_token(TokenKind::Dot) {
                        let third = self.expect_name()?;
                        // db.table.column
                        let table = Expr::new(
                            ExprOp::Dot,
                            Some(Expr::leaf(ExprOp::Id, &second)),
                            Some(Expr::leaf(ExprOp::Id, &third)),
                            ".",
                        );
                        Expr::new(
                            ExprOp::Dot,
                            Some(Expr::leaf(ExprOp::Id, &t.text)),
                            Some(table),
                            ".",
                        )
                    } else {
                        Expr::new(
                            ExprOp::Dot,
                            Some(Expr::leaf(ExprOp::Id, &t.text)),
                            Some(Expr::leaf(ExprOp::Id, &second)),
                            ".",
                        )
                    }
                } else {
                    Expr::leaf(ExprOp::Id, &t.text)
                }
            }
            _ => {
                return Err(self.error(&format!(
                    "near \"{}\": syntax error",
                    if self.current().text.is_empty() {
                        "end of input"
                    } else {
                        &self.current().text
                    }
                )))
            }
        };
        e.set_span(&self.span_from(start));
        Ok(e)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(sql: &str) -> Stmt {
        let mut p = Parser::new(sql).unwrap();
        p.parse_statement().unwrap().0.unwrap()
    }

    #[test]
    fn test_parse_simple_select() {
        let stmt = parse_one("SELECT a, b FROM t WHERE a > 1 ORDER BY b DESC LIMIT 10");
        let Stmt::Select(sel) = stmt else {
            panic!("not a select")
        };
        assert_eq!(sel.result.len(), 2);
        assert_eq!(sel.src.items[0].name, "t");
        assert!(sel.where_expr.is_some());
        assert!(sel.order_by.as_ref().unwrap().items[0].desc);
        assert_eq!(sel.limit, 10);
    }

    #[test]
    fn test_parse_compound_select() {
        let stmt = parse_one("SELECT x FROM u UNION ALL SELECT y FROM v LIMIT 3");
        let Stmt::Select(sel) = stmt else {
            panic!("not a select")
        };
        assert_eq!(sel.op, CompoundOp::UnionAll);
        assert!(sel.prior.is_some());
        assert_eq!(sel.limit, 3);
    }

    #[test]
    fn test_parse_insert_values() {
        let stmt = parse_one("INSERT INTO t(a, b) VALUES(1, 'x')");
        let Stmt::Insert {
            table,
            columns,
            source,
            ..
        } = stmt
        else {
            panic!("not an insert")
        };
        assert_eq!(table.name, "t");
        assert_eq!(columns.unwrap().names, vec!["a", "b"]);
        let InsertSource::Values(vals) = source else {
            panic!("not values")
        };
        assert_eq!(vals.len(), 2);
    }

    #[test]
    fn test_parse_create_table() {
        let stmt = parse_one(
            "CREATE TABLE t(a INTEGER PRIMARY KEY, b VARCHAR(10) NOT NULL, c DEFAULT 5)",
        );
        let Stmt::CreateTable {
            name,
            columns,
            sql,
            ..
        } = stmt
        else {
            panic!("not create table")
        };
        assert_eq!(name.name, "t");
        assert_eq!(columns.len(), 3);
        assert!(columns[0].primary_key);
        assert_eq!(columns[1].decl_type.as_deref(), Some("VARCHAR(10)"));
        assert!(columns[1].not_null);
        assert!(columns[2].default_value.is_some());
        assert!(sql.starts_with("CREATE TABLE"));
    }

    #[test]
    fn test_parse_in_subquery() {
        let stmt = parse_one("SELECT x FROM a WHERE x IN (SELECT y FROM b)");
        let Stmt::Select(sel) = stmt else {
            panic!("not a select")
        };
        let w = sel.where_expr.unwrap();
        assert_eq!(w.op, ExprOp::In);
        assert!(w.select.is_some());
    }

    #[test]
    fn test_parse_left_join() {
        let stmt = parse_one("SELECT * FROM a LEFT OUTER JOIN b ON a.x = b.y");
        let Stmt::Select(sel) = stmt else {
            panic!("not a select")
        };
        assert_eq!(sel.src.len(), 2);
        assert!(sel.src.items[1].jointype.contains(JoinType::LEFT));
        assert!(sel.src.items[1].on_expr.is_some());
    }

    #[test]
    fn test_parse_expr_precedence() {
        let stmt = parse_one("SELECT 1 + 2 * 3");
        let Stmt::Select(sel) = stmt else {
            panic!("not a select")
        };
        let e = &sel.result.items[0].expr;
        assert_eq!(e.op, ExprOp::Plus);
        assert_eq!(e.right.as_ref().unwrap().op, ExprOp::Star);
    }

    #[test]
    fn test_parse_case() {
        let stmt = parse_one("SELECT CASE WHEN a > 1 THEN 'big' ELSE 'small' END FROM t");
        let Stmt::Select(sel) = stmt else {
            panic!("not a select")
        };
        let e = &sel.result.items[0].expr;
        assert_eq!(e.op, ExprOp::Case);
        assert_eq!(e.list.as_ref().unwrap().len(), 2);
        assert!(e.right.is_some());
    }

    #[test]
    fn test_parse_errors() {
        let mut p = Parser::new("SELECT FROM").unwrap();
        assert!(p.parse_statement().is_err());
        let mut p = Parser::new("CREATE NONSENSE t").unwrap();
        assert!(p.parse_statement().is_err());
    }

    #[test]
    fn test_statement_tail() {
        let mut p = Parser::new("SELECT 1; SELECT 2").unwrap();
        let (stmt, _, tail) = p.parse_statement().unwrap();
        assert!(stmt.is_some());
        assert!(tail <= "SELECT 1; SELECT 2".len());
        assert!("SELECT 1; SELECT 2"[tail..].contains("SELECT 2"));
    }
}
