//! Precedence-climbing expression parser.

use tracing::warn;

use super::{ParseResult, Parser};
use crate::ast::{Node, NodeKind};
use crate::error::SyntaxError;
use crate::extension::{Associativity, BinaryKind, Builtin, Callable, CallableKind};
use crate::token::{Token, TokenKind, TokenStream};
use crate::value::ConstValue;

/// Operators made of letters (`and`, `in`, ...) stand for plain names when
/// they show up where an operand is expected.
fn is_name_like(token: &Token) -> bool {
    token.test(TokenKind::Operator) && {
        let mut chars = token.value().chars();
        chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

fn punctuation(token: &Token, value: &str) -> bool {
    token.test_value(TokenKind::Punctuation, value)
}

fn number_constant(token: &Token) -> ParseResult<ConstValue> {
    ConstValue::from_number_literal(token.value()).ok_or_else(|| {
        SyntaxError::new(format!("Invalid number \"{}\".", token.value()), token.line())
    })
}

/// Marks the operand of a `defined` test or `??` so that missing variables
/// and attributes do not raise in strict mode.
fn ignore_strict_check(node: &mut Node) {
    let kind = node.kind();
    if kind == NodeKind::Name {
        node.set_attribute("ignore_strict_check", true);
    } else if kind == NodeKind::GetAttr {
        node.set_attribute("ignore_strict_check", true);
        if let Some(inner) = node.get_node_mut("node") {
            ignore_strict_check(inner);
        }
    }
}

/// Nesting allowed before an expression is rejected rather than parsed
/// recursively.
const MAX_EXPRESSION_DEPTH: usize = 64;

impl<'env> Parser<'env> {
    /// Parses a full expression, including the conditional operator.
    ///
    /// # Errors
    ///
    /// Any malformed expression.
    pub fn parse_expression(&mut self) -> ParseResult<Node> {
        self.parse_expression_with(0)
    }

    fn parse_expression_with(&mut self, precedence: u32) -> ParseResult<Node> {
        if self.expression_depth >= MAX_EXPRESSION_DEPTH {
            return Err(SyntaxError::new(
                format!("Expression is nested too deeply (more than {MAX_EXPRESSION_DEPTH} levels)."),
                self.stream.current().line(),
            ));
        }
        self.expression_depth = self.expression_depth.saturating_add(1);
        let result = self.climb(precedence);
        self.expression_depth = self.expression_depth.saturating_sub(1);
        result
    }

    fn climb(&mut self, precedence: u32) -> ParseResult<Node> {
        if let Some(arrow) = self.parse_arrow()? {
            return Ok(arrow);
        }
        let registry = self.registry;
        let mut expr = self.primary()?;
        loop {
            let token = self.stream.current().clone();
            if !token.test(TokenKind::Operator) {
                break;
            }
            let Some(op) = registry.binary_operator(token.value()) else {
                break;
            };
            if op.precedence < precedence {
                break;
            }
            self.stream.next()?;
            expr = match &op.kind {
                BinaryKind::Is => self.parse_test(expr)?,
                BinaryKind::IsNot => {
                    let test = self.parse_test(expr)?;
                    Node::new(NodeKind::Unary, token.line())
                        .with_node("node", test)
                        .with_attribute("operator", "not")
                }
                BinaryKind::NullCoalesce => {
                    let next = match op.associativity {
                        Associativity::Left => op.precedence.saturating_add(1),
                        Associativity::Right => op.precedence,
                    };
                    let right = self.parse_expression_with(next)?;
                    let mut left = expr;
                    ignore_strict_check(&mut left);
                    Node::new(NodeKind::NullCoalesce, token.line())
                        .with_node("left", left)
                        .with_node("right", right)
                }
                BinaryKind::Builtin(_) | BinaryKind::Custom(_) => {
                    let next = match op.associativity {
                        Associativity::Left => op.precedence.saturating_add(1),
                        Associativity::Right => op.precedence,
                    };
                    let right = self.parse_expression_with(next)?;
                    Node::new(NodeKind::Binary, token.line())
                        .with_node("left", expr)
                        .with_node("right", right)
                        .with_attribute("operator", op.name.as_str())
                }
            };
        }

        if precedence == 0 {
            return self.parse_conditional(expr);
        }
        Ok(expr)
    }

    /// `x => expr` or `(a, b) => expr`. Leaves the stream untouched when the
    /// upcoming tokens are not an arrow function.
    fn parse_arrow(&mut self) -> ParseResult<Option<Node>> {
        let line = self.stream.current().line();
        let arrow_at =
            |stream: &TokenStream, offset: isize| stream.look(offset).is_some_and(|t| t.test(TokenKind::Arrow));
        let names = if self.stream.test(TokenKind::Name) && arrow_at(&self.stream, 1) {
            vec![self.stream.next()?.value().to_owned()]
        } else if self.stream.test_value(TokenKind::Punctuation, "(") {
            let mut offset: isize = 1;
            loop {
                if !self.stream.look(offset).is_some_and(|t| t.test(TokenKind::Name)) {
                    return Ok(None);
                }
                let separator = self.stream.look(offset.saturating_add(1));
                offset = offset.saturating_add(2);
                if separator.is_some_and(|t| punctuation(t, ")")) {
                    break;
                }
                if !separator.is_some_and(|t| punctuation(t, ",")) {
                    return Ok(None);
                }
            }
            if !arrow_at(&self.stream, offset) {
                return Ok(None);
            }
            self.stream.next()?;
            let mut names = Vec::new();
            loop {
                names.push(self.stream.expect(TokenKind::Name)?.value().to_owned());
                if self.stream.next_if_value(TokenKind::Punctuation, ",").is_none() {
                    break;
                }
            }
            self.stream.expect_value(TokenKind::Punctuation, ")")?;
            names
        } else {
            return Ok(None);
        };
        self.stream.expect(TokenKind::Arrow)?;
        let body = self.parse_expression()?;
        Ok(Some(
            Node::new(NodeKind::Arrow, line)
                .with_node("expr", body)
                .with_attribute("names", names),
        ))
    }

    fn primary(&mut self) -> ParseResult<Node> {
        let token = self.stream.current().clone();
        if token.test(TokenKind::Operator) {
            if let Some(op) = self.registry.unary_operator(token.value()) {
                let precedence = op.precedence;
                self.stream.next()?;
                let operand = self.parse_expression_with(precedence)?;
                let unary = Node::new(NodeKind::Unary, token.line())
                    .with_node("node", operand)
                    .with_attribute("operator", token.value());
                return self.parse_postfix(unary);
            }
        }
        if punctuation(&token, "(") {
            self.stream.next()?;
            let expr = self.parse_expression()?;
            self.stream.expect_with(
                TokenKind::Punctuation,
                Some(")"),
                Some("An opened parenthesis is not properly closed"),
            )?;
            return self.parse_postfix(expr);
        }
        self.parse_primary_expression()
    }

    fn parse_conditional(&mut self, mut expr: Node) -> ParseResult<Node> {
        while let Some(question) = self.stream.next_if_value(TokenKind::Punctuation, "?") {
            let (expr2, expr3) = if self.stream.next_if_value(TokenKind::Punctuation, ":").is_some() {
                (expr.clone(), self.parse_expression()?)
            } else {
                let expr2 = self.parse_expression()?;
                let expr3 = if self.stream.next_if_value(TokenKind::Punctuation, ":").is_some() {
                    self.parse_expression()?
                } else {
                    Node::string("", question.line())
                };
                (expr2, expr3)
            };
            expr = Node::new(NodeKind::Conditional, question.line())
                .with_node("expr1", expr)
                .with_node("expr2", expr2)
                .with_node("expr3", expr3);
        }
        Ok(expr)
    }

    /// Parses a literal, name, function call, sequence or mapping, followed
    /// by any subscripts and filters.
    ///
    /// # Errors
    ///
    /// When the current token cannot start an operand.
    pub fn parse_primary_expression(&mut self) -> ParseResult<Node> {
        let token = self.stream.current().clone();
        let node = match token.kind() {
            TokenKind::Name => {
                self.stream.next()?;
                match token.value() {
                    "true" | "TRUE" => Node::constant(ConstValue::Bool(true), token.line()),
                    "false" | "FALSE" => Node::constant(ConstValue::Bool(false), token.line()),
                    "none" | "NONE" | "null" | "NULL" => Node::constant(ConstValue::Null, token.line()),
                    name => {
                        if punctuation(self.stream.current(), "(") {
                            self.function_node(name, token.line())?
                        } else {
                            Node::name(name, token.line())
                        }
                    }
                }
            }
            TokenKind::Number => {
                self.stream.next()?;
                Node::constant(number_constant(&token)?, token.line())
            }
            TokenKind::String | TokenKind::InterpolationStart => self.parse_string_expression()?,
            TokenKind::Operator if is_name_like(&token) => {
                self.stream.next()?;
                if punctuation(self.stream.current(), "(") {
                    self.function_node(token.value(), token.line())?
                } else {
                    Node::name(token.value(), token.line())
                }
            }
            TokenKind::Punctuation if token.value() == "[" => self.parse_sequence_expression()?,
            TokenKind::Punctuation if token.value() == "{" => self.parse_mapping_expression()?,
            TokenKind::Eof
            | TokenKind::Text
            | TokenKind::BlockStart
            | TokenKind::VarStart
            | TokenKind::BlockEnd
            | TokenKind::VarEnd
            | TokenKind::Operator
            | TokenKind::Punctuation
            | TokenKind::InterpolationEnd
            | TokenKind::Spread
            | TokenKind::Arrow => {
                return Err(SyntaxError::new(
                    format!(
                        "Unexpected token \"{}\" of value \"{}\".",
                        token.kind(),
                        token.value()
                    ),
                    token.line(),
                ));
            }
        };
        self.parse_postfix(node)
    }

    fn parse_string_expression(&mut self) -> ParseResult<Node> {
        let mut parts = Vec::new();
        let mut next_can_be_string = true;
        loop {
            if next_can_be_string {
                if let Some(token) = self.stream.next_if(TokenKind::String) {
                    parts.push(Node::string(token.value(), token.line()));
                    next_can_be_string = false;
                    continue;
                }
            }
            if self.stream.next_if(TokenKind::InterpolationStart).is_some() {
                parts.push(self.parse_expression()?);
                self.stream.expect(TokenKind::InterpolationEnd)?;
                next_can_be_string = true;
                continue;
            }
            break;
        }

        let mut parts = parts.into_iter();
        let line = self.stream.current().line();
        let Some(mut expr) = parts.next() else {
            return Ok(Node::string("", line));
        };
        for part in parts {
            let line = expr.line();
            expr = Node::new(NodeKind::Binary, line)
                .with_node("left", expr)
                .with_node("right", part)
                .with_attribute("operator", "~");
        }
        Ok(expr)
    }

    fn parse_sequence_expression(&mut self) -> ParseResult<Node> {
        let open = self.stream.expect_with(
            TokenKind::Punctuation,
            Some("["),
            Some("A sequence element was expected"),
        )?;
        let mut node = Node::new(NodeKind::Array, open.line()).with_attribute("sequence", true);
        let mut index = 0_i64;
        while !punctuation(self.stream.current(), "]") {
            if index > 0 {
                self.stream.expect_with(
                    TokenKind::Punctuation,
                    Some(","),
                    Some("A sequence element must be followed by a comma"),
                )?;
                if punctuation(self.stream.current(), "]") {
                    break;
                }
            }
            let line = self.stream.current().line();
            let value = if self.stream.next_if(TokenKind::Spread).is_some() {
                self.parse_expression()?.with_attribute("spread", true)
            } else {
                self.parse_expression()?
            };
            node.add_element(Node::constant(ConstValue::Int(index), line), value);
            index = index.saturating_add(1);
        }
        self.stream.expect_with(
            TokenKind::Punctuation,
            Some("]"),
            Some("An opened sequence is not properly closed"),
        )?;
        Ok(node)
    }

    fn parse_mapping_expression(&mut self) -> ParseResult<Node> {
        let open = self.stream.expect_with(
            TokenKind::Punctuation,
            Some("{"),
            Some("A mapping element was expected"),
        )?;
        let mut node = Node::new(NodeKind::Array, open.line()).with_attribute("sequence", false);
        let mut first = true;
        while !punctuation(self.stream.current(), "}") {
            if !first {
                self.stream.expect_with(
                    TokenKind::Punctuation,
                    Some(","),
                    Some("A mapping value must be followed by a comma"),
                )?;
                if punctuation(self.stream.current(), "}") {
                    break;
                }
            }
            first = false;

            let token = self.stream.current().clone();
            if self.stream.next_if(TokenKind::Spread).is_some() {
                let value = self.parse_expression()?.with_attribute("spread", true);
                node.add_element(Node::constant(ConstValue::Null, token.line()), value);
                continue;
            }

            let key = if token.test(TokenKind::Name) || is_name_like(&token) {
                self.stream.next()?;
                // `{ name }` is short for `{ name: name }`.
                let current = self.stream.current();
                if punctuation(current, ",") || punctuation(current, "}") {
                    node.add_element(
                        Node::string(token.value(), token.line()),
                        Node::name(token.value(), token.line()),
                    );
                    continue;
                }
                Node::string(token.value(), token.line())
            } else if token.test(TokenKind::String) {
                self.stream.next()?;
                Node::string(token.value(), token.line())
            } else if token.test(TokenKind::Number) {
                self.stream.next()?;
                Node::constant(number_constant(&token)?, token.line())
            } else if punctuation(&token, "(") {
                self.parse_expression()?
            } else {
                return Err(SyntaxError::new(
                    format!(
                        "A mapping key must be a quoted string, a number, a name, or an expression enclosed in parentheses (unexpected token \"{}\" of value \"{}\".",
                        token.kind(),
                        token.value()
                    ),
                    token.line(),
                ));
            };

            self.stream.expect_with(
                TokenKind::Punctuation,
                Some(":"),
                Some("A mapping key must be followed by a colon (:)"),
            )?;
            let value = self.parse_expression()?;
            node.add_element(key, value);
        }
        self.stream.expect_with(
            TokenKind::Punctuation,
            Some("}"),
            Some("An opened mapping is not properly closed"),
        )?;
        Ok(node)
    }

    fn parse_postfix(&mut self, mut node: Node) -> ParseResult<Node> {
        loop {
            let token = self.stream.current();
            if punctuation(token, ".") || punctuation(token, "[") {
                node = self.parse_subscript(node)?;
            } else if punctuation(token, "|") {
                node = self.parse_filter_expression(node)?;
            } else {
                return Ok(node);
            }
        }
    }

    fn parse_subscript(&mut self, node: Node) -> ParseResult<Node> {
        let token = self.stream.next()?;
        let line = token.line();

        if token.value() == "." {
            let attribute = self.stream.next()?;
            let constant = if attribute.test(TokenKind::Name) || is_name_like(&attribute) {
                ConstValue::String(attribute.value().to_owned())
            } else if attribute.test(TokenKind::Number) {
                number_constant(&attribute)?
            } else {
                return Err(SyntaxError::new("Expected name or number.", line));
            };

            let macro_holder = (node.kind() == NodeKind::Name)
                .then(|| node.attr_str("name"))
                .filter(|target| *target == "_self" || self.is_imported_template(target))
                .map(ToOwned::to_owned);
            let is_call = punctuation(self.stream.current(), "(");
            let arguments = if is_call {
                let arguments = self.parse_arguments(macro_holder.is_some(), false)?;
                if macro_holder.is_none()
                    && arguments.nodes().any(|(key, _)| key.parse::<usize>().is_err())
                {
                    return Err(SyntaxError::new(
                        "Named arguments are not supported for method calls.",
                        line,
                    ));
                }
                arguments
            } else {
                Node::new(NodeKind::Nodes, line)
            };

            if let Some(target) = macro_holder {
                return Ok(Node::new(NodeKind::MacroCall, line)
                    .with_attribute("template", target)
                    .with_attribute("name", attribute.value())
                    .with_node("arguments", arguments));
            }

            return Ok(Node::new(NodeKind::GetAttr, line)
                .with_node("node", node)
                .with_node("attribute", Node::constant(constant, line))
                .with_node("arguments", arguments)
                .with_attribute("type", if is_call { "method" } else { "any" }));
        }

        let mut slice = false;
        let start = if punctuation(self.stream.current(), ":") {
            slice = true;
            Node::constant(ConstValue::Int(0), line)
        } else {
            self.parse_expression()?
        };
        if self.stream.next_if_value(TokenKind::Punctuation, ":").is_some() {
            slice = true;
        }

        if slice {
            let length = if punctuation(self.stream.current(), "]") {
                Node::constant(ConstValue::Null, line)
            } else {
                self.parse_expression()?
            };
            self.stream.expect_value(TokenKind::Punctuation, "]")?;
            let arguments = Node::list(vec![start, length], line);
            return Ok(Node::new(NodeKind::Filter, line)
                .with_node("node", node)
                .with_attribute("name", "slice")
                .with_node("arguments", arguments));
        }

        self.stream.expect_value(TokenKind::Punctuation, "]")?;
        Ok(Node::new(NodeKind::GetAttr, line)
            .with_node("node", node)
            .with_node("attribute", start)
            .with_node("arguments", Node::new(NodeKind::Nodes, line))
            .with_attribute("type", "array"))
    }

    /// Parses `|filter(args)|filter...` applied to `node`, starting at the
    /// first `|`.
    ///
    /// # Errors
    ///
    /// Unknown filters and malformed arguments.
    pub fn parse_filter_expression(&mut self, node: Node) -> ParseResult<Node> {
        self.stream.next()?;
        self.parse_filter_expression_raw(node)
    }

    /// Same as [`Parser::parse_filter_expression`] but positioned on the first
    /// filter name, as in `{% apply upper|trim %}`.
    ///
    /// # Errors
    ///
    /// Unknown filters and malformed arguments.
    pub fn parse_filter_expression_raw(&mut self, mut node: Node) -> ParseResult<Node> {
        loop {
            let token = self.stream.expect(TokenKind::Name)?;
            let name = token.value();
            let arguments = if punctuation(self.stream.current(), "(") {
                self.parse_arguments(true, false)?
            } else {
                Node::new(NodeKind::Nodes, token.line())
            };

            // Unknown filters inside a guard that does not hold keep the input.
            if self.lookup_callable(CallableKind::Filter, name, token.line())?.is_some() {
                node = Node::new(NodeKind::Filter, token.line())
                    .with_node("node", node)
                    .with_attribute("name", name)
                    .with_node("arguments", arguments);
            }

            if !punctuation(self.stream.current(), "|") {
                return Ok(node);
            }
            self.stream.next()?;
        }
    }

    /// Parses a parenthesised argument list.
    ///
    /// Call arguments come back as a `Nodes` node whose positional entries are
    /// keyed `"0"`, `"1"`, ... and whose named entries are keyed by name.
    /// With `definition` set (macro signatures) every entry is keyed by
    /// parameter name and holds the default value.
    ///
    /// # Errors
    ///
    /// Malformed lists, positional arguments after named ones, duplicate
    /// names and non-constant defaults.
    pub fn parse_arguments(&mut self, named_allowed: bool, definition: bool) -> ParseResult<Node> {
        let open = self.stream.expect_with(
            TokenKind::Punctuation,
            Some("("),
            Some("A list of arguments must begin with an opening parenthesis"),
        )?;
        let mut args = Node::new(NodeKind::Nodes, open.line());
        let mut positional = 0_usize;
        let mut seen_named = false;

        while !punctuation(self.stream.current(), ")") {
            if !args.is_empty() {
                self.stream.expect_with(
                    TokenKind::Punctuation,
                    Some(","),
                    Some("Arguments must be separated by a comma"),
                )?;
                if punctuation(self.stream.current(), ")") {
                    break;
                }
            }

            let line = self.stream.current().line();
            let mut value = if definition {
                let token = self.stream.expect_with(
                    TokenKind::Name,
                    None,
                    Some("An argument must be a name"),
                )?;
                Node::name(token.value(), token.line())
            } else if self.stream.next_if(TokenKind::Spread).is_some() {
                self.parse_expression()?.with_attribute("spread", true)
            } else {
                self.parse_expression()?
            };

            let mut name = None;
            if named_allowed
                && (self.stream.next_if_value(TokenKind::Operator, "=").is_some()
                    || self.stream.next_if_value(TokenKind::Punctuation, ":").is_some())
            {
                if value.kind() != NodeKind::Name {
                    return Err(SyntaxError::new(
                        format!("A parameter name must be a string, \"{:?}\" given.", value.kind()),
                        line,
                    ));
                }
                name = Some(value.attr_str("name").to_owned());
                if definition {
                    value = self.primary()?;
                    if !value.is_constant_expression() {
                        return Err(SyntaxError::new(
                            "A default value for an argument must be a constant (a boolean, a string, a number, a sequence, or a mapping).",
                            line,
                        ));
                    }
                } else {
                    value = self.parse_expression()?;
                }
            }

            if definition {
                let (name, default) = match name {
                    Some(name) => (name, value),
                    None => (value.attr_str("name").to_owned(), Node::constant(ConstValue::Null, line)),
                };
                if args.has_node(&name) {
                    return Err(SyntaxError::new(
                        format!("Argument \"{name}\" is defined twice."),
                        line,
                    ));
                }
                args.set_node(name, default);
                continue;
            }

            match name {
                Some(name) => {
                    if args.has_node(&name) {
                        return Err(SyntaxError::new(
                            format!("Argument \"{name}\" is defined twice."),
                            line,
                        ));
                    }
                    seen_named = true;
                    args.set_node(name, value);
                }
                None => {
                    if seen_named {
                        return Err(SyntaxError::new(
                            "Positional arguments cannot be used after named arguments.",
                            line,
                        ));
                    }
                    args.set_node(positional.to_string(), value);
                    positional = positional.saturating_add(1);
                }
            }
        }

        self.stream.expect_with(
            TokenKind::Punctuation,
            Some(")"),
            Some("A list of arguments must be closed by a parenthesis"),
        )?;
        Ok(args)
    }

    fn function_node(&mut self, name: &str, line: usize) -> ParseResult<Node> {
        let arguments = self.parse_arguments(true, false)?;

        if let Some(imported) = self.imported_function(name) {
            return Ok(Node::new(NodeKind::MacroCall, line)
                .with_attribute("template", imported.template_var.as_str())
                .with_attribute("name", imported.name.as_str())
                .with_node("arguments", arguments));
        }

        let registry = self.registry;
        let Some(function) = registry.function(name) else {
            if self.ignore_unknown_callables {
                return Ok(Node::constant(ConstValue::Null, line));
            }
            // Possibly a macro defined further down in this template.
            self.module.tentative_macros.push((name.to_owned(), line));
            return Ok(Node::new(NodeKind::MacroCall, line)
                .with_attribute("template", "_self")
                .with_attribute("name", name)
                .with_node("arguments", arguments));
        };
        self.warn_deprecated(function, line);

        match function.builtin_kind() {
            Some(Builtin::Parent) => {
                let Some(block) = self.peek_block_stack().map(ToOwned::to_owned) else {
                    return Err(SyntaxError::new(
                        "Calling the \"parent\" function outside of a block is forbidden.",
                        line,
                    ));
                };
                if !self.has_parent() && !self.has_traits() {
                    return Err(SyntaxError::new(
                        "Calling the \"parent\" function on a template that does not call \"extends\" or \"use\" is forbidden.",
                        line,
                    ));
                }
                Ok(Node::new(NodeKind::Parent, line)
                    .with_attribute("name", block)
                    .with_attribute("output", false))
            }
            Some(Builtin::Block) => {
                let mut positional = take_positional(arguments);
                if positional.is_empty() {
                    return Err(SyntaxError::new(
                        "The \"block\" function takes one argument (the block name).",
                        line,
                    ));
                }
                let name_node = positional.remove(0);
                let mut node = Node::new(NodeKind::BlockFunction, line)
                    .with_node("name", name_node)
                    .with_attribute("output", false);
                if !positional.is_empty() {
                    node.set_node("template", positional.remove(0));
                }
                Ok(node)
            }
            Some(Builtin::Attribute) => {
                let mut positional = take_positional(arguments);
                if positional.len() < 2 {
                    return Err(SyntaxError::new(
                        "The \"attribute\" function takes at least two arguments (the variable and the attributes).",
                        line,
                    ));
                }
                let variable = positional.remove(0);
                let attribute = positional.remove(0);
                let mut call_args = Node::new(NodeKind::Nodes, line);
                if !positional.is_empty() {
                    call_args.set_node("0", positional.remove(0).with_attribute("spread", true));
                }
                Ok(Node::new(NodeKind::GetAttr, line)
                    .with_node("node", variable)
                    .with_node("attribute", attribute)
                    .with_node("arguments", call_args)
                    .with_attribute("type", "any"))
            }
            Some(Builtin::Default | Builtin::Defined | Builtin::Include) | None => {
                Ok(Node::new(NodeKind::Function, line)
                    .with_attribute("name", name)
                    .with_node("arguments", arguments))
            }
        }
    }

    fn parse_test(&mut self, node: Node) -> ParseResult<Node> {
        let token = self.stream.expect(TokenKind::Name)?;
        let line = token.line();
        let registry = self.registry;

        let mut name = token.value().to_owned();
        let mut test = registry.test(&name);
        if test.is_none() {
            let next = self.stream.current().clone();
            if next.test(TokenKind::Name) {
                let two_words = format!("{name} {}", next.value());
                if let Some(found) = registry.test(&two_words) {
                    self.stream.next()?;
                    name = two_words;
                    test = Some(found);
                }
            }
        }

        if test.is_none() && !self.ignore_unknown_callables {
            return Err(SyntaxError::new(format!("Unknown \"{name}\" test."), line)
                .with_suggestions(&name, registry.callable_names(CallableKind::Test)));
        }

        let arguments = if punctuation(self.stream.current(), "(") {
            self.parse_arguments(true, false)?
        } else if test.is_some_and(Callable::has_one_mandatory_argument) {
            let argument = self.primary()?;
            Node::list(vec![argument], line)
        } else {
            Node::new(NodeKind::Nodes, line)
        };

        let Some(test) = test else {
            return Ok(Node::constant(ConstValue::Bool(false), line));
        };
        self.warn_deprecated(test, line);

        if test.builtin_kind() == Some(Builtin::Defined) {
            return Ok(self.defined_test(node, line)?
                .with_attribute("name", name)
                .with_node("arguments", arguments));
        }

        Ok(Node::new(NodeKind::Test, line)
            .with_node("node", node)
            .with_attribute("name", name)
            .with_node("arguments", arguments))
    }

    /// Rewrites the operand of `is defined` so it is checked rather than
    /// evaluated.
    fn defined_test(&self, node: Node, line: usize) -> ParseResult<Node> {
        let mut node = node;
        let kind = node.kind();
        if kind == NodeKind::Name {
            if let Some(imported) = self.imported_function(node.attr_str("name")) {
                node = Node::new(NodeKind::MacroCall, node.line())
                    .with_attribute("template", imported.template_var.as_str())
                    .with_attribute("name", imported.name.as_str())
                    .with_node("arguments", Node::new(NodeKind::Nodes, line))
                    .with_attribute("is_defined_test", true);
            } else {
                node.set_attribute("is_defined_test", true);
            }
        } else if kind == NodeKind::GetAttr {
            ignore_strict_check(&mut node);
            node.set_attribute("is_defined_test", true);
        } else if kind == NodeKind::BlockFunction || kind == NodeKind::MacroCall {
            node.set_attribute("is_defined_test", true);
        } else if kind == NodeKind::Constant || kind == NodeKind::Array {
            node = Node::constant(ConstValue::Bool(true), node.line());
        } else {
            return Err(SyntaxError::new(
                "The \"defined\" test only works with simple variables.",
                line,
            ));
        }
        Ok(Node::new(NodeKind::Test, line).with_node("node", node))
    }

    /// Looks a filter or function up, logging deprecated ones.
    ///
    /// Returns `None` for unknown callables while parsing a guarded body
    /// whose callable is missing.
    fn lookup_callable(&self, kind: CallableKind, name: &str, line: usize) -> ParseResult<Option<&'env Callable>> {
        let registry = self.registry;
        match registry.callable(kind, name) {
            Some(callable) => {
                self.warn_deprecated(callable, line);
                Ok(Some(callable))
            }
            None if self.ignore_unknown_callables => Ok(None),
            None => Err(SyntaxError::new(format!("Unknown \"{name}\" {kind}."), line)
                .with_suggestions(name, registry.callable_names(kind))),
        }
    }

    fn warn_deprecated(&self, callable: &Callable, line: usize) {
        let Some(deprecation) = callable.deprecation() else {
            return;
        };
        let mut message = format!(
            "The \"{}\" {} is deprecated since",
            callable.name(),
            callable.kind()
        );
        if let Some(package) = &deprecation.package {
            message.push(' ');
            message.push_str(package);
        }
        message.push_str(&format!(" version {}.", deprecation.since));
        if let Some(alternative) = &deprecation.alternative {
            message.push_str(&format!(" Use \"{alternative}\" instead."));
        }
        warn!(template = self.stream.source().name(), line, "{message}");
    }

    /// Parses the targets of `set` or `for`: one or more comma-separated
    /// names.
    ///
    /// # Errors
    ///
    /// Anything other than an assignable name.
    pub fn parse_assignment_expression(&mut self) -> ParseResult<Vec<Node>> {
        let mut targets = Vec::new();
        loop {
            let token = self.stream.current().clone();
            if is_name_like(&token) {
                self.stream.next()?;
            } else {
                self.stream.expect_with(
                    TokenKind::Name,
                    None,
                    Some("Only variables can be assigned to"),
                )?;
            }
            targets.push(Node::assign_name(token.value(), token.line())?);
            if self.stream.next_if_value(TokenKind::Punctuation, ",").is_none() {
                return Ok(targets);
            }
        }
    }

    /// Parses comma-separated expressions.
    ///
    /// # Errors
    ///
    /// Any malformed expression.
    pub fn parse_multitarget_expression(&mut self) -> ParseResult<Vec<Node>> {
        let mut targets = vec![self.parse_expression()?];
        while self.stream.next_if_value(TokenKind::Punctuation, ",").is_some() {
            targets.push(self.parse_expression()?);
        }
        Ok(targets)
    }
}

/// Removes the positional entries (`"0"`, `"1"`, ...) of an argument list in
/// order.
fn take_positional(mut arguments: Node) -> Vec<Node> {
    let mut positional = Vec::new();
    let mut index = 0_usize;
    while let Some(node) = arguments.remove_node(&index.to_string()) {
        positional.push(node);
        index = index.saturating_add(1);
    }
    positional
}
