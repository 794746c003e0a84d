//! The built-in statement tags.

use super::{EndTest, ParseResult, Parser};
use crate::ast::{Attribute, Node, NodeKind};
use crate::error::SyntaxError;
use crate::extension::{CallableKind, CoreTag};
use crate::token::{Token, TokenKind};
use crate::value::ConstValue;

/// Where an include-like tag goes: `ignore missing`, `with`, `only`.
struct IncludeArguments {
    variables: Option<Node>,
    only: bool,
    ignore_missing: bool,
}

impl Parser<'_> {
    pub(super) fn parse_core_tag(&mut self, tag: CoreTag, token: &Token) -> ParseResult<Option<Node>> {
        let line = token.line();
        match tag {
            CoreTag::Apply => self.parse_apply(line).map(Some),
            CoreTag::AutoEscape => self.parse_autoescape(line).map(Some),
            CoreTag::Block => self.parse_block(line).map(Some),
            CoreTag::Deprecated => self.parse_deprecated(line).map(Some),
            CoreTag::Do => {
                let expr = self.parse_expression()?;
                self.stream.expect(TokenKind::BlockEnd)?;
                Ok(Some(Node::new(NodeKind::Do, line).with_node("expr", expr)))
            }
            CoreTag::Embed => self.parse_embed(line).map(Some),
            CoreTag::Extends => {
                self.parse_extends(line)?;
                Ok(None)
            }
            CoreTag::Flush => {
                self.stream.expect(TokenKind::BlockEnd)?;
                Ok(Some(Node::new(NodeKind::Flush, line)))
            }
            CoreTag::For => self.parse_for(line).map(Some),
            CoreTag::From => self.parse_from(line).map(Some),
            CoreTag::Guard => self.parse_guard(line).map(Some),
            CoreTag::If => self.parse_if(line).map(Some),
            CoreTag::Import => self.parse_import(line).map(Some),
            CoreTag::Include => {
                let expr = self.parse_expression()?;
                let args = self.parse_include_arguments()?;
                Ok(Some(include_node(expr, args, line)))
            }
            CoreTag::Macro => {
                self.parse_macro(line)?;
                Ok(None)
            }
            CoreTag::Sandbox => self.parse_sandbox(line).map(Some),
            CoreTag::Set => self.parse_set(line).map(Some),
            CoreTag::Use => {
                self.parse_use(line)?;
                Ok(None)
            }
            CoreTag::With => self.parse_with(line).map(Some),
        }
    }

    fn end_tag(&mut self) -> ParseResult<()> {
        self.stream.expect(TokenKind::BlockEnd).map(|_| ())
    }

    fn parse_apply(&mut self, line: usize) -> ParseResult<Node> {
        let var = self.next_var_name("apply");
        let input = Node::name(var.as_str(), line);
        let filtered = self.parse_filter_expression_raw(input)?;
        self.end_tag()?;
        let body = self.subparse(
            Some(&EndTest {
                tag: "apply",
                line,
                names: &["endapply"],
            }),
            true,
        )?;
        self.end_tag()?;

        let capture = Node::new(NodeKind::Set, line)
            .with_node("names", Node::list(vec![Node::assign_name(&var, line)?], line))
            .with_node("values", body)
            .with_attribute("capture", true);
        Ok(Node::list(vec![capture, Node::print(filtered, line)], line))
    }

    fn parse_autoescape(&mut self, line: usize) -> ParseResult<Node> {
        let value = if self.stream.test(TokenKind::BlockEnd) {
            Attribute::Str("html".to_owned())
        } else {
            let expr = self.parse_expression()?;
            if let Some(ConstValue::String(strategy)) = expr.constant_value() {
                Attribute::Str(strategy.clone())
            } else if let Some(ConstValue::Bool(enabled)) = expr.constant_value() {
                if *enabled {
                    Attribute::Str("html".to_owned())
                } else {
                    Attribute::Bool(false)
                }
            } else {
                return Err(SyntaxError::new(
                    "An escaping strategy must be a string or false.",
                    expr.line(),
                ));
            }
        };
        self.end_tag()?;
        let body = self.subparse(
            Some(&EndTest {
                tag: "autoescape",
                line,
                names: &["endautoescape"],
            }),
            true,
        )?;
        self.end_tag()?;
        Ok(Node::new(NodeKind::AutoEscape, line)
            .with_attribute("value", value)
            .with_node("body", body))
    }

    fn parse_block(&mut self, line: usize) -> ParseResult<Node> {
        let name = self.stream.expect(TokenKind::Name)?.value().to_owned();
        if let Some(existing) = self.module.blocks.get(&name) {
            return Err(SyntaxError::new(
                format!(
                    "The block '{name}' has already been defined line {}.",
                    existing.line()
                ),
                self.stream.current().line(),
            ));
        }
        self.module.blocks.insert(
            name.clone(),
            Node::new(NodeKind::Block, line).with_attribute("name", name.as_str()),
        );
        self.push_local_scope();
        self.module.block_stack.push(name.clone());

        let body = self.parse_block_body(&name, line);

        self.module.block_stack.pop();
        self.pop_local_scope();
        let body = body?;

        self.module.blocks.insert(
            name.clone(),
            Node::new(NodeKind::Block, line)
                .with_attribute("name", name.as_str())
                .with_node("body", body),
        );
        Ok(Node::new(NodeKind::BlockReference, line).with_attribute("name", name))
    }

    fn parse_block_body(&mut self, name: &str, line: usize) -> ParseResult<Node> {
        let body = if self.stream.next_if(TokenKind::BlockEnd).is_some() {
            let body = self.subparse(
                Some(&EndTest {
                    tag: "block",
                    line,
                    names: &["endblock"],
                }),
                true,
            )?;
            if let Some(end) = self.stream.next_if(TokenKind::Name) {
                if end.value() != name {
                    return Err(SyntaxError::new(
                        format!(
                            "Expected endblock for block \"{name}\" (but \"{}\" given).",
                            end.value()
                        ),
                        end.line(),
                    ));
                }
            }
            body
        } else {
            let expr = self.parse_expression()?;
            Node::list(vec![Node::print(expr, line)], line)
        };
        self.end_tag()?;
        Ok(body)
    }

    fn parse_deprecated(&mut self, line: usize) -> ParseResult<Node> {
        let expr = self.parse_expression()?;
        let mut node = Node::new(NodeKind::Deprecated, line).with_node("expr", expr);
        while self.stream.test(TokenKind::Name) {
            let option = self.stream.next()?;
            self.stream.expect_value(TokenKind::Operator, "=")?;
            let value = self.parse_expression()?;
            match option.value() {
                "package" | "version" => node.set_node(option.value().to_owned(), value),
                other => {
                    return Err(SyntaxError::new(
                        format!("Unknown \"{other}\" option."),
                        option.line(),
                    ));
                }
            }
        }
        self.end_tag()?;
        Ok(node)
    }

    fn parse_embed(&mut self, line: usize) -> ParseResult<Node> {
        let parent = self.parse_expression()?;
        let args = self.parse_include_arguments()?;

        let parent_token = if parent.kind() == NodeKind::Constant {
            parent
                .constant_str()
                .map(|name| Token::new(TokenKind::String, name, line))
        } else if parent.kind() == NodeKind::Name {
            Some(Token::new(TokenKind::Name, parent.attr_str("name"), line))
        } else {
            None
        };
        let injected_real_parent = parent_token.is_some();
        let parent_token =
            parent_token.unwrap_or_else(|| Token::new(TokenKind::String, "__parent__", line));

        // A synthetic extends tag gives the embedded body a parent to refer to.
        self.stream.inject(vec![
            Token::new(TokenKind::BlockStart, "", line),
            Token::new(TokenKind::Name, "extends", line),
            parent_token,
            Token::new(TokenKind::BlockEnd, "", line),
        ]);

        let mut module = self.parse_embedded(&EndTest {
            tag: "embed",
            line,
            names: &["endembed"],
        })?;
        if !injected_real_parent {
            module.remove_node("parent");
            module.set_node("parent", parent);
        }
        let index = module.attr_int("index").unwrap_or_default();
        self.module.embedded.push(module);
        self.end_tag()?;

        let name = self.stream.source().name().to_owned();
        let mut node = Node::new(NodeKind::Embed, line)
            .with_attribute("name", name)
            .with_attribute("index", index)
            .with_attribute("only", args.only)
            .with_attribute("ignore_missing", args.ignore_missing);
        if let Some(variables) = args.variables {
            node.set_node("variables", variables);
        }
        Ok(node)
    }

    fn parse_extends(&mut self, line: usize) -> ParseResult<()> {
        if self.peek_block_stack().is_some() {
            return Err(SyntaxError::new("Cannot use \"extend\" in a block.", line));
        }
        if !self.is_main_scope() {
            return Err(SyntaxError::new("Cannot use \"extend\" in a macro.", line));
        }
        if self.module.parent.is_some() {
            return Err(SyntaxError::new("Multiple extends tags are forbidden.", line));
        }
        let parent = self.parse_expression()?;
        self.end_tag()?;
        self.module.parent = Some(parent);
        Ok(())
    }

    fn parse_for(&mut self, line: usize) -> ParseResult<Node> {
        let mut targets = self.parse_assignment_expression()?;
        self.stream.expect_value(TokenKind::Operator, "in")?;
        let seq = self.parse_expression()?;
        self.end_tag()?;

        let body = self.subparse(
            Some(&EndTest {
                tag: "for",
                line,
                names: &["else", "endfor"],
            }),
            false,
        )?;
        let else_body = if self.stream.next()?.value() == "else" {
            self.end_tag()?;
            Some(self.subparse(
                Some(&EndTest {
                    tag: "for",
                    line,
                    names: &["endfor"],
                }),
                true,
            )?)
        } else {
            None
        };
        self.end_tag()?;

        let (key, value) = if targets.len() > 1 {
            let key = targets.remove(0);
            let value = targets.remove(0);
            (key, value)
        } else {
            let value = targets.remove(0);
            (Node::assign_name("_key", line)?, value)
        };

        let mut node = Node::new(NodeKind::For, line)
            .with_node("key_target", key)
            .with_node("value_target", value)
            .with_node("seq", seq)
            .with_node("body", body)
            .with_attribute("with_loop", true);
        if let Some(else_body) = else_body {
            node.set_node("else", else_body);
        }
        Ok(node)
    }

    fn parse_from(&mut self, line: usize) -> ParseResult<Node> {
        let template = self.parse_expression()?;
        self.stream.expect_value(TokenKind::Name, "import")?;
        let mut targets = Vec::new();
        loop {
            let name = self.stream.expect(TokenKind::Name)?.value().to_owned();
            let alias = if self.stream.next_if_value(TokenKind::Name, "as").is_some() {
                self.stream.expect(TokenKind::Name)?.value().to_owned()
            } else {
                name.clone()
            };
            targets.push((name, alias));
            if self.stream.next_if_value(TokenKind::Punctuation, ",").is_none() {
                break;
            }
        }
        self.end_tag()?;

        let var = self.next_var_name("import");
        let node = Node::import(template, &var, self.is_main_scope(), line)?;
        for (name, alias) in targets {
            self.add_imported_function(&alias, &name, &var);
        }
        Ok(node)
    }

    fn parse_guard(&mut self, line: usize) -> ParseResult<Node> {
        let kind_token = self.stream.expect(TokenKind::Name)?;
        let kind = match kind_token.value() {
            "filter" => CallableKind::Filter,
            "function" => CallableKind::Function,
            "test" => CallableKind::Test,
            other => {
                return Err(SyntaxError::new(
                    format!("Supported guard types are function, filter and test, \"{other}\" given."),
                    kind_token.line(),
                ));
            }
        };
        let mut name = self.stream.expect(TokenKind::Name)?.value().to_owned();
        if kind == CallableKind::Test && self.stream.test(TokenKind::Name) {
            let two_words = format!("{name} {}", self.stream.current().value());
            if self.registry.test(&two_words).is_some() {
                self.stream.next()?;
                name = two_words;
            }
        }
        let exists = self.registry.callable(kind, &name).is_some();
        self.end_tag()?;

        let body = self.subparse_guarded(!exists, &["else", "endguard"], line, false)?;
        let else_body = if self.stream.next()?.value() == "else" {
            self.end_tag()?;
            Some(self.subparse_guarded(exists, &["endguard"], line, true)?)
        } else {
            None
        };
        self.end_tag()?;

        let chosen = if exists { Some(body) } else { else_body };
        Ok(chosen.unwrap_or_else(|| Node::list(Vec::new(), line)))
    }

    fn subparse_guarded(
        &mut self,
        ignore_unknown: bool,
        names: &[&str],
        line: usize,
        drop_needle: bool,
    ) -> ParseResult<Node> {
        let ignore = ignore_unknown || self.ignore_unknown_callables;
        let previous = std::mem::replace(&mut self.ignore_unknown_callables, ignore);
        let body = self.subparse(
            Some(&EndTest {
                tag: "guard",
                line,
                names,
            }),
            drop_needle,
        );
        self.ignore_unknown_callables = previous;
        body
    }

    fn parse_if(&mut self, line: usize) -> ParseResult<Node> {
        let fork = EndTest {
            tag: "if",
            line,
            names: &["elseif", "else", "endif"],
        };
        let expr = self.parse_expression()?;
        self.end_tag()?;
        let body = self.subparse(Some(&fork), false)?;
        let mut tests = vec![expr, body];
        let mut else_body = None;

        loop {
            let token = self.stream.next()?;
            match token.value() {
                "else" => {
                    self.end_tag()?;
                    else_body = Some(self.subparse(
                        Some(&EndTest {
                            tag: "if",
                            line,
                            names: &["endif"],
                        }),
                        false,
                    )?);
                }
                "elseif" => {
                    let expr = self.parse_expression()?;
                    self.end_tag()?;
                    let body = self.subparse(Some(&fork), false)?;
                    tests.push(expr);
                    tests.push(body);
                }
                "endif" => break,
                _ => {
                    return Err(SyntaxError::new(
                        format!(
                            "Unexpected end of template. Expected one of the following tags \"else\", \"elseif\", or \"endif\" to close the \"if\" block started at line {line}."
                        ),
                        token.line(),
                    ));
                }
            }
        }
        self.end_tag()?;

        let mut node = Node::new(NodeKind::If, line).with_node("tests", Node::list(tests, line));
        if let Some(else_body) = else_body {
            node.set_node("else", else_body);
        }
        Ok(node)
    }

    fn parse_import(&mut self, line: usize) -> ParseResult<Node> {
        let template = self.parse_expression()?;
        self.stream.expect_value(TokenKind::Name, "as")?;
        let alias = self.stream.expect(TokenKind::Name)?;
        self.end_tag()?;
        let node = Node::import(template, alias.value(), self.is_main_scope(), line)?;
        self.add_imported_template(alias.value());
        Ok(node)
    }

    fn parse_include_arguments(&mut self) -> ParseResult<IncludeArguments> {
        let mut ignore_missing = false;
        if self.stream.next_if_value(TokenKind::Name, "ignore").is_some() {
            self.stream.expect_value(TokenKind::Name, "missing")?;
            ignore_missing = true;
        }
        let variables = if self.stream.next_if_value(TokenKind::Name, "with").is_some() {
            Some(self.parse_expression()?)
        } else {
            None
        };
        let only = self.stream.next_if_value(TokenKind::Name, "only").is_some();
        self.end_tag()?;
        Ok(IncludeArguments {
            variables,
            only,
            ignore_missing,
        })
    }

    fn parse_macro(&mut self, line: usize) -> ParseResult<()> {
        let name = self.stream.expect(TokenKind::Name)?.value().to_owned();
        let arguments = self.parse_arguments(true, true)?;
        self.end_tag()?;

        self.push_local_scope();
        let body = self.subparse(
            Some(&EndTest {
                tag: "macro",
                line,
                names: &["endmacro"],
            }),
            true,
        );
        self.pop_local_scope();
        let body = body?;
        if let Some(end) = self.stream.next_if(TokenKind::Name) {
            if end.value() != name {
                return Err(SyntaxError::new(
                    format!(
                        "Expected endmacro for macro \"{name}\" (but \"{}\" given).",
                        end.value()
                    ),
                    end.line(),
                ));
            }
        }
        self.end_tag()?;

        let node = Node::macro_node(&name, Node::body(body), arguments, line)?;
        self.module.macros.insert(name, node);
        Ok(())
    }

    fn parse_sandbox(&mut self, line: usize) -> ParseResult<Node> {
        self.end_tag()?;
        let body = self.subparse(
            Some(&EndTest {
                tag: "sandbox",
                line,
                names: &["endsandbox"],
            }),
            true,
        )?;
        self.end_tag()?;

        for child in body.children() {
            let blank = child.kind() == NodeKind::Text
                && child.attr_str("data").chars().all(char::is_whitespace);
            if !blank && child.kind() != NodeKind::Include {
                return Err(SyntaxError::new(
                    "Only \"include\" tags are allowed within a \"sandbox\" section.",
                    child.line(),
                ));
            }
        }
        Ok(Node::new(NodeKind::Sandbox, line).with_node("body", body))
    }

    fn parse_set(&mut self, line: usize) -> ParseResult<Node> {
        let names = self.parse_assignment_expression()?;
        let (values, capture) = if self.stream.next_if_value(TokenKind::Operator, "=").is_some() {
            let values = self.parse_multitarget_expression()?;
            self.end_tag()?;
            if names.len() != values.len() {
                return Err(SyntaxError::new(
                    "When using set, you must have the same number of variables and assignments.",
                    self.stream.current().line(),
                ));
            }
            (Node::list(values, line), false)
        } else {
            if names.len() > 1 {
                return Err(SyntaxError::new(
                    "When using set with a block, you cannot have a multi-target.",
                    self.stream.current().line(),
                ));
            }
            self.end_tag()?;
            let body = self.subparse(
                Some(&EndTest {
                    tag: "set",
                    line,
                    names: &["endset"],
                }),
                true,
            )?;
            self.end_tag()?;
            (body, true)
        };
        Ok(Node::new(NodeKind::Set, line)
            .with_node("names", Node::list(names, line))
            .with_node("values", values)
            .with_attribute("capture", capture))
    }

    fn parse_use(&mut self, line: usize) -> ParseResult<()> {
        let template = self.parse_expression()?;
        if template.constant_str().is_none() {
            return Err(SyntaxError::new(
                "The template references in a \"use\" statement must be a string.",
                self.stream.current().line(),
            ));
        }

        let mut targets = Node::new(NodeKind::Nodes, line);
        if self.stream.next_if_value(TokenKind::Name, "with").is_some() {
            loop {
                let name = self.stream.expect(TokenKind::Name)?;
                let alias = if self.stream.next_if_value(TokenKind::Name, "as").is_some() {
                    self.stream.expect(TokenKind::Name)?.value().to_owned()
                } else {
                    name.value().to_owned()
                };
                targets.set_node(name.value().to_owned(), Node::string(alias, name.line()));
                if self.stream.next_if_value(TokenKind::Punctuation, ",").is_none() {
                    break;
                }
            }
        }
        self.end_tag()?;

        self.module.traits.push(
            Node::new(NodeKind::Trait, line)
                .with_node("template", template)
                .with_node("targets", targets),
        );
        Ok(())
    }

    fn parse_with(&mut self, line: usize) -> ParseResult<Node> {
        let mut variables = None;
        let mut only = false;
        if !self.stream.test(TokenKind::BlockEnd) {
            variables = Some(self.parse_expression()?);
            only = self.stream.next_if_value(TokenKind::Name, "only").is_some();
        }
        self.end_tag()?;
        let body = self.subparse(
            Some(&EndTest {
                tag: "with",
                line,
                names: &["endwith"],
            }),
            true,
        )?;
        self.end_tag()?;

        let mut node = Node::new(NodeKind::With, line)
            .with_node("body", body)
            .with_attribute("only", only);
        if let Some(variables) = variables {
            node.set_node("variables", variables);
        }
        Ok(node)
    }
}

fn include_node(expr: Node, args: IncludeArguments, line: usize) -> Node {
    let mut node = Node::new(NodeKind::Include, line)
        .with_node("expr", expr)
        .with_attribute("only", args.only)
        .with_attribute("ignore_missing", args.ignore_missing);
    if let Some(variables) = args.variables {
        node.set_node("variables", variables);
    }
    node
}
