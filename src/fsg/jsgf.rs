//! JSGF grammar compiler. Covers the subset real command grammars use: a grammar declaration,
//! public and private rules, sequences, `|` alternatives with optional `/weight/` prefixes,
//! `(...)` groups, `[...]` optionals and `<rule>` references. Imports and Kleene operators are
//! rejected up front rather than half-supported.
//!
//! Compilation is a recursive walk over the parsed rule bodies, allocating FSG states as it
//! goes; rule references expand inline, with a stack guarding against recursive grammars (which
//! a finite-state machine can't represent anyway).
use crate::error::{Error, Result};
use crate::fsg::model::{FsgBuilder, FsgModel};
use crate::logmath::LogMath;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    RuleRef(String),
    Weight(f64),
    Bar,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Equals,
    Semi,
    Public,
}

#[derive(Debug, Clone)]
enum Expr {
    Word(String),
    RuleRef(String),
    Seq(Vec<Expr>),
    Alt(Vec<(f64, Expr)>),
    Opt(Box<Expr>),
}

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    // Order matters: rule refs and weights before bare words.
    Regex::new(
        r#"(?x)
        (?P<comment>//[^\n]*|/\*(?s:.*?)\*/)
      | (?P<ruleref><[A-Za-z0-9_.\-]+>)
      | (?P<weight>/[0-9]*\.?[0-9]+/)
      | (?P<punct>[|()\[\]=;*+])
      | (?P<word>[^\s|()\[\]=;/<>]+)
    "#,
    )
    .unwrap()
});

fn tokenize(body: &str) -> Result<Vec<Token>> {
    let mut out = Vec::new();
    for cap in TOKEN_RE.captures_iter(body) {
        if cap.name("comment").is_some() {
            continue;
        }
        if let Some(m) = cap.name("ruleref") {
            let name = &m.as_str()[1..m.as_str().len() - 1];
            out.push(Token::RuleRef(name.to_string()));
        } else if let Some(m) = cap.name("weight") {
            let w: f64 = m.as_str().trim_matches('/').parse().map_err(|_| {
                Error::parse(0, format!("bad weight {:?}", m.as_str()))
            })?;
            out.push(Token::Weight(w));
        } else if let Some(m) = cap.name("punct") {
            out.push(match m.as_str() {
                "|" => Token::Bar,
                "(" => Token::LParen,
                ")" => Token::RParen,
                "[" => Token::LBracket,
                "]" => Token::RBracket,
                "=" => Token::Equals,
                ";" => Token::Semi,
                "*" | "+" => {
                    return Err(Error::parse(
                        0,
                        "Kleene operators are not supported in grammars",
                    ))
                }
                _ => unreachable!(),
            });
        } else if let Some(m) = cap.name("word") {
            match m.as_str() {
                "public" => out.push(Token::Public),
                w => out.push(Token::Word(w.to_string())),
            }
        }
    }
    Ok(out)
}

struct Parser {
    toks: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: &Token) -> Result<()> {
        match self.next() {
            Some(t) if &t == tok => Ok(()),
            other => Err(Error::parse(0, format!("expected {tok:?}, got {other:?}"))),
        }
    }

    /// alternatives := weighted-seq ( '|' weighted-seq )*
    fn parse_alt(&mut self) -> Result<Expr> {
        let mut branches = Vec::new();
        loop {
            let weight = match self.peek() {
                Some(Token::Weight(w)) => {
                    let w = *w;
                    self.next();
                    w
                }
                _ => 1.0,
            };
            branches.push((weight, self.parse_seq()?));
            match self.peek() {
                Some(Token::Bar) => {
                    self.next();
                }
                _ => break,
            }
        }
        if branches.len() == 1 && branches[0].0 == 1.0 {
            Ok(branches.pop().unwrap().1)
        } else {
            Ok(Expr::Alt(branches))
        }
    }

    fn parse_seq(&mut self) -> Result<Expr> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Word(w)) => {
                    items.push(Expr::Word(w.clone()));
                    self.next();
                }
                Some(Token::RuleRef(r)) => {
                    items.push(Expr::RuleRef(r.clone()));
                    self.next();
                }
                Some(Token::LParen) => {
                    self.next();
                    let inner = self.parse_alt()?;
                    self.expect(&Token::RParen)?;
                    items.push(inner);
                }
                Some(Token::LBracket) => {
                    self.next();
                    let inner = self.parse_alt()?;
                    self.expect(&Token::RBracket)?;
                    items.push(Expr::Opt(Box::new(inner)));
                }
                _ => break,
            }
        }
        if items.is_empty() {
            return Err(Error::parse(0, "empty rule expansion"));
        }
        if items.len() == 1 {
            Ok(items.pop().unwrap())
        } else {
            Ok(Expr::Seq(items))
        }
    }
}

pub struct Jsgf {
    grammar_name: String,
    rules: BTreeMap<String, Expr>,
    public_rules: Vec<String>,
}

impl Jsgf {
    pub fn parse(text: &str) -> Result<Self> {
        // Header: "#JSGF V1.0 [encoding [locale]];" then "grammar name;"
        let mut rest = text;
        if let Some(nl) = rest.find(';') {
            let header = &rest[..nl];
            if !header.trim_start().starts_with("#JSGF") {
                return Err(Error::parse(1, "missing #JSGF header"));
            }
            rest = &rest[nl + 1..];
        } else {
            return Err(Error::parse(1, "missing #JSGF header"));
        }
        if rest.contains("import") {
            // Check before tokenizing rules so the message is specific.
            if Regex::new(r"(?m)^\s*import\b").unwrap().is_match(rest) {
                return Err(Error::parse(0, "JSGF imports are not supported"));
            }
        }

        let toks = tokenize(rest)?;
        let mut p = Parser { toks, pos: 0 };

        // grammar declaration
        match (p.next(), p.next(), p.next()) {
            (Some(Token::Word(kw)), Some(Token::Word(name)), Some(Token::Semi))
                if kw == "grammar" =>
            {
                let grammar_name = name;
                let mut rules = BTreeMap::new();
                let mut public_rules = Vec::new();
                while p.peek().is_some() {
                    let public = matches!(p.peek(), Some(Token::Public));
                    if public {
                        p.next();
                    }
                    let name = match p.next() {
                        Some(Token::RuleRef(r)) => r,
                        other => {
                            return Err(Error::parse(
                                0,
                                format!("expected <rule> name, got {other:?}"),
                            ))
                        }
                    };
                    p.expect(&Token::Equals)?;
                    let body = p.parse_alt()?;
                    p.expect(&Token::Semi)?;
                    if public {
                        public_rules.push(name.clone());
                    }
                    rules.insert(name, body);
                }
                if public_rules.is_empty() {
                    return Err(Error::parse(0, "grammar has no public rules"));
                }
                Ok(Self {
                    grammar_name,
                    rules,
                    public_rules,
                })
            }
            other => Err(Error::parse(
                0,
                format!("expected grammar declaration, got {other:?}"),
            )),
        }
    }

    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn name(&self) -> &str {
        &self.grammar_name
    }

    pub fn public_rules(&self) -> &[String] {
        &self.public_rules
    }

    /// Resolve a rule name as given in config: fully qualified (`grammar.rule`) or bare.
    fn resolve(&self, name: &str) -> Option<&Expr> {
        if let Some(e) = self.rules.get(name) {
            return Some(e);
        }
        let prefix = format!("{}.", self.grammar_name);
        if let Some(bare) = name.strip_prefix(&prefix) {
            return self.rules.get(bare);
        }
        None
    }

    /// Compile a rule (the configured top rule, or the first public one) to an FSG.
    pub fn build_fsg(&self, toprule: Option<&str>, lmath: Arc<LogMath>) -> Result<FsgModel> {
        let rule_name = match toprule {
            Some(r) => r.to_string(),
            None => self.public_rules[0].clone(),
        };
        let body = self.resolve(&rule_name).ok_or_else(|| {
            Error::parse(0, format!("no such rule <{rule_name}> in grammar"))
        })?;

        let name = format!("{}.{}", self.grammar_name, rule_name);
        let mut b = FsgBuilder::new(name, 2, 0, 1, lmath);
        let mut stack = vec![rule_name.clone()];
        self.compile(body, 0, 1, &mut b, &mut stack)?;
        let fsg = b.build()?;
        info!(rule = %rule_name, states = fsg.n_state(), "JSGF rule compiled");
        Ok(fsg)
    }

    fn compile(
        &self,
        expr: &Expr,
        from: u32,
        to: u32,
        b: &mut FsgBuilder,
        stack: &mut Vec<String>,
    ) -> Result<()> {
        match expr {
            Expr::Word(w) => {
                b.add_arc(from, to, w, 1.0);
            }
            Expr::RuleRef(r) => {
                let body = self
                    .resolve(r)
                    .ok_or_else(|| Error::parse(0, format!("undefined rule <{r}>")))?;
                if stack.iter().any(|s| s == r) {
                    return Err(Error::parse(
                        0,
                        format!("recursive rule <{r}> cannot compile to a finite grammar"),
                    ));
                }
                stack.push(r.clone());
                self.compile(body, from, to, b, stack)?;
                stack.pop();
            }
            Expr::Seq(items) => {
                let mut cur = from;
                for (i, item) in items.iter().enumerate() {
                    let next = if i + 1 == items.len() {
                        to
                    } else {
                        b.new_state()
                    };
                    self.compile(item, cur, next, b, stack)?;
                    cur = next;
                }
            }
            Expr::Alt(branches) => {
                let total: f64 = branches.iter().map(|(w, _)| *w).sum();
                for (w, branch) in branches {
                    let prob = if total > 0.0 { w / total } else { 1.0 };
                    debug!(prob, "alternative branch");
                    match branch {
                        Expr::Word(word) => b.add_arc(from, to, word, prob),
                        other => {
                            // Route through a fresh state so the branch probability lands on
                            // one epsilon rather than being double-counted inside the branch.
                            let mid = b.new_state();
                            b.add_eps(from, mid, prob);
                            self.compile(other, mid, to, b, stack)?;
                        }
                    }
                }
            }
            Expr::Opt(inner) => {
                b.add_eps(from, to, 0.5);
                let mid = b.new_state();
                b.add_eps(from, mid, 0.5);
                self.compile(inner, mid, to, b, stack)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lmath() -> Arc<LogMath> {
        Arc::new(LogMath::new(1.0001, 0).unwrap())
    }

    const GOFORWARD: &str = "\
#JSGF V1.0;
grammar goforward;

public <move> = go forward (one | two | ten) meters;

public <move2> = go <direction> <distance> [meters];

<direction> = forward | backward;

<distance> = one | two | three | ten;
";

    #[test]
    fn parses_rules_and_publics() {
        let g = Jsgf::parse(GOFORWARD).unwrap();
        assert_eq!(g.name(), "goforward");
        assert_eq!(g.public_rules(), &["move", "move2"]);
        assert!(g.resolve("direction").is_some());
        assert!(g.resolve("goforward.distance").is_some());
        assert!(g.resolve("nope").is_none());
    }

    #[test]
    fn compiles_linear_rule() {
        let g = Jsgf::parse(GOFORWARD).unwrap();
        let fsg = g.build_fsg(Some("move"), lmath()).unwrap();
        // Start state leads with "go" only.
        let arcs = fsg.out_arcs(fsg.start_state());
        assert_eq!(arcs.len(), 1);
        assert_eq!(fsg.word_str(fsg.arc(arcs[0]).word.unwrap()), "go");
        assert!(fsg.reaches_final(fsg.final_state()));
    }

    #[test]
    fn toprule_selects_rule_with_refs_and_optionals() {
        let g = Jsgf::parse(GOFORWARD).unwrap();
        let fsg = g.build_fsg(Some("goforward.move2"), lmath()).unwrap();
        // The optional [meters] means a path skipping it must reach final.
        assert!(fsg.n_state() >= 4);
        let words: Vec<&str> = (0..fsg.n_words() as u32).map(|w| fsg.word_str(w)).collect();
        assert!(words.contains(&"backward"));
        assert!(words.contains(&"meters"));
    }

    #[test]
    fn alternative_weights_normalize() {
        let text = "\
#JSGF V1.0;
grammar w;
public <top> = /3/ yes | /1/ no;
";
        let g = Jsgf::parse(text).unwrap();
        let fsg = g.build_fsg(None, lmath()).unwrap();
        let lm = lmath();
        let arcs = fsg.out_arcs(fsg.start_state());
        assert_eq!(arcs.len(), 2);
        for &a in arcs {
            let arc = fsg.arc(a);
            let p = lm.exp(arc.logprob);
            match fsg.word_str(arc.word.unwrap()) {
                "yes" => assert!((p - 0.75).abs() < 1e-3),
                "no" => assert!((p - 0.25).abs() < 1e-3),
                w => panic!("unexpected word {w}"),
            }
        }
    }

    #[test]
    fn rejects_unsupported_constructs() {
        let recursive = "\
#JSGF V1.0;
grammar r;
public <top> = word <top>;
";
        let g = Jsgf::parse(recursive).unwrap();
        assert!(g.build_fsg(None, lmath()).is_err());

        let import = "\
#JSGF V1.0;
grammar i;
import <other.rule>;
public <top> = word;
";
        assert!(Jsgf::parse(import).is_err());

        let kleene = "\
#JSGF V1.0;
grammar k;
public <top> = word *;
";
        assert!(Jsgf::parse(kleene).is_err());

        assert!(Jsgf::parse("grammar nohdr;\npublic <top> = x;\n").is_err());
    }
}
