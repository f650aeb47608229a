//! Content expressions: the grammar describing a node's permitted children.
//!
//! ```text
//! expr   := seq ('|' seq)*
//! seq    := term+
//! term   := atom ('*' | '+' | '?' | '{n}' | '{n,}' | '{n,m}')*
//! atom   := name | '(' expr ')'
//! ```
//!
//! Names refer to node types or groups. An expression is parsed once into an
//! [`Expr`] and compiled into a Thompson NFA ([`ContentMatcher`]). The
//! converter keeps one [`MatchState`] per open container, so nesting decisions
//! are made by the automaton rather than by lookahead.

use std::collections::{BTreeSet, HashSet, VecDeque};

/// Parsed content expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Name(String),
    Seq(Vec<Expr>),
    Choice(Vec<Expr>),
    Repeat {
        expr: Box<Expr>,
        min: usize,
        max: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Number(usize),
    Open,
    Close,
    Pipe,
    Star,
    Plus,
    Question,
    BraceOpen,
    BraceClose,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '|' => {
                chars.next();
                tokens.push(Token::Pipe);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '?' => {
                chars.next();
                tokens.push(Token::Question);
            }
            '{' => {
                chars.next();
                tokens.push(Token::BraceOpen);
            }
            '}' => {
                chars.next();
                tokens.push(Token::BraceClose);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            c if c.is_ascii_digit() => {
                let mut n = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        n.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = n.parse().map_err(|_| format!("number too large: {n}"))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '-' {
                        name.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Name(name));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

/// Upper bound on a `{n,m}` count. Counted repeats are unrolled into NFA
/// states, so the bound also bounds compiled size.
pub const MAX_REPEAT: usize = 1024;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token) -> Result<(), String> {
        match self.bump() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(format!("expected {want:?}, found {t:?}")),
            None => Err(format!("expected {want:?}, found end of expression")),
        }
    }

    fn choice(&mut self) -> Result<Expr, String> {
        let mut alts = vec![self.seq()?];
        while self.peek() == Some(&Token::Pipe) {
            self.bump();
            alts.push(self.seq()?);
        }
        Ok(if alts.len() == 1 {
            alts.remove(0)
        } else {
            Expr::Choice(alts)
        })
    }

    fn seq(&mut self) -> Result<Expr, String> {
        let mut terms = Vec::new();
        while matches!(self.peek(), Some(Token::Name(_)) | Some(Token::Open)) {
            terms.push(self.term()?);
        }
        match terms.len() {
            0 => Err(match self.peek() {
                Some(t) => format!("expected a name or '(', found {t:?}"),
                None => "expected a name or '(', found end of expression".to_string(),
            }),
            1 => Ok(terms.remove(0)),
            _ => Ok(Expr::Seq(terms)),
        }
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut expr = self.atom()?;
        loop {
            let (min, max) = match self.peek() {
                Some(Token::Star) => {
                    self.bump();
                    (0, None)
                }
                Some(Token::Plus) => {
                    self.bump();
                    (1, None)
                }
                Some(Token::Question) => {
                    self.bump();
                    (0, Some(1))
                }
                Some(Token::BraceOpen) => {
                    self.bump();
                    self.range()?
                }
                _ => break,
            };
            expr = Expr::Repeat {
                expr: Box::new(expr),
                min,
                max,
            };
        }
        Ok(expr)
    }

    fn range(&mut self) -> Result<(usize, Option<usize>), String> {
        let min = match self.bump() {
            Some(Token::Number(n)) => n,
            other => return Err(format!("expected a number in range, found {other:?}")),
        };
        let max = match self.peek() {
            Some(Token::Comma) => {
                self.bump();
                match self.peek() {
                    Some(Token::Number(n)) => {
                        let n = *n;
                        self.bump();
                        Some(n)
                    }
                    _ => None,
                }
            }
            _ => Some(min),
        };
        self.expect(Token::BraceClose)?;
        if let Some(n) = std::iter::once(min).chain(max).find(|n| *n > MAX_REPEAT) {
            return Err(format!("repetition count {n} exceeds {MAX_REPEAT}"));
        }
        if let Some(max) = max {
            if max < min {
                return Err(format!("range {{{min},{max}}} has max below min"));
            }
        }
        Ok((min, max))
    }

    fn atom(&mut self) -> Result<Expr, String> {
        match self.bump() {
            Some(Token::Name(n)) => Ok(Expr::Name(n)),
            Some(Token::Open) => {
                let inner = self.choice()?;
                self.expect(Token::Close)?;
                Ok(inner)
            }
            other => Err(format!("expected a name or '(', found {other:?}")),
        }
    }
}

/// Parse a content expression. An empty (or all-whitespace) expression means
/// the node has no content and yields `None`.
pub fn parse(src: &str) -> Result<Option<Expr>, String> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Ok(None);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.choice()?;
    if let Some(t) = parser.peek() {
        return Err(format!("unexpected trailing token {t:?}"));
    }
    Ok(Some(expr))
}

impl Expr {
    /// Every name mentioned by the expression.
    pub fn names(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_names(&mut out);
        out
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Name(n) => out.push(n),
            Expr::Seq(items) | Expr::Choice(items) => {
                items.iter().for_each(|e| e.collect_names(out))
            }
            Expr::Repeat { expr, .. } => expr.collect_names(out),
        }
    }
}

// ── NFA ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct NfaState {
    eps: Vec<usize>,
    /// (label index, target state)
    edges: Vec<(usize, usize)>,
}

/// A transition label: the name as written plus the concrete types it admits.
#[derive(Debug, Clone)]
struct Label {
    types: Vec<String>,
}

/// Set of live NFA states after consuming a prefix of children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchState(BTreeSet<usize>);

/// Compiled content expression.
#[derive(Debug, Clone)]
pub struct ContentMatcher {
    source: String,
    labels: Vec<Label>,
    states: Vec<NfaState>,
    start: usize,
    accept: usize,
}

impl ContentMatcher {
    /// Compile an expression. `resolve` maps a name to the node types it
    /// admits (a node type maps to itself, a group to its members).
    pub fn compile<F>(source: &str, resolve: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<Vec<String>>,
    {
        let expr = parse(source)?;
        let mut m = ContentMatcher {
            source: source.trim().to_string(),
            labels: Vec::new(),
            states: vec![NfaState::default()],
            start: 0,
            accept: 0,
        };
        if let Some(expr) = expr {
            for name in expr.names() {
                if resolve(name).map_or(true, |t| t.is_empty()) {
                    return Err(format!("unknown node type or group '{name}'"));
                }
            }
            let end = m.build(&expr, 0, &resolve);
            m.accept = end;
        }
        Ok(m)
    }

    /// The expression text this matcher was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the node admits no children at all.
    pub fn is_leaf(&self) -> bool {
        self.labels.is_empty()
    }

    fn new_state(&mut self) -> usize {
        self.states.push(NfaState::default());
        self.states.len() - 1
    }

    fn build<F>(&mut self, expr: &Expr, from: usize, resolve: &F) -> usize
    where
        F: Fn(&str) -> Option<Vec<String>>,
    {
        match expr {
            Expr::Name(name) => {
                let types = resolve(name).unwrap_or_default();
                self.labels.push(Label { types });
                let label = self.labels.len() - 1;
                let to = self.new_state();
                self.states[from].edges.push((label, to));
                to
            }
            Expr::Seq(items) => items
                .iter()
                .fold(from, |cur, item| self.build(item, cur, resolve)),
            Expr::Choice(alts) => {
                let end = self.new_state();
                for alt in alts {
                    let branch = self.new_state();
                    self.states[from].eps.push(branch);
                    let alt_end = self.build(alt, branch, resolve);
                    self.states[alt_end].eps.push(end);
                }
                end
            }
            Expr::Repeat { expr, min, max } => {
                let mut cur = from;
                for _ in 0..*min {
                    cur = self.build(expr, cur, resolve);
                }
                match max {
                    None => {
                        let hub = self.new_state();
                        self.states[cur].eps.push(hub);
                        let body_end = self.build(expr, hub, resolve);
                        self.states[body_end].eps.push(hub);
                        hub
                    }
                    Some(max) => {
                        for _ in *min..*max {
                            let skip = self.new_state();
                            self.states[cur].eps.push(skip);
                            let body_end = self.build(expr, cur, resolve);
                            self.states[body_end].eps.push(skip);
                            cur = skip;
                        }
                        cur
                    }
                }
            }
        }
    }

    fn closure(&self, seed: impl IntoIterator<Item = usize>) -> MatchState {
        let mut set = BTreeSet::new();
        let mut stack: Vec<usize> = seed.into_iter().collect();
        while let Some(s) = stack.pop() {
            if set.insert(s) {
                stack.extend(self.states[s].eps.iter().copied());
            }
        }
        MatchState(set)
    }

    /// State before any child has been consumed.
    pub fn start(&self) -> MatchState {
        self.closure([self.start])
    }

    /// Consume one child of type `ty`. `None` when the type is not permitted here.
    pub fn step(&self, state: &MatchState, ty: &str) -> Option<MatchState> {
        let targets: Vec<usize> = state
            .0
            .iter()
            .flat_map(|&s| self.states[s].edges.iter())
            .filter(|(label, _)| self.labels[*label].types.iter().any(|t| t == ty))
            .map(|&(_, to)| to)
            .collect();
        if targets.is_empty() {
            None
        } else {
            Some(self.closure(targets))
        }
    }

    /// True when the children consumed so far form a complete valid sequence.
    pub fn accepts(&self, state: &MatchState) -> bool {
        state.0.contains(&self.accept)
    }

    /// Check a whole child-type sequence.
    pub fn matches<S: AsRef<str>>(&self, seq: &[S]) -> bool {
        self.first_mismatch(seq).is_none()
    }

    /// Index of the first child that cannot be consumed, or `Some(len)` when
    /// every child was consumed but the sequence is incomplete.
    pub fn first_mismatch<S: AsRef<str>>(&self, seq: &[S]) -> Option<usize> {
        let mut state = self.start();
        for (i, ty) in seq.iter().enumerate() {
            match self.step(&state, ty.as_ref()) {
                Some(next) => state = next,
                None => return Some(i),
            }
        }
        if self.accepts(&state) {
            None
        } else {
            Some(seq.len())
        }
    }

    /// Types that may be consumed next from `state`, in label order.
    pub fn allowed(&self, state: &MatchState) -> Vec<&str> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for &s in &state.0 {
            for (label, _) in &self.states[s].edges {
                for t in &self.labels[*label].types {
                    if seen.insert(t.as_str()) {
                        out.push(t.as_str());
                    }
                }
            }
        }
        out
    }

    /// True if any label of this expression admits `ty`.
    pub fn mentions(&self, ty: &str) -> bool {
        self.labels.iter().any(|l| l.types.iter().any(|t| t == ty))
    }

    /// Shortest sequence of types that completes `state`, choosing for each
    /// transition the first admitted type for which `usable` holds.
    pub fn shortest_completion<F>(&self, state: &MatchState, usable: F) -> Option<Vec<String>>
    where
        F: Fn(&str) -> bool,
    {
        self.shortest_path(state, &usable, |s| s == self.accept)
    }

    /// Shortest sequence of types after which `ty` may be consumed.
    pub fn shortest_prefix_for<F>(&self, state: &MatchState, ty: &str, usable: F) -> Option<Vec<String>>
    where
        F: Fn(&str) -> bool,
    {
        self.shortest_path(state, &usable, |s| {
            self.states[s]
                .edges
                .iter()
                .any(|(label, _)| self.labels[*label].types.iter().any(|t| t == ty))
        })
    }

    /// 0-1 BFS: epsilon edges cost nothing, labelled edges cost one child.
    fn shortest_path<F, G>(&self, state: &MatchState, usable: &F, goal: G) -> Option<Vec<String>>
    where
        F: Fn(&str) -> bool,
        G: Fn(usize) -> bool,
    {
        let n = self.states.len();
        let mut dist = vec![usize::MAX; n];
        let mut prev: Vec<Option<(usize, Option<String>)>> = vec![None; n];
        let mut queue = VecDeque::new();
        for &s in &state.0 {
            dist[s] = 0;
            queue.push_back(s);
        }
        while let Some(s) = queue.pop_front() {
            if goal(s) {
                let mut path = Vec::new();
                let mut cur = s;
                while let Some((p, label)) = &prev[cur] {
                    if let Some(t) = label {
                        path.push(t.clone());
                    }
                    cur = *p;
                }
                path.reverse();
                return Some(path);
            }
            for &e in &self.states[s].eps {
                if dist[s] < dist[e] {
                    dist[e] = dist[s];
                    prev[e] = Some((s, None));
                    queue.push_front(e);
                }
            }
            for &(label, to) in &self.states[s].edges {
                let Some(ty) = self.labels[label].types.iter().find(|t| usable(t)) else {
                    continue;
                };
                if dist[s] + 1 < dist[to] {
                    dist[to] = dist[s] + 1;
                    prev[to] = Some((s, Some(ty.clone())));
                    queue.push_back(to);
                }
            }
        }
        None
    }
}
