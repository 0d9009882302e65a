//! URL routing: a compressed trie over path fragments with typed
//! parameter branches. Routes register once at startup; the trie is
//! then frozen and optimized (runs of single-character literal edges
//! are merged), after which lookup is read-only and lock-free.

use std::sync::Arc;

use crate::http::request::Request;
use crate::http::response::{HandlerResult, Response};
use crate::http::status::Method;

/// Sentinel rule index answered for a registered `dir/` pattern hit
/// without its trailing slash; the connection answers 301.
pub const RULE_REDIRECT_SLASH: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamType {
    Int = 0,
    Uint = 1,
    Float = 2,
    Str = 3,
    Path = 4,
}

const PARAM_TOKENS: &[(&str, ParamType)] = &[
    ("<int>", ParamType::Int),
    ("<uint>", ParamType::Uint),
    ("<float>", ParamType::Float),
    ("<double>", ParamType::Float),
    ("<str>", ParamType::Str),
    ("<string>", ParamType::Str),
    ("<path>", ParamType::Path),
];

/// Positional typed parameters captured during lookup, one list per
/// type, in the order their slots appear in the pattern.
#[derive(Debug, Clone, Default)]
pub struct RouteParams {
    ints: Vec<i64>,
    uints: Vec<u64>,
    floats: Vec<f64>,
    strings: Vec<String>,
}

impl RouteParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.ints.clear();
        self.uints.clear();
        self.floats.clear();
        self.strings.clear();
    }

    pub fn int(&self, idx: usize) -> Option<i64> {
        self.ints.get(idx).copied()
    }

    pub fn uint(&self, idx: usize) -> Option<u64> {
        self.uints.get(idx).copied()
    }

    pub fn float(&self, idx: usize) -> Option<f64> {
        self.floats.get(idx).copied()
    }

    /// `<str>` and `<path>` captures share the string list.
    pub fn string(&self, idx: usize) -> Option<&str> {
        self.strings.get(idx).map(String::as_str)
    }
}

#[derive(Debug, Default, Clone)]
struct Node {
    children: Vec<(String, usize)>,
    param_children: [usize; 5],
    rule_index: u32,
}

impl Node {
    /// A node that only chains literals: safe to merge into its parent.
    fn is_simple(&self) -> bool {
        self.rule_index == 0 && self.param_children.iter().all(|c| *c == 0)
    }
}

#[derive(Debug, Clone)]
pub struct Trie {
    nodes: Vec<Node>,
}

impl Trie {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }

    fn new_node(&mut self) -> usize {
        self.nodes.push(Node::default());
        self.nodes.len() - 1
    }

    /// Register `pattern` for `rule_index`. Panics on duplicate
    /// registration; routes are added once, at startup.
    pub fn add(&mut self, pattern: &str, rule_index: u32) {
        let mut idx = 0;
        let bytes = pattern.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] == b'<' {
                if let Some((token, ptype)) = PARAM_TOKENS
                    .iter()
                    .find(|(token, _)| pattern[i..].starts_with(token))
                {
                    let slot = *ptype as usize;
                    if self.nodes[idx].param_children[slot] == 0 {
                        let child = self.new_node();
                        self.nodes[idx].param_children[slot] = child;
                    }
                    idx = self.nodes[idx].param_children[slot];
                    i += token.len();
                    continue;
                }
            }

            let piece = &pattern[i..i + 1];
            let existing = self.nodes[idx]
                .children
                .iter()
                .find(|(label, _)| label == piece)
                .map(|(_, child)| *child);
            idx = match existing {
                Some(child) => child,
                None => {
                    let child = self.new_node();
                    self.nodes[idx].children.push((piece.to_string(), child));
                    child
                }
            };
            i += 1;
        }

        match self.nodes[idx].rule_index {
            0 => self.nodes[idx].rule_index = rule_index,
            RULE_REDIRECT_SLASH => {
                // A real rule displaces the planted redirect sentinel.
                if rule_index != RULE_REDIRECT_SLASH {
                    self.nodes[idx].rule_index = rule_index;
                }
            }
            _ if rule_index == RULE_REDIRECT_SLASH => {}
            _ => panic!("a handler already exists for '{pattern}'"),
        }

        if rule_index != RULE_REDIRECT_SLASH && pattern.ends_with('/') && pattern.len() > 1 {
            self.add(&pattern[..pattern.len() - 1], RULE_REDIRECT_SLASH);
        }
    }

    /// Merge runs of simple single-character children so each edge
    /// carries a multi-character label. Idempotent.
    pub fn optimize(&mut self) {
        self.optimize_node(0);
    }

    fn optimize_node(&mut self, idx: usize) {
        for slot in 0..self.nodes[idx].param_children.len() {
            let child = self.nodes[idx].param_children[slot];
            if child != 0 {
                self.optimize_node(child);
            }
        }
        if self.nodes[idx].children.is_empty() {
            return;
        }

        let all_simple = self.nodes[idx]
            .children
            .iter()
            .all(|(_, child)| self.nodes[*child].is_simple());

        if all_simple {
            let children = std::mem::take(&mut self.nodes[idx].children);
            let mut merged = Vec::new();
            for (label, child) in children {
                for (sub_label, grandchild) in self.nodes[child].children.clone() {
                    merged.push((format!("{label}{sub_label}"), grandchild));
                }
            }
            self.nodes[idx].children = merged;
            self.optimize_node(idx);
        } else {
            let children: Vec<usize> = self.nodes[idx]
                .children
                .iter()
                .map(|(_, child)| *child)
                .collect();
            for child in children {
                self.optimize_node(child);
            }
        }
    }

    /// Depth-first lookup. Literal edges beat parameter edges at the
    /// same position, and the lowest non-zero rule index wins among
    /// overlapping literal branches; among parameter types the first
    /// match in preference order (int, uint, float, string, path)
    /// wins.
    pub fn find(&self, url: &str) -> (u32, RouteParams) {
        let mut params = RouteParams::new();
        self.find_from(url, 0, 0, &mut params)
    }

    fn find_from(
        &self,
        url: &str,
        idx: usize,
        pos: usize,
        params: &mut RouteParams,
    ) -> (u32, RouteParams) {
        let node = &self.nodes[idx];
        if pos == url.len() {
            return (node.rule_index, params.clone());
        }

        let mut found: u32 = 0;
        let mut found_params = RouteParams::new();
        let update = |ret: (u32, RouteParams), found: &mut u32, fparams: &mut RouteParams| {
            if ret.0 != 0 && (*found == 0 || *found > ret.0) {
                *found = ret.0;
                *fparams = ret.1;
            }
        };

        for (fragment, child) in &node.children {
            if url.as_bytes()[pos..].starts_with(fragment.as_bytes()) {
                let ret = self.find_from(url, *child, pos + fragment.len(), params);
                update(ret, &mut found, &mut found_params);
            }
        }
        if found != 0 {
            return (found, found_params);
        }

        // Parameter branches, in preference order: the first type that
        // yields a match wins.
        let rest = &url[pos..];

        let int_child = node.param_children[ParamType::Int as usize];
        if int_child != 0 {
            if let Some((value, used)) = parse_int_prefix(rest) {
                params.ints.push(value);
                let ret = self.find_from(url, int_child, pos + used, params);
                params.ints.pop();
                if ret.0 != 0 {
                    return ret;
                }
            }
        }

        let uint_child = node.param_children[ParamType::Uint as usize];
        if uint_child != 0 {
            if let Some((value, used)) = parse_uint_prefix(rest) {
                params.uints.push(value);
                let ret = self.find_from(url, uint_child, pos + used, params);
                params.uints.pop();
                if ret.0 != 0 {
                    return ret;
                }
            }
        }

        let float_child = node.param_children[ParamType::Float as usize];
        if float_child != 0 {
            if let Some((value, used)) = parse_float_prefix(rest) {
                params.floats.push(value);
                let ret = self.find_from(url, float_child, pos + used, params);
                params.floats.pop();
                if ret.0 != 0 {
                    return ret;
                }
            }
        }

        let str_child = node.param_children[ParamType::Str as usize];
        if str_child != 0 {
            let end = rest.find('/').unwrap_or(rest.len());
            if end > 0 {
                params.strings.push(rest[..end].to_string());
                let ret = self.find_from(url, str_child, pos + end, params);
                params.strings.pop();
                if ret.0 != 0 {
                    return ret;
                }
            }
        }

        let path_child = node.param_children[ParamType::Path as usize];
        if path_child != 0 && !rest.is_empty() {
            params.strings.push(rest.to_string());
            let ret = self.find_from(url, path_child, url.len(), params);
            params.strings.pop();
            if ret.0 != 0 {
                return ret;
            }
        }

        (0, RouteParams::new())
    }
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

/// strtoll-style signed prefix parse: optional sign, at least one
/// digit, stops at the first non-digit, refuses overflow.
fn parse_int_prefix(s: &str) -> Option<(i64, usize)> {
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut negative = false;
    match bytes.first() {
        Some(b'+') => i = 1,
        Some(b'-') => {
            negative = true;
            i = 1;
        }
        _ => {}
    }
    let start = i;
    let mut value: i64 = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        let digit = (bytes[i] - b'0') as i64;
        value = value.checked_mul(10)?.checked_add(digit)?;
        i += 1;
    }
    if i == start {
        return None;
    }
    Some((if negative { -value } else { value }, i))
}

fn parse_uint_prefix(s: &str) -> Option<(u64, usize)> {
    let bytes = s.as_bytes();
    let mut i = 0;
    if bytes.first() == Some(&b'+') {
        i = 1;
    }
    let start = i;
    let mut value: u64 = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        let digit = (bytes[i] - b'0') as u64;
        value = value.checked_mul(10)?.checked_add(digit)?;
        i += 1;
    }
    if i == start {
        return None;
    }
    Some((value, i))
}

/// strtod-style prefix parse: sign, digits, optional fraction and
/// exponent; at least one mantissa digit is required.
fn parse_float_prefix(s: &str) -> Option<(f64, usize)> {
    let bytes = s.as_bytes();
    let mut i = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        i = 1;
    }
    let mantissa_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if !s[mantissa_start..i].bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    // Exponent is consumed only when complete.
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && matches!(bytes[j], b'+' | b'-') {
            j += 1;
        }
        let exp_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > exp_start {
            i = j;
        }
    }
    s[..i].parse().ok().map(|v| (v, i))
}

/// Attribute bag attached to a route at registration.
#[derive(Debug, Clone, Default)]
pub struct RouteAttrs {
    /// Served by the static file server.
    pub is_static: bool,
    /// Parse the body as a form before invoking the handler.
    pub parse_form: bool,
    /// Roles an authorization middleware must see; empty means open.
    pub auth_roles: Vec<String>,
    /// Content-Type to stamp on the reply when the handler sets none.
    pub reply_type: Option<String>,
}

pub type Handler = Arc<dyn Fn(&mut Request, &mut Response) -> HandlerResult + Send + Sync>;

pub struct Route {
    pub pattern: String,
    pub methods: u32,
    pub attrs: RouteAttrs,
    pub(crate) handler: Handler,
}

impl Route {
    pub fn accepts(&self, method: Method) -> bool {
        self.methods & method.bit() != 0
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

/// Lookup outcome for one request line.
pub enum Resolution<'r> {
    Found {
        route: &'r Route,
        params: RouteParams,
    },
    RedirectSlash,
    MethodNotAllowed,
    NotFound,
}

pub struct Router {
    routes: Vec<Route>,
    trie: Trie,
    frozen: bool,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            trie: Trie::new(),
            frozen: false,
        }
    }

    /// Register a handler for `pattern` on the given methods. Returns
    /// the route so attributes can be adjusted in place.
    pub fn add<F>(&mut self, methods: &[Method], pattern: &str, handler: F) -> &mut Route
    where
        F: Fn(&mut Request, &mut Response) -> HandlerResult + Send + Sync + 'static,
    {
        assert!(!self.frozen, "routes cannot be added after freeze()");
        let rule_index = (self.routes.len() + 1) as u32;
        self.trie.add(pattern, rule_index);
        let mut mask = 0;
        for m in methods {
            mask |= m.bit();
        }
        self.routes.push(Route {
            pattern: pattern.to_string(),
            methods: mask,
            attrs: RouteAttrs::default(),
            handler: Arc::new(handler),
        });
        self.routes.last_mut().unwrap()
    }

    pub fn get<F>(&mut self, pattern: &str, handler: F) -> &mut Route
    where
        F: Fn(&mut Request, &mut Response) -> HandlerResult + Send + Sync + 'static,
    {
        self.add(&[Method::Get], pattern, handler)
    }

    pub fn post<F>(&mut self, pattern: &str, handler: F) -> &mut Route
    where
        F: Fn(&mut Request, &mut Response) -> HandlerResult + Send + Sync + 'static,
    {
        self.add(&[Method::Post], pattern, handler)
    }

    pub fn put<F>(&mut self, pattern: &str, handler: F) -> &mut Route
    where
        F: Fn(&mut Request, &mut Response) -> HandlerResult + Send + Sync + 'static,
    {
        self.add(&[Method::Put], pattern, handler)
    }

    pub fn delete<F>(&mut self, pattern: &str, handler: F) -> &mut Route
    where
        F: Fn(&mut Request, &mut Response) -> HandlerResult + Send + Sync + 'static,
    {
        self.add(&[Method::Delete], pattern, handler)
    }

    /// Optimize the trie and lock registration. Called once before the
    /// server starts accepting.
    pub fn freeze(&mut self) {
        if !self.frozen {
            self.trie.optimize();
            self.frozen = true;
        }
    }

    pub fn resolve(&self, method: Method, path: &str) -> Resolution<'_> {
        let (rule, params) = self.trie.find(path);
        match rule {
            0 => Resolution::NotFound,
            RULE_REDIRECT_SLASH => Resolution::RedirectSlash,
            _ => {
                let route = &self.routes[(rule - 1) as usize];
                if route.accepts(method) {
                    Resolution::Found { route, params }
                } else {
                    Resolution::MethodNotAllowed
                }
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie_with(patterns: &[&str]) -> Trie {
        let mut trie = Trie::new();
        for (i, p) in patterns.iter().enumerate() {
            trie.add(p, (i + 1) as u32);
        }
        trie
    }

    #[test]
    fn literal_lookup() {
        let trie = trie_with(&["/hello", "/hello/world"]);
        assert_eq!(trie.find("/hello").0, 1);
        assert_eq!(trie.find("/hello/world").0, 2);
        assert_eq!(trie.find("/helloo").0, 0);
        assert_eq!(trie.find("/hell").0, 0);
    }

    #[test]
    fn typed_params_capture() {
        let trie = trie_with(&["/add/<int>/<int>", "/take/<str>/<float>", "/files/<path>"]);

        let (rule, params) = trie.find("/add/3/4");
        assert_eq!(rule, 1);
        assert_eq!(params.int(0), Some(3));
        assert_eq!(params.int(1), Some(4));

        let (rule, params) = trie.find("/take/pi/3.14");
        assert_eq!(rule, 2);
        assert_eq!(params.string(0), Some("pi"));
        assert_eq!(params.float(0), Some(3.14));

        let (rule, params) = trie.find("/files/js/app.js");
        assert_eq!(rule, 3);
        assert_eq!(params.string(0), Some("js/app.js"));
    }

    #[test]
    fn negative_and_overflow_ints() {
        let trie = trie_with(&["/n/<int>"]);
        let (rule, params) = trie.find("/n/-42");
        assert_eq!(rule, 1);
        assert_eq!(params.int(0), Some(-42));
        // Overflowing i64 must not match the int branch.
        assert_eq!(trie.find("/n/92233720368547758080").0, 0);
    }

    #[test]
    fn literal_beats_parameter_at_same_prefix() {
        let mut trie = Trie::new();
        trie.add("/users/<str>", 1);
        trie.add("/users/admin", 2);
        assert_eq!(trie.find("/users/admin").0, 2);
        assert_eq!(trie.find("/users/bob").0, 1);
    }

    #[test]
    fn param_type_preference_order() {
        let mut trie = Trie::new();
        trie.add("/v/<str>", 5);
        trie.add("/v/<int>", 9);
        // Both branches match "/v/7"; the int branch is preferred even
        // though the string rule was registered first.
        let (rule, params) = trie.find("/v/7");
        assert_eq!(rule, 9);
        assert_eq!(params.int(0), Some(7));
        assert_eq!(trie.find("/v/x").0, 5);
    }

    #[test]
    fn optimize_preserves_lookups() {
        let patterns = [
            "/hello",
            "/hello/world",
            "/add/<int>/<int>",
            "/files/<path>",
            "/users/<str>/posts/<uint>",
            "/docs/",
        ];
        let mut trie = trie_with(&patterns);
        let inputs = [
            "/hello",
            "/hello/world",
            "/add/3/4",
            "/files/a/b/c.txt",
            "/users/ada/posts/7",
            "/docs/",
            "/docs",
            "/nothing",
        ];
        let before: Vec<u32> = inputs.iter().map(|u| trie.find(u).0).collect();
        trie.optimize();
        let after: Vec<u32> = inputs.iter().map(|u| trie.find(u).0).collect();
        assert_eq!(before, after);
        // A second pass must change nothing either.
        trie.optimize();
        let again: Vec<u32> = inputs.iter().map(|u| trie.find(u).0).collect();
        assert_eq!(before, again);
    }

    #[test]
    fn trailing_slash_plants_redirect() {
        let trie = trie_with(&["/docs/"]);
        assert_eq!(trie.find("/docs/").0, 1);
        assert_eq!(trie.find("/docs").0, RULE_REDIRECT_SLASH);
    }

    #[test]
    #[should_panic(expected = "already exists")]
    fn duplicate_pattern_panics() {
        let mut trie = Trie::new();
        trie.add("/a", 1);
        trie.add("/a", 2);
    }

    #[test]
    fn router_resolves_method_mismatch() {
        let mut router = Router::new();
        router.get("/hello", |_req, resp| {
            resp.append(b"Hello World").end(crate::http::Status::Ok);
            Ok(())
        });
        router.freeze();

        assert!(matches!(
            router.resolve(Method::Get, "/hello"),
            Resolution::Found { .. }
        ));
        assert!(matches!(
            router.resolve(Method::Post, "/hello"),
            Resolution::MethodNotAllowed
        ));
        assert!(matches!(
            router.resolve(Method::Get, "/nope"),
            Resolution::NotFound
        ));
    }
}
