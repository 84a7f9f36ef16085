use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use super::code::CodeMap;

/// Elements kept in the output; every other element is unwrapped.
pub const ALLOWED_TAGS: &[&str] = &[
    "p", "a", "code", "pre", "blockquote", "ul", "ol", "li", "strong", "em", "img", "h1", "h2",
    "h3", "h4", "h5", "h6",
];

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

// A comment, or a start/end tag whose name is followed by whitespace, `/` or `>`.
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<!--[\s\S]*?-->|<(/?)([A-Za-z][A-Za-z0-9-]*)((?:[\s/](?:[^>"']|"[^"]*"|'[^']*')*)?)>"#)
        .unwrap()
});

const ROOT: usize = 0;

#[derive(Debug)]
enum NodeKind {
    Root,
    Text(Range<usize>),
    Element {
        name: String,
        open: Range<usize>,
        close: Option<Range<usize>>,
    },
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Arena tree over a source string; nodes hold byte ranges into the source so
/// text and surviving tags are written back exactly as they were.
struct Tree<'a> {
    source: &'a str,
    nodes: Vec<Node>,
}

impl<'a> Tree<'a> {
    /// Lenient parse: unknown or unbalanced markup never fails. An end tag
    /// closes the nearest open element of the same name; elements left open
    /// simply have no end marker. A stray end tag becomes a childless element.
    /// Tags lying wholly inside code stay text.
    fn parse(source: &'a str) -> Self {
        let mut tree = Tree {
            source,
            nodes: vec![Node {
                kind: NodeKind::Root,
                parent: None,
                children: Vec::new(),
            }],
        };
        let code = CodeMap::new(source);
        let mut stack = vec![ROOT];
        let mut cursor = 0;

        for caps in TAG_RE.captures_iter(source) {
            let Some(m) = caps.get(0) else { continue };
            if code.covers(m.range()) {
                continue;
            }
            let top = *stack.last().unwrap_or(&ROOT);
            if m.start() > cursor {
                tree.push(top, NodeKind::Text(cursor..m.start()));
            }
            cursor = m.end();

            let Some(name) = caps.get(2) else {
                tree.push(top, NodeKind::Text(m.range()));
                continue;
            };
            let name = name.as_str().to_ascii_lowercase();

            if !caps[1].is_empty() {
                let open_at = stack
                    .iter()
                    .rposition(|&id| tree.element_name(id) == Some(name.as_str()));
                match open_at {
                    Some(depth) => {
                        if let NodeKind::Element { close, .. } = &mut tree.nodes[stack[depth]].kind {
                            *close = Some(m.range());
                        }
                        stack.truncate(depth);
                    }
                    None => {
                        tree.push(
                            top,
                            NodeKind::Element {
                                name,
                                open: m.range(),
                                close: None,
                            },
                        );
                    }
                }
                continue;
            }

            let self_closing = caps[3].trim_end().ends_with('/');
            let is_void = VOID_TAGS.contains(&name.as_str());
            let id = tree.push(
                top,
                NodeKind::Element {
                    name,
                    open: m.range(),
                    close: None,
                },
            );
            if !self_closing && !is_void {
                stack.push(id);
            }
        }

        if cursor < source.len() {
            let top = *stack.last().unwrap_or(&ROOT);
            tree.push(top, NodeKind::Text(cursor..source.len()));
        }

        tree
    }

    fn push(&mut self, parent: usize, kind: NodeKind) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node {
            kind,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        id
    }

    fn element_name(&self, id: usize) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Element { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Replace every element outside `allowed` by its children, in place.
    fn unwrap_disallowed(&mut self, allowed: &[&str]) {
        // Parents precede children in the arena, so a child always sees its
        // final parent by the time it is visited.
        for id in 1..self.nodes.len() {
            let disallowed = self
                .element_name(id)
                .is_some_and(|name| !allowed.contains(&name));
            if disallowed {
                self.unwrap(id);
            }
        }
    }

    fn unwrap(&mut self, id: usize) {
        let Some(parent) = self.nodes[id].parent.take() else {
            return;
        };
        let children = std::mem::take(&mut self.nodes[id].children);
        for &child in &children {
            self.nodes[child].parent = Some(parent);
        }
        let siblings = &mut self.nodes[parent].children;
        if let Some(pos) = siblings.iter().position(|&c| c == id) {
            siblings.splice(pos..=pos, children);
        }
    }

    fn render(&self) -> String {
        let mut out = String::with_capacity(self.source.len());
        self.render_into(ROOT, &mut out);
        out
    }

    fn render_into(&self, id: usize, out: &mut String) {
        let node = &self.nodes[id];
        match &node.kind {
            NodeKind::Root => {}
            NodeKind::Text(range) => out.push_str(&self.source[range.clone()]),
            NodeKind::Element { open, .. } => out.push_str(&self.source[open.clone()]),
        }
        for &child in &node.children {
            self.render_into(child, out);
        }
        if let NodeKind::Element {
            close: Some(close), ..
        } = &node.kind
        {
            out.push_str(&self.source[close.clone()]);
        }
    }
}

/// Strip HTML elements outside [`ALLOWED_TAGS`], keeping their content.
pub fn sanitize(body: &str) -> String {
    sanitize_with(body, ALLOWED_TAGS)
}

pub fn sanitize_with(body: &str, allowed: &[&str]) -> String {
    if body.is_empty() {
        return String::new();
    }
    let mut tree = Tree::parse(body);
    tree.unwrap_disallowed(allowed);
    tree.render()
}
