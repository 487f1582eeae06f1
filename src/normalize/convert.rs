//! HTML to readable-text conversion strategies.
//!
//! Two rule sets exist. [`RuleSet::Standard`] drops non-content tags,
//! promotes the document `<title>` to a heading marker, and renders links
//! and images in bracketed form. [`RuleSet::Bare`] performs raw tag
//! stripping only and is the retry path when the standard renderer fails.

use ego_tree::NodeRef;
use miette::Diagnostic;
use scraper::{Html, node::Node};
use thiserror::Error;

/// Tags whose subtrees never contribute readable content.
const DROPPED_TAGS: &[&str] = &["style", "script", "meta", "link", "textarea", "noscript"];

/// Nesting depth guard for the recursive renderer. Real pages stay far
/// below this; past it we bail out rather than risk the stack.
const MAX_DEPTH: usize = 256;

#[derive(Debug, Error, Diagnostic)]
pub enum ConvertError {
    #[error("markup nesting exceeds {MAX_DEPTH} levels (reached {depth})")]
    #[diagnostic(
        code(pagewright::normalize::too_deep),
        help("The bare rule set strips this document iteratively; let the fallback chain continue.")
    )]
    MarkupTooDeep { depth: usize },
}

/// Conversion rule sets, ordered from richest to most permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSet {
    Standard,
    Bare,
}

/// Converts an HTML document (or fragment) into readable text.
pub fn convert_html(html: &str, rules: RuleSet) -> Result<String, ConvertError> {
    let document = Html::parse_document(html);
    match rules {
        RuleSet::Standard => {
            let mut out = String::new();
            render(*document.root_element(), &mut out, 0)?;
            Ok(out)
        }
        RuleSet::Bare => Ok(strip_tags(&document)),
    }
}

fn render(node: NodeRef<'_, Node>, out: &mut String, depth: usize) -> Result<(), ConvertError> {
    if depth > MAX_DEPTH {
        return Err(ConvertError::MarkupTooDeep { depth });
    }
    match node.value() {
        Node::Text(text) => out.push_str(&text.text),
        Node::Element(element) => {
            let name = element.name();
            if DROPPED_TAGS.contains(&name) {
                return Ok(());
            }
            match name {
                "title" => {
                    let mut inner = String::new();
                    render_children(node, &mut inner, depth)?;
                    let title = inner.trim();
                    if !title.is_empty() {
                        out.push_str("# ");
                        out.push_str(title);
                        out.push_str("\n\n");
                    }
                }
                "a" => {
                    let mut label = String::new();
                    render_children(node, &mut label, depth)?;
                    match element.attr("href") {
                        Some(href) if !label.trim().is_empty() => {
                            out.push('[');
                            out.push_str(label.trim());
                            out.push_str("](");
                            out.push_str(href);
                            out.push(')');
                        }
                        _ => out.push_str(&label),
                    }
                }
                "img" => {
                    if let Some(src) = element.attr("src") {
                        let alt = element.attr("alt").unwrap_or_default();
                        out.push_str("![");
                        out.push_str(alt);
                        out.push_str("](");
                        out.push_str(src);
                        out.push(')');
                    }
                }
                "br" => out.push('\n'),
                "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                    let level = name[1..].parse::<usize>().unwrap_or(1);
                    let mut inner = String::new();
                    render_children(node, &mut inner, depth)?;
                    out.push_str(&"#".repeat(level));
                    out.push(' ');
                    out.push_str(inner.trim());
                    out.push_str("\n\n");
                }
                "li" => {
                    let mut inner = String::new();
                    render_children(node, &mut inner, depth)?;
                    out.push_str("- ");
                    out.push_str(inner.trim());
                    out.push('\n');
                }
                "p" | "div" | "section" | "article" | "blockquote" | "pre" | "table" | "tr"
                | "ul" | "ol" | "header" | "footer" | "main" | "nav" | "aside" | "figure" => {
                    render_children(node, out, depth)?;
                    out.push_str("\n\n");
                }
                _ => render_children(node, out, depth)?,
            }
        }
        // Comments, doctypes and processing instructions carry no content.
        _ => render_children(node, out, depth)?,
    }
    Ok(())
}

fn render_children(
    node: NodeRef<'_, Node>,
    out: &mut String,
    depth: usize,
) -> Result<(), ConvertError> {
    for child in node.children() {
        render(child, out, depth + 1)?;
    }
    Ok(())
}

/// Iterative text-node collection; immune to nesting depth.
fn strip_tags(document: &Html) -> String {
    let mut out = String::new();
    let mut stack = vec![document.tree.root()];
    while let Some(node) = stack.pop() {
        match node.value() {
            Node::Text(text) => out.push_str(&text.text),
            Node::Element(element) if DROPPED_TAGS.contains(&element.name()) => continue,
            _ => {}
        }
        // Reverse so children pop in document order.
        let children: Vec<_> = node.children().collect();
        for child in children.into_iter().rev() {
            stack.push(child);
        }
    }
    out
}
