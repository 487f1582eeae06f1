//! Whitespace and link-syntax cleanup applied to every normalized document.

use std::sync::LazyLock;

use regex::Regex;

/// `[ ![alt](img) ](href)` split across lines, collapsed to one line.
static IMAGE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[\s*(!\[[^\]]*\]\([^)]*\))\s*\]\s*\(\s*([^)]+?)\s*\)")
        .expect("image link pattern")
});

/// `[text](href)` with line breaks inside the brackets or parens.
static BROKEN_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[\s*([^\]]+?)\s*\]\s*\(\s*([^)]+?)\s*\)").expect("link pattern"));

static LEADING_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]+").expect("leading whitespace pattern"));

static EXCESS_BLANKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank line pattern"));

static INNER_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("inner whitespace pattern"));

/// Tidies link syntax and whitespace. Never fails; empty in, empty out.
///
/// Steps, in order: collapse a link wrapping an inline image onto one line,
/// collapse any remaining multi-line link syntax, strip leading whitespace
/// from each line, and squeeze runs of three or more blank lines down to two.
pub fn tidy_text(input: &str) -> String {
    let text = IMAGE_LINK.replace_all(input, |caps: &regex::Captures<'_>| {
        let image = INNER_WS.replace_all(&caps[1], " ");
        format!("[{}]({})", image.trim(), caps[2].trim())
    });
    let text = BROKEN_LINK.replace_all(&text, |caps: &regex::Captures<'_>| {
        let label = INNER_WS.replace_all(&caps[1], " ");
        format!("[{}]({})", label.trim(), caps[2].trim())
    });
    let text = LEADING_WS.replace_all(&text, "");
    let text = EXCESS_BLANKS.replace_all(&text, "\n\n");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_link_broken_across_lines() {
        let input = "see [the\n  guide\n](https://example.com/guide) for more";
        assert_eq!(
            tidy_text(input),
            "see [the guide](https://example.com/guide) for more"
        );
    }

    #[test]
    fn collapses_link_wrapping_an_image() {
        let input = "[\n  ![logo](https://example.com/logo.png)\n](https://example.com)";
        assert_eq!(
            tidy_text(input),
            "[![logo](https://example.com/logo.png)](https://example.com)"
        );
    }

    #[test]
    fn strips_leading_whitespace_per_line() {
        assert_eq!(tidy_text("  alpha\n\tbeta"), "alpha\nbeta");
    }

    #[test]
    fn squeezes_blank_runs_to_two() {
        assert_eq!(tidy_text("a\n\n\n\n\nb"), "a\n\nb");
        // Exactly two blank lines are left alone.
        assert_eq!(tidy_text("a\n\nb"), "a\n\nb");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(tidy_text(""), "");
        assert_eq!(tidy_text("   \n  \n"), "");
    }

    #[test]
    fn intact_links_are_untouched() {
        let input = "[guide](https://example.com/guide)";
        assert_eq!(tidy_text(input), input);
    }
}
