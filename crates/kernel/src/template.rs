//! Textual macro substitution for kernel templates.
//!
//! The expander is deliberately dumb: it walks the template line by line,
//! leaves preprocessor-style directive lines alone and replaces every literal
//! occurrence of the macro token elsewhere. Replacements are never re-scanned.

/// First non-whitespace character of a line that must be copied verbatim.
pub const DIRECTIVE_MARKER: char = '#';

/// Macro token the bundled template uses for the iteration formula.
pub const ITERATOR_TOKEN: &str = "iterator";

/// Expands `macro_token` into `replacement` on every non-directive line.
///
/// The output has exactly one `\n` after each input line, so line order and
/// line count are preserved even when the input has no trailing newline.
pub fn expand(template: &str, macro_token: &str, replacement: &str) -> String {
    let mut expanded = String::with_capacity(template.len() + replacement.len());
    for line in template.lines() {
        if macro_token.is_empty() || is_directive(line) {
            expanded.push_str(line);
        } else {
            expanded.push_str(&line.replace(macro_token, replacement));
        }
        expanded.push('\n');
    }
    expanded
}

/// `true` for lines whose first non-whitespace character is [`DIRECTIVE_MARKER`].
pub fn is_directive(line: &str) -> bool {
    line.trim_start().starts_with(DIRECTIVE_MARKER)
}

/// Counts literal occurrences of `token` on non-directive lines.
pub fn count_token_outside_directives(source: &str, token: &str) -> usize {
    if token.is_empty() {
        return 0;
    }
    source
        .lines()
        .filter(|line| !is_directive(line))
        .map(|line| line.matches(token).count())
        .sum()
}
