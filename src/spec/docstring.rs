//! Extraction of specs embedded in Python source files.
//!
//! A test script carries its spec in the module docstring, after a line
//! starting with `---`:
//!
//! ```text
//! #!/usr/bin/env python
//! """Check that resuming works.
//!
//! ---
//! id: 0.resume.01
//! plugin:
//!   - wandb
//! """
//! ```
//!
//! Only the leading string literal of the module counts as its docstring.
//! Comments, blank lines and a shebang may precede it.

/// Returns the cleaned module docstring of a Python source file, if any.
pub fn module_docstring(source: &str) -> Option<String> {
    let body = skip_preamble(source);
    let (quote, rest) = open_string(body)?;
    let end = rest.find(quote)?;
    Some(clean_docstring(&rest[..end]))
}

/// Returns the text after the first line starting with `---`.
pub fn yaml_section(text: &str) -> Option<String> {
    let mut lines = text.split('\n');
    lines.by_ref().find(|line| line.trim().starts_with("---"))?;
    Some(lines.collect::<Vec<_>>().join("\n"))
}

fn skip_preamble(source: &str) -> &str {
    let mut rest = source.strip_prefix('\u{feff}').unwrap_or(source);
    loop {
        let trimmed = rest.trim_start();
        if let Some(comment) = trimmed.strip_prefix('#') {
            rest = match comment.find('\n') {
                Some(idx) => &comment[idx + 1..],
                None => "",
            };
        } else {
            return trimmed;
        }
    }
}

/// Recognizes the opening of a string literal usable as a docstring.
///
/// Returns the closing delimiter and the text after the opening one.
fn open_string(text: &str) -> Option<(&'static str, &str)> {
    let unprefixed = match text.as_bytes().first()? {
        b'r' | b'R' | b'u' | b'U' => &text[1..],
        _ => text,
    };
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if let Some(rest) = unprefixed.strip_prefix(quote) {
            if quote.len() == 1 {
                // A single-quoted docstring ends at the line break.
                let line_end = rest.find('\n').unwrap_or(rest.len());
                return rest[..line_end].contains(quote).then_some((quote, rest));
            }
            return Some((quote, rest));
        }
    }
    None
}

/// Normalizes docstring indentation the way Python's `inspect.cleandoc` does.
///
/// The first line loses its leading whitespace. All further lines lose their
/// common indentation. Leading and trailing blank lines are dropped.
pub fn clean_docstring(doc: &str) -> String {
    let expanded = doc.replace('\t', "        ");
    let lines: Vec<&str> = expanded.lines().collect();
    let Some((first, rest)) = lines.split_first() else {
        return String::new();
    };

    let margin = rest
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    let mut cleaned: Vec<&str> = Vec::with_capacity(lines.len());
    cleaned.push(first.trim_start());
    for line in rest {
        cleaned.push(line.get(margin..).unwrap_or_else(|| line.trim_start()));
    }

    while cleaned.first().is_some_and(|l| l.trim().is_empty()) {
        cleaned.remove(0);
    }
    while cleaned.last().is_some_and(|l| l.trim().is_empty()) {
        cleaned.pop();
    }
    cleaned.join("\n")
}
