// Macro expansion for recipe command lists and output paths.
// Supported forms: `<name>` substitutes a defined variable (empty string if
// undefined) and the guarded `<a?b>` picks `a` when it is defined, else `b`.

use std::collections::BTreeMap;

pub const MACRO_VERSION: &str = "version";
pub const MACRO_DATETIME: &str = "datetime";
pub const MACRO_EXTRA: &str = "extra";

/// Variable table for one expansion pass, keyed without the enclosers.
pub type MacroSpecs = BTreeMap<String, String>;

/// Expand every macro occurrence in `input`.
///
/// Text that looks like a macro but does not parse (`<1x>`, `< >`, an
/// unterminated `<`) is passed through untouched.
pub fn expand(input: &str, specs: &MacroSpecs) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];

        match parse_macro(tail) {
            Some((parsed, consumed)) => {
                out.push_str(&resolve(&parsed, specs));
                rest = &tail[consumed..];
            }
            None => {
                out.push('<');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

enum Parsed {
    Plain(String),
    Guarded(String, String),
}

/// Parse one macro at the start of `s` (which begins with '<').
/// Returns the parsed form and the number of bytes consumed.
fn parse_macro(s: &str) -> Option<(Parsed, usize)> {
    let mut chars = s.char_indices().skip(1).peekable();

    let first = take_word(s, &mut chars)?;
    match chars.peek().copied() {
        Some((i, '>')) => Some((Parsed::Plain(first), i + 1)),
        Some((_, '?')) => {
            chars.next();
            let second = take_word(s, &mut chars)?;
            match chars.peek().copied() {
                Some((i, '>')) => Some((Parsed::Guarded(first, second), i + 1)),
                _ => None,
            }
        }
        _ => None,
    }
}

fn take_word(
    s: &str,
    chars: &mut std::iter::Peekable<impl Iterator<Item = (usize, char)>>,
) -> Option<String> {
    let start = chars.peek()?.0;
    let mut end = start;
    while let Some(&(i, c)) = chars.peek() {
        if c.is_ascii_alphabetic() {
            end = i + c.len_utf8();
            chars.next();
        } else {
            break;
        }
    }
    if end == start {
        return None;
    }
    Some(s[start..end].to_string())
}

fn resolve(parsed: &Parsed, specs: &MacroSpecs) -> String {
    match parsed {
        Parsed::Plain(name) => specs.get(name).cloned().unwrap_or_default(),
        Parsed::Guarded(a, b) => match specs.get(a) {
            Some(v) => v.clone(),
            None => specs.get(b).cloned().unwrap_or_default(),
        },
    }
}

/// Normalize backslash path separators to forward slashes.
pub fn normalize_separators(input: &str) -> String {
    input.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(pairs: &[(&str, &str)]) -> MacroSpecs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_plain_macro() {
        let s = specs(&[("version", "v1.2")]);
        assert_eq!(expand("build-<version>.bin", &s), "build-v1.2.bin");
    }

    #[test]
    fn test_undefined_macro_becomes_empty() {
        let s = specs(&[]);
        assert_eq!(expand("out-<version>", &s), "out-");
    }

    #[test]
    fn test_guarded_macro_prefers_first() {
        let s = specs(&[("extra", "hotfix"), ("version", "v2")]);
        assert_eq!(expand("<extra?version>", &s), "hotfix");
    }

    #[test]
    fn test_guarded_macro_falls_back() {
        let s = specs(&[("version", "v2")]);
        assert_eq!(expand("<extra?version>", &s), "v2");
    }

    #[test]
    fn test_non_macro_text_untouched() {
        let s = specs(&[("version", "v2")]);
        assert_eq!(expand("a < b && c > d", &s), "a < b && c > d");
        assert_eq!(expand("tail<", &s), "tail<");
    }

    #[test]
    fn test_multiple_occurrences() {
        let s = specs(&[("version", "v2"), ("datetime", "2020")]);
        assert_eq!(expand("<version>/<datetime>/<version>", &s), "v2/2020/v2");
    }

    #[test]
    fn test_separator_normalization() {
        assert_eq!(normalize_separators(r"out\sub\file"), "out/sub/file");
    }
}
