//! Recognition of the `final_answer(<expr>)` call pattern.
//!
//! This is a narrow grammar check, not a parser. A snippet is in final-answer
//! form when its last line starts at column 0 and its last statement on that
//! line is exactly `final_answer(<expr>)`:
//!
//! ```text
//! final_answer(x + 3)
//! x = 2; final_answer(x + 3)
//! y = compute()
//! final_answer({"y": y})   # trailing comment allowed
//! ```
//!
//! The call must take one positional argument and must not sit behind a
//! same-line compound header such as `if x: y = 1; final_answer(y)`.
//! Anything else runs as ordinary code, where the in-sandbox `final_answer`
//! function still ends the snippet with Python's own control flow.

const CALL_PREFIX: &str = "final_answer(";

const COMPOUND_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "for", "while", "with", "try", "except", "finally", "def", "class",
    "async", "match", "case",
];

/// A snippet split into the code to run first and the answer expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalAnswerCall {
    /// Code preceding the call; may be empty.
    pub prelude: String,
    /// Argument expression, trimmed.
    pub expr: String,
}

/// Split `code` into prelude and answer expression if it ends in a
/// top-level `final_answer(<expr>)` call.
pub fn parse_final_answer(code: &str) -> Option<FinalAnswerCall> {
    let code = code.trim_end();
    let line_start = code.rfind('\n').map_or(0, |idx| idx + 1);
    let line = &code[line_start..];
    if line.is_empty() || line.starts_with(char::is_whitespace) {
        return None;
    }

    let segments = split_statements(line)?;
    let (&(seg_start, seg_end), earlier) = segments.split_last()?;
    // A header earlier on the line makes the call part of its body.
    if earlier
        .iter()
        .any(|&(s, e)| opens_compound(line[s..e].trim()))
    {
        return None;
    }
    let segment = line[seg_start..seg_end].trim();
    let expr = call_argument(segment)?;

    let prelude = code[..line_start + seg_start]
        .trim_end()
        .trim_end_matches(';')
        .trim_end()
        .to_string();
    Some(FinalAnswerCall {
        prelude,
        expr: expr.to_string(),
    })
}

/// Byte ranges of the non-empty `;`-separated statements on a line,
/// ignoring separators inside strings or brackets and stopping at a comment.
///
/// Returns `None` when the line ends inside a string or with unbalanced
/// brackets.
fn split_statements(line: &str) -> Option<Vec<(usize, usize)>> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut end = line.len();

    for (idx, ch) in line.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            ';' if depth == 0 => {
                segments.push((start, idx));
                start = idx + 1;
            }
            '#' => {
                end = idx;
                break;
            }
            _ => {}
        }
    }
    if quote.is_some() || depth != 0 {
        return None;
    }
    segments.push((start, end));
    segments.retain(|&(s, e)| !line[s..e].trim().is_empty());
    Some(segments)
}

/// Whether a statement is the header of a compound statement, so that what
/// follows it on the same line only runs conditionally or repeatedly.
///
/// Any top-level `:` not owned by a `lambda` counts, which also rejects
/// annotated assignments; those snippets simply run as plain code.
fn opens_compound(statement: &str) -> bool {
    let keyword = statement
        .split(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
        .next()
        .unwrap_or_default();
    if COMPOUND_KEYWORDS.contains(&keyword) {
        return true;
    }

    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut open_lambdas = 0usize;
    let mut word = String::new();
    let mut chars = statement.chars().peekable();

    while let Some(ch) = chars.next() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        if ch.is_alphanumeric() || ch == '_' {
            word.push(ch);
            continue;
        }
        if word == "lambda" && depth == 0 {
            open_lambdas += 1;
        }
        word.clear();
        match ch {
            '\'' | '"' => quote = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ':' if depth == 0 && chars.peek() != Some(&'=') => {
                if open_lambdas == 0 {
                    return true;
                }
                open_lambdas -= 1;
            }
            _ => {}
        }
    }
    false
}

/// Argument text of a statement that is exactly one `final_answer(...)` call
/// with a single positional argument.
///
/// Keyword, starred or multiple arguments are left to the in-sandbox
/// function, so they return `None`.
fn call_argument(segment: &str) -> Option<&str> {
    let inner = segment.strip_prefix(CALL_PREFIX)?;
    let mut depth = 1i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut prev: Option<char> = None;
    let mut chars = inner.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        let before = prev.replace(ch);
        match ch {
            '\'' | '"' => quote = Some(ch),
            ',' if depth == 1 => return None,
            '=' if depth == 1 => {
                let compares = matches!(before, Some('=' | '<' | '>' | '!' | ':'))
                    || chars.peek().is_some_and(|&(_, next)| next == '=');
                if !compares {
                    return None;
                }
            }
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    let rest = &inner[idx + ch.len_utf8()..];
                    if !rest.trim().is_empty() {
                        return None;
                    }
                    let expr = inner[..idx].trim();
                    return (!expr.is_empty() && !expr.starts_with('*')).then_some(expr);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(code: &str) -> (String, String) {
        let call = parse_final_answer(code).expect("final answer form");
        (call.prelude, call.expr)
    }

    #[test]
    fn bare_call() {
        assert_eq!(parsed("final_answer(5)"), (String::new(), "5".to_string()));
    }

    #[test]
    fn same_line_prelude() {
        assert_eq!(
            parsed("x = 2; final_answer(x + 3)"),
            ("x = 2".to_string(), "x + 3".to_string())
        );
    }

    #[test]
    fn multi_line_prelude_and_trailing_comment() {
        let code = "import math\ny = math.sqrt(16)\nfinal_answer({'y': (y, [1, 2])})  # done\n\n";
        assert_eq!(
            parsed(code),
            (
                "import math\ny = math.sqrt(16)".to_string(),
                "{'y': (y, [1, 2])}".to_string()
            )
        );
    }

    #[test]
    fn strings_with_parens_and_semicolons() {
        assert_eq!(
            parsed(r#"final_answer("a ) ; b \" (")"#),
            (String::new(), r#""a ) ; b \" (""#.to_string())
        );
    }

    #[test]
    fn trailing_semicolon_is_allowed() {
        assert_eq!(parsed("final_answer(1);"), (String::new(), "1".to_string()));
    }

    #[test]
    fn rejects_other_shapes() {
        for code in [
            "print('hi')",
            "    final_answer(1)",
            "if done: final_answer(1)",
            "final_answer(1); print('after')",
            "final_answer(1)(2)",
            "final_answer()",
            "final_answer(1",
            "# final_answer(1)",
            "x = final_answer(1)",
            "final_answer(1)\nprint('after')",
            "def f():\n    final_answer(1)",
            "if False: x = 1; final_answer(1)",
            "for i in range(3): print(i); final_answer(i)",
            "while True: x = 1; final_answer(x)",
            "with open('f') as fh: data = fh.read(); final_answer(data)",
            "final_answer(answer=5)",
            "final_answer(5,)",
            "final_answer(1, 2)",
            "final_answer(*values)",
            "",
        ] {
            assert!(parse_final_answer(code).is_none(), "should reject {code:?}");
        }
    }

    /// Only a header keyword or a bare top-level colon marks a compound
    /// statement; lambdas, slices, dict literals and walrus do not.
    #[test]
    fn simple_statements_before_the_call_are_kept() {
        assert_eq!(
            parsed("f = lambda v: v * 2; final_answer(f(3))"),
            ("f = lambda v: v * 2".to_string(), "f(3)".to_string())
        );
        assert_eq!(
            parsed("d = {'k': xs[1:2]}; final_answer(d)"),
            ("d = {'k': xs[1:2]}".to_string(), "d".to_string())
        );
        assert_eq!(
            parsed("iffy = 1; final_answer(iffy)"),
            ("iffy = 1".to_string(), "iffy".to_string())
        );
        assert!(parse_final_answer("(n := 4); final_answer(n)").is_some());
    }

    #[test]
    fn comparisons_and_nested_commas_stay_one_argument() {
        assert_eq!(parsed("final_answer(a == b)").1, "a == b");
        assert_eq!(parsed("final_answer(a <= b != c)").1, "a <= b != c");
        assert_eq!(parsed("final_answer((y := 5))").1, "(y := 5)");
        assert_eq!(parsed("final_answer([1, 2])").1, "[1, 2]");
        assert_eq!(parsed("final_answer(f(x, k=1))").1, "f(x, k=1)");
        assert_eq!(parsed("final_answer('a,b=c')").1, "'a,b=c'");
    }
}
