//! Shell-like command-line splitting: supports single- and double-quoted
//! arguments, whitespace-separated otherwise.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitCommandError {
    #[error("unbalanced quotes in command")]
    UnbalancedQuotes,
}

/// Splits `input` into argv, honoring `'...'` and `"..."` quoting. No shell
/// expansion (globs, variables, pipes) is performed; the command is handed
/// directly to the OS process spawner.
pub fn split(input: &str) -> Result<Vec<String>, SplitCommandError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => {
                quote = None;
            }
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        args.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err(SplitCommandError::UnbalancedQuotes);
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(split("sh -c echo").unwrap(), vec!["sh", "-c", "echo"]);
    }

    #[test]
    fn honors_double_quotes_with_embedded_spaces() {
        assert_eq!(
            split(r#"sh -c "echo hello world""#).unwrap(),
            vec!["sh", "-c", "echo hello world"]
        );
    }

    #[test]
    fn honors_single_quotes() {
        assert_eq!(split("sh -c 'echo boom >&2'").unwrap(), vec!["sh", "-c", "echo boom >&2"]);
    }

    #[test]
    fn rejects_unbalanced_quotes() {
        assert_eq!(split(r#"sh -c "unterminated"#), Err(SplitCommandError::UnbalancedQuotes));
    }

    #[test]
    fn collapses_repeated_whitespace() {
        assert_eq!(split("  a   b  "), Ok(vec!["a".to_string(), "b".to_string()]));
    }
}
