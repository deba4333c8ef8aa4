use crate::error::{OmnidexError, OmnidexResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Keyword or identifier; keywords are matched case-insensitively.
    Word(String),
    /// Double-quoted string literal, quotes stripped.
    Str(String),
    /// Numeric literal, kept raw so the engine can tell int from float.
    Num(String),
    /// Single-character punctuation: `( ) , = *`.
    Symbol(char),
    /// The text-match operator `@@`.
    AtAt,
    /// The similarity operator `<->`.
    Distance,
}

pub fn tokenize(sql: &str) -> OmnidexResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' | ';' => i += 1,
            '(' | ')' | ',' | '=' | '*' => {
                tokens.push(Token::Symbol(c));
                i += 1;
            }
            '@' if chars.get(i + 1) == Some(&'@') => {
                tokens.push(Token::AtAt);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'-') && chars.get(i + 2) == Some(&'>') => {
                tokens.push(Token::Distance);
                i += 3;
            }
            '"' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                        None => {
                            return Err(OmnidexError::Parse(
                                "unterminated string literal".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '-' if chars.get(i + 1).is_some_and(|ch| ch.is_ascii_digit()) => {
                let (num, next) = scan_number(&chars, i);
                tokens.push(Token::Num(num));
                i = next;
            }
            _ if c.is_ascii_digit() => {
                let (num, next) = scan_number(&chars, i);
                tokens.push(Token::Num(num));
                i = next;
            }
            _ if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    word.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Word(word));
            }
            other => {
                return Err(OmnidexError::Parse(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        }
    }
    Ok(tokens)
}

fn scan_number(chars: &[char], start: usize) -> (String, usize) {
    let mut i = start;
    let mut num = String::new();
    if chars[i] == '-' {
        num.push('-');
        i += 1;
    }
    let mut seen_dot = false;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() {
            num.push(c);
            i += 1;
        } else if c == '.' && !seen_dot && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) {
            seen_dot = true;
            num.push(c);
            i += 1;
        } else {
            break;
        }
    }
    (num, i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_operators_and_literals() {
        let tokens = tokenize(r#"SELECT * FROM t WHERE f @@ "rock" LIMIT 5"#).unwrap();
        assert!(tokens.contains(&Token::AtAt));
        assert!(tokens.contains(&Token::Str("rock".to_string())));
        assert!(tokens.contains(&Token::Num("5".to_string())));
    }

    #[test]
    fn distance_operator_and_negative_numbers() {
        let tokens = tokenize(r#"f <-> "q.jpg" , -122.31"#).unwrap();
        assert_eq!(tokens[0], Token::Word("f".to_string()));
        assert_eq!(tokens[1], Token::Distance);
        assert_eq!(tokens[4], Token::Num("-122.31".to_string()));
    }

    #[test]
    fn unterminated_string_is_a_parse_error() {
        assert!(matches!(
            tokenize(r#"SELECT "oops"#),
            Err(OmnidexError::Parse(_))
        ));
    }
}
