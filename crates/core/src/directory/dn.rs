//! Distinguished-name and filter escaping helpers.

/// Escape a value for use inside a search filter (RFC 4515).
pub fn escape_filter_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\5c"),
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\0' => out.push_str("\\00"),
            c => out.push(c),
        }
    }
    out
}

/// Escape an attribute value for use in an RDN (RFC 4514).
pub fn escape_dn_value(value: &str) -> String {
    let count = value.chars().count();
    let mut out = String::with_capacity(value.len() + 4);
    for (i, ch) in value.chars().enumerate() {
        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            '\0' => out.push_str("\\00"),
            ' ' if i == 0 || i + 1 == count => out.push_str("\\20"),
            '#' if i == 0 => out.push_str("\\23"),
            c => out.push(c),
        }
    }
    out
}

/// Build `attr=value,parent` with the value escaped.
pub fn child_dn(attr: &str, value: &str, parent: &str) -> String {
    format!("{}={},{}", attr, escape_dn_value(value), parent)
}

/// Return the unescaped value of the first RDN of `dn` if its attribute is
/// `attr` (case-insensitive).
pub fn leading_rdn_value(dn: &str, attr: &str) -> Option<String> {
    let (rdn_attr, rest) = dn.split_once('=')?;
    if !rdn_attr.trim().eq_ignore_ascii_case(attr) {
        return None;
    }

    let mut value = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            ',' | '+' => break,
            '\\' => {
                let first = chars.next()?;
                match chars.peek().copied() {
                    Some(second) if first.is_ascii_hexdigit() && second.is_ascii_hexdigit() => {
                        chars.next();
                        let byte = u8::from_str_radix(&format!("{first}{second}"), 16).ok()?;
                        value.push(char::from(byte));
                    }
                    _ => value.push(first),
                }
            }
            c => value.push(c),
        }
    }

    (!value.is_empty()).then_some(value)
}
