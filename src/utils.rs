use crate::error::{Error, Result, ValidateError};

/// Lovingly borrowed from the cargo crate
///
/// Joins an iterator of [std::fmt::Display]'ables into an output writable
pub(crate) fn iter_join_onto<W, I, T>(mut w: W, iter: I, delim: &str) -> std::fmt::Result
where
    W: std::fmt::Write,
    I: IntoIterator<Item = T>,
    T: std::fmt::Display,
{
    let mut it = iter.into_iter().peekable();
    while let Some(n) = it.next() {
        write!(w, "{}", n)?;
        if it.peek().is_some() {
            write!(w, "{}", delim)?;
        }
    }
    Ok(())
}

/// Lovingly borrowed from the cargo crate
///
/// Joins an iterator of [std::fmt::Display]'ables to a new [std::string::String].
pub(crate) fn iter_join<I, T>(iter: I, delim: &str) -> String
where
    I: IntoIterator<Item = T>,
    T: std::fmt::Display,
{
    let mut s = String::new();
    let _ = iter_join_onto(&mut s, iter, delim);
    s
}

/// Wrap a string in double quotes, escaping `\` and `"`.
pub(crate) fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Reject strings that cannot be sent as an IMAP quoted string.
pub(crate) fn validate_str(value: &str) -> Result<&str> {
    if value.contains('\n') {
        return Err(Error::Validate(ValidateError('\n')));
    }
    if value.contains('\r') {
        return Err(Error::Validate(ValidateError('\r')));
    }
    Ok(value)
}

/// Whether `name` refers to INBOX, which is case-insensitive.
pub(crate) fn is_inbox(name: &str) -> bool {
    name.eq_ignore_ascii_case("INBOX")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_backslash() {
        assert_eq!("\"test\\\\text\"", quote(r"test\text"));
    }

    #[test]
    fn quote_dquote() {
        assert_eq!("\"test\\\"text\"", quote("test\"text"));
    }

    #[test]
    fn validate_newline() {
        match validate_str("test\nstring") {
            Err(Error::Validate(ValidateError('\n'))) => {}
            other => panic!("Wrong result: {:?}", other),
        }
    }

    #[test]
    fn validate_carriage_return() {
        match validate_str("test\rstring") {
            Err(Error::Validate(ValidateError('\r'))) => {}
            other => panic!("Wrong result: {:?}", other),
        }
    }

    #[test]
    fn join() {
        assert_eq!(iter_join(["a", "b", "c"], " "), "a b c");
        assert_eq!(iter_join(Vec::<u32>::new(), ","), "");
    }
}
