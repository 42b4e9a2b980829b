//! Pure text edits behind the `replace` operation.

use crate::core::operation::OperationError;

/// Replace every occurrence of `search`. Returns the new text and the count.
pub fn replace_all(text: &str, search: &str, replace: &str) -> Result<(String, usize), OperationError> {
    if search.is_empty() {
        return Err(OperationError::InvalidEntry("search text is empty".to_string()));
    }
    let count = text.matches(search).count();
    if count == 0 {
        return Err(OperationError::SearchNotFound);
    }
    Ok((text.replace(search, replace), count))
}

/// Edit line `line` (1-based).
///
/// With `search`, only occurrences on that line are replaced. Without it the
/// whole line is replaced. The original line ending is kept either way.
pub fn replace_in_line(
    text: &str,
    line: i64,
    search: Option<&str>,
    replace: &str,
) -> Result<(String, usize), OperationError> {
    if line < 1 {
        return Err(OperationError::InvalidLine(line));
    }
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let len = lines.len();
    let idx = usize::try_from(line - 1).map_err(|_| OperationError::LineOutOfRange { line, len })?;
    if idx >= len {
        return Err(OperationError::LineOutOfRange { line, len });
    }

    let (body, ending) = split_ending(lines[idx]);
    let (new_body, count) = match search {
        Some(search) => replace_all(body, search, replace)?,
        None => (replace.to_string(), 1),
    };

    let mut out = String::with_capacity(text.len() + new_body.len());
    for (i, original) in lines.iter().enumerate() {
        if i == idx {
            out.push_str(&new_body);
            out.push_str(ending);
        } else {
            out.push_str(original);
        }
    }
    Ok((out, count))
}

fn split_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}
