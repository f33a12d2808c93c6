//! Response filter for list-shaped results.
//!
//! Only removes items from a known list field. Errors, unknown shapes and undecodable bodies are
//! handed back untouched.

use super::ListFilter;
use crate::mcp::parser::EVENT_STREAM_MIME_TYPE;
use serde_json::Value;

/// Result field holding the list and the item field identifying each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListShape {
    pub field: &'static str,
    pub id_field: &'static str,
}

#[must_use]
pub fn list_shape(method: &str) -> Option<ListShape> {
    let (field, id_field) = match method {
        "tools/list" => ("tools", "name"),
        "prompts/list" => ("prompts", "name"),
        "resources/list" => ("resources", "uri"),
        "resources/templates/list" => ("resourceTemplates", "uriTemplate"),
        _ => return None,
    };
    Some(ListShape { field, id_field })
}

#[derive(Debug, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Re-encoded body with unauthorized items removed.
    Filtered { body: Vec<u8>, removed: usize },
    /// Body was not a recognizable list result; forward as-is.
    PassThrough,
}

/// Apply `filter` to a buffered upstream body.
#[must_use]
pub fn filter_body(
    body: &[u8],
    content_type: Option<&str>,
    method: &str,
    filter: &ListFilter,
) -> FilterOutcome {
    let Some(shape) = list_shape(method) else {
        return FilterOutcome::PassThrough;
    };
    let permits = |id: &str| filter.permits(id);
    let is_stream = content_type.is_some_and(|ct| ct.contains(EVENT_STREAM_MIME_TYPE));
    if is_stream {
        filter_event_stream(body, shape, &permits)
    } else {
        match filter_message(body, shape, &permits) {
            Some((body, removed)) => FilterOutcome::Filtered { body, removed },
            None => FilterOutcome::PassThrough,
        }
    }
}

/// Filter one JSON-RPC response message. `None` when the message has no list result.
fn filter_message(
    body: &[u8],
    shape: ListShape,
    permits: &dyn Fn(&str) -> bool,
) -> Option<(Vec<u8>, usize)> {
    let mut msg: Value = serde_json::from_slice(body).ok()?;
    let items = msg
        .get_mut("result")?
        .get_mut(shape.field)?
        .as_array_mut()?;
    let before = items.len();
    items.retain(|item| {
        item.get(shape.id_field)
            .and_then(Value::as_str)
            .is_some_and(permits)
    });
    let removed = before - items.len();
    let out = serde_json::to_vec(&msg).ok()?;
    Some((out, removed))
}

/// Line content and its terminator.
fn split_eol(line: &str) -> (&str, &str) {
    if let Some(c) = line.strip_suffix("\r\n") {
        return (c, "\r\n");
    }
    match line.strip_suffix('\n') {
        Some(c) => (c, "\n"),
        None => (line, ""),
    }
}

/// Filter every event of a buffered event stream. An event's `data:` lines are joined before
/// decoding, and a filtered event is re-emitted with its message on a single `data:` line.
fn filter_event_stream(
    body: &[u8],
    shape: ListShape,
    permits: &dyn Fn(&str) -> bool,
) -> FilterOutcome {
    let Ok(text) = std::str::from_utf8(body) else {
        return FilterOutcome::PassThrough;
    };
    let mut out = String::with_capacity(text.len());
    let mut removed = 0;
    let mut touched = false;
    let mut event: Vec<&str> = Vec::new();
    for line in text.split_inclusive('\n') {
        if split_eol(line).0.is_empty() {
            if let Some(n) = flush_event(&event, &mut out, shape, permits) {
                touched = true;
                removed += n;
            }
            event.clear();
            out.push_str(line);
        } else {
            event.push(line);
        }
    }
    if let Some(n) = flush_event(&event, &mut out, shape, permits) {
        touched = true;
        removed += n;
    }
    if touched {
        FilterOutcome::Filtered {
            body: out.into_bytes(),
            removed,
        }
    } else {
        FilterOutcome::PassThrough
    }
}

/// Write one event to `out`, filtered when its data is a list result. Returns the number of
/// removed items when it was.
fn flush_event(
    lines: &[&str],
    out: &mut String,
    shape: ListShape,
    permits: &dyn Fn(&str) -> bool,
) -> Option<usize> {
    let data: Vec<&str> = lines
        .iter()
        .filter_map(|l| split_eol(l).0.strip_prefix("data:"))
        .map(|d| d.strip_prefix(' ').unwrap_or(d))
        .collect();
    let filtered = if data.is_empty() {
        None
    } else {
        filter_message(data.join("\n").as_bytes(), shape, permits)
    };
    let Some((message, removed)) = filtered else {
        lines.iter().for_each(|l| out.push_str(l));
        return None;
    };
    let mut written = false;
    for line in lines {
        let (content, eol) = split_eol(line);
        if !content.starts_with("data:") {
            out.push_str(line);
        } else if !written {
            written = true;
            out.push_str("data: ");
            out.push_str(&String::from_utf8_lossy(&message));
            out.push_str(if eol.is_empty() { "\n" } else { eol });
        }
    }
    Some(removed)
}
