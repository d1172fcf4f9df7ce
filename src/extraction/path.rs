//! Dotted value paths into nested records
//!
//! Supported syntax: an optional `$` root, `.`-separated keys, `[n]` indexes
//! and `*` / `[*]` wildcards, e.g. `$.meta.lots[0].id` or `images[*].name`.

use serde_json::Value;

/// One step of a parsed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// Parse a path expression into segments
pub fn parse_path(path: &str) -> Result<Vec<Segment>, String> {
    let trimmed = path.trim();
    let body = trimmed
        .strip_prefix('$')
        .map(|rest| rest.strip_prefix('.').unwrap_or(rest))
        .unwrap_or(trimmed);

    let mut segments = Vec::new();
    for part in body.split('.').filter(|p| !p.is_empty()) {
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        match key {
            "" => {}
            "*" => segments.push(Segment::Wildcard),
            key => segments.push(Segment::Key(key.to_string())),
        }
        while !rest.is_empty() {
            let close = rest
                .find(']')
                .ok_or_else(|| format!("unclosed '[' in path '{path}'"))?;
            let inner = rest[1..close].trim();
            if inner == "*" {
                segments.push(Segment::Wildcard);
            } else {
                let index = inner
                    .parse::<usize>()
                    .map_err(|_| format!("invalid index '{inner}' in path '{path}'"))?;
                segments.push(Segment::Index(index));
            }
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(format!("unexpected '{rest}' in path '{path}'"));
            }
        }
    }
    Ok(segments)
}

/// Every value the path selects, in document order
///
/// An unparseable path selects nothing.
pub fn select<'a>(value: &'a Value, path: &str) -> Vec<&'a Value> {
    match parse_path(path) {
        Ok(segments) => select_segments(value, &segments),
        Err(_) => Vec::new(),
    }
}

/// First value the path selects
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    select(value, path).into_iter().next()
}

fn select_segments<'a>(value: &'a Value, segments: &[Segment]) -> Vec<&'a Value> {
    let mut current = vec![value];
    for segment in segments {
        let mut next = Vec::new();
        for node in current {
            match (segment, node) {
                (Segment::Key(key), Value::Object(map)) => next.extend(map.get(key)),
                (Segment::Index(i), Value::Array(items)) => next.extend(items.get(*i)),
                (Segment::Wildcard, Value::Array(items)) => next.extend(items.iter()),
                (Segment::Wildcard, Value::Object(map)) => next.extend(map.values()),
                _ => {}
            }
        }
        current = next;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("$.meta.lots[0].id").unwrap(),
            vec![
                Segment::Key("meta".into()),
                Segment::Key("lots".into()),
                Segment::Index(0),
                Segment::Key("id".into()),
            ]
        );
        assert_eq!(parse_path("$").unwrap(), vec![]);
        assert_eq!(parse_path("a[*]").unwrap().last(), Some(&Segment::Wildcard));
        assert!(parse_path("a[x]").is_err());
        assert!(parse_path("a[0").is_err());
    }

    #[test]
    fn test_select_and_lookup() {
        let doc = json!({
            "meta": {"lot": "LOT9", "lots": [{"id": 1}, {"id": 2}]},
            "images": [{"name": "a"}, {"name": "b"}]
        });
        assert_eq!(lookup(&doc, "meta.lot"), Some(&json!("LOT9")));
        assert_eq!(lookup(&doc, "$.meta.lots[1].id"), Some(&json!(2)));
        assert_eq!(
            select(&doc, "images[*].name"),
            vec![&json!("a"), &json!("b")]
        );
        assert_eq!(lookup(&doc, "meta.missing"), None);
        assert_eq!(lookup(&doc, "$"), Some(&doc));
    }
}
