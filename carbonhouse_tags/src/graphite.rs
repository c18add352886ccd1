use std::borrow::Cow;

use crate::{
    Error, MAX_TAGS, Result,
    escape::{path_segment_escape, plain_name_escape, query_escape},
    template::TagRules,
};

/// Canonicalize a graphite name.
///
/// `name;k=v;...` becomes `name?k=v&...` with tags stably sorted by key, the
/// last value winning for a repeated key. A plain name is first offered to
/// the template rules; if none apply it is returned path-escaped, which for
/// ordinary names means unchanged. Names already in canonical form (they
/// contain `?` and no `;`) pass through untouched.
pub fn graphite<'a>(rules: &TagRules, s: &'a str) -> Result<Cow<'a, str>> {
    if !s.contains(';') {
        if s.contains('?') {
            return Ok(Cow::Borrowed(s));
        }
        if rules.enabled() {
            if let Some(tagged) = rules.apply(s) {
                return canonical(&tagged).map(Cow::Owned);
            }
        }
        return Ok(plain_name_escape(s));
    }
    canonical(s).map(Cow::Owned)
}

fn canonical(s: &str) -> Result<String> {
    let mut parts = s.split(';');
    let name = parts.next().unwrap_or_default();
    if name.is_empty() {
        return Err(Error::NoMetric {
            path: s.to_string(),
        });
    }

    let mut tags = Vec::new();
    for segment in parts {
        match segment.find('=') {
            Some(p) if p >= 1 => tags.push((&segment[..p], &segment[p + 1..])),
            _ => {
                return Err(Error::InvalidSegment {
                    path: s.to_string(),
                    segment: segment.to_string(),
                });
            }
        }
        if tags.len() > MAX_TAGS {
            return Err(Error::TooManyTags {
                path: s.to_string(),
            });
        }
    }

    // stable, so among equal keys the input order survives and the last one wins
    tags.sort_by(|a, b| a.0.cmp(b.0));
    let mut unique: Vec<(&str, &str)> = Vec::with_capacity(tags.len());
    for (k, v) in tags {
        match unique.last_mut() {
            Some(last) if last.0 == k => last.1 = v,
            _ => unique.push((k, v)),
        }
    }

    let mut out = String::with_capacity(s.len() + 8);
    out.push_str(&path_segment_escape(name));
    out.push('?');
    for (i, (k, v)) in unique.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(&query_escape(k));
        out.push('=');
        out.push_str(&query_escape(v));
    }
    Ok(out)
}
