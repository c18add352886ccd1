use crate::escape::{path_segment_escape, query_escape};

/// Label holding the metric name in a Prometheus series.
pub const NAME_LABEL: &str = "__name__";

/// Canonical name for a Prometheus label set.
///
/// `__name__` becomes the path, the other labels are stably sorted by name
/// (labels sharing a name keep their relative order) and form the query.
pub fn prometheus<'a, I>(labels: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut name = None;
    let mut rest = Vec::new();
    for (k, v) in labels {
        if name.is_none() && k == NAME_LABEL {
            name = Some(v);
        } else {
            rest.push((k, v));
        }
    }
    rest.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = String::new();
    if let Some(name) = name {
        out.push_str(&path_segment_escape(name));
    }
    out.push('?');
    for (i, (k, v)) in rest.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(&query_escape(k));
        out.push('=');
        out.push_str(&query_escape(v));
    }
    out
}
