//! URL escaping with the rules the column store's graphite tables expect.
//!
//! Unreserved characters (`A-Za-z0-9-_.~`) are never escaped. Query
//! components encode a space as `+`.

use std::borrow::Cow;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A whole path: only `?` among the reserved characters is escaped.
const PATH: &AsciiSet = &UNRESERVED
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b',')
    .remove(b'/')
    .remove(b':')
    .remove(b';')
    .remove(b'=')
    .remove(b'@');

/// A single path segment: `/`, `;`, `,` and `?` are escaped as well.
const PATH_SEGMENT: &AsciiSet = &UNRESERVED
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b':')
    .remove(b'=')
    .remove(b'@');

/// Plain names keep existing escapes so escaping twice is a no-op.
const PLAIN_NAME: &AsciiSet = &PATH.remove(b'%');

fn encode<'a>(s: &'a str, set: &'static AsciiSet) -> Cow<'a, str> {
    utf8_percent_encode(s, set).into()
}

pub fn path_escape(s: &str) -> Cow<'_, str> {
    encode(s, PATH)
}

pub fn path_segment_escape(s: &str) -> Cow<'_, str> {
    encode(s, PATH_SEGMENT)
}

pub(crate) fn plain_name_escape(s: &str) -> Cow<'_, str> {
    encode(s, PLAIN_NAME)
}

pub fn query_escape(s: &str) -> Cow<'_, str> {
    match encode(s, UNRESERVED) {
        Cow::Borrowed(s) => Cow::Borrowed(s),
        Cow::Owned(s) => Cow::Owned(s.replace("%20", "+")),
    }
}

/// Reverse of [`query_escape`]. Malformed `%` sequences are kept verbatim.
pub fn unescape(s: &str) -> Cow<'_, str> {
    if !s.contains(['%', '+']) {
        return Cow::Borrowed(s);
    }
    let spaced = s.replace('+', " ");
    Cow::Owned(percent_decode_str(&spaced).decode_utf8_lossy().into_owned())
}
