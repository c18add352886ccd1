//! Dot-segment reversal: `a.b.c` becomes `c.b.a`.

/// Reverse the segment order of a dotted name in place.
///
/// The whole slice is reversed first, then every segment is reversed back,
/// so empty segments survive the trip.
pub fn reverse_in_place(name: &mut [u8]) {
    name.reverse();
    let mut start = 0;
    for i in 0..name.len() {
        if name[i] == b'.' {
            name[start..i].reverse();
            start = i + 1;
        }
    }
    name[start..].reverse();
}

/// Reversed copy of `name`.
pub fn reverse_bytes(name: &[u8]) -> Vec<u8> {
    let mut out = name.to_vec();
    reverse_in_place(&mut out);
    out
}
