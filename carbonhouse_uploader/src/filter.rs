//! `ignored-patterns`: dot-separated globs where a `*` segment matches any
//! single segment.

use hashbrown::HashMap;

#[derive(Debug, Default)]
pub struct IgnoredPatterns {
    /// Patterns grouped by segment count.
    by_len: HashMap<usize, Vec<Vec<String>>>,
}

impl IgnoredPatterns {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut by_len: HashMap<usize, Vec<Vec<String>>> = HashMap::new();
        for pattern in patterns {
            let segments: Vec<String> = pattern.as_ref().split('.').map(String::from).collect();
            by_len.entry(segments.len()).or_default().push(segments);
        }
        Self { by_len }
    }

    pub fn is_empty(&self) -> bool {
        self.by_len.is_empty()
    }

    /// Whether `name` matches a pattern. A `reversed` name has its segments
    /// in reverse order and is matched against the patterns read backwards.
    pub fn contains(&self, name: &str, reversed: bool) -> bool {
        let segments: Vec<&str> = name.split('.').collect();
        let Some(patterns) = self.by_len.get(&segments.len()) else {
            return false;
        };

        let n = segments.len();
        patterns.iter().any(|pattern| {
            segments.iter().enumerate().all(|(i, segment)| {
                let p = if reversed {
                    &pattern[n - 1 - i]
                } else {
                    &pattern[i]
                };
                p == "*" || p.as_str() == *segment
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globs() {
        let patterns = IgnoredPatterns::new(&["a.b.c.d", "a.b.c.d.e", "a.b.d.c", "k.b.*.f"]);
        let cases = [
            ("a.b.c.d", true),
            ("a.b.c.d.e", true),
            ("a.b.c.d.f", false),
            ("a.b.d.c", true),
            ("k.b.anything.f", true),
            ("k.b.anything.g", false),
            ("a.b.c", false),
            ("k.b.f", false),
        ];
        for (name, ignored) in cases {
            assert_eq!(patterns.contains(name, false), ignored, "{name}");
        }

        assert!(patterns.contains("d.c.b.a", true));
        assert!(patterns.contains("f.x.b.k", true));
        assert!(!patterns.contains("a.b.c.d", true));
    }

    #[test]
    fn empty() {
        let patterns = IgnoredPatterns::new::<&str>(&[]);
        assert!(patterns.is_empty());
        assert!(!patterns.contains("a.b", false));
    }
}
