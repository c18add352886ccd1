//! Template rules that turn plain dotted names into tagged ones.
//!
//! A rule is `[filter] template [k=v,...]`. The filter is a glob over dot
//! segments, the template names what each segment of a matching name means,
//! and the optional trailing list adds fixed tags.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// `[convert-to-tagged]` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TagConfig {
    pub enabled: bool,
    pub separator: String,
    pub tags: Vec<String>,
    pub templates: Vec<String>,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            separator: "_".to_string(),
            tags: vec![],
            templates: vec![],
        }
    }
}

impl TagConfig {
    pub fn compile(&self) -> Result<TagRules> {
        let mut tags = BTreeMap::new();
        parse_tag_list(&mut tags, self.tags.iter().map(String::as_str))?;

        let templates = self
            .templates
            .iter()
            .map(|t| Template::parse(t))
            .collect::<Result<Vec<_>>>()?;

        Ok(TagRules {
            enabled: self.enabled,
            separator: self.separator.clone(),
            tags,
            templates,
        })
    }
}

/// Compiled form of [`TagConfig`].
#[derive(Debug, Clone, Default)]
pub struct TagRules {
    enabled: bool,
    separator: String,
    tags: BTreeMap<String, String>,
    templates: Vec<Template>,
}

impl TagRules {
    /// Rules that never rewrite plain names.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Rewrite `name` with the first matching rule into `measurement;k=v;...`.
    ///
    /// `None` when no rule matches.
    pub fn apply(&self, name: &str) -> Option<String> {
        let template = self.templates.iter().find(|t| t.filter.is_match(name))?;

        let mut tags = self.tags.clone();
        tags.extend(
            template
                .extra_tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let segments: Vec<&str> = name.split('.').collect();
        let mut measurement = String::new();
        for (i, segment) in segments.iter().enumerate() {
            // segments past the end of the template are ignored
            let Some(role) = template.segments.get(i) else {
                break;
            };
            match role.as_str() {
                "" => {}
                "measurement" => {
                    measurement.push_str(segment);
                    measurement.push_str(&self.separator);
                }
                "measurement*" => {
                    measurement.push_str(&segments[i..].join(&self.separator));
                    break;
                }
                key => {
                    tags.insert(key.to_string(), segment.to_string());
                }
            }
        }
        if !self.separator.is_empty() && measurement.ends_with(&self.separator) {
            measurement.truncate(measurement.len() - self.separator.len());
        }

        let mut out = measurement;
        for (k, v) in &tags {
            out.push(';');
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        Some(out)
    }
}

#[derive(Debug, Clone)]
struct Template {
    filter: Regex,
    segments: Vec<String>,
    extra_tags: BTreeMap<String, String>,
}

impl Template {
    fn parse(rule: &str) -> Result<Self> {
        let parts: Vec<&str> = rule.split_whitespace().collect();
        let (filter, template, tags) = match parts.as_slice() {
            [template] => ("", *template, ""),
            [first, second] if second.contains('=') => ("", *first, *second),
            [filter, template] => (*filter, *template, ""),
            [filter, template, tags] => (*filter, *template, *tags),
            _ => return Err(Error::InvalidTemplate(rule.to_string())),
        };

        let mut extra_tags = BTreeMap::new();
        if !tags.is_empty() {
            parse_tag_list(&mut extra_tags, tags.split(','))?;
        }

        Ok(Self {
            filter: filter_regex(filter)?,
            segments: template.split('.').map(str::to_string).collect(),
            extra_tags,
        })
    }
}

/// Glob over dot segments to a regex. A leading or trailing `*` leaves that
/// end unanchored; an inner `*` matches one segment. An empty filter matches
/// any name containing a dot.
fn filter_regex(filter: &str) -> Result<Regex> {
    let pattern = if filter.is_empty() {
        r"\.".to_string()
    } else {
        let mut body = filter;
        let begin = match body.strip_prefix('*') {
            Some(rest) => {
                body = rest;
                ""
            }
            None => "^",
        };
        let end = match body.strip_suffix('*') {
            Some(rest) => {
                body = rest;
                ""
            }
            None => "$",
        };
        let body = body.replace('.', r"\.").replace('*', r"[^\.]*");
        format!("{begin}{body}{end}")
    };
    Regex::new(&pattern).map_err(|source| Error::InvalidFilter {
        filter: filter.to_string(),
        source,
    })
}

fn parse_tag_list<'a>(
    map: &mut BTreeMap<String, String>,
    tags: impl Iterator<Item = &'a str>,
) -> Result<()> {
    for tag in tags {
        let (k, v) = tag
            .split_once('=')
            .ok_or_else(|| Error::InvalidTag(tag.to_string()))?;
        map.insert(k.to_string(), v.to_string());
    }
    Ok(())
}
