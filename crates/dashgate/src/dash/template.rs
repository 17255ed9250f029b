//! `SegmentTemplate` identifier substitution.
//!
//! Only the `%0<width>d` format tag is permitted by DASH-IF IOP, so it is
//! implemented directly instead of going through a printf implementation.
//! Example: `$RepresentationID$/$Number%06d$.m4s`.

use std::sync::LazyLock;

use regex::{Captures, Regex, Replacer};

static IDENTIFIER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?\$")
        .expect("identifier pattern is valid")
});

/// Values available while expanding one segment URL.
///
/// Identifiers without a value are left in the output untouched, which keeps
/// a malformed template visible in the resulting URL instead of silently
/// producing a wrong one.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars<'a> {
    pub representation_id: &'a str,
    pub bandwidth: Option<u64>,
    pub number: Option<u64>,
    pub time: Option<u64>,
}

impl<'a> TemplateVars<'a> {
    pub fn new(representation_id: &'a str, bandwidth: Option<u64>) -> Self {
        Self {
            representation_id,
            bandwidth,
            number: None,
            time: None,
        }
    }

    pub fn with_segment(&self, number: u64, time: u64) -> Self {
        Self {
            number: Some(number),
            time: Some(time),
            ..self.clone()
        }
    }

    pub fn expand(&self, template: &str) -> String {
        IDENTIFIER_REGEX
            .replace_all(template, VarsReplacer(self))
            .into_owned()
    }

    fn value(&self, identifier: &str) -> Option<String> {
        match identifier {
            "RepresentationID" => Some(self.representation_id.to_string()),
            "Number" => self.number.map(|n| n.to_string()),
            "Time" => self.time.map(|t| t.to_string()),
            "Bandwidth" => self.bandwidth.map(|b| b.to_string()),
            _ => None,
        }
    }
}

struct VarsReplacer<'v, 'a>(&'v TemplateVars<'a>);

impl Replacer for VarsReplacer<'_, '_> {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        let Some(value) = self.0.value(&caps[1]) else {
            dst.push_str(&caps[0]);
            return;
        };

        match caps.get(2).and_then(|w| w.as_str().parse::<usize>().ok()) {
            Some(width) => dst.push_str(&format!("{value:0>width$}")),
            None => dst.push_str(&value),
        }
    }
}
