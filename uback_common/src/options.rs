// uback_common is the core library implementing the backup-chain engine.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The options/fingerprint language: comma-separated `key=value` pairs,
//! `@`-prefixed multi-valued keys, pascal-cased key normalization, and
//! `Preset=name` macro splicing against a caller-supplied preset table.

use std::collections::HashMap;

use crate::error::OptionsError;

/// A resolved set of options: single-valued and multi-valued (`@key`) keys.
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub strings: HashMap<String, String>,
    pub str_slices: HashMap<String, Vec<String>>,
}

impl Options {
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.strings.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.strings.get(key).map(String::as_str), Some("true"))
    }

    pub fn get_required(&self, key: &str) -> Result<&str, OptionsError> {
        self.get_string(key)
            .ok_or_else(|| OptionsError::MissingOption(key.to_string()))
    }

    pub fn get_multi(&self, key: &str) -> &[String] {
        self.str_slices.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    fn merge_one(&mut self, key: String, value: String, is_multi: bool) {
        if is_multi {
            self.str_slices.entry(key).or_default().push(value);
        } else {
            self.strings.insert(key, value);
        }
    }
}

/// Split a comma-separated options string into its top-level fields,
/// respecting `\,` (escaped comma, kept literal within a field) and `\\`
/// (escaped backslash).
pub fn split_options(s: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next == ',' || next == '\\' {
                    current.push('\\');
                    current.push(next);
                    chars.next();
                    continue;
                }
            }
            current.push(c);
        } else if c == ',' {
            fields.push(current);
            current = String::new();
        } else {
            current.push(c);
        }
    }
    fields.push(current);
    fields
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next == ',' || next == '\\' {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Normalize a key to pascal case: `full-interval` / `full_interval` ->
/// `FullInterval`.
pub fn pascalize(key: &str) -> String {
    key.split(|c: char| c == '-' || c == '_')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                None => String::new(),
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            }
        })
        .collect()
}

/// Parse one `key=value` (or bare `key`, or `@key=value`) field into its
/// normalized key, value, and whether it is multi-valued.
fn parse_option(field: &str) -> Result<(String, String, bool), OptionsError> {
    if field.is_empty() {
        return Err(OptionsError::InvalidOption(field.to_string()));
    }

    let (is_multi, rest) = match field.strip_prefix('@') {
        Some(rest) => (true, rest),
        None => (false, field),
    };

    // Find the first unescaped '='.
    let mut eq_pos = None;
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
        } else if c == '=' {
            eq_pos = Some(i);
            break;
        }
    }

    let (raw_key, raw_value) = match eq_pos {
        Some(i) => (&rest[..i], &rest[i + 1..]),
        None => (rest, "true"),
    };

    if raw_key.is_empty() {
        return Err(OptionsError::InvalidOption(field.to_string()));
    }

    let key = pascalize(&unescape(raw_key));
    let value = unescape(raw_value);
    Ok((key, value, is_multi))
}

/// Evaluate a split options list into a resolved [`Options`], splicing any
/// `Preset=name` reference against `presets` (already-split option field
/// lists keyed by preset name) and substituting `{{.Key}}` template
/// placeholders against options parsed earlier in the same list.
pub fn eval_options(fields: &[String], presets: &HashMap<String, Vec<String>>) -> Result<Options, OptionsError> {
    let mut options = Options::default();
    let mut queue: Vec<String> = fields.to_vec();
    let mut i = 0;

    while i < queue.len() {
        let field = queue[i].clone();
        i += 1;

        let (key, value, is_multi) = parse_option(&field)?;

        if key == "Preset" {
            if let Some(preset_fields) = presets.get(&value) {
                for (offset, f) in preset_fields.iter().enumerate() {
                    queue.insert(i + offset, f.clone());
                }
            }
            continue;
        }

        let resolved_value = substitute_templates(&value, &options);
        options.merge_one(key, resolved_value, is_multi);
    }

    Ok(options)
}

fn substitute_templates(value: &str, options: &Options) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("{{.") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        match after.find("}}") {
            Some(end) => {
                let key = &after[..end];
                if let Some(v) = options.get_string(key) {
                    out.push_str(v);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_escaped_comma() {
        let fields = split_options(r"a=1,b=foo\,bar,c=3");
        assert_eq!(fields, vec!["a=1", r"b=foo\,bar", "c=3"]);
    }

    #[test]
    fn parse_pascalizes_keys() {
        let presets = HashMap::new();
        let fields = split_options("full-interval=1d,path=/tmp");
        let opts = eval_options(&fields, &presets).unwrap();
        assert_eq!(opts.get_string("FullInterval"), Some("1d"));
        assert_eq!(opts.get_string("Path"), Some("/tmp"));
    }

    #[test]
    fn bare_key_means_true() {
        let presets = HashMap::new();
        let fields = split_options("force-full");
        let opts = eval_options(&fields, &presets).unwrap();
        assert!(opts.get_bool("ForceFull"));
    }

    #[test]
    fn multi_valued_keys_accumulate() {
        let presets = HashMap::new();
        let fields = split_options("@tag=a,@tag=b");
        let opts = eval_options(&fields, &presets).unwrap();
        assert_eq!(opts.get_multi("Tag"), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn preset_splices_in_place() {
        let mut presets = HashMap::new();
        presets.insert("local".to_string(), vec!["type=fs".to_string(), "path=/tmp/x".to_string()]);
        let fields = split_options("preset=local,extra=1");
        let opts = eval_options(&fields, &presets).unwrap();
        assert_eq!(opts.get_string("Type"), Some("fs"));
        assert_eq!(opts.get_string("Path"), Some("/tmp/x"));
        assert_eq!(opts.get_string("Extra"), Some("1"));
    }

    #[test]
    fn template_substitutes_earlier_option() {
        let presets = HashMap::new();
        let fields = split_options("name=acme,label={{.Name}}-backup");
        let opts = eval_options(&fields, &presets).unwrap();
        assert_eq!(opts.get_string("Label"), Some("acme-backup"));
    }
}
