//! `{{variable}}` substitution for step messages.

use std::collections::HashMap;

/// Replaces every `{{ name }}` placeholder with its value from `variables`.
/// Whitespace inside the braces is ignored. Unknown placeholders are left
/// as written so missing data stays visible in the audit trail.
pub fn render_template(template: &str, variables: &HashMap<String, String>) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            result.push_str(&rest[start..]);
            return result;
        };

        let name = after_open[..end].trim();
        match variables.get(name) {
            Some(value) if !name.is_empty() => result.push_str(value),
            _ => result.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }

    result.push_str(rest);
    result
}
