//! String template rendering utilities.

/// Render a printf-style template, substituting `%s` placeholders in order.
///
/// `%%` renders a literal percent sign. Placeholders beyond the supplied
/// values render as empty strings.
pub fn sprintf(template: &str, values: &[&str]) -> String {
    let mut result = String::with_capacity(template.len());
    let mut values = values.iter();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '%' {
            result.push(ch);
            continue;
        }

        match chars.peek() {
            Some('s') => {
                chars.next();
                if let Some(value) = values.next() {
                    result.push_str(value);
                }
            }
            Some('%') => {
                chars.next();
                result.push('%');
            }
            _ => result.push('%'),
        }
    }

    result
}
