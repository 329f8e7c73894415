#![forbid(unsafe_code)]

/// Reduce user supplied text to trimmed plain text: HTML tags are removed,
/// control characters other than newline and tab are dropped.
pub fn sanitize_text(input: &str) -> String {
	let mut out = String::with_capacity(input.len());
	let mut chars = input.chars().peekable();

	while let Some(c) = chars.next() {
		if c == '<'
			&& let Some(&next) = chars.peek()
			&& (next.is_ascii_alphabetic() || matches!(next, '/' | '!' | '?'))
		{
			// Skip to the end of the tag; an unterminated tag drops the rest.
			for t in chars.by_ref() {
				if t == '>' {
					break;
				}
			}
			continue;
		}

		if c.is_control() && c != '\n' && c != '\t' {
			continue;
		}

		out.push(c);
	}

	out.trim().to_string()
}
