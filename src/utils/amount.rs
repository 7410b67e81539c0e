/// Normalize a ledger decimal amount into its shortest canonical form.
///
/// The ledger renders whole amounts with a trailing point (`"5."`) and may pad
/// fractions with zeros (`"0.500"`). Values that are not plain decimals are
/// returned trimmed but otherwise untouched.
pub fn normalize_amount(raw: &str) -> String {
	let trimmed = raw.trim();
	let is_decimal = !trimmed.is_empty()
		&& trimmed.chars().all(|c| c.is_ascii_digit() || c == '.')
		&& trimmed.matches('.').count() <= 1;

	if !is_decimal {
		return trimmed.to_string();
	}

	let (int_part, frac_part) = match trimmed.split_once('.') {
		Some((int_part, frac_part)) => (int_part, frac_part.trim_end_matches('0')),
		None => (trimmed, ""),
	};

	let int_part = match int_part.trim_start_matches('0') {
		"" => "0",
		digits => digits,
	};

	if frac_part.is_empty() {
		int_part.to_string()
	} else {
		format!("{}.{}", int_part, frac_part)
	}
}
