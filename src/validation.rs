//! Input validation and normalization for phones, e-mails and Brazilian tax ids.

use phonenumber::{country::Id as CountryId, Mode};
use regex::Regex;
use std::sync::LazyLock;

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("email regex is valid")
});

/// Keeps only ASCII digits.
pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Escapes `\`, `%` and `_` so user text matches literally under `LIKE ... ESCAPE '\'`.
pub fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Validates an e-mail address, rejecting the repeated-digit patterns fake form
/// submissions tend to use.
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    let fake_patterns = ["999999", "111111", "000000", "123456789"];

    for pattern in &fake_patterns {
        if email.contains(pattern) {
            tracing::warn!(
                "Invalid email detected (fake pattern '{}'): {}",
                pattern,
                email
            );
            return false;
        }
    }

    if !EMAIL_REGEX.is_match(email) {
        tracing::warn!("Invalid email format: {}", email);
        return false;
    }

    true
}

/// Validates a Brazilian phone number.
///
/// Returns `(true, e164)` on success, or `(false, reason)`.
pub fn validate_br_phone(raw: &str) -> (bool, String) {
    if raw.trim().is_empty() || raw.len() < 8 {
        return (false, "Phone too short".to_string());
    }

    match phonenumber::parse(Some(CountryId::BR), raw) {
        Ok(number) => {
            if number.code().value() != 55 {
                tracing::warn!("Non-Brazilian phone number: {}", raw);
                return (false, "Not a Brazilian phone number".to_string());
            }
            if phonenumber::is_valid(&number) {
                let formatted = number.format().mode(Mode::E164).to_string();
                tracing::debug!("Valid BR phone: {} -> {}", raw, formatted);
                (true, formatted)
            } else {
                tracing::warn!("Invalid BR phone number: {}", raw);
                (false, "Invalid Brazilian phone number".to_string())
            }
        }
        Err(e) => {
            tracing::warn!("Failed to parse BR phone '{}': {:?}", raw, e);
            (false, format!("Parse error: {:?}", e))
        }
    }
}

/// Canonical storage key for a phone: validated E.164 digits without the `+`.
pub fn normalize_phone(raw: &str) -> Option<String> {
    match validate_br_phone(raw) {
        (true, e164) => Some(digits_only(&e164)),
        (false, _) => None,
    }
}

/// Turns a WhatsApp jid (`5511987654321@s.whatsapp.net`) into the canonical phone.
///
/// Group and broadcast jids yield `None`. Brazilian mobiles that the gateway
/// reports without the ninth digit get it back, so both forms map to the same lead.
pub fn canonical_whatsapp_phone(jid: &str) -> Option<String> {
    let (user, server) = match jid.split_once('@') {
        Some((user, server)) => (user, Some(server)),
        None => (jid, None),
    };

    if matches!(server, Some("g.us") | Some("broadcast")) || user == "status" {
        return None;
    }

    // Device suffix, e.g. `5511987654321:12@s.whatsapp.net`
    let user = user.split(':').next().unwrap_or(user);
    let digits = digits_only(user);
    if digits.len() < 10 {
        return None;
    }

    if digits.len() == 12 && digits.starts_with("55") {
        let subscriber_first = digits.as_bytes()[4];
        if (b'6'..=b'9').contains(&subscriber_first) {
            return Some(format!("{}9{}", &digits[..4], &digits[4..]));
        }
    }

    Some(digits)
}

fn all_same_digit(digits: &[u32]) -> bool {
    digits.windows(2).all(|w| w[0] == w[1])
}

fn to_digit_vec(raw: &str) -> Vec<u32> {
    raw.chars().filter_map(|c| c.to_digit(10)).collect()
}

/// Mod-11 check digit with the Receita Federal weights.
fn check_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    let rest = sum % 11;
    if rest < 2 {
        0
    } else {
        11 - rest
    }
}

/// Validates a CPF (formatted or digits only).
pub fn is_valid_cpf(raw: &str) -> bool {
    let digits = to_digit_vec(raw);
    if digits.len() != 11 || all_same_digit(&digits) {
        return false;
    }

    let first = check_digit(&digits[..9], &[10, 9, 8, 7, 6, 5, 4, 3, 2]);
    let second = check_digit(&digits[..10], &[11, 10, 9, 8, 7, 6, 5, 4, 3, 2]);

    digits[9] == first && digits[10] == second
}

/// Validates a CNPJ (formatted or digits only).
pub fn is_valid_cnpj(raw: &str) -> bool {
    let digits = to_digit_vec(raw);
    if digits.len() != 14 || all_same_digit(&digits) {
        return false;
    }

    let first = check_digit(&digits[..12], &[5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2]);
    let second = check_digit(&digits[..13], &[6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2]);

    digits[12] == first && digits[13] == second
}

/// Formats 14 CNPJ digits as `00.000.000/0000-00`; anything else is returned unchanged.
pub fn format_cnpj(raw: &str) -> String {
    let d = digits_only(raw);
    if d.len() != 14 {
        return raw.to_string();
    }
    format!(
        "{}.{}.{}/{}-{}",
        &d[..2],
        &d[2..5],
        &d[5..8],
        &d[8..12],
        &d[12..]
    )
}

const UFS: &[&str] = &[
    "AC", "AL", "AM", "AP", "BA", "CE", "DF", "ES", "GO", "MA", "MG", "MS", "MT", "PA", "PB",
    "PE", "PI", "PR", "RJ", "RN", "RO", "RR", "RS", "SC", "SE", "SP", "TO",
];

/// Uppercased state code when `raw` is one of the 27 Brazilian UFs.
pub fn normalize_uf(raw: &str) -> Option<String> {
    let uf = raw.trim().to_ascii_uppercase();
    UFS.contains(&uf.as_str()).then_some(uf)
}
