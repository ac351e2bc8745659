//! Message templates for disparos (`{{nome}}`, `{{divida}}`, ...) and BRL formatting.

use bigdecimal::BigDecimal;
use regex::{Captures, Regex};
use serde::Serialize;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([a-zA-Z_]+)\s*\}\}").expect("placeholder regex is valid"));

static SPACES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("spaces regex is valid"));

/// Placeholders a template may use.
pub const KNOWN_PLACEHOLDERS: &[&str] = &[
    "nome",
    "primeiro_nome",
    "empresa",
    "cnpj",
    "cidade",
    "uf",
    "divida",
    "telefone",
];

/// Values available to a template for one recipient.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TemplateVars {
    pub nome: Option<String>,
    pub empresa: Option<String>,
    pub cnpj: Option<String>,
    pub cidade: Option<String>,
    pub uf: Option<String>,
    pub divida: Option<BigDecimal>,
    pub telefone: Option<String>,
}

impl TemplateVars {
    fn lookup(&self, key: &str) -> Option<Option<String>> {
        let value = match key {
            "nome" => self.nome.clone(),
            "primeiro_nome" => self
                .nome
                .as_deref()
                .and_then(|n| n.split_whitespace().next())
                .map(title_case),
            "empresa" => self.empresa.clone(),
            "cnpj" => self.cnpj.as_deref().map(crate::validation::format_cnpj),
            "cidade" => self.cidade.clone(),
            "uf" => self.uf.clone(),
            "divida" => self.divida.as_ref().map(format_brl),
            "telefone" => self.telefone.clone(),
            _ => return None,
        };
        Some(value)
    }
}

fn title_case(word: &str) -> String {
    let lower = word.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Renders a template.
///
/// Known placeholders without a value render empty; unknown placeholders are kept
/// verbatim so typos stay visible in the preview. Runs of spaces left behind by
/// empty values are collapsed.
pub fn render_template(template: &str, vars: &TemplateVars) -> String {
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        let key = caps[1].to_lowercase();
        match vars.lookup(&key) {
            Some(value) => value.unwrap_or_default(),
            None => caps[0].to_string(),
        }
    });

    let collapsed = SPACES.replace_all(&rendered, " ");
    collapsed
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Placeholders used by a template that are not known.
pub fn unknown_placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|c| c[1].to_lowercase())
        .filter(|k| !KNOWN_PLACEHOLDERS.contains(&k.as_str()))
        .collect()
}

/// Formats a value as Brazilian currency, e.g. `R$ 12.345,67`.
pub fn format_brl(value: &BigDecimal) -> String {
    let rounded = value.round(2).with_scale(2);
    let text = rounded.to_string();
    let (negative, text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.as_str()),
    };
    let (int_part, frac_part) = text.split_once('.').unwrap_or((text, "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }

    format!(
        "{}R$ {},{}",
        if negative { "-" } else { "" },
        grouped,
        frac_part
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars {
        TemplateVars {
            nome: Some("MARIA souza".to_string()),
            empresa: Some("Souza Doces".to_string()),
            cnpj: Some("11222333000181".to_string()),
            cidade: None,
            uf: Some("SP".to_string()),
            divida: Some("15234.5".parse().unwrap()),
            telefone: Some("5511987654321".to_string()),
        }
    }

    #[test]
    fn test_render_known_placeholders() {
        let out = render_template(
            "Olá {{primeiro_nome}}, a {{ empresa }} ({{cnpj}}) tem {{divida}} em aberto.",
            &vars(),
        );
        assert_eq!(
            out,
            "Olá Maria, a Souza Doces (11.222.333/0001-81) tem R$ 15.234,50 em aberto."
        );
    }

    #[test]
    fn test_missing_value_renders_empty_and_collapses() {
        let out = render_template("Atendemos {{cidade}} e região", &vars());
        assert_eq!(out, "Atendemos e região");
    }

    #[test]
    fn test_unknown_placeholder_kept() {
        let out = render_template("Oi {{apelido}}", &vars());
        assert_eq!(out, "Oi {{apelido}}");
        assert_eq!(unknown_placeholders("{{nome}} {{apelido}}"), vec!["apelido"]);
    }

    #[test]
    fn test_format_brl() {
        assert_eq!(format_brl(&"0".parse().unwrap()), "R$ 0,00");
        assert_eq!(format_brl(&"999.999".parse().unwrap()), "R$ 1.000,00");
        assert_eq!(format_brl(&"1234567.8".parse().unwrap()), "R$ 1.234.567,80");
        assert_eq!(format_brl(&"-50".parse().unwrap()), "-R$ 50,00");
    }
}
