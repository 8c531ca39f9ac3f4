//! Pattern-based field extraction from document text.
//!
//! Pure functions over text already pulled out of a PDF (or carried in an
//! XML payload). No I/O, no shared state. Every field is optional: slips
//! and invoices vary in layout, and a pattern that does not match is a
//! normal outcome, not an error.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::normalize_number;

// Payment reference line ("linha digitável"): 47 digits in the standard
// 5-5-5-6-5-6-1-14 blocks, dots/spaces optional.
static REFERENCE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\d{5}[.\s]?\d{5}[.\s]?\d{5}[.\s]?\d{6}[.\s]?\d{5}[.\s]?\d{6}[.\s]?\d[.\s]?\d{14}",
    )
    .unwrap()
});

static AMOUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"R\$\s*[\d.,]+").unwrap());

static DATE_DMY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{2}/\d{2}/\d{4}\b").unwrap());

static CNPJ: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{2}\.\d{3}\.\d{3}/\d{4}-\d{2}").unwrap());

static CPF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{3}\.\d{3}\.\d{3}-\d{2}").unwrap());

// Cuts trailing dates or CNPJ/CPF-like digit runs off a candidate name line.
static NAME_TAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{2}[./]\d{2}[./]\d{2,4}|\d{2,3}\.\d{3}\.\d{3}").unwrap());

const NAME_MAX_CHARS: usize = 50;

/// Everything the extractor can pull out of a payment slip.
#[derive(Debug, Clone, Default)]
pub struct SlipFields {
    /// 47-digit payment reference line, separators stripped.
    pub reference_line: Option<String>,
    /// Monetary amount as printed (e.g. `R$ 1.234,56`).
    pub amount: Option<String>,
    /// Due date as printed (`dd/mm/yyyy`).
    pub due_date: Option<String>,
    /// Beneficiary tax ID (CNPJ preferred, CPF as fallback).
    pub tax_id: Option<String>,
}

/// Extract every slip field in one pass.
pub fn extract_slip_fields(text: &str) -> SlipFields {
    SlipFields {
        reference_line: reference_line(text),
        amount: amount(text),
        due_date: due_date(text),
        tax_id: tax_id(text),
    }
}

pub fn reference_line(text: &str) -> Option<String> {
    REFERENCE_LINE
        .find(text)
        .map(|m| m.as_str().chars().filter(char::is_ascii_digit).collect())
}

/// The printed total. Slips list intermediate values first; the last match
/// is the one charged.
pub fn amount(text: &str) -> Option<String> {
    AMOUNT
        .find_iter(text)
        .last()
        .map(|m| m.as_str().to_string())
}

/// First date on the document, which on slips is the due date.
pub fn due_date(text: &str) -> Option<String> {
    DATE_DMY.find(text).map(|m| m.as_str().to_string())
}

pub fn tax_id(text: &str) -> Option<String> {
    CNPJ.find(text)
        .or_else(|| CPF.find(text))
        .map(|m| m.as_str().to_string())
}

/// Whether a document number appears anywhere in the text, comparing
/// digits-only on both sides.
pub fn contains_number(text: &str, number: &str) -> bool {
    let digits = normalize_number(number);
    if digits.is_empty() {
        return false;
    }
    normalize_number(text).contains(&digits)
}

/// Customer ("sacado"/"tomador") name, found by the labels slips and
/// invoices actually print. Checked per line, first hit wins.
pub fn customer_name(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        let upper = line.to_uppercase();

        // "CLIENTE: name" / "SACADO: name"
        if upper.contains("CLIENTE:") || upper.contains("SACADO:") {
            if let Some(name) = after_colon(line) {
                return Some(truncate_name(&name));
            }
        }

        // Bare label with the name on the following line.
        let bare = upper.trim();
        if matches!(bare, "CLIENTE" | "SACADO" | "PAGADOR") {
            if let Some(next) = lines.get(i + 1).map(|l| l.trim()).filter(|l| !l.is_empty()) {
                return Some(truncate_name(next));
            }
        }

        // Invoice header "NOME/RAZÃO SOCIAL": the name sits a few lines
        // down, past repeated column headers.
        if upper.contains("NOME/RAZÃO SOCIAL") || upper.contains("NOME/RAZAO SOCIAL") {
            if let Some(name) = name_below_header(&lines, i) {
                return Some(name);
            }
            continue;
        }

        // "RAZÃO SOCIAL: name" (but not the NOME/ header handled above)
        if (upper.contains("RAZÃO SOCIAL:") || upper.contains("RAZAO SOCIAL:"))
            && !upper.contains("NOME/")
        {
            if let Some(name) = after_colon(line) {
                return Some(truncate_name(&name));
            }
        }

        if upper.contains("DESTINATÁRIO") || upper.contains("DESTINATARIO") {
            if let Some(name) = after_colon(line) {
                return Some(truncate_name(&name));
            }
            if let Some(next) = lines.get(i + 1).map(|l| l.trim()).filter(|l| !l.is_empty()) {
                let next_upper = next.to_uppercase();
                if !next_upper.contains("CNPJ") && !next_upper.contains("CPF") {
                    return Some(truncate_name(next));
                }
            }
        }
    }

    None
}

fn after_colon(line: &str) -> Option<String> {
    let (_, value) = line.split_once(':')?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn name_below_header(lines: &[&str], header_index: usize) -> Option<String> {
    for candidate in lines
        .iter()
        .skip(header_index + 1)
        .take(4)
        .map(|l| l.trim())
    {
        if candidate.is_empty() {
            continue;
        }
        let upper = candidate.to_uppercase();
        if upper.starts_with("CNPJ")
            || upper.starts_with("CPF")
            || upper.contains("CNPJ/CPF")
            || (upper.contains("DATA") && (upper.contains("EMISSÃO") || upper.contains("EMISSAO")))
        {
            continue;
        }
        let cut = NAME_TAIL
            .find(candidate)
            .map(|m| &candidate[..m.start()])
            .unwrap_or(candidate)
            .trim();
        let only_digits = cut.chars().filter(|c| !c.is_whitespace()).all(|c| c.is_ascii_digit());
        if cut.len() > 3 && !only_digits {
            return Some(truncate_name(cut));
        }
    }
    None
}

fn truncate_name(name: &str) -> String {
    name.chars().take(NAME_MAX_CHARS).collect::<String>().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLIP: &str = "\
BANCO EXEMPLO S.A.
23793.38128 60000.000000 00000.012345 1 23450000015000
CLIENTE: COMERCIO DE PEÇAS LTDA
CNPJ: 12.345.678/0001-90
Vencimento 15/08/2024
Valor cobrado R$ 150,00";

    #[test]
    fn reference_line_strips_separators() {
        let line = reference_line(SLIP).unwrap();
        assert_eq!(line.len(), 47);
        assert!(line.starts_with("2379338128"));
    }

    #[test]
    fn amount_takes_the_last_match() {
        let text = "Valor do documento R$ 200,00\nDesconto R$ 50,00\nValor cobrado R$ 150,00";
        assert_eq!(amount(text).as_deref(), Some("R$ 150,00"));
    }

    #[test]
    fn due_date_is_the_first_date() {
        assert_eq!(due_date(SLIP).as_deref(), Some("15/08/2024"));
    }

    #[test]
    fn tax_id_prefers_cnpj() {
        assert_eq!(tax_id(SLIP).as_deref(), Some("12.345.678/0001-90"));
        assert_eq!(
            tax_id("titular 123.456.789-01").as_deref(),
            Some("123.456.789-01")
        );
    }

    #[test]
    fn missing_fields_are_none_not_errors() {
        let fields = extract_slip_fields("nothing interesting here");
        assert!(fields.reference_line.is_none());
        assert!(fields.amount.is_none());
        assert!(fields.due_date.is_none());
        assert!(fields.tax_id.is_none());
    }

    #[test]
    fn contains_number_compares_digits_only() {
        assert!(contains_number("Documento nº 00.29-A", "29"));
        assert!(!contains_number("Documento nº 31", "29"));
        assert!(!contains_number("Documento nº 29", ""));
    }

    #[test]
    fn customer_name_from_labeled_line() {
        assert_eq!(
            customer_name(SLIP).as_deref(),
            Some("COMERCIO DE PEÇAS LTDA")
        );
        assert_eq!(
            customer_name("SACADO: ACME LTDA").as_deref(),
            Some("ACME LTDA")
        );
    }

    #[test]
    fn customer_name_from_bare_label() {
        let text = "PAGADOR\nINDUSTRIA BETA S.A.\nCNPJ 11.222.333/0001-44";
        assert_eq!(customer_name(text).as_deref(), Some("INDUSTRIA BETA S.A."));
    }

    #[test]
    fn customer_name_below_invoice_header_skips_column_headers() {
        let text = "\
NOME/RAZÃO SOCIAL
CNPJ/CPF INSCRIÇÃO ESTADUAL
TRANSPORTES GAMA LTDA 12.345.678/0001-90
";
        assert_eq!(customer_name(text).as_deref(), Some("TRANSPORTES GAMA LTDA"));
    }

    #[test]
    fn customer_name_absent_when_no_label_matches() {
        assert!(customer_name("linha sem rótulo algum").is_none());
    }
}
