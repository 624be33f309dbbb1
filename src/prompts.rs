//! Prompts for the LLM-backed collaborators.
//!
//! Kept together so wording changes never touch retry or parsing code, and
//! so tests can assert on the instructions that matter (JSON-only output,
//! translation-only output).

/// System prompt for structuring a copyright page into JSON.
pub const METADATA_SYSTEM_PROMPT: &str = r#"You extract bibliographic metadata from the copyright page of a book.

Return ONLY one JSON object, no commentary, no Markdown fences, with these keys:
  "title"          string, main title without subtitle
  "subtitle"       string, or "" if none
  "authors"        array of strings, personal or corporate authors in order
  "publisher"      string
  "published_date" string, the year or full date of THIS edition (e.g. "2020")
  "edition"        integer edition number (1 for a first edition), or null
  "isbn"           string, the ISBN of the print or e-book edition as printed
  "categories"     array of short subject categories, may be empty
  "language"       ISO 639-1 code of the book's language

Use "" or null for anything the text does not state. Never invent an ISBN."#;

/// Wrap raw page text for the metadata request.
pub fn metadata_user_prompt(raw_text: &str) -> String {
    format!("Copyright page text:\n\"\"\"\n{}\n\"\"\"", raw_text.trim())
}

/// System prompt for translation. `{hint}` is replaced by the domain hint.
pub const TRANSLATION_SYSTEM_PROMPT: &str = r#"You are a professional translator for a technical book catalogue.
Translate the user's text into Simplified Chinese. The text is: {hint}.

Rules:
- Output ONLY the translation. No explanations, notes, quotes, or romanisation.
- Keep product names, programming languages, acronyms and version numbers in their original form.
- If the input has numbered lines ("1. ...", "2. ..."), output exactly the same number of numbered lines in the same order."#;

pub fn translation_system_prompt(domain_hint: &str) -> String {
    TRANSLATION_SYSTEM_PROMPT.replace("{hint}", domain_hint)
}

/// System prompt for the OCR fallback.
pub const OCR_SYSTEM_PROMPT: &str = r#"Transcribe all text visible on this book page exactly as printed.
Output plain text only, one printed line per line. Do not summarise, translate, or add anything.
Pay particular attention to ISBNs, years, edition statements, and publisher names."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_prompt_embeds_hint() {
        let p = translation_system_prompt("a book title");
        assert!(p.contains("The text is: a book title."));
        assert!(!p.contains("{hint}"));
    }

    #[test]
    fn metadata_prompt_demands_json_only() {
        assert!(METADATA_SYSTEM_PROMPT.contains("ONLY one JSON object"));
        assert!(metadata_user_prompt("  ISBN 978  ").contains("\"\"\"\nISBN 978\n\"\"\""));
    }
}
