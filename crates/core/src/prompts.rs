use crate::models::ChipSet;
use crate::templates::DocumentTemplate;

pub const PAGE_EXTRACTION_PROMPT: &str = r#"You are transcribing one page of a scanned or digital document.
Extract all text from this page exactly as it appears, in natural reading order.
Preserve paragraph breaks, headings, numbering and list structure.
Wrap tables between [TABLE] and [/TABLE] and keep one row per line with cells separated by |.
Wrap handwritten text between [HANDWRITTEN] and [/HANDWRITTEN]; mark signatures as [SIGNATURE].
Do not summarise, translate, correct or add commentary.
Return only the extracted text with no preamble and no code fences."#;

pub const CLASSIFICATION_SYSTEM_PROMPT: &str = "You classify documents and extract structured metadata. Reply with a single JSON object and nothing else.";

pub const ANSWER_SYSTEM_PROMPT: &str = "You answer questions using only the provided document excerpts. Cite the document name for each fact. If the excerpts do not contain the answer, say so.";

pub fn classification_prompt(text: &str, templates: &[DocumentTemplate], fallback: &str) -> String {
    let mut prompt = String::from(
        "Decide which document type below best fits the document and extract the listed fields for that type only.\n\nDocument types:\n",
    );

    for template in templates {
        prompt.push_str(&format!(
            "- {}: fields [{}]",
            template.type_name,
            template.chip_fields.join(", ")
        ));
        if let Some(hint) = template
            .extraction_prompt
            .as_deref()
            .filter(|hint| !hint.trim().is_empty())
        {
            prompt.push_str(&format!(" (hint: {})", hint.trim()));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "\nIf no specific type fits, use \"{fallback}\".\n\
Respond with JSON of exactly this shape:\n\
{{\"file_type\": \"<one type name>\", \"confidence\": <number between 0 and 1>, \"chips\": {{\"<field>\": \"<value or empty string>\"}}, \"reasoning\": \"<one sentence>\"}}\n\
Use an empty string for any field you cannot find.\n\nDocument:\n\"\"\"\n{text}\n\"\"\""
    ));

    prompt
}

pub fn answer_context(excerpts: &[(String, f32, String)]) -> String {
    if excerpts.is_empty() {
        return "No relevant document excerpts were found.".to_string();
    }

    excerpts
        .iter()
        .enumerate()
        .map(|(position, (document, similarity, text))| {
            format!(
                "[{}] {} (similarity {:.2})\n{}",
                position + 1,
                document,
                similarity,
                text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn chip_lines(chips: &ChipSet) -> Vec<String> {
    chips
        .non_empty()
        .map(|chip| {
            format!(
                "{}: {}",
                humanize_field(&chip.key),
                chip.value.split_whitespace().collect::<Vec<_>>().join(" ")
            )
        })
        .collect()
}

/// `property_address` -> `Property Address`.
pub fn humanize_field(key: &str) -> String {
    key.split(['_', '-', ' '])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanize_handles_separators() {
        assert_eq!(humanize_field("property_address"), "Property Address");
        assert_eq!(humanize_field("lease-start date"), "Lease Start Date");
        assert_eq!(humanize_field("rent"), "Rent");
    }

    #[test]
    fn prompt_lists_every_template_and_hint() {
        let templates = vec![
            DocumentTemplate::new("lease", ["tenant_name", "monthly_rent"])
                .with_hint("residential or commercial leases"),
            DocumentTemplate::new("generic", ["title"]),
        ];
        let prompt = classification_prompt("Lease text", &templates, "generic");

        assert!(prompt.contains("- lease: fields [tenant_name, monthly_rent] (hint: residential or commercial leases)"));
        assert!(prompt.contains("- generic: fields [title]"));
        assert!(prompt.contains("\"file_type\""));
        assert!(prompt.ends_with("Lease text\n\"\"\""));
    }

    #[test]
    fn empty_context_is_explicit() {
        assert_eq!(answer_context(&[]), "No relevant document excerpts were found.");
    }
}
