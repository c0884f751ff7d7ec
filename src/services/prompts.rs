//! Prompt text sent to the vision model

/// JSON shape every extraction prompt asks for
const LINE_ITEM_SCHEMA: &str = r#"{
  "project_name": "string or null",
  "line_items": [
    {
      "item_number": "string or null",
      "description": "string",
      "quantity": number or null,
      "unit": "string or null",
      "unit_price": number or null,
      "total_price": number or null,
      "notes": "string or null"
    }
  ],
  "extraction_confidence": "high/medium/low"
}"#;

/// Single-pass extraction over the whole drawing
pub fn standard_extraction() -> String {
    format!(
        r#"Analyze this construction/preconstruction diagram or work drawing and extract all bid items and information.

Please extract the following information in a structured format:
1. Project name or title (if visible)
2. All line items with:
   - Item number (if present)
   - Description of work/material
   - Quantity (if specified)
   - Unit of measurement (e.g., LF, SF, EA, CY, etc.)
   - Any visible pricing information
   - Any relevant notes or specifications

Format your response as a JSON object with this structure:
{schema}

If this is not a construction diagram or you cannot extract meaningful bid information, return an empty line_items array and set extraction_confidence to "low"."#,
        schema = LINE_ITEM_SCHEMA
    )
}

/// First comprehensive pass: list the parts of the drawing worth a focused pass
pub fn overview(max_sections: usize) -> String {
    format!(
        r#"You are reviewing a construction drawing or specification for a preconstruction bid.

Do not extract line items yet. Identify:
1. The project name or title (if visible)
2. The distinct sections of this document that contain biddable scope, such as
   trades (e.g. "Concrete", "Electrical", "Plumbing"), schedules, keynote lists,
   or areas of the drawing. List at most {max_sections}, most significant first.

Respond with a JSON object:
{{
  "project_name": "string or null",
  "sections": ["string"],
  "extraction_confidence": "high/medium/low"
}}

If this is not a construction document, return an empty sections array and set extraction_confidence to "low"."#
    )
}

/// Focused comprehensive pass over one section
pub fn section_extraction(section: &str) -> String {
    format!(
        r#"Analyze this construction/preconstruction document and extract bid line items ONLY for the following section or trade: "{section}".

Be exhaustive within that section: include every item, quantity, unit of measurement (LF, SF, EA, CY, LS, etc.), visible pricing, and notes. Ignore scope that belongs to other sections.

Format your response as a JSON object with this structure:
{schema}

If the section has no extractable items, return an empty line_items array and set extraction_confidence to "low"."#,
        section = section.replace('"', "'"),
        schema = LINE_ITEM_SCHEMA
    )
}

/// Classify the drawing's discipline
pub fn categorization() -> String {
    r#"Classify this construction document.

Respond with a JSON object:
{
  "category": one of "floor_plan", "site_plan", "elevation", "section", "detail", "electrical", "plumbing", "mechanical", "structural", "specification", "schedule", "other",
  "confidence": number between 0 and 1,
  "summary": "one or two sentences describing the document",
  "trades": ["trades whose scope appears in the document"]
}"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_prompt_names_the_section() {
        let prompt = section_extraction("Division 09 \"Finishes\"");
        assert!(prompt.contains("Division 09 'Finishes'"));
        assert!(prompt.contains("\"line_items\""));
    }

    #[test]
    fn overview_prompt_caps_sections() {
        assert!(overview(8).contains("at most 8"));
    }
}
