//! Line-item extraction pipeline.
//!
//! Standard mode is one model call. Comprehensive mode asks for an overview
//! of the document's sections first, runs one focused call per section and
//! merges the results. Both report progress through a caller-supplied
//! callback.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::prompts;
use super::vision::{TokenUsage, VisionError, VisionModel, VisionRequest};
use crate::domain::diagrams::DiagramCategory;
use crate::domain::extraction::{
    CategorizationResult, Confidence, ExtractedLineItem, ExtractionMode, ExtractionResult,
};

/// Upper bound on focused passes in comprehensive mode
pub const MAX_SECTIONS: usize = 8;

/// Progress callback: `(percent, stage)`
pub type ProgressFn<'a> = &'a (dyn Fn(u8, &str) + Send + Sync);

/// Forwards progress to a callback, never letting the percentage go backwards
struct ProgressTracker<'a> {
    sink: ProgressFn<'a>,
    last: AtomicU8,
}

impl<'a> ProgressTracker<'a> {
    fn new(sink: ProgressFn<'a>) -> Self {
        Self {
            sink,
            last: AtomicU8::new(0),
        }
    }

    fn report(&self, percent: u8, stage: &str) {
        let percent = percent.min(100);
        let previous = self.last.fetch_max(percent, Ordering::SeqCst);
        (self.sink)(percent.max(previous), stage);
    }
}

/// Extraction output plus bookkeeping
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub result: ExtractionResult,
    pub mode: ExtractionMode,
    /// Model calls made
    pub passes: u32,
    pub usage: TokenUsage,
}

/// Slice of the model's text that should hold the JSON object: a ```json
/// fence body if present, else first `{` through last `}`, else everything.
pub fn extract_json_str(text: &str) -> &str {
    const FENCE: &str = "```json";
    if let Some(start) = text.find(FENCE) {
        let body_start = start + FENCE.len();
        let body_end = text[body_start..]
            .find("```")
            .map(|offset| body_start + offset)
            .unwrap_or(text.len());
        return text[body_start..body_end].trim();
    }

    if let Some(start) = text.find('{') {
        let end = text.rfind('}').map(|i| i + 1).unwrap_or(text.len());
        if end > start {
            return &text[start..end];
        }
        return &text[start..];
    }

    text
}

fn clean_items(items: Vec<ExtractedLineItem>) -> Vec<ExtractedLineItem> {
    items
        .into_iter()
        .filter_map(|mut item| {
            let description = item.description.trim();
            if description.is_empty() {
                return None;
            }
            item.description = description.to_string();
            Some(item)
        })
        .collect()
}

/// Strict parse of an extraction reply
pub fn try_parse_extraction(text: &str) -> Result<ExtractionResult, serde_json::Error> {
    let mut result: ExtractionResult = serde_json::from_str(extract_json_str(text))?;
    result.line_items = clean_items(result.line_items);
    result.raw_text = Some(text.to_string());
    Ok(result)
}

/// Parse an extraction reply; unparseable text yields no items, low confidence
/// and the raw text for the reviewer to read.
pub fn parse_extraction(text: &str) -> ExtractionResult {
    try_parse_extraction(text).unwrap_or_else(|e| {
        warn!(error = %e, "Vision response was not valid extraction JSON");
        ExtractionResult {
            project_name: None,
            line_items: Vec::new(),
            extraction_confidence: Confidence::Low,
            raw_text: Some(text.to_string()),
        }
    })
}

#[derive(Debug, Deserialize, Default)]
struct Overview {
    #[serde(default)]
    project_name: Option<String>,
    #[serde(default)]
    sections: Vec<String>,
    #[serde(default)]
    extraction_confidence: Confidence,
}

fn parse_overview(text: &str, max_sections: usize) -> Overview {
    let mut overview: Overview = serde_json::from_str(extract_json_str(text)).unwrap_or_else(|e| {
        warn!(error = %e, "Overview response was not valid JSON");
        Overview::default()
    });

    let mut seen = std::collections::HashSet::new();
    overview.sections = overview
        .sections
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.to_lowercase()))
        .take(max_sections)
        .collect();
    overview
}

/// Merge line items from several passes, in first-seen order. Items with the
/// same normalized (item number, description) collapse into the first report,
/// with gaps filled from later ones.
pub fn merge_line_items(
    passes: impl IntoIterator<Item = Vec<ExtractedLineItem>>,
) -> Vec<ExtractedLineItem> {
    let mut merged: Vec<ExtractedLineItem> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for item in passes.into_iter().flatten() {
        let key = item.dedup_key();
        match index.get(&key) {
            Some(&i) => merged[i].fill_missing_from(&item),
            None => {
                index.insert(key, merged.len());
                merged.push(item);
            }
        }
    }

    merged
}

#[derive(Debug, Deserialize)]
struct RawCategorization {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    trades: Vec<String>,
}

/// Parse a categorization reply; garbage becomes `Other` with zero confidence
pub fn parse_categorization(text: &str) -> CategorizationResult {
    match serde_json::from_str::<RawCategorization>(extract_json_str(text)) {
        Ok(raw) => CategorizationResult {
            category: raw
                .category
                .as_deref()
                .map(DiagramCategory::parse_lenient)
                .unwrap_or(DiagramCategory::Other),
            confidence: raw
                .confidence
                .filter(|c| c.is_finite())
                .unwrap_or(0.0)
                .clamp(0.0, 1.0),
            summary: raw.summary.filter(|s| !s.trim().is_empty()),
            trades: raw
                .trades
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        },
        Err(e) => {
            warn!(error = %e, "Categorization response was not valid JSON");
            CategorizationResult {
                category: DiagramCategory::Other,
                confidence: 0.0,
                summary: None,
                trades: Vec::new(),
            }
        }
    }
}

fn add_usage(total: &mut TokenUsage, usage: &TokenUsage) {
    total.input_tokens += usage.input_tokens;
    total.output_tokens += usage.output_tokens;
}

/// Runs extraction and categorization against a [`VisionModel`]
#[derive(Clone)]
pub struct ExtractionService {
    vision: Arc<dyn VisionModel>,
    max_sections: usize,
}

impl ExtractionService {
    pub fn new(vision: Arc<dyn VisionModel>) -> Self {
        Self {
            vision,
            max_sections: MAX_SECTIONS,
        }
    }

    pub fn model_name(&self) -> &str {
        self.vision.model_name()
    }

    pub fn vision(&self) -> &Arc<dyn VisionModel> {
        &self.vision
    }

    pub async fn extract(
        &self,
        bytes: &[u8],
        media_type: &str,
        mode: ExtractionMode,
        progress: ProgressFn<'_>,
    ) -> Result<ExtractionOutcome, VisionError> {
        let tracker = ProgressTracker::new(progress);
        tracker.report(5, "Preparing document");

        let outcome = match mode {
            ExtractionMode::Standard => self.run_standard(bytes, media_type, &tracker, 10).await?,
            ExtractionMode::Comprehensive => {
                self.run_comprehensive(bytes, media_type, &tracker).await?
            }
        };

        info!(
            mode = mode.as_str(),
            passes = outcome.passes,
            line_items = outcome.result.line_items.len(),
            confidence = outcome.result.extraction_confidence.as_str(),
            "Extraction finished"
        );
        tracker.report(100, "Extraction complete");
        Ok(outcome)
    }

    async fn run_standard(
        &self,
        bytes: &[u8],
        media_type: &str,
        tracker: &ProgressTracker<'_>,
        start_percent: u8,
    ) -> Result<ExtractionOutcome, VisionError> {
        tracker.report(start_percent, "Analyzing document");
        let prompt = prompts::standard_extraction();
        let reply = self
            .vision
            .analyze(VisionRequest {
                bytes,
                media_type,
                prompt: &prompt,
            })
            .await?;

        tracker.report(90, "Parsing line items");
        Ok(ExtractionOutcome {
            result: parse_extraction(&reply.text),
            mode: ExtractionMode::Standard,
            passes: 1,
            usage: reply.usage,
        })
    }

    async fn run_comprehensive(
        &self,
        bytes: &[u8],
        media_type: &str,
        tracker: &ProgressTracker<'_>,
    ) -> Result<ExtractionOutcome, VisionError> {
        tracker.report(10, "Identifying document sections");
        let overview_prompt = prompts::overview(self.max_sections);
        let overview_reply = self
            .vision
            .analyze(VisionRequest {
                bytes,
                media_type,
                prompt: &overview_prompt,
            })
            .await?;
        let overview = parse_overview(&overview_reply.text, self.max_sections);

        if overview.sections.is_empty() {
            info!("Overview found no sections, falling back to standard extraction");
            let mut outcome = self.run_standard(bytes, media_type, tracker, 20).await?;
            outcome.passes += 1;
            add_usage(&mut outcome.usage, &overview_reply.usage);
            if outcome.result.project_name.is_none() {
                outcome.result.project_name = overview.project_name;
            }
            return Ok(outcome);
        }

        debug!(sections = ?overview.sections, "Comprehensive extraction sections");

        let mut usage = overview_reply.usage.clone();
        let mut passes = 1u32;
        let mut raw_parts = vec![format!("--- overview ---\n{}", overview_reply.text)];
        let mut confidences = vec![overview.extraction_confidence];
        let mut item_passes = Vec::with_capacity(overview.sections.len());
        let mut project_name = overview.project_name;

        let total = overview.sections.len();
        for (i, section) in overview.sections.iter().enumerate() {
            let percent = 20 + (70 * i / total) as u8;
            tracker.report(percent, &format!("Extracting section {}/{}: {}", i + 1, total, section));

            let prompt = prompts::section_extraction(section);
            passes += 1;
            let reply = match self
                .vision
                .analyze(VisionRequest {
                    bytes,
                    media_type,
                    prompt: &prompt,
                })
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(section = %section, error = %e, "Section pass failed, skipping");
                    continue;
                }
            };
            add_usage(&mut usage, &reply.usage);
            raw_parts.push(format!("--- {} ---\n{}", section, reply.text));

            match try_parse_extraction(&reply.text) {
                Ok(parsed) => {
                    confidences.push(parsed.extraction_confidence);
                    if project_name.is_none() {
                        project_name = parsed.project_name;
                    }
                    let items = parsed
                        .line_items
                        .into_iter()
                        .map(|mut item| {
                            if item.category.is_none() {
                                item.category = Some(section.clone());
                            }
                            item
                        })
                        .collect();
                    item_passes.push(items);
                }
                Err(e) => {
                    warn!(section = %section, error = %e, "Section response was not valid JSON, skipping");
                }
            }
        }

        tracker.report(95, "Merging line items");
        let line_items = merge_line_items(item_passes);
        let extraction_confidence = if line_items.is_empty() {
            Confidence::Low
        } else {
            confidences.into_iter().min().unwrap_or_default()
        };

        Ok(ExtractionOutcome {
            result: ExtractionResult {
                project_name,
                line_items,
                extraction_confidence,
                raw_text: Some(raw_parts.join("\n\n")),
            },
            mode: ExtractionMode::Comprehensive,
            passes,
            usage,
        })
    }

    pub async fn categorize(
        &self,
        bytes: &[u8],
        media_type: &str,
    ) -> Result<CategorizationResult, VisionError> {
        let prompt = prompts::categorization();
        let reply = self
            .vision
            .analyze(VisionRequest {
                bytes,
                media_type,
                prompt: &prompt,
            })
            .await?;
        Ok(parse_categorization(&reply.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::vision::VisionReply;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays canned replies and records the prompts it saw
    struct ScriptedVision {
        replies: Mutex<VecDeque<Result<String, VisionError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedVision {
        fn new(replies: Vec<Result<&str, VisionError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl VisionModel for ScriptedVision {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn analyze(
            &self,
            request: VisionRequest<'_>,
        ) -> Result<VisionReply, VisionError> {
            self.prompts.lock().push(request.prompt.to_string());
            let next = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(VisionError::Unavailable("script exhausted".into())));
            next.map(|text| VisionReply {
                text,
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 10,
                },
            })
        }
    }

    fn no_progress(_: u8, _: &str) {}

    #[test]
    fn json_is_taken_from_fence() {
        let text = "Here you go:\n```json\n{\"line_items\": []}\n```\nThanks";
        assert_eq!(extract_json_str(text), "{\"line_items\": []}");
    }

    #[test]
    fn unterminated_fence_runs_to_end() {
        let text = "```json\n{\"a\": 1}";
        assert_eq!(extract_json_str(text), "{\"a\": 1}");
    }

    #[test]
    fn json_is_taken_between_outer_braces() {
        let text = "Sure! {\"a\": {\"b\": 1}} hope that helps";
        assert_eq!(extract_json_str(text), "{\"a\": {\"b\": 1}}");
        assert_eq!(extract_json_str("no json here"), "no json here");
    }

    #[test]
    fn parse_keeps_raw_text_and_drops_blank_items() {
        let text = r#"{"project_name": "Main St Clinic",
            "line_items": [
                {"item_number": "1", "description": " Excavation ", "quantity": 120, "unit": "CY"},
                {"description": "   "}
            ],
            "extraction_confidence": "high"}"#;
        let result = parse_extraction(text);
        assert_eq!(result.project_name.as_deref(), Some("Main St Clinic"));
        assert_eq!(result.line_items.len(), 1);
        assert_eq!(result.line_items[0].description, "Excavation");
        assert_eq!(result.extraction_confidence, Confidence::High);
        assert_eq!(result.raw_text.as_deref(), Some(text));
    }

    #[test]
    fn invalid_json_falls_back_to_low_confidence() {
        let text = "I could not read this drawing { not json";
        let result = parse_extraction(text);
        assert!(result.line_items.is_empty());
        assert_eq!(result.extraction_confidence, Confidence::Low);
        assert_eq!(result.raw_text.as_deref(), Some(text));
    }

    #[test]
    fn merge_deduplicates_and_fills_gaps() {
        let a = vec![
            ExtractedLineItem {
                item_number: Some("1".into()),
                description: "Concrete footing".into(),
                quantity: Some(10.0),
                ..Default::default()
            },
            ExtractedLineItem {
                description: "Rebar".into(),
                ..Default::default()
            },
        ];
        let b = vec![
            ExtractedLineItem {
                item_number: Some("1".into()),
                description: "concrete  FOOTING".into(),
                unit: Some("CY".into()),
                quantity: Some(99.0),
                ..Default::default()
            },
            ExtractedLineItem {
                description: "Formwork".into(),
                ..Default::default()
            },
        ];

        let merged = merge_line_items(vec![a, b]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].quantity, Some(10.0));
        assert_eq!(merged[0].unit.as_deref(), Some("CY"));
        assert_eq!(merged[1].description, "Rebar");
        assert_eq!(merged[2].description, "Formwork");
    }

    #[test]
    fn categorization_parsing() {
        let parsed = parse_categorization(
            r#"```json
            {"category": "Electrical", "confidence": 1.7, "summary": "Lighting plan", "trades": ["Electrical", " "]}
            ```"#,
        );
        assert_eq!(parsed.category, DiagramCategory::Electrical);
        assert_eq!(parsed.confidence, 1.0);
        assert_eq!(parsed.summary.as_deref(), Some("Lighting plan"));
        assert_eq!(parsed.trades, vec!["Electrical".to_string()]);

        let garbage = parse_categorization("no idea");
        assert_eq!(garbage.category, DiagramCategory::Other);
        assert_eq!(garbage.confidence, 0.0);
    }

    #[tokio::test]
    async fn standard_mode_is_one_pass() {
        let vision = ScriptedVision::new(vec![Ok(
            r#"{"line_items": [{"description": "Paint walls", "quantity": 400, "unit": "SF"}], "extraction_confidence": "medium"}"#,
        )]);
        let service = ExtractionService::new(vision.clone());

        let outcome = service
            .extract(b"img", "image/png", ExtractionMode::Standard, &no_progress)
            .await
            .unwrap();

        assert_eq!(outcome.passes, 1);
        assert_eq!(outcome.mode, ExtractionMode::Standard);
        assert_eq!(outcome.result.line_items.len(), 1);
        assert_eq!(outcome.result.extraction_confidence, Confidence::Medium);
        assert!(vision.prompts.lock()[0].contains("extract all bid items"));
    }

    #[tokio::test]
    async fn comprehensive_mode_runs_a_pass_per_section_and_merges() {
        let vision = ScriptedVision::new(vec![
            Ok(r#"{"project_name": "Depot", "sections": ["Concrete", "Electrical", "concrete"], "extraction_confidence": "high"}"#),
            Ok(r#"{"line_items": [{"item_number": "C1", "description": "Slab on grade", "quantity": 5000, "unit": "SF"}], "extraction_confidence": "high"}"#),
            Ok(r#"```json
{"line_items": [{"item_number": "C1", "description": "Slab on grade", "unit_price": 6.5},
                {"description": "Panelboard", "quantity": 2, "unit": "EA"}],
 "extraction_confidence": "medium"}
```"#),
        ]);
        let service = ExtractionService::new(vision.clone());

        let reports = Mutex::new(Vec::new());
        let record = |percent: u8, stage: &str| reports.lock().push((percent, stage.to_string()));

        let outcome = service
            .extract(b"pdf", "application/pdf", ExtractionMode::Comprehensive, &record)
            .await
            .unwrap();

        // Overview + two distinct sections
        assert_eq!(outcome.passes, 3);
        assert_eq!(outcome.result.project_name.as_deref(), Some("Depot"));
        assert_eq!(outcome.result.line_items.len(), 2);
        let slab = &outcome.result.line_items[0];
        assert_eq!(slab.unit_price, Some(6.5));
        assert_eq!(slab.category.as_deref(), Some("Concrete"));
        assert_eq!(
            outcome.result.line_items[1].category.as_deref(),
            Some("Electrical")
        );
        assert_eq!(outcome.result.extraction_confidence, Confidence::Medium);
        assert_eq!(outcome.usage.input_tokens, 300);

        let prompts = vision.prompts.lock();
        assert!(prompts[1].contains("\"Concrete\""));
        assert!(prompts[2].contains("\"Electrical\""));

        let reports = reports.lock();
        assert_eq!(reports.last().unwrap().0, 100);
        assert!(reports.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[tokio::test]
    async fn failed_sections_are_skipped() {
        let vision = ScriptedVision::new(vec![
            Ok(r#"{"sections": ["Roofing", "Doors"], "extraction_confidence": "high"}"#),
            Err(VisionError::Unavailable("timeout".into())),
            Ok(r#"{"line_items": [{"description": "Hollow metal door", "quantity": 12, "unit": "EA"}], "extraction_confidence": "high"}"#),
        ]);
        let service = ExtractionService::new(vision);

        let outcome = service
            .extract(b"img", "image/jpeg", ExtractionMode::Comprehensive, &no_progress)
            .await
            .unwrap();

        assert_eq!(outcome.result.line_items.len(), 1);
        assert_eq!(outcome.result.line_items[0].description, "Hollow metal door");
        assert_eq!(outcome.result.extraction_confidence, Confidence::High);
    }

    #[tokio::test]
    async fn empty_overview_falls_back_to_standard() {
        let vision = ScriptedVision::new(vec![
            Ok(r#"{"project_name": "Annex", "sections": []}"#),
            Ok(r#"{"line_items": [{"description": "Demolition", "unit": "LS"}], "extraction_confidence": "low"}"#),
        ]);
        let service = ExtractionService::new(vision.clone());

        let outcome = service
            .extract(b"img", "image/png", ExtractionMode::Comprehensive, &no_progress)
            .await
            .unwrap();

        assert_eq!(outcome.passes, 2);
        assert_eq!(outcome.mode, ExtractionMode::Standard);
        assert_eq!(outcome.result.project_name.as_deref(), Some("Annex"));
        assert_eq!(outcome.result.line_items.len(), 1);
        assert!(vision.prompts.lock()[1].contains("extract all bid items"));
    }

    #[tokio::test]
    async fn overview_failure_fails_the_run() {
        let vision = ScriptedVision::new(vec![Err(VisionError::Rejected {
            status: 401,
            message: "bad key".into(),
        })]);
        let service = ExtractionService::new(vision);

        let err = service
            .extract(b"img", "image/png", ExtractionMode::Comprehensive, &no_progress)
            .await
            .unwrap_err();
        assert!(matches!(err, VisionError::Rejected { status: 401, .. }));
    }
}
