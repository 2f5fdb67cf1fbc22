//! Extraction: evidence text -> grounded atomic claims.
//!
//! The [`ClaimExtractor`] seam proposes candidates; the stage enforces the
//! grounding contract. A candidate whose quote is not a verbatim substring
//! of the evidence text becomes a rejection record, and candidates below
//! the configured minimum confidence are dropped without being persisted.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use regtruth_crawler::document_text;
use regtruth_shared::{
    AtomicClaim, AuthorityLevel, ContentClass, Evidence, ExtractionConfig, ItemState, QueueName,
    RegTruthError, Result, ValueType,
};
use regtruth_storage::{Job, Storage};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{ComposeJob, EvidenceJob, settle_item};
use crate::context::StageContext;
use crate::queue::{JobError, JobHandler, decode, enqueue_next};

/// A claim proposed by an extractor, before grounding checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateClaim {
    pub concept: String,
    pub exact_quote: String,
    pub normalized_value: String,
    pub value_type: ValueType,
    pub confidence: f64,
    pub legal_reference: Option<String>,
    pub effective_from: Option<NaiveDate>,
}

#[async_trait]
pub trait ClaimExtractor: Send + Sync {
    async fn extract(&self, evidence: &Evidence, text: &str) -> Result<Vec<CandidateClaim>>;
}

// ---------------------------------------------------------------------------
// Pattern extractor
// ---------------------------------------------------------------------------

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:[.,]\d{1,2})?)\s?%").expect("valid regex"));

static AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\d{1,3}(?:[. ]\d{3})+(?:,\d{1,2})?|\d+(?:[.,]\d{1,2})?)\s?(€|(?:eura|eur|kuna|kn|hrk)\b)",
    )
    .expect("valid regex")
});

static THOUSANDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(?:\.\d{3})+(?:,\d{1,2})?$").expect("valid regex"));

static DMY_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})\.\s?(\d{1,2})\.\s?(\d{4})\b").expect("valid regex")
});

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("valid regex"));

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:članak|članka|članku|čl\.|article|art\.)\s*(\d+[a-z]?)")
        .expect("valid regex")
});

static EFFECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:od|from|as of|since|effective(?: from)?|primjenjuje se od|stupa na snagu)\s+(\d{1,2}\.\s?\d{1,2}\.\s?\d{4}|\d{4}-\d{2}-\d{2})",
    )
    .expect("valid regex")
});

struct ConceptMatcher {
    id: String,
    keywords: Vec<Regex>,
    value_type: Option<ValueType>,
}

/// Keyword-and-value extractor driven by `[[extraction.concepts]]`.
pub struct PatternExtractor {
    concepts: Vec<ConceptMatcher>,
}

impl PatternExtractor {
    pub fn from_config(config: &ExtractionConfig) -> Result<Self> {
        let mut concepts = Vec::with_capacity(config.concepts.len());
        for concept in &config.concepts {
            let keywords = concept
                .keywords
                .iter()
                .map(|k| {
                    Regex::new(k).map_err(|e| {
                        RegTruthError::config(format!("concept '{}' keyword '{k}': {e}", concept.id))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            concepts.push(ConceptMatcher {
                id: concept.id.clone(),
                keywords,
                value_type: concept.value_type,
            });
        }
        Ok(Self { concepts })
    }

    fn candidates(&self, text: &str) -> Vec<CandidateClaim> {
        let mut out = Vec::new();
        for sentence in sentences(text) {
            for concept in &self.concepts {
                if !concept.keywords.iter().any(|k| k.is_match(sentence)) {
                    continue;
                }
                if let Some(candidate) = candidate_for(concept, sentence) {
                    out.push(candidate);
                }
            }
        }
        out
    }
}

#[async_trait]
impl ClaimExtractor for PatternExtractor {
    async fn extract(&self, _evidence: &Evidence, text: &str) -> Result<Vec<CandidateClaim>> {
        Ok(self.candidates(text))
    }
}

fn candidate_for(concept: &ConceptMatcher, sentence: &str) -> Option<CandidateClaim> {
    let order = match concept.value_type {
        Some(t) => vec![t],
        None => vec![ValueType::NumericThreshold, ValueType::Date, ValueType::Reference],
    };
    let typed = order
        .into_iter()
        .map(|t| (t, values_of(t, sentence)))
        .find(|(_, values)| !values.is_empty());

    let (value_type, values, base) = match typed {
        Some((t, values)) => (t, values, 0.6),
        None if concept.value_type.is_some() => return None,
        None => (ValueType::FreeText, vec![collapse(sentence)], 0.45),
    };

    let legal_reference = REFERENCE.find(sentence).map(|m| m.as_str().trim().to_string());
    let effective_from = EFFECTIVE
        .captures(sentence)
        .and_then(|c| c.get(1))
        .and_then(|m| dates(m.as_str()).into_iter().next());

    let distinct: BTreeSet<&String> = values.iter().collect();
    let mut confidence: f64 = base;
    if distinct.len() == 1 {
        confidence += 0.15;
    }
    if legal_reference.is_some() {
        confidence += 0.1;
    }
    if effective_from.is_some() {
        confidence += 0.05;
    }

    Some(CandidateClaim {
        concept: concept.id.clone(),
        exact_quote: sentence.to_string(),
        normalized_value: values[0].clone(),
        value_type,
        confidence: round2(confidence.min(1.0)),
        legal_reference,
        effective_from,
    })
}

fn values_of(value_type: ValueType, sentence: &str) -> Vec<String> {
    match value_type {
        ValueType::NumericThreshold => {
            let mut values: Vec<(usize, String)> = PERCENT
                .captures_iter(sentence)
                .filter_map(|c| {
                    let number = c.get(1)?;
                    let value = trim_decimals(&number.as_str().replace(',', "."));
                    Some((number.start(), format!("{value}%")))
                })
                .collect();
            values.extend(AMOUNT.captures_iter(sentence).filter_map(|c| {
                let number = c.get(1)?;
                let currency = c.get(2)?;
                Some((number.start(), normalize_amount(number.as_str(), currency.as_str())))
            }));
            values.sort_by_key(|(at, _)| *at);
            values.into_iter().map(|(_, v)| v).collect()
        }
        ValueType::Date => dates(sentence)
            .into_iter()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect(),
        ValueType::Reference => REFERENCE
            .captures_iter(sentence)
            .filter_map(|c| c.get(1).map(|m| format!("article {}", m.as_str().to_lowercase())))
            .collect(),
        ValueType::FreeText => vec![collapse(sentence)],
    }
}

/// Dates in `d.m.yyyy` or ISO form, in order of appearance.
fn dates(text: &str) -> Vec<NaiveDate> {
    let mut found: Vec<(usize, NaiveDate)> = Vec::new();
    for c in DMY_DATE.captures_iter(text) {
        let parts = (c[1].parse::<u32>(), c[2].parse::<u32>(), c[3].parse::<i32>());
        if let (Some(all), (Ok(d), Ok(m), Ok(y))) = (c.get(0), parts) {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                found.push((all.start(), date));
            }
        }
    }
    for c in ISO_DATE.captures_iter(text) {
        let parts = (c[1].parse::<i32>(), c[2].parse::<u32>(), c[3].parse::<u32>());
        if let (Some(all), (Ok(y), Ok(m), Ok(d))) = (c.get(0), parts) {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                found.push((all.start(), date));
            }
        }
    }
    found.sort_by_key(|(at, _)| *at);
    found.into_iter().map(|(_, d)| d).collect()
}

/// `40.000,00` -> `40000`, `1 500` -> `1500`, `12,5` -> `12.5`.
fn normalize_amount(number: &str, currency: &str) -> String {
    let compact = number.replace(' ', "");
    let value = if THOUSANDS.is_match(&compact) {
        compact.replace('.', "").replace(',', ".")
    } else {
        compact.replace(',', ".")
    };
    let currency = match currency.to_lowercase().as_str() {
        "€" | "eur" | "eura" => "EUR",
        _ => "HRK",
    };
    format!("{} {currency}", trim_decimals(&value))
}

fn trim_decimals(value: &str) -> String {
    match value.split_once('.') {
        Some((whole, frac)) if frac.chars().all(|c| c == '0') => whole.to_string(),
        _ => value.to_string(),
    }
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Split text into sentences that are verbatim slices of it.
///
/// A period after a digit never ends a sentence, so ordinals and dates
/// (`38. stavak`, `1.1.2025.`) stay intact.
pub fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    for line in text.lines() {
        let chars: Vec<(usize, char)> = line.char_indices().collect();
        let mut start = 0;
        for (i, &(pos, c)) in chars.iter().enumerate() {
            if !matches!(c, '.' | '!' | '?') {
                continue;
            }
            let after_digit = i > 0 && chars[i - 1].1.is_ascii_digit();
            let spaced = chars.get(i + 1).is_some_and(|(_, n)| n.is_whitespace());
            let capital = chars.get(i + 2).is_some_and(|(_, n)| n.is_uppercase());
            if spaced && capital && !(c == '.' && after_digit) {
                let end = pos + c.len_utf8();
                push_trimmed(&mut out, &line[start..end]);
                start = end;
            }
        }
        push_trimmed(&mut out, &line[start..]);
    }
    out
}

fn push_trimmed<'a>(out: &mut Vec<&'a str>, s: &'a str) {
    let s = s.trim();
    if !s.is_empty() {
        out.push(s);
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

pub struct ExtractStage {
    storage: Arc<Storage>,
    extractor: Arc<dyn ClaimExtractor>,
}

impl ExtractStage {
    pub fn new(storage: Arc<Storage>, extractor: Arc<dyn ClaimExtractor>) -> Self {
        Self { storage, extractor }
    }
}

#[async_trait]
impl JobHandler for ExtractStage {
    fn queue(&self) -> QueueName {
        QueueName::Extract
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn handle(&self, ctx: &StageContext, job: &Job) -> std::result::Result<(), JobError> {
        let payload: EvidenceJob = decode(job)?;
        let Some(evidence) = self.storage.get_evidence(&payload.evidence_id).await? else {
            return Err(JobError::validation(
                format!("unknown evidence {}", payload.evidence_id),
                job.payload.clone(),
            ));
        };

        let text = match evidence.content_class {
            ContentClass::ScannedPdf => evidence.ocr_text.clone(),
            class => document_text(class, &evidence.raw_content),
        };
        let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
            let state = ItemState::Skipped {
                reason: "no extractable text".into(),
            };
            settle_item(&self.storage, payload.item_id.as_deref(), &state).await?;
            return Err(JobError::validation("no extractable text", job.payload.clone()));
        };

        let candidates = self.extractor.extract(&evidence, &text).await?;
        let authority = ctx
            .config
            .source(&evidence.source_id)
            .map(|s| s.authority)
            .unwrap_or(AuthorityLevel::ProceduralNotice);
        let min_confidence = ctx.config.extraction.min_confidence;

        let mut concepts = BTreeSet::new();
        let (mut kept, mut rejected, mut discarded) = (0usize, 0usize, 0usize);
        for candidate in candidates {
            let problem = if candidate.exact_quote.trim().is_empty()
                || !text.contains(&candidate.exact_quote)
            {
                Some("quote is not verbatim in the evidence")
            } else if !(0.0..=1.0).contains(&candidate.confidence) {
                Some("confidence outside [0, 1]")
            } else if candidate.normalized_value.trim().is_empty() {
                Some("empty normalized value")
            } else {
                None
            };
            if let Some(reason) = problem {
                self.storage
                    .insert_rejection("extract", &evidence.id, reason, &json!(candidate))
                    .await?;
                rejected += 1;
                continue;
            }
            if candidate.confidence < min_confidence {
                debug!(concept = %candidate.concept, confidence = candidate.confidence, "below minimum confidence");
                discarded += 1;
                continue;
            }

            let claim = AtomicClaim {
                id: Uuid::now_v7().to_string(),
                evidence_id: evidence.id.clone(),
                concept: candidate.concept.clone(),
                exact_quote: candidate.exact_quote,
                normalized_value: candidate.normalized_value,
                value_type: candidate.value_type,
                confidence: candidate.confidence,
                legal_reference: candidate.legal_reference,
                effective_from: candidate.effective_from,
                authority,
                created_at: ctx.now,
            };
            self.storage.insert_claim(&claim).await?;
            concepts.insert(candidate.concept);
            kept += 1;
        }

        for concept in concepts {
            let id = format!("{concept}@{}", evidence.id);
            enqueue_next(&self.storage, ctx, QueueName::Compose, id, &ComposeJob { concept }, job.priority)
                .await?;
        }

        let state = ItemState::Processed {
            evidence_id: evidence.id.clone(),
        };
        settle_item(&self.storage, payload.item_id.as_deref(), &state).await?;
        self.storage
            .record_event(
                "extract",
                "evidence",
                &evidence.id,
                "extracted",
                Some(json!({ "claims": kept, "rejected": rejected, "discarded": discarded })),
            )
            .await?;
        info!(evidence_id = %evidence.id, kept, rejected, discarded, "extraction finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx, job, store_evidence, test_storage};
    use regtruth_shared::ConceptPattern;

    fn extractor() -> PatternExtractor {
        PatternExtractor::from_config(&ExtractionConfig::default()).unwrap()
    }

    #[test]
    fn splits_sentences_without_breaking_ordinals() {
        let text = "Od 1.1.2025. opća stopa iznosi 25% (članak 38. Zakona). Snižena stopa je 13%.\nDrugi red";
        assert_eq!(
            sentences(text),
            vec![
                "Od 1.1.2025. opća stopa iznosi 25% (članak 38. Zakona).",
                "Snižena stopa je 13%.",
                "Drugi red",
            ]
        );
    }

    #[test]
    fn grounded_rate_with_reference_and_date() {
        let text = "Od 1.1.2025. opća stopa PDV-a iznosi 25% (članak 38. Zakona o PDV-u).";
        let claims = extractor().candidates(text);
        assert_eq!(claims.len(), 1);
        let claim = &claims[0];
        assert_eq!(claim.concept, "vat-standard-rate");
        assert_eq!(claim.normalized_value, "25%");
        assert_eq!(claim.value_type, ValueType::NumericThreshold);
        assert_eq!(claim.effective_from, NaiveDate::from_ymd_opt(2025, 1, 1));
        assert_eq!(claim.legal_reference.as_deref(), Some("članak 38"));
        assert_eq!(claim.confidence, 0.9);
        assert_eq!(claim.exact_quote, text);
    }

    #[test]
    fn normalizes_amounts() {
        assert_eq!(normalize_amount("40.000,00", "EUR"), "40000 EUR");
        assert_eq!(normalize_amount("300 000", "kn"), "300000 HRK");
        assert_eq!(normalize_amount("12,5", "€"), "12.5 EUR");

        let claims = extractor().candidates("The registration threshold is 60.000,00 EUR.");
        assert_eq!(claims[0].normalized_value, "60000 EUR");
        assert_eq!(claims[0].confidence, 0.75);
    }

    #[test]
    fn typed_concept_without_a_value_yields_nothing() {
        assert!(extractor().candidates("Opća stopa bit će objavljena naknadno.").is_empty());
    }

    #[test]
    fn untyped_concept_falls_back_to_free_text() {
        let config = ExtractionConfig {
            min_confidence: 0.0,
            concepts: vec![ConceptPattern {
                id: "filing-channel".into(),
                keywords: vec![r"(?i)e-porezna".into()],
                value_type: None,
            }],
        };
        let claims = PatternExtractor::from_config(&config)
            .unwrap()
            .candidates("Prijave se podnose  putem sustava e-Porezna.");
        assert_eq!(claims[0].value_type, ValueType::FreeText);
        assert_eq!(claims[0].normalized_value, "Prijave se podnose putem sustava e-Porezna.");
        assert_eq!(claims[0].confidence, 0.6);
    }

    #[test]
    fn invalid_keyword_is_a_config_error() {
        let config = ExtractionConfig {
            min_confidence: 0.5,
            concepts: vec![ConceptPattern {
                id: "broken".into(),
                keywords: vec!["(unclosed".into()],
                value_type: None,
            }],
        };
        assert!(matches!(
            PatternExtractor::from_config(&config),
            Err(RegTruthError::Config { .. })
        ));
    }

    struct Forged;

    #[async_trait]
    impl ClaimExtractor for Forged {
        async fn extract(&self, _evidence: &Evidence, _text: &str) -> Result<Vec<CandidateClaim>> {
            Ok(vec![CandidateClaim {
                concept: "vat-standard-rate".into(),
                exact_quote: "Opća stopa iznosi 30%.".into(),
                normalized_value: "30%".into(),
                value_type: ValueType::NumericThreshold,
                confidence: 0.95,
                legal_reference: None,
                effective_from: None,
            }])
        }
    }

    #[tokio::test]
    async fn persists_claims_and_hands_off_to_composition() {
        let storage = Arc::new(test_storage().await);
        let html = "<p>Od 1.1.2025. opća stopa PDV-a iznosi 25% (članak 38. Zakona o PDV-u).</p>\
                    <p>Opća stopa možda iznosi 5%.</p>";
        let evidence_id =
            store_evidence(&storage, "https://gov.example/pdv", ContentClass::Html, html.as_bytes()).await;
        let stage = ExtractStage::new(storage.clone(), Arc::new(extractor()));

        let job = job(QueueName::Extract, &evidence_id, json!({ "evidence_id": evidence_id }));
        stage.handle(&ctx(), &job).await.unwrap();

        let claims = storage.claims_for_evidence(&evidence_id).await.unwrap();
        assert_eq!(claims.len(), 2);
        assert!(claims.iter().all(|c| c.claim.authority == AuthorityLevel::SecondaryGuidance));
        assert!(
            storage
                .job_exists(QueueName::Compose, &format!("vat-standard-rate@{evidence_id}"))
                .await
                .unwrap()
        );

        // Re-extraction adds nothing new.
        stage.handle(&ctx(), &job).await.unwrap();
        assert_eq!(storage.claims_for_evidence(&evidence_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ungrounded_quotes_are_rejected() {
        let storage = Arc::new(test_storage().await);
        let evidence_id = store_evidence(
            &storage,
            "https://gov.example/pdv-2",
            ContentClass::Html,
            b"<p>Opca stopa iznosi 25%.</p>",
        )
        .await;
        let stage = ExtractStage::new(storage.clone(), Arc::new(Forged));

        let job = job(QueueName::Extract, &evidence_id, json!({ "evidence_id": evidence_id }));
        stage.handle(&ctx(), &job).await.unwrap();

        assert!(storage.claims_for_evidence(&evidence_id).await.unwrap().is_empty());
        let rejections = storage.list_rejections(10).await.unwrap();
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].entity_id, evidence_id);
        assert_eq!(rejections[0].payload["normalized_value"], "30%");
    }
}
