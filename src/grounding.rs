//! Grounding Checker
//!
//! Extracts factual claims from a narrative (numbers and named entities) and
//! checks each one against the result rows, the accepted query's filter
//! literals and the retrieved context, cited items first. The question is not
//! evidence: a premise the data contradicts must not pass. Unsupported claims
//! are stripped or trigger a regeneration.

use crate::execution::result::{as_number, ExecutionResult};
use crate::schema_rag::retriever::RetrievedContext;
use crate::synthesis::narrative::NarrativeDraft;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

lazy_static! {
    static ref NUMBER_TOKEN: Regex =
        Regex::new(r"^[+-]?\$?(\d{1,3}(?:,\d{3})+|\d+)(\.\d+)?(%)?$").unwrap();
    static ref HYPHENATED_NUMBER: Regex = Regex::new(r"^(\d+(?:\.\d+)?)-[A-Za-z]+$").unwrap();
    static ref IDENTIFIER_TOKEN: Regex = Regex::new(r"^[A-Z][A-Z0-9]*(?:[-_][A-Z0-9]+)+$|^[A-Z]+\d+[A-Z0-9]*$").unwrap();
    static ref DATE_TOKEN: Regex = Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap();
    static ref CAPITALIZED_WORD: Regex = Regex::new(r"^[A-Z][a-z][A-Za-z'-]*$|^[A-Z]$").unwrap();
    static ref QUOTED: Regex = Regex::new(r#""([^"]+)"|“([^”]+)”"#).unwrap();
    static ref ANY_NUMBER: Regex = Regex::new(r"-?\d+(?:,\d{3})*(?:\.\d+)?").unwrap();
}

/// Phrases that signal the model talking about itself rather than the data.
const META_PHRASES: &[&str] = &[
    "as an ai",
    "as a language model",
    "i don't have access",
    "i do not have access",
    "i cannot access",
    "i can't access",
    "i am not able to",
    "i'm not able to",
];

/// Words that start sentences and are not part of a name.
const PHRASE_STOPWORDS: &[&str] = &[
    "The", "A", "An", "This", "That", "These", "Those", "There", "In", "On", "At", "Of", "For",
    "And", "Or", "But", "Only", "All", "No", "It", "Its", "Most", "Some", "Each", "Every",
    "Overall", "Currently", "Both", "Across", "With", "From", "By", "I", "Yes", "However",
    "Also", "Please", "Note", "Total", "Average", "Together",
];

fn unit_word(word: &str) -> Option<u64> {
    let value = match word {
        "zero" => 0,
        "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        "thirteen" => 13,
        "fourteen" => 14,
        "fifteen" => 15,
        "sixteen" => 16,
        "seventeen" => 17,
        "eighteen" => 18,
        "nineteen" => 19,
        "twenty" => 20,
        "thirty" => 30,
        "forty" => 40,
        "fifty" => 50,
        "sixty" => 60,
        "seventy" => 70,
        "eighty" => 80,
        "ninety" => 90,
        _ => return None,
    };
    Some(value)
}

fn is_number_word(word: &str) -> bool {
    unit_word(word).is_some() || matches!(word, "hundred" | "thousand")
}

/// Value of a run of number words: "twenty-five", "two hundred", "three thousand".
fn number_words_value(words: &[String]) -> Option<f64> {
    let mut total = 0u64;
    let mut current = 0u64;
    for word in words.iter().flat_map(|w| w.split('-')) {
        match word {
            "hundred" => current = current.max(1) * 100,
            "thousand" => {
                total += current.max(1) * 1000;
                current = 0;
            }
            other => current += unit_word(other)?,
        }
    }
    Some((total + current) as f64)
}

const TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    Number,
    Entity,
    MetaDisclaimer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "part", content = "index")]
pub enum ClaimLocation {
    /// Sentence index within the summary.
    Summary(usize),
    Insight(usize),
}

/// Where a supported claim was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "from", content = "source_id")]
pub enum Support {
    /// Result cells, column names, counts or aggregates.
    Result,
    /// A numeric literal in the accepted query's WHERE or HAVING clause.
    QueryFilter,
    /// A retrieved context item.
    Context(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    pub kind: ClaimKind,
    pub location: ClaimLocation,
    pub supported: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support: Option<Support>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingVerdict {
    pub claims: Vec<Claim>,
    pub passed: bool,
}

impl GroundingVerdict {
    pub fn unsupported(&self) -> impl Iterator<Item = &Claim> {
        self.claims.iter().filter(|c| !c.supported)
    }

    /// An unsupported claim sits in the summary, which is central to the answer.
    pub fn summary_failed(&self) -> bool {
        self.unsupported()
            .any(|c| matches!(c.location, ClaimLocation::Summary(_)))
    }

    /// Unsupported claim texts, for a regeneration note.
    pub fn unsupported_texts(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.unsupported()
            .filter(|c| seen.insert(c.text.clone()))
            .map(|c| c.text.clone())
            .collect()
    }

    /// Context ids that supported at least one claim, in first-use order.
    pub fn context_sources(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.claims
            .iter()
            .filter_map(|c| match &c.support {
                Some(Support::Context(id)) => Some(id.clone()),
                _ => None,
            })
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }
}

/// Narrative after unsupported claims were removed.
#[derive(Debug, Clone, PartialEq)]
pub struct StrippedNarrative {
    pub summary: String,
    pub insights: Vec<String>,
    pub removed_sentences: usize,
    pub removed_insights: usize,
}

#[derive(Debug, Default)]
struct SourceEvidence {
    numbers: Vec<f64>,
    text: String,
}

impl SourceEvidence {
    fn supports_number(&self, claim: &NumberClaim) -> bool {
        let mut candidates = vec![claim.value];
        if claim.percent {
            candidates.push(claim.value / 100.0);
        }
        candidates.iter().any(|&c| {
            self.numbers.iter().any(|&v| {
                (c - v).abs() <= TOLERANCE
                    || (claim.decimals > 0 && (c - round_to(v, claim.decimals)).abs() <= TOLERANCE)
            })
        })
    }

    fn supports_entity(&self, entity: &str) -> bool {
        let needle = normalize(entity);
        !needle.is_empty() && self.text.contains(&needle)
    }
}

/// Everything a claim may be grounded in.
#[derive(Debug, Default)]
pub struct Evidence {
    result: SourceEvidence,
    filter_numbers: Vec<f64>,
    /// Cited items first, then the rest in retrieval order.
    context: Vec<(String, SourceEvidence)>,
}

impl Evidence {
    pub fn build(
        result: &ExecutionResult,
        context: &RetrievedContext,
        citations: &[String],
        filter_numbers: &[f64],
    ) -> Self {
        let mut numbers = vec![result.row_count as f64, result.columns.len() as f64];
        let mut text = String::new();

        for column in &result.columns {
            text.push_str(&normalize(&column.name));
            text.push('\n');
            let distinct: HashSet<String> = result
                .rows
                .iter()
                .filter_map(|row| row.get(&column.name))
                .filter(|v| !v.is_null())
                .map(|v| v.to_string())
                .collect();
            numbers.push(distinct.len() as f64);
        }

        for row in &result.rows {
            for value in row.values() {
                if let Some(n) = as_number(value) {
                    numbers.push(n);
                }
                if let Value::String(s) = value {
                    numbers.extend(lenient_numbers(s));
                    text.push_str(&normalize(s));
                    text.push('\n');
                } else if !value.is_null() {
                    text.push_str(&value.to_string().to_lowercase());
                    text.push('\n');
                }
            }
        }

        for stats in result.column_stats() {
            numbers.extend([stats.sum, stats.min, stats.max, stats.avg]);
            numbers.extend([stats.sum, stats.min, stats.max, stats.avg].map(round2));
            numbers.push(stats.count as f64);
        }

        let (cited, uncited): (Vec<_>, Vec<_>) = context
            .items
            .iter()
            .partition(|item| citations.contains(&item.source_id));
        let context = cited
            .into_iter()
            .chain(uncited)
            .map(|item| {
                (
                    item.source_id.clone(),
                    SourceEvidence {
                        numbers: lenient_numbers(&item.content),
                        text: normalize(&item.content),
                    },
                )
            })
            .collect();

        Self {
            result: SourceEvidence { numbers, text },
            filter_numbers: filter_numbers.to_vec(),
            context,
        }
    }

    fn support_for_number(&self, claim: &NumberClaim) -> Option<Support> {
        if self.result.supports_number(claim) {
            return Some(Support::Result);
        }
        if self
            .filter_numbers
            .iter()
            .any(|&v| (claim.value - v).abs() <= TOLERANCE)
        {
            return Some(Support::QueryFilter);
        }
        self.context
            .iter()
            .find(|(_, source)| source.supports_number(claim))
            .map(|(id, _)| Support::Context(id.clone()))
    }

    fn support_for_entity(&self, entity: &str) -> Option<Support> {
        if self.result.supports_entity(entity) {
            return Some(Support::Result);
        }
        self.context
            .iter()
            .find(|(_, source)| source.supports_entity(entity))
            .map(|(id, _)| Support::Context(id.clone()))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct NumberClaim {
    text: String,
    value: f64,
    decimals: u32,
    percent: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum RawClaim {
    Number(NumberClaim),
    Entity(String),
    Meta(String),
}

fn normalize(text: &str) -> String {
    text.to_lowercase().replace('_', " ")
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

fn round2(value: f64) -> f64 {
    round_to(value, 2)
}

fn lenient_numbers(text: &str) -> Vec<f64> {
    ANY_NUMBER
        .find_iter(text)
        .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok())
        .collect()
}

fn trim_token(token: &str) -> &str {
    token.trim_matches(|c: char| {
        matches!(
            c,
            '.' | ',' | ';' | ':' | '!' | '?' | '(' | ')' | '[' | ']' | '"' | '\'' | '“' | '”'
        )
    })
}

fn parse_number_token(token: &str) -> Option<NumberClaim> {
    if let Some(caps) = NUMBER_TOKEN.captures(token) {
        let integer = caps.get(1)?.as_str().replace(',', "");
        let fraction = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        let sign = if token.starts_with('-') { "-" } else { "" };
        let value: f64 = format!("{}{}{}", sign, integer, fraction).parse().ok()?;
        return Some(NumberClaim {
            text: token.to_string(),
            value,
            decimals: fraction.len().saturating_sub(1) as u32,
            percent: caps.get(3).is_some(),
        });
    }
    let caps = HYPHENATED_NUMBER.captures(token)?;
    let raw = caps.get(1)?.as_str();
    Some(NumberClaim {
        text: raw.to_string(),
        value: raw.parse().ok()?,
        decimals: raw.split('.').nth(1).map(|f| f.len() as u32).unwrap_or(0),
        percent: false,
    })
}

/// Close a run of capitalized words. Two or more words form an entity; a
/// single word does too unless it opened the sentence.
fn flush_phrase(
    phrase: &mut Vec<&str>,
    at_sentence_start: bool,
    claims: &mut Vec<RawClaim>,
    quoted_spans: &[String],
) {
    let mut at_start = at_sentence_start;
    while phrase.first().is_some_and(|w| PHRASE_STOPWORDS.contains(w)) {
        phrase.remove(0);
        at_start = false;
    }
    let is_entity = match phrase.as_slice() {
        [] => false,
        [word] => !at_start && word.len() > 1,
        _ => true,
    };
    if is_entity {
        let joined = phrase.join(" ");
        if !quoted_spans.iter().any(|q| q.contains(&joined)) {
            claims.push(RawClaim::Entity(joined));
        }
    }
    phrase.clear();
}

fn is_number_word_token(token: &str) -> bool {
    let lower = token.to_lowercase();
    !lower.is_empty() && lower.split('-').all(is_number_word)
}

/// Close a run of spelled-out number words.
fn flush_number_words(words: &mut Vec<String>, originals: &mut Vec<&str>, claims: &mut Vec<RawClaim>) {
    if !words.is_empty() {
        if let Some(value) = number_words_value(words) {
            claims.push(RawClaim::Number(NumberClaim {
                text: originals.join(" "),
                value,
                decimals: 0,
                percent: false,
            }));
        }
    }
    words.clear();
    originals.clear();
}

/// Rule-based claim extraction over one span of text.
fn extract_claims(text: &str) -> Vec<RawClaim> {
    let mut claims = Vec::new();
    let lower = text.to_lowercase();
    for phrase in META_PHRASES {
        if lower.contains(phrase) {
            claims.push(RawClaim::Meta((*phrase).to_string()));
        }
    }

    let mut quoted_spans = Vec::new();
    for caps in QUOTED.captures_iter(text) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            claims.push(RawClaim::Entity(m.as_str().trim().to_string()));
            quoted_spans.push(m.as_str().to_string());
        }
    }

    let mut phrase: Vec<&str> = Vec::new();
    let mut phrase_at_start = false;
    let mut number_words: Vec<String> = Vec::new();
    let mut number_originals: Vec<&str> = Vec::new();
    let mut sentence_start = true;

    for raw in text.split_whitespace() {
        let token = trim_token(raw);
        let ends_clause = raw.ends_with(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | ')'));
        let at_start = sentence_start;
        sentence_start = raw.ends_with(|c: char| matches!(c, '.' | '!' | '?'));

        if token.is_empty() {
            flush_phrase(&mut phrase, phrase_at_start, &mut claims, &quoted_spans);
            flush_number_words(&mut number_words, &mut number_originals, &mut claims);
            continue;
        }
        if is_number_word_token(token) {
            flush_phrase(&mut phrase, phrase_at_start, &mut claims, &quoted_spans);
            number_words.push(token.to_lowercase());
            number_originals.push(token);
            if ends_clause {
                flush_number_words(&mut number_words, &mut number_originals, &mut claims);
            }
            continue;
        }
        flush_number_words(&mut number_words, &mut number_originals, &mut claims);

        if CAPITALIZED_WORD.is_match(token) {
            if phrase.is_empty() {
                phrase_at_start = at_start;
            }
            phrase.push(token);
            if ends_clause {
                flush_phrase(&mut phrase, phrase_at_start, &mut claims, &quoted_spans);
            }
            continue;
        }
        flush_phrase(&mut phrase, phrase_at_start, &mut claims, &quoted_spans);

        if let Some(number) = parse_number_token(token) {
            claims.push(RawClaim::Number(number));
        } else if IDENTIFIER_TOKEN.is_match(token) || DATE_TOKEN.is_match(token) {
            claims.push(RawClaim::Entity(token.to_string()));
        }
    }
    flush_phrase(&mut phrase, phrase_at_start, &mut claims, &quoted_spans);
    flush_number_words(&mut number_words, &mut number_originals, &mut claims);
    claims
}

/// Split a summary into sentences, keeping terminators.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().map_or(true, |n| n.is_whitespace()) {
            let sentence = current.trim().to_string();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            current.clear();
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

#[derive(Debug, Default)]
pub struct GroundingChecker;

impl GroundingChecker {
    pub fn new() -> Self {
        Self
    }

    pub fn check(
        &self,
        draft: &NarrativeDraft,
        result: &ExecutionResult,
        context: &RetrievedContext,
        filter_numbers: &[f64],
    ) -> GroundingVerdict {
        let evidence = Evidence::build(result, context, &draft.citations, filter_numbers);
        let mut claims = Vec::new();

        for (idx, sentence) in split_sentences(&draft.summary).iter().enumerate() {
            claims.extend(self.judge(sentence, ClaimLocation::Summary(idx), &evidence));
        }
        for (idx, insight) in draft.insights.iter().enumerate() {
            claims.extend(self.judge(insight, ClaimLocation::Insight(idx), &evidence));
        }

        let passed = claims.iter().all(|c| c.supported);
        GroundingVerdict { claims, passed }
    }

    fn judge(&self, text: &str, location: ClaimLocation, evidence: &Evidence) -> Vec<Claim> {
        extract_claims(text)
            .into_iter()
            .map(|raw| match raw {
                RawClaim::Number(number) => {
                    let support = evidence.support_for_number(&number);
                    Claim {
                        supported: support.is_some(),
                        support,
                        text: number.text,
                        kind: ClaimKind::Number,
                        location,
                    }
                }
                RawClaim::Entity(entity) => {
                    let support = evidence.support_for_entity(&entity);
                    Claim {
                        supported: support.is_some(),
                        support,
                        text: entity,
                        kind: ClaimKind::Entity,
                        location,
                    }
                }
                RawClaim::Meta(phrase) => Claim {
                    text: phrase,
                    kind: ClaimKind::MetaDisclaimer,
                    location,
                    supported: false,
                    support: None,
                },
            })
            .collect()
    }

    /// Drop insights and summary sentences that carry unsupported claims.
    pub fn strip(&self, draft: &NarrativeDraft, verdict: &GroundingVerdict) -> StrippedNarrative {
        let bad_sentences: HashSet<usize> = verdict
            .unsupported()
            .filter_map(|c| match c.location {
                ClaimLocation::Summary(i) => Some(i),
                ClaimLocation::Insight(_) => None,
            })
            .collect();
        let bad_insights: HashSet<usize> = verdict
            .unsupported()
            .filter_map(|c| match c.location {
                ClaimLocation::Insight(i) => Some(i),
                ClaimLocation::Summary(_) => None,
            })
            .collect();

        let kept_sentences: Vec<String> = split_sentences(&draft.summary)
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !bad_sentences.contains(i))
            .map(|(_, s)| s)
            .collect();
        let insights: Vec<String> = draft
            .insights
            .iter()
            .enumerate()
            .filter(|(i, _)| !bad_insights.contains(i))
            .map(|(_, s)| s.clone())
            .collect();

        StrippedNarrative {
            summary: kept_sentences.join(" "),
            insights,
            removed_sentences: bad_sentences.len(),
            removed_insights: bad_insights.len(),
        }
    }
}
