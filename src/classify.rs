//! Feedback classifiers
//!
//! Pure functions over configurable word catalogs, plus `FeedbackHandler`,
//! which redeems a claim-checked feedback text, classifies it, and records
//! the outcome against the blob reference.

use crate::claim_check::{redeem, BlobStore, ClaimCheck, RecordStore};
use crate::error::{EdaError, Result};
use crate::pipeline::Handler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

const GOOD_WORDS: &[&str] = &[
    "good", "great", "awesome", "amazing", "excellent", "fantastic", "perfect", "nice", "cool",
    "wonderful",
];

const BAD_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "poor", "worst", "horrible", "boring", "lazy", "complex",
    "difficult",
];

/// Sentiment of a feedback text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feeling {
    Positive,
    Negative,
    Neutral,
}

impl Feeling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feeling::Positive => "positive",
            Feeling::Negative => "negative",
            Feeling::Neutral => "neutral",
        }
    }

    /// Queue that receives feedback with this feeling
    pub fn queue(&self) -> &'static str {
        match self {
            Feeling::Positive => "eda-feeling-good",
            Feeling::Negative => "eda-feeling-negative",
            Feeling::Neutral => "eda-feeling-neutral",
        }
    }
}

/// Word-count bucket routed to a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LengthRoute {
    /// Inclusive lower bound
    pub min_words: usize,

    /// Inclusive upper bound; `None` means unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_words: Option<usize>,

    /// Destination queue name
    pub queue: String,
}

impl LengthRoute {
    pub fn new(min_words: usize, max_words: Option<usize>, queue: impl Into<String>) -> Self {
        Self {
            min_words,
            max_words,
            queue: queue.into(),
        }
    }

    pub fn contains(&self, count: usize) -> bool {
        count >= self.min_words && self.max_words.map_or(true, |max| count <= max)
    }
}

/// Classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassifierConfig {
    /// Minimum catalog hits before a feeling other than neutral is chosen
    pub threshold: usize,

    /// Catalog of positive words
    pub good_words: Vec<String>,

    /// Catalog of negative words
    pub bad_words: Vec<String>,

    /// Length buckets, checked in order
    pub length_routes: Vec<LengthRoute>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            good_words: GOOD_WORDS.iter().map(|w| w.to_string()).collect(),
            bad_words: BAD_WORDS.iter().map(|w| w.to_string()).collect(),
            length_routes: vec![
                LengthRoute::new(0, Some(40), "eda-length-small"),
                LengthRoute::new(41, Some(99), "eda-length-medium"),
                LengthRoute::new(100, None, "eda-length-large"),
            ],
        }
    }
}

impl ClassifierConfig {
    /// Reject configurations that cannot classify every input
    pub fn validate(&self) -> Result<()> {
        if self.length_routes.is_empty() {
            return Err(EdaError::Config(
                "At least one length route is required".to_string(),
            ));
        }
        if let Some(route) = self
            .length_routes
            .iter()
            .find(|r| r.max_words.is_some_and(|max| max < r.min_words))
        {
            return Err(EdaError::Config(format!(
                "Length route '{}' has max_words below min_words",
                route.queue
            )));
        }
        Ok(())
    }
}

/// Count words of `text` that appear in `catalog`
///
/// Line breaks, tabs, periods, commas, and exclamation marks are removed
/// before splitting on whitespace. Matching is exact and case-sensitive.
pub fn count_words<S: AsRef<str>>(text: &str, catalog: &[S]) -> usize {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '\n' | '\r' | '\t' | '.' | ',' | '!'))
        .collect();

    cleaned
        .split_whitespace()
        .filter(|word| catalog.iter().any(|entry| entry.as_ref() == *word))
        .count()
}

/// Classify the sentiment of `text`
pub fn classify_sentiment(text: &str, config: &ClassifierConfig) -> Feeling {
    let good = count_words(text, &config.good_words);
    let bad = count_words(text, &config.bad_words);

    tracing::debug!(good, bad, "Catalog words counted");

    if good < config.threshold && bad < config.threshold {
        return Feeling::Neutral;
    }
    match good.cmp(&bad) {
        std::cmp::Ordering::Greater => Feeling::Positive,
        std::cmp::Ordering::Less => Feeling::Negative,
        std::cmp::Ordering::Equal => Feeling::Neutral,
    }
}

/// Pick the first route whose bounds contain the word count of `text`
pub fn route_by_length<'a>(text: &str, routes: &'a [LengthRoute]) -> Result<&'a LengthRoute> {
    let count = text.split_whitespace().count();
    routes
        .iter()
        .find(|route| route.contains(count))
        .ok_or_else(|| EdaError::Config(format!("No length route accepts {} words", count)))
}

/// Handler for claim-checked feedback messages
///
/// Redeems the text, classifies sentiment and length, and merges the
/// outcome into the record keyed by the blob reference.
pub struct FeedbackHandler {
    blobs: Arc<dyn BlobStore>,
    records: Arc<RecordStore>,
    config: ClassifierConfig,
}

impl FeedbackHandler {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        records: Arc<RecordStore>,
        config: ClassifierConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            blobs,
            records,
            config,
        })
    }
}

#[async_trait]
impl Handler for FeedbackHandler {
    async fn handle(&self, data: &Value) -> Result<Value> {
        let ticket = ClaimCheck::from_value(data)?;
        let bytes = redeem(self.blobs.as_ref(), &ticket).await?;
        let text = String::from_utf8_lossy(&bytes);

        let feeling = classify_sentiment(&text, &self.config);
        let route = route_by_length(&text, &self.config.length_routes)?;
        let word_count = text.split_whitespace().count();
        let stars = ticket.attributes.get("stars").cloned().unwrap_or(Value::Null);

        let mut fields = Map::new();
        fields.insert("feeling".to_string(), json!(feeling.as_str()));
        fields.insert("queue_feeling".to_string(), json!(feeling.queue()));
        fields.insert("word_count".to_string(), json!(word_count));
        fields.insert("queue_length".to_string(), json!(route.queue));
        fields.insert("stars".to_string(), stars.clone());
        self.records.upsert(&ticket.reference, fields).await;

        tracing::info!(
            reference = %ticket.reference,
            feeling = feeling.as_str(),
            word_count,
            queue = %route.queue,
            "Feedback classified"
        );

        Ok(json!({
            "key": ticket.reference,
            "feeling": feeling,
            "queueFeeling": feeling.queue(),
            "wordCount": word_count,
            "queueLength": route.queue,
            "stars": stars,
        }))
    }
}
