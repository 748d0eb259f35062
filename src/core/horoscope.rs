//! Horoscope generator.
//!
//! Stands in for an LLM: picks a canned horoscope from a CSV corpus based on the prompt and
//! streams it word by word. Generation is slowed down on purpose, the whole text takes a
//! random time between the configured min and max response time.

use crate::core::context::RequestContext;
use crate::core::message::ChunkResult;
use crate::core::traits::{InferenceProvider, ResultGroup};
use anyhow::{Context, anyhow};
use async_stream::stream;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use log::{info, warn};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sign {
    Aries,
    Taurus,
    Gemini,
    Cancer,
    Leo,
    Virgo,
    Libra,
    Scorpio,
    Sagittarius,
    Capricorn,
    Aquarius,
    Pisces,
}

impl Sign {
    pub const ALL: [Sign; 12] = [
        Sign::Aries,
        Sign::Taurus,
        Sign::Gemini,
        Sign::Cancer,
        Sign::Leo,
        Sign::Virgo,
        Sign::Libra,
        Sign::Scorpio,
        Sign::Sagittarius,
        Sign::Capricorn,
        Sign::Aquarius,
        Sign::Pisces,
    ];
}

impl FromStr for Sign {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ARIES" => Ok(Sign::Aries),
            "TAURUS" => Ok(Sign::Taurus),
            "GEMINI" => Ok(Sign::Gemini),
            "CANCER" => Ok(Sign::Cancer),
            "LEO" => Ok(Sign::Leo),
            "VIRGO" => Ok(Sign::Virgo),
            "LIBRA" => Ok(Sign::Libra),
            "SCORPIO" => Ok(Sign::Scorpio),
            "SAGITTARIUS" => Ok(Sign::Sagittarius),
            "CAPRICORN" => Ok(Sign::Capricorn),
            "AQUARIUS" => Ok(Sign::Aquarius),
            "PISCES" => Ok(Sign::Pisces),
            other => Err(anyhow!("unknown sign `{other}`")),
        }
    }
}

/// Horoscope texts grouped by sign.
#[derive(Debug, Default)]
pub struct HoroscopeIndex {
    horoscopes: HashMap<Sign, Vec<String>>,
}

impl HoroscopeIndex {
    pub fn new(horoscopes: HashMap<Sign, Vec<String>>) -> Self {
        Self { horoscopes }
    }

    pub fn load_from_csv(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read horoscopes from {}", path.display()))?;
        let index = Self::from_csv(&data)?;

        info!(
            "Loaded {} horoscopes from {}",
            index.horoscopes.values().map(Vec::len).sum::<usize>(),
            path.display()
        );
        Ok(index)
    }

    /// Parses `;` separated records with a header row naming at least `sign` and `text`.
    pub fn from_csv(data: &str) -> anyhow::Result<Self> {
        let mut lines = data.lines().filter(|line| !line.trim().is_empty());

        let header = split_record(lines.next().context("horoscope csv is empty")?);
        let column = |name: &str| {
            header
                .iter()
                .position(|h| h == name)
                .with_context(|| format!("horoscope csv has no `{name}` column"))
        };
        let sign_column = column("sign")?;
        let text_column = column("text")?;

        let mut horoscopes: HashMap<Sign, Vec<String>> = HashMap::new();
        for (row, line) in lines.enumerate() {
            let record = split_record(line);
            let (Some(sign), Some(text)) = (record.get(sign_column), record.get(text_column))
            else {
                warn!("Skipping short horoscope row {}", row + 1);
                continue;
            };

            match sign.parse::<Sign>() {
                Ok(sign) => horoscopes.entry(sign).or_default().push(text.clone()),
                Err(err) => warn!("Skipping horoscope row {}: {err}", row + 1),
            }
        }

        Ok(Self::new(horoscopes))
    }

    pub fn predictions(&self, sign: Sign) -> &[String] {
        self.horoscopes.get(&sign).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Deterministically picks a horoscope for `prefix`, or `""` if its sign has none.
    pub fn predict_by_prefix(&self, prefix: &str) -> &str {
        let digest = Sha256::digest(prefix.as_bytes());

        let sign = Sign::ALL[digest_mod(&digest, Sign::ALL.len())];
        let predictions = self.predictions(sign);

        if predictions.is_empty() {
            ""
        } else {
            &predictions[digest_mod(&digest, predictions.len())]
        }
    }
}

/// `digest` read as a big-endian integer, modulo `n`.
fn digest_mod(digest: &[u8], n: usize) -> usize {
    let n = n as u128;
    digest
        .iter()
        .fold(0u128, |acc, byte| (acc * 256 + u128::from(*byte)) % n) as usize
}

/// Splits one `;` separated record. Fields may be wrapped in double quotes, `""` inside a
/// quoted field is a literal quote.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = vec![];
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            '"' => quoted = !quoted,
            ';' if !quoted => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);

    fields
}

/// Splits `overall` into `n` random parts that add up to it.
fn produce_n_delays(overall: Duration, n: usize) -> Vec<Duration> {
    if n == 0 {
        return vec![];
    }

    let mut rng = rand::thread_rng();
    let weights: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..1.0)).collect();
    let total: f64 = weights.iter().sum();

    if total <= f64::EPSILON {
        return vec![overall / n as u32; n];
    }

    weights
        .into_iter()
        .map(|weight| overall.mul_f64(weight / total))
        .collect()
}

/// [`InferenceProvider`] serving horoscopes from a [`HoroscopeIndex`].
pub struct HoroscopeModel {
    index: Arc<HoroscopeIndex>,
    min_response_time: Duration,
    max_response_time: Duration,
}

impl HoroscopeModel {
    pub const MIN_RESPONSE_TIME: Duration = Duration::from_millis(500);
    pub const MAX_RESPONSE_TIME: Duration = Duration::from_millis(3000);

    pub fn new(index: HoroscopeIndex) -> Self {
        Self {
            index: Arc::new(index),
            min_response_time: Self::MIN_RESPONSE_TIME,
            max_response_time: Self::MAX_RESPONSE_TIME,
        }
    }

    pub fn with_response_time(mut self, min: Duration, max: Duration) -> Self {
        self.min_response_time = min.min(max);
        self.max_response_time = max.max(min);
        self
    }

    fn words(&self, context: &RequestContext) -> Vec<String> {
        self.index
            .predict_by_prefix(context.prompt())
            .split(' ')
            .map(str::to_owned)
            .collect()
    }

    fn overall_response_time(&self) -> Duration {
        let min = self.min_response_time.as_millis() as u64;
        let max = self.max_response_time.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Generates the horoscope for a single context.
    pub fn infer(
        &self,
        context: RequestContext,
    ) -> BoxStream<'static, anyhow::Result<ChunkResult>> {
        self.infer_batch(vec![context])
            .flat_map(|group| {
                let chunks: Vec<_> = match group {
                    Ok(group) => group.into_iter().map(Ok).collect(),
                    Err(err) => vec![Err(err)],
                };
                stream::iter(chunks)
            })
            .boxed()
    }
}

impl InferenceProvider for HoroscopeModel {
    fn infer_batch(
        &self,
        contexts: Vec<RequestContext>,
    ) -> BoxStream<'static, anyhow::Result<ResultGroup>> {
        let words_batch: Vec<(RequestContext, Vec<String>)> = contexts
            .into_iter()
            .map(|context| {
                let words = self.words(&context);
                (context, words)
            })
            .collect();

        let steps = words_batch.iter().map(|(_, words)| words.len()).max().unwrap_or(0);
        let delays = produce_n_delays(self.overall_response_time(), steps);

        stream! {
            for (step, delay) in delays.into_iter().enumerate() {
                tokio::time::sleep(delay).await;

                let group: ResultGroup = words_batch
                    .iter()
                    .filter_map(|(context, words)| {
                        let word = words.get(step)?;
                        let is_last = step == words.len() - 1;
                        let text = if is_last { word.clone() } else { format!("{word} ") };
                        Some(ChunkResult::new(context.clone(), text, is_last))
                    })
                    .collect();

                yield Ok::<_, anyhow::Error>(group);
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CSV: &str = "source;ts;sign;text;type
mailru;2019-11-10 00:00:00;ARIES;\"Вы многое принимаете близко к сердцу\";DEFAULT
mailru;2019-11-11 00:00:00;LIBRA;\"День обещает приятные встречи; интересные разговоры\";DEFAULT
rambler;2019-11-14 00:00:00;ARIES;Овнов сегодня ждет ряд волнующих моментов;DEFAULT
rambler;2019-11-14 00:00:00;OPHIUCHUS;Never shown;DEFAULT";

    fn model_with(words: &[&str]) -> HoroscopeModel {
        let text = words.join(" ");
        let horoscopes = Sign::ALL.iter().map(|sign| (*sign, vec![text.clone()])).collect();
        HoroscopeModel::new(HoroscopeIndex::new(horoscopes))
            .with_response_time(Duration::ZERO, Duration::from_millis(10))
    }

    #[test]
    fn test_csv_loading_groups_by_sign() {
        let index = HoroscopeIndex::from_csv(TEST_CSV).unwrap();

        assert_eq!(
            index.predictions(Sign::Aries),
            &[
                "Вы многое принимаете близко к сердцу".to_string(),
                "Овнов сегодня ждет ряд волнующих моментов".to_string(),
            ]
        );
        // Separator inside quotes is part of the text
        assert_eq!(
            index.predictions(Sign::Libra),
            &["День обещает приятные встречи; интересные разговоры".to_string()]
        );
        assert!(index.predictions(Sign::Cancer).is_empty());
    }

    #[test]
    fn test_csv_without_text_column_fails() {
        assert!(HoroscopeIndex::from_csv("source;sign\nx;LEO").is_err());
        assert!(HoroscopeIndex::from_csv("").is_err());
    }

    #[test]
    fn test_split_record_quotes() {
        assert_eq!(split_record(r#"a;"b;c";"say ""hi""""#), vec!["a", "b;c", r#"say "hi""#]);
        assert_eq!(split_record("a;;"), vec!["a", "", ""]);
    }

    #[test]
    fn test_predict_by_prefix_is_deterministic() {
        let index = HoroscopeIndex::from_csv(TEST_CSV).unwrap();

        for prefix in ["", "cat", "random", "Hey!"] {
            assert_eq!(index.predict_by_prefix(prefix), index.predict_by_prefix(prefix));
        }
    }

    #[test]
    fn test_predict_by_prefix_empty_for_sign_without_texts() {
        let index = HoroscopeIndex::default();
        assert_eq!(index.predict_by_prefix("anything"), "");
    }

    #[test]
    fn test_digest_mod_matches_big_integer_modulo() {
        // 0x0102 = 258
        assert_eq!(digest_mod(&[0x01, 0x02], 12), 258 % 12);
        assert_eq!(digest_mod(&[0xff; 32], 1), 0);
    }

    #[test]
    fn test_delays_add_up() {
        let overall = Duration::from_millis(1000);
        let delays = produce_n_delays(overall, 7);

        assert_eq!(delays.len(), 7);
        let total: Duration = delays.iter().sum();
        let diff = total.abs_diff(overall);
        assert!(diff < Duration::from_millis(1), "{total:?} != {overall:?}");

        assert!(produce_n_delays(overall, 0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_infer_single_context() {
        let model = model_with(&["Hello", "world", "!"]);
        let context = RequestContext::new("random", 32).unwrap();

        let chunks: Vec<ChunkResult> = model
            .infer(context.clone())
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(
            chunks,
            vec![
                ChunkResult::new(context.clone(), "Hello ", false),
                ChunkResult::new(context.clone(), "world ", false),
                ChunkResult::new(context, "!", true),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_infer_batch_contexts_finish_independently() {
        let mut horoscopes = HashMap::new();
        for sign in Sign::ALL {
            horoscopes.insert(sign, vec!["one two three".to_string()]);
        }
        let model = HoroscopeModel::new(HoroscopeIndex::new(horoscopes))
            .with_response_time(Duration::ZERO, Duration::ZERO);

        let contexts = vec![
            RequestContext::new("a", 8).unwrap(),
            RequestContext::new("b", 8).unwrap(),
        ];
        let groups: Vec<ResultGroup> = model
            .infer_batch(contexts)
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(groups.len(), 3);
        for group in &groups {
            assert_eq!(group.len(), 2);
        }
        let last: Vec<_> = groups[2].iter().map(|c| (c.text.as_str(), c.is_last)).collect();
        assert_eq!(last, vec![("three", true), ("three", true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_infer_batch_partial_completion() {
        // One context with an empty corpus finishes on the first step.
        let mut horoscopes = HashMap::new();
        horoscopes.insert(Sign::Aries, vec!["a b c".to_string()]);
        let index = HoroscopeIndex::new(horoscopes);

        let prompt_for = |wanted: &str| {
            (0..)
                .map(|i| format!("prompt {i}"))
                .find(|p| index.predict_by_prefix(p) == wanted)
                .unwrap()
        };
        let long_prompt = prompt_for("a b c");
        let short_prompt = prompt_for("");

        let model = HoroscopeModel::new(index).with_response_time(Duration::ZERO, Duration::ZERO);
        let long = RequestContext::new(long_prompt, 64).unwrap();
        let short = RequestContext::new(short_prompt, 64).unwrap();

        let groups: Vec<ResultGroup> = model
            .infer_batch(vec![long.clone(), short.clone()])
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[0][1], ChunkResult::new(short, "", true));
        assert_eq!(groups[1].len(), 1);
        assert_eq!(groups[2], vec![ChunkResult::new(long, "c", true)]);
    }
}
