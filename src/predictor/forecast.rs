//! Next-request forecasting from an entity's prompt sequence.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;

use crate::router::envelope::GenerationContext;

/// Distinct prompts remembered per entity.
const MAX_PROMPTS_PER_ENTITY: usize = 64;

/// History turns carried into a forecast context.
const HISTORY_TURNS: usize = 4;

#[derive(Debug, Clone)]
pub struct Forecast {
    pub context: GenerationContext,
    pub confidence: f64,
}

#[derive(Debug, Default)]
struct PromptTransitions {
    last: Option<String>,
    next: HashMap<String, HashMap<String, u32>>,
}

/// First-order transition counts over each entity's normalized prompts.
///
/// With no recorded successor, the forecast is that the entity repeats its
/// last prompt, at `repeat_confidence`.
pub struct TransitionForecaster {
    entities: DashMap<String, PromptTransitions>,
    repeat_confidence: f64,
}

impl TransitionForecaster {
    pub fn new(repeat_confidence: f64) -> Self {
        Self {
            entities: DashMap::new(),
            repeat_confidence,
        }
    }

    pub fn observe(&self, entity_id: &str, prompt: &str) {
        let prompt = normalize(prompt);
        let mut entity = self.entities.entry(entity_id.to_string()).or_default();
        if let Some(last) = entity.last.take() {
            let known = entity.next.len();
            if let Some(successors) = entity.next.get_mut(&last) {
                *successors.entry(prompt.clone()).or_insert(0) += 1;
            } else if known < MAX_PROMPTS_PER_ENTITY {
                entity
                    .next
                    .insert(last, HashMap::from([(prompt.clone(), 1)]));
            }
        }
        entity.last = Some(prompt);
    }

    /// Forecast the request following `current`, which was answered with `response`.
    pub fn forecast(
        &self,
        entity_id: &str,
        current: &GenerationContext,
        response: &str,
    ) -> Option<Forecast> {
        let entity = self.entities.get(entity_id)?;
        let last = entity.last.as_ref()?;

        let (prompt, confidence) = match entity.next.get(last) {
            Some(successors) => {
                let total: u32 = successors.values().sum();
                let (prompt, count) = successors
                    .iter()
                    .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))?;
                (prompt.clone(), *count as f64 / total as f64)
            }
            None => (last.clone(), self.repeat_confidence),
        };

        let mut history = current.history.clone();
        history.push(current.prompt.clone());
        history.push(response.to_string());
        let skip = history.len().saturating_sub(HISTORY_TURNS);
        history.drain(..skip);

        Some(Forecast {
            context: GenerationContext {
                system: current.system.clone(),
                prompt,
                history,
            },
            confidence,
        })
    }

    pub fn forget(&self, entity_id: &str) {
        self.entities.remove(entity_id);
    }
}

pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Jaccard similarity of the lowercase word sets of `a` and `b`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let words = |s: &str| -> HashSet<String> {
        s.split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| !w.is_empty())
            .collect()
    };
    let (a, b) = (words(a), words(b));
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let union = a.union(&b).count();
    a.intersection(&b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity() {
        assert_eq!(similarity("Hello there", "hello THERE!"), 1.0);
        assert_eq!(similarity("a b", "c d"), 0.0);
        assert!((similarity("a b c", "a b d") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_repeat_forecast_without_history() {
        let f = TransitionForecaster::new(0.5);
        f.observe("npc", "Any news?");
        let ctx = GenerationContext::prompt("Any news?");
        let forecast = f.forecast("npc", &ctx, "None today.").unwrap();
        assert_eq!(forecast.context.prompt, "any news?");
        assert_eq!(forecast.confidence, 0.5);
        assert_eq!(forecast.context.history, vec!["Any news?", "None today."]);
    }

    #[test]
    fn test_learned_transition_wins() {
        let f = TransitionForecaster::new(0.5);
        for _ in 0..3 {
            f.observe("npc", "greetings");
            f.observe("npc", "what do you sell");
        }
        f.observe("npc", "greetings");
        let forecast = f
            .forecast("npc", &GenerationContext::prompt("greetings"), "hail")
            .unwrap();
        assert_eq!(forecast.context.prompt, "what do you sell");
        assert_eq!(forecast.confidence, 1.0);
    }

    #[test]
    fn test_unknown_entity() {
        let f = TransitionForecaster::new(0.5);
        assert!(f
            .forecast("ghost", &GenerationContext::prompt("boo"), "")
            .is_none());
    }
}
