//! Token-level model interface and the synthetic capability provider.
//!
//! Real weights are an external collaborator: anything that can produce a
//! next-token distribution implements [`TokenModel`]. The crate ships a
//! deterministic [`SyntheticModel`] (seeded hash-to-logits) so every tier can
//! run and be tested without weights.

use std::sync::Arc;

use rand::Rng;

use crate::registry::descriptor::AdapterRef;

pub type TokenId = u32;

pub trait TokenModel: Send + Sync {
    fn vocab_size(&self) -> usize;

    /// Probability distribution over the next token given `context`.
    fn next_distribution(&self, context: &[TokenId]) -> Vec<f64>;

    /// Distributions at every position of `context ++ proposed`, i.e.
    /// `proposed.len() + 1` distributions from one batched forward pass.
    fn score_continuations(&self, context: &[TokenId], proposed: &[TokenId]) -> Vec<Vec<f64>> {
        let mut ctx = Vec::with_capacity(context.len() + proposed.len());
        ctx.extend_from_slice(context);
        let mut out = Vec::with_capacity(proposed.len() + 1);
        out.push(self.next_distribution(&ctx));
        for &t in proposed {
            ctx.push(t);
            out.push(self.next_distribution(&ctx));
        }
        out
    }
}

/// Builds the model for an adapter when a tier reloads.
pub trait ModelFactory: Send + Sync {
    fn load(&self, adapter: &AdapterRef) -> Arc<dyn TokenModel>;
}

/// Sample a token from a probability distribution.
pub fn sample<R: Rng + ?Sized>(dist: &[f64], rng: &mut R) -> TokenId {
    let total: f64 = dist.iter().sum();
    if total <= 0.0 {
        return 0;
    }
    let mut r = rng.gen::<f64>() * total;
    for (i, &p) in dist.iter().enumerate() {
        if r < p {
            return i as TokenId;
        }
        r -= p;
    }
    // Rounding left a sliver; return the last token with mass.
    dist.iter().rposition(|&p| p > 0.0).unwrap_or(0) as TokenId
}

pub(crate) fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

/// Uniform value in [0, 1) derived from a hash.
fn unit(h: u64) -> f64 {
    (h >> 11) as f64 / (1u64 << 53) as f64
}

/// Stable pseudo-random value in [0, 1) for a piece of text.
pub(crate) fn text_unit(text: &str) -> f64 {
    unit(splitmix64(fnv1a(text.as_bytes())))
}

/// Deterministic model: logits are a hash of the seed, the trailing context
/// window and the candidate token.
#[derive(Debug, Clone)]
pub struct SyntheticModel {
    seed: u64,
    vocab_size: usize,
    temperature: f64,
    window: usize,
    sharpness: f64,
    perturbation: Option<(u64, f64)>,
}

impl SyntheticModel {
    pub fn new(seed: u64, vocab_size: usize, temperature: f64) -> Self {
        Self {
            seed,
            vocab_size: vocab_size.max(2),
            temperature: temperature.max(1e-3),
            window: 3,
            sharpness: 4.0,
            perturbation: None,
        }
    }

    /// Add a second hash field to the logits, scaled by `scale`.
    ///
    /// Draft models and fine-tuned adapters are the base model plus a perturbation.
    pub fn with_perturbation(mut self, seed: u64, scale: f64) -> Self {
        self.perturbation = Some((seed, scale));
        self
    }

    pub fn with_sharpness(mut self, sharpness: f64) -> Self {
        self.sharpness = sharpness;
        self
    }

    fn context_hash(&self, seed: u64, context: &[TokenId]) -> u64 {
        let start = context.len().saturating_sub(self.window);
        context[start..]
            .iter()
            .fold(splitmix64(seed), |h, &t| splitmix64(h ^ t as u64))
    }

    fn logits(&self, context: &[TokenId]) -> Vec<f64> {
        let base = self.context_hash(self.seed, context);
        let noise = self
            .perturbation
            .map(|(seed, scale)| (self.context_hash(seed, context), scale));

        (0..self.vocab_size as u64)
            .map(|i| {
                let mut logit = self.sharpness * unit(splitmix64(base ^ i));
                if let Some((h, scale)) = noise {
                    logit += scale * (2.0 * unit(splitmix64(h ^ i)) - 1.0);
                }
                logit
            })
            .collect()
    }
}

impl TokenModel for SyntheticModel {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn next_distribution(&self, context: &[TokenId]) -> Vec<f64> {
        softmax(&self.logits(context), self.temperature)
    }
}

pub fn softmax(logits: &[f64], temperature: f64) -> Vec<f64> {
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits
        .iter()
        .map(|&l| ((l - max) / temperature).exp())
        .collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Loads synthetic models: the base model seeds the logits and each adapter
/// version adds a small deterministic perturbation.
#[derive(Debug, Clone)]
pub struct SyntheticModelFactory {
    pub vocab_size: usize,
    pub temperature: f64,
    pub adapter_perturbation: f64,
}

impl SyntheticModelFactory {
    pub fn new(vocab_size: usize, temperature: f64) -> Self {
        Self {
            vocab_size,
            temperature,
            adapter_perturbation: 0.05,
        }
    }

    pub fn base_seed(base_model: &str) -> u64 {
        fnv1a(base_model.as_bytes())
    }

    pub fn build(&self, adapter: &AdapterRef) -> SyntheticModel {
        let model = SyntheticModel::new(
            Self::base_seed(&adapter.base_model),
            self.vocab_size,
            self.temperature,
        );
        if adapter.version == 0 {
            model
        } else {
            model.with_perturbation(
                fnv1a(adapter.id.as_bytes()) ^ adapter.version,
                self.adapter_perturbation,
            )
        }
    }
}

impl ModelFactory for SyntheticModelFactory {
    fn load(&self, adapter: &AdapterRef) -> Arc<dyn TokenModel> {
        Arc::new(self.build(adapter))
    }
}

const ONSETS: [&str; 16] = [
    "b", "d", "f", "g", "h", "k", "l", "m", "n", "p", "r", "s", "t", "v", "w", "z",
];
const NUCLEI: [&str; 8] = ["a", "e", "i", "o", "u", "ai", "or", "en"];

/// Map whitespace-separated words onto token ids.
pub fn tokenize(text: &str, vocab_size: usize) -> Vec<TokenId> {
    let vocab = vocab_size.max(1) as u64;
    text.split_whitespace()
        .map(|w| (fnv1a(w.to_lowercase().as_bytes()) % vocab) as TokenId)
        .collect()
}

/// Render tokens as pronounceable pseudo-words.
pub fn detokenize(tokens: &[TokenId]) -> String {
    tokens
        .iter()
        .map(|&t| {
            let t = t as usize;
            let first = ONSETS[t % 16].to_string() + NUCLEI[(t / 16) % 8];
            let rest = t / 128;
            if rest == 0 {
                first
            } else {
                first + ONSETS[rest % 16] + NUCLEI[(rest / 16) % 8]
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
