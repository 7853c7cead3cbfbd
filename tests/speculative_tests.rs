//! Speculative decoding: distribution identity, speedup and per-entity serialization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;

use tier_router::config::SpeculativeConfig;
use tier_router::inference::engine::decode_target_only;
use tier_router::inference::model::{SyntheticModel, TokenId, TokenModel};
use tier_router::inference::speculative::{speculative_round, SpeculativeDecoder};

const VOCAB: usize = 8;
const SAMPLES: usize = 8000;
/// Two-token sequences have VOCAB^2 outcomes and need more draws.
const JOINT_SAMPLES: usize = 40_000;

fn target() -> SyntheticModel {
    SyntheticModel::new(1234, VOCAB, 1.0).with_sharpness(2.0)
}

fn draft() -> SyntheticModel {
    SyntheticModel::new(1234, VOCAB, 1.0)
        .with_sharpness(2.0)
        .with_perturbation(99, 1.5)
}

fn histogram(samples: impl Iterator<Item = Vec<TokenId>>) -> HashMap<Vec<TokenId>, f64> {
    let mut counts = HashMap::new();
    for s in samples {
        *counts.entry(s).or_insert(0.0) += 1.0;
    }
    for v in counts.values_mut() {
        *v /= JOINT_SAMPLES as f64;
    }
    counts
}

fn total_variation(a: &HashMap<Vec<TokenId>, f64>, b: &HashMap<Vec<TokenId>, f64>) -> f64 {
    let keys: std::collections::HashSet<_> = a.keys().chain(b.keys()).collect();
    keys.into_iter()
        .map(|k| (a.get(k).copied().unwrap_or(0.0) - b.get(k).copied().unwrap_or(0.0)).abs())
        .sum::<f64>()
        / 2.0
}

#[test]
fn test_first_token_distribution_matches_target() {
    let (target, draft) = (target(), draft());
    let context = [3, 1];
    let expected = target.next_distribution(&context);

    let mut rng = StdRng::seed_from_u64(7);
    let mut counts = [0usize; VOCAB];
    for _ in 0..SAMPLES {
        let (emitted, _) = speculative_round(&draft, &target, &context, 3, &mut rng);
        counts[emitted[0] as usize] += 1;
    }

    for (token, &p) in expected.iter().enumerate() {
        let observed = counts[token] as f64 / SAMPLES as f64;
        assert!(
            (observed - p).abs() < 0.03,
            "token {token}: observed {observed:.4}, target {p:.4}"
        );
    }
}

#[test]
fn test_two_token_sequences_match_target_only_decoding() {
    let (target, draft) = (target(), draft());
    let context = [5];

    let mut rng = StdRng::seed_from_u64(11);
    let speculative = histogram((0..JOINT_SAMPLES).map(|_| {
        let (mut emitted, _) = speculative_round(&draft, &target, &context, 2, &mut rng);
        // A rejection emits fewer than two tokens; finish from the target.
        while emitted.len() < 2 {
            let mut ctx = context.to_vec();
            ctx.extend_from_slice(&emitted);
            emitted.extend(decode_target_only(&target, &ctx, 1, &mut rng));
        }
        emitted.truncate(2);
        emitted
    }));

    let mut rng = StdRng::seed_from_u64(13);
    let reference =
        histogram((0..JOINT_SAMPLES).map(|_| decode_target_only(&target, &context, 2, &mut rng)));

    let tv = total_variation(&speculative, &reference);
    assert!(tv < 0.05, "total variation {tv:.4}");
}

#[tokio::test]
async fn test_close_draft_gives_speedup() {
    let config = SpeculativeConfig {
        lookahead: 4,
        vocab_size: 64,
        temperature: 0.8,
        draft_perturbation: 0.2,
        draft_cost_ratio: 0.1,
    };
    let target = SyntheticModel::new(77, 64, 0.8);
    let draft = SyntheticModel::new(77, 64, 0.8).with_perturbation(5, 0.2);
    let decoder = SpeculativeDecoder::new(Arc::new(draft), &config);

    let mut rng = StdRng::seed_from_u64(3);
    for i in 0..20 {
        let out = decoder
            .decode(
                "npc-fast",
                &target,
                &[i, i + 1],
                32,
                &mut rng,
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(out.tokens.len(), 32);
    }

    let report = decoder.report();
    assert_eq!(report.decodes, 20);
    assert!(report.acceptance_rate > 0.5, "acceptance {}", report.acceptance_rate);
    assert!(report.speedup > 1.0, "speedup {}", report.speedup);
}

/// Target that tracks how many decodes are inside it at once.
struct Probe {
    inner: SyntheticModel,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl TokenModel for Probe {
    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn next_distribution(&self, context: &[TokenId]) -> Vec<f64> {
        self.inner.next_distribution(context)
    }

    fn score_continuations(&self, context: &[TokenId], proposed: &[TokenId]) -> Vec<Vec<f64>> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_micros(200));
        let out = self.inner.score_continuations(context, proposed);
        self.active.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_decode_in_flight_per_entity() {
    let config = SpeculativeConfig::default();
    let decoder = Arc::new(SpeculativeDecoder::new(
        Arc::new(SyntheticModel::new(1, 64, 0.8)),
        &config,
    ));
    let probe = Arc::new(Probe {
        inner: SyntheticModel::new(2, 64, 0.8),
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });

    let tasks: Vec<_> = (0..8u64)
        .map(|seed| {
            let decoder = Arc::clone(&decoder);
            let probe = Arc::clone(&probe);
            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed);
                decoder
                    .decode(
                        "npc-busy",
                        probe.as_ref(),
                        &[1, 2, 3],
                        16,
                        &mut rng,
                        Instant::now() + Duration::from_secs(10),
                    )
                    .await
                    .map(|out| out.tokens.len())
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 16);
    }
    assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    assert!(decoder.locks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queued_decode_gives_up_at_deadline() {
    let decoder = SpeculativeDecoder::new(
        Arc::new(SyntheticModel::new(1, 64, 0.8)),
        &SpeculativeConfig::default(),
    );
    let turn = decoder
        .acquire("npc-held", Instant::now() + Duration::from_secs(1))
        .await
        .unwrap();
    assert!(decoder.locks().is_busy("npc-held"));

    let started = Instant::now();
    let waited = decoder
        .acquire("npc-held", Instant::now() + Duration::from_millis(20))
        .await;
    assert!(waited.is_err());
    assert!(started.elapsed() < Duration::from_millis(100));

    // Other entities are not serialized behind it.
    assert!(decoder
        .acquire("npc-other", Instant::now() + Duration::from_millis(20))
        .await
        .is_ok());

    drop(turn);
    assert!(!decoder.locks().is_busy("npc-held"));
}
