use std::collections::HashMap;

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use persona_pipeline::clustering::{KMeansConfig, calinski_harabasz, kmeans};
use persona_pipeline::facts::{COUNTER_COUNT, FactKey, GameMode, MatchFact, RawFactRow, Role};
use persona_pipeline::features::{FeatureSchema, Window, extract_features};
use persona_pipeline::quality_gate::validate_batch;
use persona_pipeline::riot_match::parse_match_json;

const MATCH_JSON: &str = include_str!("../tests/fixtures/riot_match_sample.json");

fn sample_facts(player_id: &str, n: usize) -> Vec<MatchFact> {
    let roles = [Role::Top, Role::Jungle, Role::Middle, Role::Bottom, Role::Utility];
    (0..n)
        .map(|i| {
            let mut counters = [0u64; COUNTER_COUNT];
            for (idx, c) in counters.iter_mut().enumerate() {
                *c = ((i * 37 + idx * 101) % 500) as u64;
            }
            MatchFact {
                match_id: format!("EUW1_{i:06}"),
                player_id: player_id.to_string(),
                game_mode: GameMode::Classic,
                game_creation_ms: 1_717_200_000_000 + i as i64 * 60_000,
                duration_secs: 1200 + (i % 900) as u32,
                team_id: 100,
                role: roles[i % roles.len()],
                champion_name: format!("champ{}", i % 17),
                win: i % 3 == 0,
                counters,
            }
        })
        .collect()
}

fn sample_points(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| {
            let group = (i % 4) as f64;
            (0..8)
                .map(|d| group * 3.0 + ((i * 7 + d * 13) % 11) as f64 * 0.05)
                .collect()
        })
        .collect()
}

fn bench_match_parse(c: &mut Criterion) {
    c.bench_function("riot_match_parse", |b| {
        b.iter(|| {
            let rows = parse_match_json(black_box(MATCH_JSON)).unwrap();
            black_box(rows.len());
        })
    });
}

fn bench_quality_gate(c: &mut Criterion) {
    let template = parse_match_json(MATCH_JSON).unwrap();
    let rows = (0..2_000)
        .map(|i| {
            let mut row: RawFactRow = template[i % 2].clone();
            row.match_id = Some(format!("EUW1_{i:06}"));
            row
        })
        .collect::<Vec<_>>();
    let ledger = HashMap::<FactKey, String>::new();
    c.bench_function("quality_gate_2k_rows", |b| {
        b.iter(|| {
            let outcome = validate_batch(black_box(rows.clone()), &ledger).unwrap();
            black_box(outcome.accepted.len());
        })
    });
}

fn bench_feature_extraction(c: &mut Criterion) {
    let schema = FeatureSchema::default_lol();
    let window = Window::from_dates("2024-06-01", "2024-07-01").unwrap();
    let facts = sample_facts("bench-player", 500);
    c.bench_function("extract_features_500_matches", |b| {
        b.iter(|| {
            let v = extract_features("bench-player", black_box(&facts), window, &schema).unwrap();
            black_box(v.map(|v| v.match_count));
        })
    });
}

fn bench_kmeans(c: &mut Criterion) {
    let points = sample_points(1_000);
    let cfg = KMeansConfig {
        k: 4,
        max_iters: 100,
        restarts: 4,
        seed: 42,
    };
    c.bench_function("kmeans_1k_points_k4", |b| {
        b.iter(|| {
            let fit = kmeans(black_box(&points), &cfg).unwrap();
            black_box(calinski_harabasz(&points, &fit));
        })
    });
}

criterion_group!(
    perf,
    bench_match_parse,
    bench_quality_gate,
    bench_feature_extraction,
    bench_kmeans
);
criterion_main!(perf);
