use concord_engine::consensus::{is_eligible, voting_weight};
use concord_engine::reputation::MAX_SCORE;
use concord_engine::{compute_score, EngineConfig, ReputationInputs};
use proptest::prelude::*;

fn inputs() -> impl Strategy<Value = ReputationInputs> {
    (0u64..500, 0.0f64..=100.0, 0u64..1_000).prop_map(|(confirmed, rate, total)| {
        ReputationInputs {
            confirmed_activities: confirmed,
            success_rate: rate,
            total_requests: total,
        }
    })
}

proptest! {
    #[test]
    fn score_is_bounded(i in inputs()) {
        prop_assert!(compute_score(i) <= MAX_SCORE);
    }

    #[test]
    fn score_is_monotone_in_every_input(
        i in inputs(),
        more_confirmed in 0u64..50,
        more_rate in 0.0f64..=100.0,
        more_requests in 0u64..200,
    ) {
        let base = compute_score(i);
        let bumped = ReputationInputs {
            confirmed_activities: i.confirmed_activities + more_confirmed,
            success_rate: (i.success_rate + more_rate).min(100.0),
            total_requests: i.total_requests + more_requests,
        };
        prop_assert!(compute_score(bumped) >= base);
    }

    #[test]
    fn weight_stays_within_multiplier_clamp(power in 0u64..1_000_000, score in 0u32..=1000) {
        let config = EngineConfig::default();
        let weight = voting_weight(power, score, &config);
        let p = power as f64;
        prop_assert!(weight.final_weight >= (p * config.multiplier_min).round() as u64);
        prop_assert!(weight.final_weight <= (p * config.multiplier_max).round() as u64);
        prop_assert!(weight.reputation_multiplier >= config.multiplier_min);
        prop_assert!(weight.reputation_multiplier <= config.multiplier_max);
    }

    #[test]
    fn eligibility_needs_both_bars(power in 0u64..1_000, score in 0u32..=1000) {
        let config = EngineConfig::default();
        let weight = voting_weight(power, score, &config);
        let eligible = is_eligible(&weight, &config);
        prop_assert_eq!(
            eligible,
            weight.final_weight >= config.min_voting_weight && score >= config.min_voter_reputation
        );
    }
}
